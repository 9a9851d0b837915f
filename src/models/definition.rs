use camino::{Utf8Component, Utf8Path};
use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;
use serde_yaml_ng::Value;
use std::sync::LazyLock;

/// Container names accepted by Docker. Instance names double as folder names
/// under the instance root, so they must also be a single path segment.
static INSTANCE_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$").expect("instance name regex is valid")
});

/// Where an instance's server files come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadSource {
    /// A full server archive extracted straight into the instance folder
    Archive { url: String },

    /// A patch archive extracted into `patches/`, whose `base_folder` is merged
    /// into the instance folder
    Patch {
        url: String,
        base_folder: Option<String>,
    },
}

impl DownloadSource {
    pub fn url(&self) -> &str {
        match self {
            Self::Archive { url } | Self::Patch { url, .. } => url,
        }
    }
}

/// Mods to download into `mods/` and mod files to rename to `*.disabled`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModsList {
    pub install: Vec<String>,
    pub disable: Vec<String>,
}

/// Validated, immutable description of one instance.
///
/// Built from a `<name>.yaml` file by [`InstanceDefinition::parse`]; all required
/// fields are checked at load time so later workflow steps never meet a missing key.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceDefinition {
    pub name: String,
    pub source: DownloadSource,

    /// Config filename -> ordered key/value overrides, already in string form
    pub configs: IndexMap<String, IndexMap<String, String>>,

    /// Structured (YAML) config filename -> override tree
    pub yamls: IndexMap<String, Value>,

    pub mods: ModsList,

    /// Relative paths copied from the rotated snapshot during an upgrade
    pub upgrade_list: Vec<String>,

    /// Start script, relative to the instance folder
    pub entrypoint: String,

    pub port: u16,
    pub rcon_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawPatch {
    url: String,
    #[serde(default)]
    basefolder: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawModsList {
    #[serde(default)]
    install: Option<Vec<String>>,
    #[serde(default)]
    disable: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawDefinition {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    patch: Option<RawPatch>,
    #[serde(default)]
    configs: Option<IndexMap<String, Option<IndexMap<String, Value>>>>,
    #[serde(default)]
    yamls: Option<IndexMap<String, Value>>,
    #[serde(rename = "modsList", default)]
    mods_list: Option<RawModsList>,
    #[serde(rename = "upgradeList", default)]
    upgrade_list: Option<Vec<String>>,
    entrypoint: String,
    port: u16,
    #[serde(default)]
    rconport: Option<u16>,
}

impl InstanceDefinition {
    /// Parse and validate a definition document.
    ///
    /// Returns a human-readable reason on failure; the caller attaches the file path.
    pub fn parse(name: &str, document: &str) -> Result<Self, String> {
        let raw: RawDefinition = serde_yaml_ng::from_str(document).map_err(|e| e.to_string())?;

        let source = match (raw.url, raw.patch) {
            (Some(url), None) => DownloadSource::Archive { url },
            (None, Some(patch)) => DownloadSource::Patch {
                url: patch.url,
                base_folder: patch.basefolder.filter(|b| !b.is_empty()),
            },
            (Some(_), Some(_)) => {
                return Err("exactly one of 'url' or 'patch' may be given, found both".into());
            }
            (None, None) => return Err("one of 'url' or 'patch' is required".into()),
        };
        if source.url().trim().is_empty() {
            return Err("download url is empty".into());
        }
        if let DownloadSource::Patch {
            base_folder: Some(base),
            ..
        } = &source
        {
            ensure_relative("patch.basefolder", base)?;
        }

        let mut configs = IndexMap::new();
        for (filename, overrides) in raw.configs.unwrap_or_default() {
            ensure_relative("configs", &filename)?;
            let mut rendered = IndexMap::new();
            for (key, value) in overrides.unwrap_or_default() {
                let text = scalar_to_string(&value).ok_or_else(|| {
                    format!("configs.{filename}.{key}: override values must be scalars")
                })?;
                rendered.insert(key, text);
            }
            configs.insert(filename, rendered);
        }

        let yamls = raw.yamls.unwrap_or_default();
        for filename in yamls.keys() {
            ensure_relative("yamls", filename)?;
        }

        let mods_list = raw.mods_list.unwrap_or_default();
        let mods = ModsList {
            install: mods_list.install.unwrap_or_default(),
            disable: mods_list.disable.unwrap_or_default(),
        };
        for disabled in &mods.disable {
            ensure_relative("modsList.disable", disabled)?;
        }

        let upgrade_list = raw.upgrade_list.unwrap_or_default();
        for path in &upgrade_list {
            ensure_relative("upgradeList", path)?;
        }

        ensure_relative("entrypoint", &raw.entrypoint)?;
        if raw.port == 0 {
            return Err("port must be non-zero".into());
        }

        Ok(Self {
            name: name.to_string(),
            source,
            configs,
            yamls,
            mods,
            upgrade_list,
            entrypoint: raw.entrypoint,
            port: raw.port,
            rcon_port: raw.rconport,
        })
    }
}

/// String form of a scalar override value, as written into a `key=value` file.
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    }
}

/// Check that `name` is usable as both a container name and a folder name.
pub fn validate_instance_name(name: &str) -> Result<(), String> {
    let mut components = Utf8Path::new(name).components();
    let single_segment = matches!(
        (components.next(), components.next()),
        (Some(Utf8Component::Normal(segment)), None) if segment == name
    );
    if !single_segment || !INSTANCE_NAME_REGEX.is_match(name) {
        return Err(format!(
            "'{name}' is not a valid instance name (expected [a-zA-Z0-9][a-zA-Z0-9_.-]*)"
        ));
    }
    Ok(())
}

fn ensure_relative(field: &str, path: &str) -> Result<(), String> {
    if path.trim().is_empty() {
        return Err(format!("{field}: empty path"));
    }
    let escapes = Utf8Path::new(path)
        .components()
        .any(|c| !matches!(c, Utf8Component::Normal(_) | Utf8Component::CurDir));
    if escapes {
        return Err(format!(
            "{field}: '{path}' must be a relative path inside the instance folder"
        ));
    }
    Ok(())
}
