//! Text patching of instance configuration files.
//!
//! - [`apply_overrides`]: line-oriented `key=value` files (`server.properties` and friends)
//! - [`apply_yaml_overrides`]: structured YAML files, deep-merged with an override tree
//! - [`create_eula`], [`read_properties`], [`convert_to_unix_line_endings`]: small helpers
//!   used by the install and start workflows
//!
//! Every write goes through [`write_atomic`]: the new content lands in a temp file in
//! the same directory and is renamed over the target, so a failure never leaves a
//! half-written file behind.

use crate::error::{ManagerError, Result};
use camino::Utf8Path;
use indexmap::{IndexMap, IndexSet};
use serde_yaml_ng::{Mapping, Value};
use std::fs;
use std::io::{ErrorKind, Write};

/// Contents written to `eula.txt`.
pub const EULA_CONTENTS: &str = "#By changing the setting below to TRUE you are indicating your agreement to our EULA (https://account.mojang.com/documents/minecraft_eula).\neula=true\n";

/// Rewrite a `key=value` file in place.
///
/// Existing lines whose key (text before the first `=`) appears in `overrides` are
/// replaced with `key=value`; all other lines are kept verbatim and in order. Keys not
/// present in the file are appended in `overrides` order. A key repeated in the file
/// keeps only its first, overridden, occurrence. A missing file is treated as empty.
pub fn apply_overrides(path: &Utf8Path, overrides: &IndexMap<String, String>) -> Result<()> {
    let original = read_or_empty(path)?;
    let patched = patch_properties(&original, overrides);

    if patched == original && path.exists() {
        tracing::debug!("{} already up to date", path);
        return Ok(());
    }
    write_atomic(path, patched.as_bytes())
}

/// Pure form of [`apply_overrides`] operating on file contents.
pub fn patch_properties(original: &str, overrides: &IndexMap<String, String>) -> String {
    let mut seen: IndexSet<&str> = IndexSet::new();
    let mut out = String::with_capacity(original.len());

    for line in original.split_inclusive('\n') {
        let key = line.find('=').map(|pos| &line[..pos]);
        match key.and_then(|k| overrides.get_key_value(k)) {
            Some((key, value)) => {
                if seen.insert(key.as_str()) {
                    out.push_str(key);
                    out.push('=');
                    out.push_str(value);
                    out.push('\n');
                } else {
                    tracing::debug!("Dropping duplicate line for overridden key '{}'", key);
                }
            }
            None => out.push_str(line),
        }
    }

    let mut missing = overrides
        .iter()
        .filter(|(key, _)| !seen.contains(key.as_str()))
        .peekable();

    if missing.peek().is_some() && !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    for (key, value) in missing {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }

    out
}

/// Deep-merge `overrides` into the YAML document at `path`.
///
/// Mappings merge key by key; any other override value replaces what was there.
/// A missing file starts from an empty mapping.
pub fn apply_yaml_overrides(path: &Utf8Path, overrides: &Value) -> Result<()> {
    let original = read_or_empty(path)?;
    let mut document: Value = if original.trim().is_empty() {
        Value::Mapping(Mapping::new())
    } else {
        serde_yaml_ng::from_str(&original).map_err(|e| {
            ManagerError::Config(format!("Failed to parse YAML file {}: {}", path, e))
        })?
    };

    merge_yaml(&mut document, overrides);

    let rendered = serde_yaml_ng::to_string(&document).map_err(|e| {
        ManagerError::Config(format!("Failed to serialize YAML file {}: {}", path, e))
    })?;
    write_atomic(path, rendered.as_bytes())
}

/// Recursive merge used by [`apply_yaml_overrides`].
pub fn merge_yaml(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Write `eula.txt` accepting the server EULA.
pub fn create_eula(instance_dir: &Utf8Path) -> Result<()> {
    write_atomic(&instance_dir.join("eula.txt"), EULA_CONTENTS.as_bytes())
}

/// Parse a `key=value` file into an ordered map (split on the first `=`).
pub fn read_properties(path: &Utf8Path) -> Result<IndexMap<String, String>> {
    let text = fs::read_to_string(path).map_err(|e| ManagerError::io(path, e))?;
    let mut props = IndexMap::new();
    for line in text.lines() {
        if let Some((key, value)) = line.split_once('=') {
            props.insert(key.to_string(), value.trim_end_matches('\r').to_string());
        }
    }
    Ok(props)
}

/// Replace `\r\n` with `\n`; scripts with DOS line endings do not run in the container.
pub fn convert_to_unix_line_endings(path: &Utf8Path) -> Result<()> {
    let bytes = fs::read(path).map_err(|e| ManagerError::io(path, e))?;
    if !bytes.windows(2).any(|w| w == b"\r\n") {
        return Ok(());
    }

    let mut converted = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter().peekable();
    while let Some(&byte) = iter.next() {
        if byte == b'\r' && iter.peek() == Some(&&b'\n') {
            continue;
        }
        converted.push(byte);
    }

    tracing::info!("Converted {} to unix line endings", path);
    write_atomic(path, &converted)
}

/// Replace `path` with `contents` via temp file + rename, keeping the original mode.
pub fn write_atomic(path: &Utf8Path, contents: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_str().is_empty() => p,
        _ => Utf8Path::new("."),
    };

    let mut temp =
        tempfile::NamedTempFile::new_in(parent).map_err(|e| ManagerError::io(parent, e))?;
    temp.write_all(contents)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|e| ManagerError::io(path, e))?;

    let permissions = match fs::metadata(path) {
        Ok(meta) => Some(meta.permissions()),
        Err(e) if e.kind() == ErrorKind::NotFound => default_permissions(),
        Err(e) => return Err(ManagerError::io(path, e)),
    };
    if let Some(permissions) = permissions {
        fs::set_permissions(temp.path(), permissions).map_err(|e| ManagerError::io(path, e))?;
    }

    temp.persist(path).map_err(|e| ManagerError::io(path, e.error))?;
    Ok(())
}

#[cfg(unix)]
fn default_permissions() -> Option<fs::Permissions> {
    use std::os::unix::fs::PermissionsExt;
    Some(fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn default_permissions() -> Option<fs::Permissions> {
    None
}

fn read_or_empty(path: &Utf8Path) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(ManagerError::io(path, e)),
    }
}
