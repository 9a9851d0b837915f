use crate::error::{ManagerError, Result};
use crate::models::InstanceDefinition;
use crate::models::definition::validate_instance_name;
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use std::fs;

/// Read-only collection of instance definitions, keyed by file stem.
///
/// Loaded once per invocation from a directory of `*.yaml` / `*.yml` files.
/// Two files sharing a stem (`foo.yaml` and `foo.yml`) are rejected rather than
/// letting one silently shadow the other.
#[derive(Debug, Clone, Default)]
pub struct DefinitionStore {
    definitions: IndexMap<String, InstanceDefinition>,
    sources: IndexMap<String, Utf8PathBuf>,
}

impl DefinitionStore {
    /// Load every definition file in `dir`.
    ///
    /// A missing directory yields an empty store so commands that need no
    /// definitions (`build`) still work.
    pub fn load<P: AsRef<Utf8Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let mut store = Self::default();

        if !dir.exists() {
            tracing::warn!("Definitions directory {} not found, no instances defined", dir);
            return Ok(store);
        }

        let mut files = Vec::new();
        for entry in dir.read_dir_utf8().map_err(|e| ManagerError::io(dir, e))? {
            let entry = entry.map_err(|e| ManagerError::io(dir, e))?;
            let path = entry.path().to_path_buf();
            let is_yaml = matches!(path.extension(), Some("yaml") | Some("yml"));
            if is_yaml && path.is_file() {
                files.push(path);
            }
        }
        files.sort();

        for path in files {
            store.insert_file(&path)?;
        }

        store.definitions.sort_keys();
        store.sources.sort_keys();
        tracing::info!("Loaded {} instance definition(s) from {}", store.len(), dir);
        Ok(store)
    }

    fn insert_file(&mut self, path: &Utf8Path) -> Result<()> {
        let name = path
            .file_stem()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ManagerError::DefinitionParse {
                path: path.to_path_buf(),
                reason: "file name has no stem".into(),
            })?
            .to_string();
        validate_instance_name(&name).map_err(|reason| ManagerError::DefinitionParse {
            path: path.to_path_buf(),
            reason,
        })?;

        if let Some(first) = self.sources.get(&name) {
            return Err(ManagerError::DuplicateName {
                name,
                first: first.clone(),
                second: path.to_path_buf(),
            });
        }

        let document = fs::read_to_string(path).map_err(|e| ManagerError::io(path, e))?;
        let definition = InstanceDefinition::parse(&name, &document).map_err(|reason| {
            ManagerError::DefinitionParse {
                path: path.to_path_buf(),
                reason,
            }
        })?;

        tracing::debug!("Loaded definition '{}' from {}", name, path);
        self.sources.insert(name.clone(), path.to_path_buf());
        self.definitions.insert(name, definition);
        Ok(())
    }

    /// Look up a definition by instance name.
    pub fn get(&self, name: &str) -> Result<&InstanceDefinition> {
        self.definitions
            .get(name)
            .ok_or_else(|| ManagerError::UnknownInstance(name.to_string()))
    }

    /// Instance names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }

    /// File the named definition was loaded from
    pub fn source_path(&self, name: &str) -> Option<&Utf8Path> {
        self.sources.get(name).map(Utf8PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
