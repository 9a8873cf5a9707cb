//! Preset module registry and custom module validation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{ModuleError, RegistryError};

const BUILTIN_REGISTRY: &str = include_str!("../../config/modules.json");

static MODULE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._-]+$").expect("valid module name regex"));

/// Which configure flag a module is added with.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ModuleFlag {
    #[default]
    AddModule,
    AddDynamicModule,
}

impl ModuleFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddModule => "add-module",
            Self::AddDynamicModule => "add-dynamic-module",
        }
    }

    /// The configure argument prefix, e.g. `--add-module`.
    pub fn as_arg(&self) -> &'static str {
        match self {
            Self::AddModule => "--add-module",
            Self::AddDynamicModule => "--add-dynamic-module",
        }
    }
}

impl fmt::Display for ModuleFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleFlag {
    type Err = ModuleError;

    /// An empty string selects the default static module flag.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "add-module" => Ok(Self::AddModule),
            "add-dynamic-module" => Ok(Self::AddDynamicModule),
            other => Err(ModuleError::InvalidFlag(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Module {
    pub name: String,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub flag: ModuleFlag,
    /// Pre-provisioned location; relative paths live under the modules root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Module {
    /// The clone source, if one is configured and not blank.
    pub fn repository(&self) -> Option<&str> {
        self.repo.as_deref().map(str::trim).filter(|r| !r.is_empty())
    }
}

/// Name-keyed set of preset modules. Iteration order is alphabetical.
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, Module>,
}

impl ModuleRegistry {
    /// Parse a JSON array of module records. Later duplicates replace earlier ones.
    pub fn from_json(data: &str) -> Result<Self, RegistryError> {
        let list: Vec<Module> = serde_json::from_str(data).map_err(RegistryError::Malformed)?;
        Ok(list.into_iter().collect())
    }

    /// The registry compiled into the binary.
    pub fn builtin() -> Result<Self, RegistryError> {
        Self::from_json(BUILTIN_REGISTRY)
    }

    pub fn from_file(path: &Path) -> Result<Self, RegistryError> {
        let data = std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&data)
    }

    /// `path` when configured, otherwise the built-in presets.
    pub fn load(path: Option<&Path>) -> Result<Self, RegistryError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Self::builtin(),
        }
    }

    pub fn list(&self) -> Vec<Module> {
        self.modules.values().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<&Module> {
        self.modules.get(name)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl FromIterator<Module> for ModuleRegistry {
    fn from_iter<I: IntoIterator<Item = Module>>(iter: I) -> Self {
        Self {
            modules: iter.into_iter().map(|m| (m.name.clone(), m)).collect(),
        }
    }
}

/// Check a request-supplied module and turn it into a [`Module`].
pub fn validate_custom_module(name: &str, repo: &str, flag: &str) -> Result<Module, ModuleError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ModuleError::EmptyName);
    }
    // "." and ".." pass the character check but would escape the clone directory.
    if !MODULE_NAME_RE.is_match(name) || name == "." || name == ".." {
        return Err(ModuleError::InvalidName(name.to_string()));
    }
    let repo = repo.trim();
    if repo.is_empty() {
        return Err(ModuleError::EmptyRepository(name.to_string()));
    }
    if !repo.starts_with("https://") {
        return Err(ModuleError::InsecureRepository(repo.to_string()));
    }
    let flag = flag.parse::<ModuleFlag>()?;

    Ok(Module {
        name: name.to_string(),
        repo: Some(repo.to_string()),
        description: String::new(),
        flag,
        path: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_loads() {
        let registry = ModuleRegistry::builtin().unwrap();
        assert!(!registry.is_empty());
        assert!(registry.get("brotli").is_some());
        for module in registry.list() {
            let repo = module.repository().unwrap();
            assert!(repo.starts_with("https://"), "{} has non-https repo", module.name);
        }
    }

    #[test]
    fn test_list_is_alphabetical() {
        let registry = ModuleRegistry::from_json(
            r#"[{"name": "zeta"}, {"name": "alpha"}, {"name": "mid"}]"#,
        )
        .unwrap();
        let names: Vec<String> = registry.list().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_defaults_for_missing_fields() {
        let registry = ModuleRegistry::from_json(r#"[{"name": "local", "path": "local-mod"}]"#).unwrap();
        let module = registry.get("local").unwrap();
        assert_eq!(module.flag, ModuleFlag::AddModule);
        assert!(module.repository().is_none());
        assert_eq!(module.path.as_deref(), Some(Path::new("local-mod")));
    }

    #[test]
    fn test_blank_repo_counts_as_missing() {
        let registry = ModuleRegistry::from_json(r#"[{"name": "x", "repo": "  "}]"#).unwrap();
        assert!(registry.get("x").unwrap().repository().is_none());
    }

    #[test]
    fn test_malformed_registry() {
        assert!(matches!(
            ModuleRegistry::from_json("{}"),
            Err(RegistryError::Malformed(_))
        ));
        assert!(ModuleRegistry::from_json(r#"[{"name": "x", "flag": "add-whatever"}]"#).is_err());
    }

    #[test]
    fn test_missing_registry_file() {
        let err = ModuleRegistry::from_file(Path::new("/nonexistent/modules.json")).unwrap_err();
        assert!(matches!(err, RegistryError::Read { .. }));
    }

    #[test]
    fn test_flag_args() {
        assert_eq!(ModuleFlag::AddModule.as_arg(), "--add-module");
        assert_eq!(ModuleFlag::AddDynamicModule.as_arg(), "--add-dynamic-module");
        assert_eq!("".parse::<ModuleFlag>().unwrap(), ModuleFlag::AddModule);
    }

    #[test]
    fn test_validate_custom_module_ok() {
        let module =
            validate_custom_module("my_mod-1.0", "https://example.com/mod.git", "add-dynamic-module").unwrap();
        assert_eq!(module.name, "my_mod-1.0");
        assert_eq!(module.flag, ModuleFlag::AddDynamicModule);
        assert_eq!(module.repository(), Some("https://example.com/mod.git"));
    }

    #[test]
    fn test_validate_custom_module_defaults_flag() {
        let module = validate_custom_module("m", "https://example.com/m.git", "").unwrap();
        assert_eq!(module.flag, ModuleFlag::AddModule);
    }

    #[test]
    fn test_validate_custom_module_rejects_insecure_repo() {
        let err = validate_custom_module("m", "http://example.com/mod.git", "").unwrap_err();
        assert_eq!(err, ModuleError::InsecureRepository("http://example.com/mod.git".into()));
        assert!(validate_custom_module("m", "git@github.com:a/b.git", "").is_err());
    }

    #[test]
    fn test_validate_custom_module_rejects_bad_names() {
        assert_eq!(
            validate_custom_module("  ", "https://x/y.git", "").unwrap_err(),
            ModuleError::EmptyName
        );
        for bad in ["a/b", "a b", "..", ".", "mod;rm"] {
            assert!(
                matches!(
                    validate_custom_module(bad, "https://x/y.git", ""),
                    Err(ModuleError::InvalidName(_))
                ),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_validate_custom_module_rejects_empty_repo_and_bad_flag() {
        assert_eq!(
            validate_custom_module("m", "", "").unwrap_err(),
            ModuleError::EmptyRepository("m".into())
        );
        assert_eq!(
            validate_custom_module("m", "https://x/y.git", "load-module").unwrap_err(),
            ModuleError::InvalidFlag("load-module".into())
        );
    }
}
