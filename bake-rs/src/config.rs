//! `bake.toml` configuration file.
//!
//! | Table | Contents |
//! |-------|----------|
//! | `[engine]` | [`EngineOptions`] fields (`entry_section`, `stop_build_on_error`, …) |
//! | `[variables]` | run-wide read-only variables, `Name = "value"` |
//! | `[macros]` | run-wide macros, `Name = "Command,args"` |
//!
//! ```toml
//! [engine]
//! stop_build_on_error = true
//! best_effort_sections = ["Cleanup"]
//!
//! [variables]
//! TargetDir = 'X:\Target'
//!
//! [macros]
//! Hello = "Echo,Hello #1"
//! ```
//!
//! Loading never fails outright: problems are returned as a list of
//! [`ConfigError`]s next to whatever could be parsed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::script::engine::EngineOptions;
use crate::script::schema::is_macro_name;
use crate::script::variables::is_var_name;
use crate::var::VarStore;

// ── Public API ────────────────────────────────────────────────────────────────

/// A non-fatal error encountered while loading a config file.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct ConfigError {
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineOptions,
    pub variables: BTreeMap<String, String>,
    pub macros: BTreeMap<String, String>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a config string.
    ///
    /// A TOML syntax or type error yields the default config and one error.
    /// Invalid or colliding variable and macro names are dropped and
    /// reported; the rest of the file still applies.
    pub fn load_str(s: &str) -> (Self, Vec<ConfigError>) {
        let mut config: Config = match toml::from_str(s) {
            Ok(c) => c,
            Err(e) => {
                let line = e.span().map_or(0, |span| line_of(s, span.start));
                return (Config::new(), vec![ConfigError { line, message: e.message().to_owned() }]);
            }
        };
        let mut errors = Vec::new();
        check_names(s, "variables", &mut config.variables, is_var_name, &mut errors);
        check_names(s, "macros", &mut config.macros, is_macro_name, &mut errors);
        (config, errors)
    }

    /// Read and parse a config file from disk.
    pub fn load_file(path: &Path) -> std::io::Result<(Self, Vec<ConfigError>)> {
        let s = std::fs::read_to_string(path)?;
        Ok(Self::load_str(&s))
    }

    /// The read-only variable tier seeded from `[variables]`.
    pub fn fixed_vars(&self) -> VarStore {
        let mut store = VarStore::new();
        for (k, v) in &self.variables {
            store.set(k.as_str(), v.as_str());
        }
        store
    }
}

/// Search for the user config file: the platform config directory first,
/// then `./bake.toml`.  Returns the first path that exists, or `None`.
pub fn default_path() -> Option<PathBuf> {
    let user = directories::ProjectDirs::from("", "", "bake").map(|d| d.config_dir().join("bake.toml"));
    user.into_iter().chain(std::iter::once(PathBuf::from("bake.toml"))).find(|p| p.is_file())
}

// ── Validation ────────────────────────────────────────────────────────────────

/// 1-based line containing byte `offset`.
fn line_of(s: &str, offset: usize) -> usize {
    s.get(..offset).unwrap_or(s).matches('\n').count() + 1
}

/// Line on which `key` is defined under `[table]`, or 0 if it cannot be
/// located (inline tables, dotted keys).
fn key_line(s: &str, table: &str, key: &str) -> usize {
    let mut in_table = false;
    for (i, raw) in s.lines().enumerate() {
        let line = raw.trim();
        if let Some(name) = line.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
            in_table = name.trim() == table;
            continue;
        }
        if !in_table {
            continue;
        }
        let Some((k, _)) = line.split_once('=') else { continue };
        let k = k.trim().trim_matches(|c: char| c == '"' || c == '\'');
        if k == key {
            return i + 1;
        }
    }
    0
}

/// Drop entries whose name fails `valid` or collides, ignoring case, with
/// an earlier entry.
fn check_names(
    src: &str,
    table: &str,
    entries: &mut BTreeMap<String, String>,
    valid: fn(&str) -> bool,
    errors: &mut Vec<ConfigError>,
) {
    let mut seen: BTreeMap<String, String> = BTreeMap::new();
    entries.retain(|name, _| {
        let line = key_line(src, table, name);
        if !valid(name) {
            errors.push(ConfigError { line, message: format!("[{table}] invalid name {name:?}") });
            return false;
        }
        if let Some(first) = seen.get(&name.to_lowercase()) {
            errors.push(ConfigError {
                line,
                message: format!("[{table}] {name:?} collides with {first:?}"),
            });
            return false;
        }
        seen.insert(name.to_lowercase(), name.clone());
        true
    });
    errors.sort_by_key(|e| e.line);
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_default() {
        let (cfg, errs) = Config::load_str("");
        assert!(errs.is_empty(), "{errs:?}");
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.engine.entry_section, "Process");
    }

    #[test]
    fn engine_table() {
        let (cfg, errs) = Config::load_str(
            "[engine]\nstop_build_on_error = true\nbest_effort_sections = [\"Cleanup\"]\noptimize = false\n",
        );
        assert!(errs.is_empty(), "{errs:?}");
        assert!(cfg.engine.stop_build_on_error);
        assert!(!cfg.engine.optimize);
        assert_eq!(cfg.engine.best_effort_sections, vec!["Cleanup"]);
        assert_eq!(cfg.engine.macro_section, "ApiVar");
    }

    #[test]
    fn variables_and_macros() {
        let src = "\
[variables]
TargetDir = 'X:\\Target'
\"Build\" = \"1\"

[macros]
Hello = \"Echo,Hello #1\"
";
        let (cfg, errs) = Config::load_str(src);
        assert!(errs.is_empty(), "{errs:?}");
        assert_eq!(cfg.variables.get("TargetDir").map(String::as_str), Some("X:\\Target"));
        assert_eq!(cfg.macros.get("Hello").map(String::as_str), Some("Echo,Hello #1"));
        let fixed = cfg.fixed_vars();
        assert_eq!(fixed.get("targetdir"), Some("X:\\Target"));
        assert_eq!(fixed.get("BUILD"), Some("1"));
    }

    #[test]
    fn invalid_names_are_dropped_with_line() {
        let src = "[variables]\nok = \"1\"\n\"bad name\" = \"2\"\n\n[macros]\n\"with-dash\" = \"Echo,x\"\n";
        let (cfg, errs) = Config::load_str(src);
        assert_eq!(cfg.variables.len(), 1);
        assert!(cfg.macros.is_empty());
        assert_eq!(errs.len(), 2, "{errs:?}");
        assert_eq!(errs[0].line, 3);
        assert_eq!(errs[1].line, 6);
        assert!(errs[1].message.contains("with-dash"));
    }

    #[test]
    fn case_collisions_are_reported() {
        let (cfg, errs) = Config::load_str("[macros]\nHello = \"Echo,a\"\nhello = \"Echo,b\"\n");
        assert_eq!(cfg.macros.len(), 1);
        assert_eq!(errs.len(), 1, "{errs:?}");
        assert!(errs[0].message.contains("collides"));
    }

    #[test]
    fn syntax_error_has_line() {
        let (cfg, errs) = Config::load_str("[engine]\noptimize = true\nstop_build_on_error = = 1\n");
        assert_eq!(cfg, Config::default());
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].line, 3);
    }

    #[test]
    fn wrong_type_is_error() {
        let (_, errs) = Config::load_str("[engine]\noptimize = \"yes\"\n");
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].line, 2);
    }

    #[test]
    fn load_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bake.toml");
        std::fs::write(&path, "[variables]\nA = \"1\"\n").unwrap();
        let (cfg, errs) = Config::load_file(&path).unwrap();
        assert!(errs.is_empty());
        assert_eq!(cfg.variables.len(), 1);
        assert!(Config::load_file(&dir.path().join("missing.toml")).is_err());
    }
}
