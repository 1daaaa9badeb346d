//! Case-insensitive variable table.
//!
//! One [`VarStore`] backs each tier of the script variable store (fixed,
//! global, local).  Lookups ignore case; the spelling used by the most
//! recent `set` is kept for display.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    name: String,
    value: String,
}

/// Key/value variable table with case-insensitive keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VarStore {
    vars: HashMap<String, Entry>,
}

fn fold(name: &str) -> String {
    name.to_lowercase()
}

impl VarStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or overwrite) a variable.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.vars.insert(fold(&name), Entry { name, value: value.into() });
    }

    /// Get the string value of a variable.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(&fold(name)).map(|e| e.value.as_str())
    }

    /// Remove a variable.  Returns `true` if it existed.
    pub fn unset(&mut self, name: &str) -> bool {
        self.vars.remove(&fold(name)).is_some()
    }

    /// Returns `true` if the variable is set.
    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(&fold(name))
    }

    /// Iterate over all variables as `(name, value)`, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.values().map(|e| (e.name.as_str(), e.value.as_str()))
    }

    /// All variables sorted by folded name; stable output for dumps and tests.
    pub fn sorted(&self) -> Vec<(&str, &str)> {
        let mut keys: Vec<&String> = self.vars.keys().collect();
        keys.sort();
        keys.into_iter()
            .map(|k| {
                let e = &self.vars[k];
                (e.name.as_str(), e.value.as_str())
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for VarStore {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut store = VarStore::new();
        for (k, v) in iter {
            store.set(k, v);
        }
        store
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get() {
        let mut vars = VarStore::new();
        vars.set("SourceDir", "C:\\Src");
        assert_eq!(vars.get("SourceDir"), Some("C:\\Src"));
    }

    #[test]
    fn keys_ignore_case() {
        let mut vars = VarStore::new();
        vars.set("TargetDir", "X:\\");
        assert_eq!(vars.get("targetdir"), Some("X:\\"));
        assert_eq!(vars.get("TARGETDIR"), Some("X:\\"));
        assert!(vars.contains("tArGeTdIr"));
    }

    #[test]
    fn overwrite_keeps_latest_spelling() {
        let mut vars = VarStore::new();
        vars.set("dest", "old");
        vars.set("Dest", "new");
        assert_eq!(vars.len(), 1);
        assert_eq!(vars.iter().next(), Some(("Dest", "new")));
    }

    #[test]
    fn unset() {
        let mut vars = VarStore::new();
        vars.set("Gone", "bye");
        assert!(vars.unset("GONE"));
        assert_eq!(vars.get("gone"), None);
        assert!(!vars.unset("gone"));
    }

    #[test]
    fn sorted_is_deterministic() {
        let vars: VarStore = [("b", "2"), ("A", "1"), ("c", "3")].into_iter().collect();
        assert_eq!(vars.sorted(), vec![("A", "1"), ("b", "2"), ("c", "3")]);
    }
}
