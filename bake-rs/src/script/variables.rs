//! Three-tier variable store.
//!
//! | Tier | Lifetime | Writable |
//! |------|----------|----------|
//! | local | one section call | yes |
//! | global | the whole run | yes |
//! | fixed | the whole run | no |
//!
//! Lookups search local, then global, then fixed.  `System,SetLocal` pushes a
//! copy of the local tier tagged with the frame depth; `System,EndLocal`
//! restores it.

use crate::var::VarStore;

use super::expand::Resolve;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Local,
    Global,
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VarError {
    #[error("variable %{0}% is read-only")]
    ReadOnly(String),
    #[error("invalid variable name {0:?}")]
    InvalidKey(String),
    #[error("EndLocal without matching SetLocal")]
    UnbalancedEndLocal,
}

/// Characters allowed in a `%Name%` reference.
pub fn is_var_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '#' | '(' | ')' | '.'))
}

#[derive(Debug, Clone)]
struct SetLocalEntry {
    depth: usize,
    saved: VarStore,
}

#[derive(Debug, Clone, Default)]
pub struct Variables {
    fixed: VarStore,
    global: VarStore,
    local: VarStore,
    set_local: Vec<SetLocalEntry>,
}

impl Variables {
    pub fn new(fixed: VarStore) -> Self {
        Variables { fixed, ..Default::default() }
    }

    fn tier(&self, scope: Scope) -> &VarStore {
        match scope {
            Scope::Local => &self.local,
            Scope::Global => &self.global,
            Scope::Fixed => &self.fixed,
        }
    }

    /// Resolve a name through local, global, fixed.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.local
            .get(name)
            .or_else(|| self.global.get(name))
            .or_else(|| self.fixed.get(name))
    }

    pub fn get_in(&self, scope: Scope, name: &str) -> Option<&str> {
        self.tier(scope).get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn is_fixed(&self, name: &str) -> bool {
        self.fixed.contains(name)
    }

    pub fn set(&mut self, scope: Scope, name: &str, value: impl Into<String>) -> Result<(), VarError> {
        if !is_var_name(name) {
            return Err(VarError::InvalidKey(name.to_owned()));
        }
        let store = match scope {
            Scope::Local => &mut self.local,
            Scope::Global => &mut self.global,
            Scope::Fixed => return Err(VarError::ReadOnly(name.to_owned())),
        };
        store.set(name, value);
        Ok(())
    }

    /// Remove `name` from one tier.  Returns `true` if it existed.
    pub fn delete(&mut self, scope: Scope, name: &str) -> Result<bool, VarError> {
        match scope {
            Scope::Local => Ok(self.local.unset(name)),
            Scope::Global => Ok(self.global.unset(name)),
            Scope::Fixed => Err(VarError::ReadOnly(name.to_owned())),
        }
    }

    /// Seed a fixed variable before the run starts.
    pub fn set_fixed(&mut self, name: &str, value: impl Into<String>) {
        self.fixed.set(name, value);
    }

    pub fn locals(&self) -> &VarStore {
        &self.local
    }

    pub fn globals(&self) -> &VarStore {
        &self.global
    }

    pub fn fixed(&self) -> &VarStore {
        &self.fixed
    }

    /// Swap in a new local tier, returning the caller's.
    pub fn replace_locals(&mut self, locals: VarStore) -> VarStore {
        std::mem::replace(&mut self.local, locals)
    }

    // ── SetLocal / EndLocal ───────────────────────────────────────────────────

    pub fn set_local(&mut self, depth: usize) {
        self.set_local.push(SetLocalEntry { depth, saved: self.local.clone() });
    }

    pub fn end_local(&mut self, depth: usize) -> Result<(), VarError> {
        match self.set_local.last() {
            Some(e) if e.depth == depth => {}
            _ => return Err(VarError::UnbalancedEndLocal),
        }
        if let Some(entry) = self.set_local.pop() {
            self.local = entry.saved;
        }
        Ok(())
    }

    /// Restore every `SetLocal` still open at `depth` or deeper.  Returns how
    /// many were unbalanced.
    pub fn unwind_set_local(&mut self, depth: usize) -> usize {
        let mut count = 0;
        while let Some(entry) = self.set_local.last() {
            if entry.depth < depth {
                break;
            }
            if let Some(entry) = self.set_local.pop() {
                self.local = entry.saved;
            }
            count += 1;
        }
        count
    }

    pub fn set_local_depth(&self) -> usize {
        self.set_local.len()
    }
}

impl Resolve for Variables {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).map(str::to_owned)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
