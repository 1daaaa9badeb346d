//! Command handler contract.
//!
//! Every keyword the engine does not execute itself is dispatched to a
//! [`CommandHandler`] registered in a [`HandlerRegistry`].  The handler gets
//! the payload with its strings already expanded and an
//! [`EngineContext`] for variable access, and answers with an [`Outcome`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use super::builtins;
use super::command::{Keyword, Payload};
use super::engine::EngineContext;

// ── Severity ──────────────────────────────────────────────────────────────────

/// Outcome severity, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Success,
    Ignore,
    Overwrite,
    Info,
    Warning,
    Error,
    CriticalError,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── Outcome ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub severity: Severity,
    pub message: String,
    pub log_fields: BTreeMap<String, String>,
}

impl Outcome {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Outcome { severity, message: message.into(), log_fields: BTreeMap::new() }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(Severity::Success, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Severity::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self::new(Severity::CriticalError, message)
    }

    pub fn ignore(message: impl Into<String>) -> Self {
        Self::new(Severity::Ignore, message)
    }

    pub fn overwrite(message: impl Into<String>) -> Self {
        Self::new(Severity::Overwrite, message)
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.log_fields.insert(key.into(), value.into());
        self
    }
}

impl<E: std::error::Error> From<E> for Outcome {
    fn from(e: E) -> Self {
        Outcome::error(e.to_string())
    }
}

// ── Handler ───────────────────────────────────────────────────────────────────

pub trait CommandHandler {
    fn execute(&mut self, payload: &Payload, ctx: &mut EngineContext<'_>) -> Outcome;

    /// Called once with every member of a fused batch before the members are
    /// executed one by one.  The payloads are not expanded yet: a member may
    /// depend on variables an earlier member writes.
    fn prepare_batch(&mut self, _payloads: &[&Payload]) {}
}

impl<F> CommandHandler for F
where
    F: FnMut(&Payload, &mut EngineContext<'_>) -> Outcome,
{
    fn execute(&mut self, payload: &Payload, ctx: &mut EngineContext<'_>) -> Outcome {
        self(payload, ctx)
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<Keyword, Box<dyn CommandHandler>>,
}

impl HandlerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the pure built-in handlers (`Echo`, `Math`,
    /// `StrFormat`, `Wait`, `Beep`).
    pub fn with_builtins() -> Self {
        let mut r = Self::new();
        builtins::register(&mut r);
        r
    }

    /// Register `handler` for `keyword`, replacing any previous one.
    pub fn register(&mut self, keyword: Keyword, handler: impl CommandHandler + 'static) {
        self.handlers.insert(keyword, Box::new(handler));
    }

    /// Register a closure.
    pub fn register_fn<F>(&mut self, keyword: Keyword, f: F)
    where
        F: FnMut(&Payload, &mut EngineContext<'_>) -> Outcome + 'static,
    {
        self.register(keyword, f);
    }

    pub fn get_mut(&mut self, keyword: Keyword) -> Option<&mut (dyn CommandHandler + 'static)> {
        self.handlers.get_mut(&keyword).map(|h| h.as_mut())
    }

    pub fn contains(&self, keyword: Keyword) -> bool {
        self.handlers.contains_key(&keyword)
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.handlers.keys().collect();
        keys.sort();
        f.debug_struct("HandlerRegistry").field("keywords", &keys).finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
