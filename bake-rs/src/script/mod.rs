//! The script language: from raw section lines to executed commands.
//!
//! | Stage | Module |
//! |-------|--------|
//! | split a line into arguments | [`lexer`] |
//! | keyword table and typed payloads | [`schema`], [`command`] |
//! | lines to a command tree (blocks, `Else` chains, batches) | [`parser`] |
//! | variable tiers and `%Name%`/`#n` expansion | [`variables`], [`expand`] |
//! | `If` predicates | [`condition`] |
//! | execution, call frames, macros, error policy | [`engine`] |
//! | handler contract and the built-in handlers | [`handler`], [`builtins`] |
//!
//! # Quick start
//!
//! ```rust
//! use bake::project::{Project, Script};
//! use bake::script::{Engine, EngineOptions};
//!
//! let mut project = Project::new();
//! project.add(Script::parse("hello.script", "[Process]\nSet,%A%,6\nMath,Mul,%A%,%A%,7\nEcho,%A%\n"));
//! let mut engine = Engine::new(project, EngineOptions::default());
//! let report = engine.run();
//! assert_eq!(engine.output, vec!["42"]);
//! assert_eq!(report.exit_code(), 0);
//! ```

pub mod builtins;
pub mod command;
pub mod condition;
pub mod engine;
pub mod expand;
pub mod handler;
pub mod lexer;
pub mod parser;
pub mod schema;
pub mod value;
pub mod variables;

pub use command::{CommandNode, Keyword, Payload, VarKey};
pub use engine::{Engine, EngineContext, EngineOptions, HaltHandle, RunReport, RunStatus};
pub use handler::{CommandHandler, HandlerRegistry, Outcome, Severity};
