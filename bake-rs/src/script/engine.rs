//! Execution engine.
//!
//! The [`Engine`] walks parsed sections one command at a time.  Control
//! commands (`If`, `Run`, `Loop`, `Set`, …) are executed here; everything
//! else is expanded and dispatched to the [`HandlerRegistry`].
//!
//! Non-local exits travel up the Rust stack as [`Unwind`] signals:
//!
//! | Signal | Raised by | Caught by |
//! |--------|-----------|-----------|
//! | `Section` | an `Error` outside `ErrorOff` | the calling `Run`/`Loop`/macro, which reports `Error` itself |
//! | `Script` | `CriticalError`, a section that fails to parse, `Exit` | [`Engine::run`], which moves to the next script |
//! | `Run` | `Halt`, `stop_build_on_error`, a [`HaltHandle`] | [`Engine::run`], which stops |

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::log::{LogEvent, LogSink, LogState};
use crate::project::{Project, Script};
use crate::var::VarStore;

use super::command::{
    Call, CommandNode, ElseBlock, IfBlock, Keyword, LoopForm, MacroCall, Payload, Position, ScriptId,
    SetMacro, SetScope, SetVar, SystemCmd, VarKey,
};
use super::condition::{self, CondKind, Condition, ConditionEnv, ConditionError, ConditionProbe, NullProbe};
use super::expand::{self, ExpandError, Resolve};
use super::handler::{HandlerRegistry, Outcome, Severity};
use super::parser;
use super::schema;
use super::value::Number;
use super::variables::{Scope, VarError, Variables};

/// Deepest allowed nesting of section, loop and macro frames.
pub const MAX_CALL_DEPTH: usize = 128;

/// Largest `System,ErrorOff` count.
pub const MAX_ERROR_OFF: u32 = 255;

/// Names that resolve to the running script rather than a stored variable.
const SCRIPT_VARS: &[&str] = &["ScriptFile", "ScriptDir", "ScriptTitle"];

// ── Options ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Section run when a script starts.
    pub entry_section: String,
    /// Section holding `Name=Command` macro definitions.
    pub macro_section: String,
    /// Section holding `%Key%=Value` script variables.
    pub variables_section: String,
    /// Halt the whole run on the first unsuppressed `Error`.
    pub stop_build_on_error: bool,
    /// Sections that keep going after an `Error`.
    pub best_effort_sections: Vec<String>,
    /// Called sections start with a copy of the caller's locals.
    pub inherit_locals: bool,
    /// `Set,#c,...` inside a loop changes the next iteration.
    pub overridable_loop_counter: bool,
    /// Fuse adjacent same-file commands into batches.
    pub optimize: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            entry_section: "Process".into(),
            macro_section: "ApiVar".into(),
            variables_section: "Variables".into(),
            stop_build_on_error: false,
            best_effort_sections: Vec::new(),
            inherit_locals: false,
            overridable_loop_counter: false,
            optimize: true,
        }
    }
}

// ── Halt handle ───────────────────────────────────────────────────────────────

/// Cooperative cancellation flag, polled between commands.
#[derive(Debug, Clone, Default)]
pub struct HaltHandle(Arc<AtomicBool>);

impl HaltHandle {
    pub fn halt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Run report ────────────────────────────────────────────────────────────────

/// How the run ended, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum RunStatus {
    Done,
    Exited,
    ScriptAborted,
    Halted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub worst: LogState,
    pub parser_errors: usize,
    pub scripts_run: usize,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        if self.status == RunStatus::Halted {
            3
        } else if self.worst >= LogState::ParserError {
            2
        } else if self.worst == LogState::Error {
            1
        } else {
            0
        }
    }
}

// ── Runtime state ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unwind {
    Section,
    Script,
    Run,
}

#[derive(Debug, Clone, Default)]
struct Frame {
    script: ScriptId,
    section: String,
    in_params: Vec<String>,
    out_values: Vec<String>,
    error_off: u32,
    else_flag: bool,
}

impl Frame {
    fn new(script: ScriptId, section: &str, in_params: Vec<String>, out_values: Vec<String>) -> Self {
        Frame { script, section: section.to_owned(), in_params, out_values, ..Default::default() }
    }
}

#[derive(Debug, Clone)]
struct LoopState {
    counter: String,
    break_requested: bool,
}

#[derive(Debug, Default)]
struct State {
    vars: Variables,
    frames: Vec<Frame>,
    loops: Vec<LoopState>,
    return_value: String,
    /// Messages emitted by the running handler.
    pending: Vec<(Severity, String)>,
}

#[derive(Debug, Clone)]
struct MacroDef {
    command: String,
    parsed: Option<Result<CommandNode, String>>,
}

impl MacroDef {
    fn new(command: impl Into<String>) -> Self {
        MacroDef { command: command.into(), parsed: None }
    }

    fn body(&mut self) -> Result<CommandNode, String> {
        let command = &self.command;
        self.parsed
            .get_or_insert_with(|| match parser::parse_line(command, Position::default()) {
                None => Err("macro body is empty".to_owned()),
                Some(CommandNode { payload: Payload::Invalid(e), .. }) => Err(e.to_string()),
                Some(node) => Ok(node),
            })
            .clone()
    }
}

enum LoadError {
    Missing(String),
    Parse,
}

// ── Variable lookup ───────────────────────────────────────────────────────────

/// Read-only view used for expansion.
struct Lookup<'a> {
    state: &'a State,
    script: Option<&'a Script>,
}

impl<'a> Lookup<'a> {
    fn new(state: &'a State, project: &'a Project) -> Self {
        let script = state.frames.last().and_then(|f| project.get(f.script));
        Lookup { state, script }
    }

    fn frame(&self) -> Option<&'a Frame> {
        self.state.frames.last()
    }
}

fn script_var(script: Option<&Script>, name: &str) -> Option<String> {
    let script = script?;
    if name.eq_ignore_ascii_case("ScriptFile") {
        Some(script.path_str())
    } else if name.eq_ignore_ascii_case("ScriptDir") {
        Some(script.dir())
    } else if name.eq_ignore_ascii_case("ScriptTitle") {
        Some(script.title.clone())
    } else {
        None
    }
}

fn is_script_var(name: &str) -> bool {
    SCRIPT_VARS.iter().any(|n| n.eq_ignore_ascii_case(name))
}

impl Resolve for Lookup<'_> {
    fn var(&self, name: &str) -> Option<String> {
        self.state.vars.get(name).map(str::to_owned).or_else(|| script_var(self.script, name))
    }

    fn in_param(&self, n: usize) -> Option<String> {
        self.frame()?.in_params.get(n.checked_sub(1)?).cloned()
    }

    fn in_count(&self) -> usize {
        self.frame().map_or(0, |f| f.in_params.len())
    }

    fn out_param(&self, n: usize) -> Option<String> {
        self.frame()?.out_values.get(n.checked_sub(1)?).cloned()
    }

    fn out_count(&self) -> usize {
        self.frame().map_or(0, |f| f.out_values.len())
    }

    fn return_value(&self) -> String {
        self.state.return_value.clone()
    }

    fn loop_counter(&self) -> Option<String> {
        self.state.loops.last().map(|l| l.counter.clone())
    }
}

// ── EngineContext ─────────────────────────────────────────────────────────────

/// What a handler may touch while it runs: variables, the current script
/// and section, the log and the output buffer.
pub struct EngineContext<'a> {
    state: &'a mut State,
    output: &'a mut Vec<String>,
    project: &'a Project,
    overridable_loop_counter: bool,
}

impl<'a> EngineContext<'a> {
    fn new(
        state: &'a mut State,
        output: &'a mut Vec<String>,
        project: &'a Project,
        overridable_loop_counter: bool,
    ) -> Self {
        EngineContext { state, output, project, overridable_loop_counter }
    }

    fn lookup(&self) -> Lookup<'_> {
        Lookup::new(self.state, self.project)
    }

    /// Resolve a variable through local, global and fixed scope.
    pub fn get(&self, name: &str) -> Option<String> {
        self.lookup().var(name)
    }

    pub fn get_in(&self, scope: Scope, name: &str) -> Option<&str> {
        self.state.vars.get_in(scope, name)
    }

    pub fn is_fixed(&self, name: &str) -> bool {
        self.state.vars.is_fixed(name) || is_script_var(name)
    }

    pub fn set(&mut self, scope: Scope, name: &str, value: impl Into<String>) -> Result<(), VarError> {
        if self.is_fixed(name) {
            return Err(VarError::ReadOnly(name.to_owned()));
        }
        self.state.vars.set(scope, name, value)
    }

    pub fn delete(&mut self, scope: Scope, name: &str) -> Result<bool, VarError> {
        self.state.vars.delete(scope, name)
    }

    /// Current value of a destination key.
    pub fn get_key(&self, key: &VarKey) -> Option<String> {
        let r = self.lookup();
        match key {
            VarKey::Var(name) => r.var(name),
            VarKey::InParam(n) => r.in_param(*n),
            VarKey::OutParam(n) => r.out_param(*n),
            VarKey::ReturnValue => Some(r.return_value()),
            VarKey::LoopCounter => r.loop_counter(),
        }
    }

    /// Write a destination key.  A `%Name%` goes to whichever of local and
    /// global already holds it, else to local.
    pub fn set_key(&mut self, key: &VarKey, value: impl Into<String>) -> Result<(), VarError> {
        let value = value.into();
        match key {
            VarKey::Var(name) => {
                let scope = if self.state.vars.get_in(Scope::Local, name).is_none()
                    && self.state.vars.get_in(Scope::Global, name).is_some()
                {
                    Scope::Global
                } else {
                    Scope::Local
                };
                self.set(scope, name, value)
            }
            VarKey::InParam(n) => {
                let frame = self.state.frames.last_mut().ok_or_else(|| VarError::InvalidKey(key.to_string()))?;
                if frame.in_params.len() < *n {
                    frame.in_params.resize(*n, String::new());
                }
                frame.in_params[*n - 1] = value;
                Ok(())
            }
            VarKey::OutParam(n) => {
                let slot = self
                    .state
                    .frames
                    .last_mut()
                    .and_then(|f| f.out_values.get_mut(*n - 1))
                    .ok_or_else(|| VarError::InvalidKey(key.to_string()))?;
                *slot = value;
                Ok(())
            }
            VarKey::ReturnValue => {
                self.state.return_value = value;
                Ok(())
            }
            VarKey::LoopCounter => match self.state.loops.last_mut() {
                Some(l) if self.overridable_loop_counter => {
                    l.counter = value;
                    Ok(())
                }
                _ => Err(VarError::ReadOnly(key.to_string())),
            },
        }
    }

    fn script(&self) -> Option<&Script> {
        self.state.frames.last().and_then(|f| self.project.get(f.script))
    }

    pub fn script_path(&self) -> String {
        self.script().map(Script::path_str).unwrap_or_default()
    }

    pub fn script_dir(&self) -> String {
        self.script().map(Script::dir).unwrap_or_default()
    }

    pub fn section(&self) -> &str {
        self.state.frames.last().map_or("", |f| f.section.as_str())
    }

    /// Add an extra entry to the build log.
    pub fn emit(&mut self, severity: Severity, message: impl Into<String>) {
        self.state.pending.push((severity, message.into()));
    }

    /// Append a line to [`Engine::output`].
    pub fn print(&mut self, line: impl Into<String>) {
        self.output.push(line.into());
    }
}

impl Resolve for EngineContext<'_> {
    fn var(&self, name: &str) -> Option<String> {
        self.lookup().var(name)
    }
    fn in_param(&self, n: usize) -> Option<String> {
        self.lookup().in_param(n)
    }
    fn in_count(&self) -> usize {
        self.lookup().in_count()
    }
    fn out_param(&self, n: usize) -> Option<String> {
        self.lookup().out_param(n)
    }
    fn out_count(&self) -> usize {
        self.lookup().out_count()
    }
    fn return_value(&self) -> String {
        self.state.return_value.clone()
    }
    fn loop_counter(&self) -> Option<String> {
        self.lookup().loop_counter()
    }
}

// ── Condition environment ─────────────────────────────────────────────────────

struct CondEnv<'a> {
    lookup: Lookup<'a>,
    project: &'a Project,
    global_macros: &'a HashMap<String, MacroDef>,
    local_macros: &'a HashMap<String, MacroDef>,
    probe: &'a mut dyn ConditionProbe,
    from: ScriptId,
}

impl ConditionEnv for CondEnv<'_> {
    fn section_exists(&self, script: &str, section: &str) -> bool {
        self.project.section_exists(script, section, self.from)
    }

    fn var_exists(&self, key: &str) -> Result<bool, ConditionError> {
        let parsed = VarKey::parse(key).ok_or_else(|| ConditionError::BadVarKey(key.to_owned()))?;
        let r = &self.lookup;
        Ok(match parsed {
            VarKey::Var(name) => r.var(&name).is_some(),
            VarKey::InParam(n) => n <= r.in_count(),
            VarKey::OutParam(n) => n <= r.out_count(),
            VarKey::ReturnValue => true,
            VarKey::LoopCounter => r.loop_counter().is_some(),
        })
    }

    fn macro_exists(&self, name: &str) -> bool {
        let key = name.to_ascii_lowercase();
        self.global_macros.contains_key(&key) || self.local_macros.contains_key(&key)
    }

    fn probe(&mut self, kind: CondKind, args: &[String]) -> Option<bool> {
        self.probe.probe(kind, args)
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

pub struct Engine {
    options: EngineOptions,
    handlers: HandlerRegistry,
    probe: Box<dyn ConditionProbe>,
    sink: Option<Box<dyn LogSink>>,
    halt: HaltHandle,
    halt_reported: bool,
    project: Project,
    sections: HashMap<(ScriptId, String), Rc<[CommandNode]>>,
    global_macros: HashMap<String, MacroDef>,
    local_macros: HashMap<String, MacroDef>,
    state: State,
    exited: bool,
    worst: LogState,
    parser_errors: usize,
    /// Every log event of the run, in order.
    pub events: Vec<LogEvent>,
    /// Lines printed by handlers (`Echo`).
    pub output: Vec<String>,
}

impl Engine {
    /// An engine over `project` with the built-in handlers registered.
    pub fn new(project: Project, options: EngineOptions) -> Self {
        Engine {
            options,
            handlers: HandlerRegistry::with_builtins(),
            probe: Box::new(NullProbe),
            sink: None,
            halt: HaltHandle::default(),
            halt_reported: false,
            project,
            sections: HashMap::new(),
            global_macros: HashMap::new(),
            local_macros: HashMap::new(),
            state: State::default(),
            exited: false,
            worst: LogState::Success,
            parser_errors: 0,
            events: Vec::new(),
            output: Vec::new(),
        }
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_probe(mut self, probe: impl ConditionProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Seed the read-only variable tier.
    pub fn with_fixed(mut self, fixed: VarStore) -> Self {
        self.state.vars = Variables::new(fixed);
        self
    }

    pub fn handlers_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.handlers
    }

    /// Define a run-wide macro.
    pub fn define_macro(&mut self, name: &str, command: &str) {
        self.global_macros.insert(name.to_ascii_lowercase(), MacroDef::new(command));
    }

    pub fn halt_handle(&self) -> HaltHandle {
        self.halt.clone()
    }

    pub fn variables(&self) -> &Variables {
        &self.state.vars
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Run every script of the project in order.
    pub fn run(&mut self) -> RunReport {
        let count = self.project.len();
        let mut status = RunStatus::Done;
        let mut scripts_run = 0;
        for id in 0..count {
            if self.halt.is_halted() {
                status = RunStatus::Halted;
                break;
            }
            scripts_run += 1;
            match self.run_script(id, id == 0) {
                Ok(()) | Err(Unwind::Section) => {}
                Err(Unwind::Script) => {
                    let s = if self.exited { RunStatus::Exited } else { RunStatus::ScriptAborted };
                    status = status.max(s);
                }
                Err(Unwind::Run) => {
                    status = RunStatus::Halted;
                    break;
                }
            }
        }
        tracing::info!(?status, worst = ?self.worst, parser_errors = self.parser_errors, "run finished");
        RunReport { status, worst: self.worst, parser_errors: self.parser_errors, scripts_run }
    }

    fn run_script(&mut self, id: ScriptId, first: bool) -> Result<(), Unwind> {
        self.exited = false;
        self.state.frames.clear();
        self.state.loops.clear();
        self.local_macros = self.script_macros(id);
        let locals = self.script_variables(id);
        if first {
            for (name, value) in locals.iter() {
                if let Err(e) = self.state.vars.set(Scope::Global, name, value) {
                    tracing::warn!(name = %name, "cannot seed global variable: {e}");
                }
            }
            self.global_macros.extend(self.local_macros.clone());
        }

        let entry = self.options.entry_section.clone();
        let exists = self.project.get(id).is_some_and(|s| s.section(&entry).is_some());
        if !exists {
            let title = self.project.get(id).map(|s| s.title.clone()).unwrap_or_default();
            self.log(Some(Position { script: id, line: 0 }), Some(&entry), None, LogState::Error,
                format!("script {title:?} has no [{entry}] section"), BTreeMap::new());
            return Ok(());
        }
        let (result, _) = self.call_section(Frame::new(id, &entry, Vec::new(), Vec::new()), locals);
        result
    }

    /// `[Variables]` of a script, skipping names that are fixed.
    fn script_variables(&mut self, id: ScriptId) -> VarStore {
        let section = self.options.variables_section.clone();
        let pairs = self.project.get(id).map(|s| s.variables(&section)).unwrap_or_default();
        let mut store = VarStore::new();
        for (name, value) in pairs {
            if self.state.vars.is_fixed(&name) || is_script_var(&name) {
                self.log(Some(Position { script: id, line: 0 }), Some(&section), None, LogState::Warning,
                    format!("fixed variable %{name}% cannot be redefined"), BTreeMap::new());
            } else if super::variables::is_var_name(&name) {
                store.set(name, value);
            } else {
                tracing::warn!(name = %name, "skipping invalid variable name");
            }
        }
        store
    }

    fn script_macros(&self, id: ScriptId) -> HashMap<String, MacroDef> {
        let Some(script) = self.project.get(id) else {
            return HashMap::new();
        };
        script
            .key_values(&self.options.macro_section)
            .into_iter()
            .filter(|(name, _)| {
                let ok = schema::is_macro_name(name);
                if !ok {
                    tracing::warn!(name = %name, "skipping invalid macro name");
                }
                ok
            })
            .map(|(name, command)| (name.to_ascii_lowercase(), MacroDef::new(command)))
            .collect()
    }

    // ── Logging ───────────────────────────────────────────────────────────────

    fn log(
        &mut self,
        pos: Option<Position>,
        section: Option<&str>,
        keyword: Option<Keyword>,
        state: LogState,
        message: String,
        fields: BTreeMap<String, String>,
    ) {
        let frame = self.state.frames.last();
        let event = LogEvent {
            script_id: pos.map(|p| p.script).or(frame.map(|f| f.script)).unwrap_or_default(),
            section: section.map(str::to_owned).or_else(|| frame.map(|f| f.section.clone())).unwrap_or_default(),
            line_no: pos.map_or(0, |p| p.line),
            command_keyword: keyword.map(|k| k.name().to_owned()),
            state,
            message,
            timestamp: Utc::now(),
            depth: self.state.frames.len(),
            fields,
        };
        self.worst = self.worst.max(state);
        if state == LogState::ParserError {
            self.parser_errors += 1;
        }
        if let Some(sink) = &mut self.sink {
            sink.record(&event);
        }
        self.events.push(event);
    }

    fn record(&mut self, node: &CommandNode, state: LogState, message: impl Into<String>) {
        self.log(Some(node.pos), None, Some(node.keyword), state, message.into(), BTreeMap::new());
    }

    fn flush_pending(&mut self, node: &CommandNode) {
        for (severity, message) in std::mem::take(&mut self.state.pending) {
            self.record(node, severity.into(), message);
        }
    }

    /// Log an outcome and apply the error policy.
    fn apply(&mut self, node: &CommandNode, outcome: Outcome) -> Result<(), Unwind> {
        let Outcome { severity, message, log_fields } = outcome;
        let (state, result) = match severity {
            Severity::Error => self.on_error(node, &message),
            Severity::CriticalError => (LogState::CriticalError, Err(Unwind::Script)),
            s => (s.into(), Ok(())),
        };
        let message = match state {
            LogState::Warning if severity == Severity::Error => format!("{message} (error suppressed)"),
            _ => message,
        };
        self.log(Some(node.pos), None, Some(node.keyword), state, message, log_fields);
        result
    }

    fn on_error(&mut self, node: &CommandNode, message: &str) -> (LogState, Result<(), Unwind>) {
        if let Some(frame) = self.state.frames.last_mut().filter(|f| f.error_off > 0) {
            frame.error_off -= 1;
            tracing::warn!(line = node.pos.line, keyword = %node.keyword, "suppressed error: {message}");
            return (LogState::Warning, Ok(()));
        }
        if self.options.stop_build_on_error {
            self.halt.halt();
            self.halt_reported = true;
            return (LogState::Error, Err(Unwind::Run));
        }
        let section = self.state.frames.last().map(|f| f.section.as_str()).unwrap_or("");
        if self.options.best_effort_sections.iter().any(|s| s.eq_ignore_ascii_case(section)) {
            return (LogState::Error, Ok(()));
        }
        (LogState::Error, Err(Unwind::Section))
    }

    fn check_halt(&mut self) -> Result<(), Unwind> {
        if !self.halt.is_halted() {
            return Ok(());
        }
        if !self.halt_reported {
            self.halt_reported = true;
            self.log(None, None, None, LogState::Warning, "build halted".into(), BTreeMap::new());
        }
        Err(Unwind::Run)
    }

    // ── Sections ──────────────────────────────────────────────────────────────

    fn load_section(&mut self, script: ScriptId, name: &str) -> Result<Rc<[CommandNode]>, LoadError> {
        let key = (script, name.to_ascii_lowercase());
        if let Some(nodes) = self.sections.get(&key) {
            return Ok(nodes.clone());
        }
        let Some(sec) = self.project.get(script).and_then(|s| s.section(name)) else {
            let title = self.project.get(script).map(|s| s.title.clone()).unwrap_or_default();
            return Err(LoadError::Missing(format!("section [{name}] does not exist in {title:?}")));
        };
        let parsed = parser::parse_section(&sec.lines, script, sec.first_line, self.options.optimize);
        if !parsed.is_ok() {
            for e in parsed.errors {
                self.log(Some(e.pos), Some(name), None, LogState::ParserError,
                    format!("{}: {}", e.error, e.raw), BTreeMap::new());
            }
            return Err(LoadError::Parse);
        }
        let nodes: Rc<[CommandNode]> = parsed.nodes.into();
        self.sections.insert(key, nodes.clone());
        Ok(nodes)
    }

    /// Run a section in a new frame with `locals` as its local tier.  The
    /// caller's locals are restored afterwards.
    fn call_section(&mut self, frame: Frame, locals: VarStore) -> (Result<(), Unwind>, Frame) {
        let nodes = match self.load_section(frame.script, &frame.section) {
            Ok(nodes) => nodes,
            Err(LoadError::Missing(message)) => {
                self.log(None, Some(&frame.section), None, LogState::Error, message, BTreeMap::new());
                return (Err(Unwind::Section), frame);
            }
            Err(LoadError::Parse) => return (Err(Unwind::Script), frame),
        };

        let saved = self.state.vars.replace_locals(locals);
        let section = frame.section.clone();
        let script = frame.script;
        self.state.frames.push(frame);
        let depth = self.state.frames.len();
        tracing::info!(section = %section, depth, "processing section");
        self.log(Some(Position { script, line: 0 }), None, None, LogState::Info,
            format!("processing section [{section}]"), BTreeMap::new());

        let result = self.exec_block(&nodes);
        self.close_frame(depth);

        let frame = self.state.frames.pop().unwrap_or_default();
        self.state.vars.replace_locals(saved);
        (result, frame)
    }

    /// Restore any `SetLocal` still open in the frame at `depth`.
    fn close_frame(&mut self, depth: usize) {
        let unbalanced = self.state.vars.unwind_set_local(depth);
        if unbalanced > 0 {
            self.log(None, None, None, LogState::Warning,
                format!("UnbalancedSetLocal: {unbalanced} SetLocal without EndLocal"), BTreeMap::new());
        }
    }

    fn exec_block(&mut self, nodes: &[CommandNode]) -> Result<(), Unwind> {
        for node in nodes {
            self.exec_node(node)?;
        }
        Ok(())
    }

    fn exec_node(&mut self, node: &CommandNode) -> Result<(), Unwind> {
        self.check_halt()?;
        tracing::debug!(line = node.pos.line, keyword = %node.keyword, "{}", node.raw);
        match &node.payload {
            Payload::Invalid(e) => {
                let message = e.to_string();
                self.record(node, LogState::ParserError, message);
                Err(Unwind::Script)
            }
            Payload::If(b) => self.exec_if(node, b),
            Payload::Else(b) => self.exec_else(node, b),
            Payload::Begin | Payload::End => {
                self.apply(node, Outcome::error("Begin/End outside an If or Else block"))
            }
            Payload::Batch(members) => self.exec_batch(node, members),
            Payload::Set(set) => self.exec_set(node, set),
            Payload::SetMacro(m) => self.exec_set_macro(node, m),
            _ if node.keyword.is_control() => match self.expand_payload(&node.payload) {
                Ok(payload) => self.exec_control(node, payload),
                Err(e) => self.apply(node, e.into()),
            },
            _ => match self.expand_payload(&node.payload) {
                Ok(payload) => self.dispatch(node, &payload),
                Err(e) => self.apply(node, e.into()),
            },
        }
    }

    fn expand(&self, s: &str) -> Result<String, ExpandError> {
        expand::expand(s, &Lookup::new(&self.state, &self.project))
    }

    fn preprocess(&self, s: &str) -> Result<String, ExpandError> {
        expand::preprocess(s, &Lookup::new(&self.state, &self.project))
    }

    fn expand_payload(&self, payload: &Payload) -> Result<Payload, ExpandError> {
        let lookup = Lookup::new(&self.state, &self.project);
        let mut payload = payload.clone();
        payload.visit_strings::<ExpandError>(&mut |s: &mut String| {
            *s = expand::preprocess(s, &lookup)?;
            Ok(())
        })?;
        Ok(payload)
    }

    fn context(&mut self) -> EngineContext<'_> {
        EngineContext::new(
            &mut self.state,
            &mut self.output,
            &self.project,
            self.options.overridable_loop_counter,
        )
    }

    // ── Handlers ──────────────────────────────────────────────────────────────

    fn dispatch(&mut self, node: &CommandNode, payload: &Payload) -> Result<(), Unwind> {
        let outcome = match self.handlers.get_mut(node.keyword) {
            None => Outcome::error(format!("no handler registered for {}", node.keyword)),
            Some(handler) => {
                let mut ctx = EngineContext::new(
                    &mut self.state,
                    &mut self.output,
                    &self.project,
                    self.options.overridable_loop_counter,
                );
                handler.execute(payload, &mut ctx)
            }
        };
        self.flush_pending(node);
        self.apply(node, outcome)
    }

    fn exec_batch(&mut self, node: &CommandNode, members: &[CommandNode]) -> Result<(), Unwind> {
        tracing::debug!(keyword = %node.keyword, count = members.len(), "running batch");
        if let Some(handler) = self.handlers.get_mut(node.keyword) {
            let refs: Vec<&Payload> = members.iter().map(|m| &m.payload).collect();
            handler.prepare_batch(&refs);
        }
        // Each member sees the variables its predecessors wrote.
        for m in members {
            self.check_halt()?;
            match self.expand_payload(&m.payload) {
                Ok(p) => self.dispatch(m, &p)?,
                Err(e) => self.apply(m, e.into())?,
            }
        }
        Ok(())
    }

    // ── Branching ─────────────────────────────────────────────────────────────

    fn expand_condition(&self, cond: &Condition) -> Result<Condition, ExpandError> {
        let mut out = cond.clone();
        for (i, arg) in out.args.iter_mut().enumerate() {
            // ExistVar names a key; expanding it would test its value instead.
            if cond.kind == CondKind::ExistVar && i == 0 {
                continue;
            }
            *arg = self.preprocess(arg)?;
        }
        Ok(out)
    }

    fn exec_if(&mut self, node: &CommandNode, b: &IfBlock) -> Result<(), Unwind> {
        let cond = match self.expand_condition(&b.condition) {
            Ok(c) => c,
            Err(e) => return self.apply(node, e.into()),
        };
        let from = self.state.frames.last().map_or(0, |f| f.script);
        let result = {
            let mut env = CondEnv {
                lookup: Lookup::new(&self.state, &self.project),
                project: &self.project,
                global_macros: &self.global_macros,
                local_macros: &self.local_macros,
                probe: self.probe.as_mut(),
                from,
            };
            condition::evaluate(&cond, &mut env)
        };
        match result {
            Err(e) => self.apply(node, e.into()),
            Ok(true) => {
                self.record(node, LogState::Success, format!("condition {} is true", cond.kind));
                self.exec_block(&b.block)?;
                self.set_else_flag(false);
                Ok(())
            }
            Ok(false) => {
                self.record(node, LogState::Ignore, format!("condition {} is false", cond.kind));
                self.set_else_flag(true);
                Ok(())
            }
        }
    }

    fn exec_else(&mut self, node: &CommandNode, b: &ElseBlock) -> Result<(), Unwind> {
        let run = self.state.frames.last().is_some_and(|f| f.else_flag);
        if !run {
            self.record(node, LogState::Ignore, "else condition not met");
            return Ok(());
        }
        self.record(node, LogState::Success, "else condition met");
        self.exec_block(&b.block)?;
        // `Else,If,...` chains keep the flag the inner If left behind.
        let chained = matches!(b.block.as_slice(), [only] if only.keyword == Keyword::If);
        if !chained {
            self.set_else_flag(false);
        }
        Ok(())
    }

    fn set_else_flag(&mut self, value: bool) {
        if let Some(f) = self.state.frames.last_mut() {
            f.else_flag = value;
        }
    }

    // ── Control ───────────────────────────────────────────────────────────────

    fn exec_control(&mut self, node: &CommandNode, payload: Payload) -> Result<(), Unwind> {
        match payload {
            Payload::AddVariables(a) => {
                let outcome = self.add_variables(&a.script, &a.section, a.global);
                self.flush_pending(node);
                self.apply(node, outcome)
            }
            Payload::Exit { message, no_warn } => {
                let state = if no_warn { LogState::Info } else { LogState::Warning };
                self.record(node, state, format!("exit: {message}"));
                self.exited = true;
                Err(Unwind::Script)
            }
            Payload::Halt { message } => {
                self.record(node, LogState::Warning, format!("halt: {message}"));
                self.halt.halt();
                self.halt_reported = true;
                Err(Unwind::Run)
            }
            Payload::Run(call) | Payload::RunEx(call) => self.exec_call(node, &call, false),
            Payload::Exec(call) => self.exec_call(node, &call, true),
            Payload::Loop(form) | Payload::LoopEx(form) => self.exec_loop(node, form, false),
            Payload::LoopLetter(form) | Payload::LoopLetterEx(form) => self.exec_loop(node, form, true),
            Payload::System(cmd) => self.exec_system(node, cmd),
            Payload::Macro(m) => self.exec_macro(node, &m),
            other => self.dispatch(node, &other),
        }
    }

    fn exec_set(&mut self, node: &CommandNode, set: &SetVar) -> Result<(), Unwind> {
        // Set expands but keeps escape sequences as written.
        let value = match self.expand(&set.value) {
            Ok(v) => v,
            Err(e) => return self.apply(node, e.into()),
        };
        let delete = set.value.trim().eq_ignore_ascii_case("NIL");
        let name = match &set.key {
            VarKey::Var(name) => name,
            key => {
                let key = key.clone();
                let value = if delete { String::new() } else { value };
                let outcome = match self.context().set_key(&key, value.clone()) {
                    Ok(()) => Outcome::success(format!("{key} set to [{value}]")),
                    Err(e) => e.into(),
                };
                return self.apply(node, outcome);
            }
        };

        if self.context().is_fixed(name) {
            return self.apply(node, Outcome::warning(format!("fixed variable %{name}% cannot be overwritten")));
        }
        let vars = &mut self.state.vars;
        let outcome = if delete {
            let local = vars.delete(Scope::Local, name).unwrap_or(false);
            let global = vars.delete(Scope::Global, name).unwrap_or(false);
            if local || global {
                Outcome::success(format!("variable %{name}% removed"))
            } else {
                Outcome::ignore(format!("variable %{name}% does not exist"))
            }
        } else {
            let result = match set.scope {
                SetScope::Local => vars.set(Scope::Local, name, value.as_str()),
                SetScope::Global | SetScope::Permanent => vars
                    .set(Scope::Global, name, value.as_str())
                    .map(|()| {
                        let _ = vars.delete(Scope::Local, name);
                    }),
            };
            match result {
                Ok(()) => {
                    if set.scope == SetScope::Permanent {
                        let script = self.state.frames.last().map_or(0, |f| f.script);
                        let section = self.options.variables_section.clone();
                        self.project.persist_variable(script, &section, name, &value);
                    }
                    let scope = match set.scope {
                        SetScope::Local => "local",
                        SetScope::Global => "global",
                        SetScope::Permanent => "permanent",
                    };
                    Outcome::success(format!("{scope} variable %{name}% set to [{value}]"))
                }
                Err(e) => e.into(),
            }
        };
        self.apply(node, outcome)
    }

    fn exec_set_macro(&mut self, node: &CommandNode, m: &SetMacro) -> Result<(), Unwind> {
        // The body is stored unexpanded so `#1` refers to the macro's own
        // arguments when it runs.
        let name = match self.preprocess(&m.name) {
            Ok(n) => n,
            Err(e) => return self.apply(node, e.into()),
        };
        if !schema::is_macro_name(&name) || Keyword::from_name(&name).is_some() {
            return self.apply(node, Outcome::error(format!("invalid macro name {name:?}")));
        }
        let key = name.to_ascii_lowercase();
        let table = match m.scope {
            SetScope::Local => &mut self.local_macros,
            SetScope::Global | SetScope::Permanent => &mut self.global_macros,
        };
        let outcome = if m.command.trim().eq_ignore_ascii_case("NIL") {
            match table.remove(&key) {
                Some(_) => Outcome::success(format!("macro {name} removed")),
                None => Outcome::ignore(format!("macro {name} does not exist")),
            }
        } else {
            table.insert(key, MacroDef::new(m.command.clone()));
            if m.scope == SetScope::Permanent {
                let script = self.state.frames.last().map_or(0, |f| f.script);
                let section = self.options.macro_section.clone();
                self.project.persist_macro(script, &section, &name, &m.command);
            }
            Outcome::success(format!("macro {name} set to [{}]", m.command))
        };
        self.apply(node, outcome)
    }

    fn add_variables(&mut self, script: &str, section: &str, global: bool) -> Outcome {
        let from = self.state.frames.last().map_or(0, |f| f.script);
        let id = match self.project.resolve(script, from) {
            Ok(id) => id,
            Err(e) => return e.into(),
        };
        let Some(pairs) = self.project.get(id).and_then(|s| s.section(section).map(|_| s.variables(section))) else {
            return Outcome::error(format!("section [{section}] does not exist"));
        };
        let scope = if global { Scope::Global } else { Scope::Local };
        let mut added = 0;
        for (name, value) in pairs {
            if self.context().is_fixed(&name) {
                self.state.pending.push((Severity::Warning, format!("fixed variable %{name}% skipped")));
                continue;
            }
            match self.state.vars.set(scope, &name, value) {
                Ok(()) => added += 1,
                Err(e) => self.state.pending.push((Severity::Warning, e.to_string())),
            }
        }
        Outcome::success(format!("{added} variables added from [{section}]"))
    }

    fn exec_system(&mut self, node: &CommandNode, cmd: SystemCmd) -> Result<(), Unwind> {
        let depth = self.state.frames.len();
        let outcome = match cmd {
            SystemCmd::ErrorOff(count) => {
                let count = count.unwrap_or_else(|| "1".into());
                match count.trim().parse::<u32>() {
                    Ok(n) if (1..=MAX_ERROR_OFF).contains(&n) => {
                        if let Some(f) = self.state.frames.last_mut() {
                            f.error_off = n;
                        }
                        Outcome::success(format!("error suppression enabled for {n} error(s)"))
                    }
                    _ => Outcome::error(format!("ErrorOff count must be 1-{MAX_ERROR_OFF}, got {count:?}")),
                }
            }
            SystemCmd::SetLocal => {
                self.state.vars.set_local(depth);
                Outcome::success("local variables saved")
            }
            SystemCmd::EndLocal => match self.state.vars.end_local(depth) {
                Ok(()) => Outcome::success("local variables restored"),
                Err(e) => e.into(),
            },
            other => return self.dispatch(node, &Payload::System(other)),
        };
        self.apply(node, outcome)
    }

    // ── Calls ─────────────────────────────────────────────────────────────────

    /// Resolve the target of a call, reporting `Err` as an outcome.
    fn target(&mut self, call: &Call) -> Result<ScriptId, Outcome> {
        let from = self.state.frames.last().map_or(0, |f| f.script);
        let id = self.project.resolve(&call.script, from)?;
        match self.project.get(id) {
            Some(s) if s.section(&call.section).is_some() => Ok(id),
            Some(s) => Err(Outcome::error(format!("section [{}] does not exist in {:?}", call.section, s.title))),
            None => Err(Outcome::error(format!("script {:?} not found", call.script))),
        }
    }

    fn exec_call(&mut self, node: &CommandNode, call: &Call, exec: bool) -> Result<(), Unwind> {
        let target = match self.target(call) {
            Ok(id) => id,
            Err(outcome) => return self.apply(node, outcome),
        };
        self.record(node, LogState::Info, format!("running section [{}]", call.section));
        match self.invoke(node, target, &call.section, call.in_params.clone(), &call.out_params, exec) {
            Err(Unwind::Section) => {
                self.apply(node, Outcome::error(format!("section [{}] failed", call.section)))
            }
            other => other,
        }
    }

    /// Push a frame for `section`, run it, and copy out-parameters back.
    fn invoke(
        &mut self,
        node: &CommandNode,
        target: ScriptId,
        section: &str,
        in_params: Vec<String>,
        out_keys: &[VarKey],
        exec: bool,
    ) -> Result<(), Unwind> {
        if self.state.frames.len() >= MAX_CALL_DEPTH {
            return self.apply(node, Outcome::critical(format!("call depth exceeds {MAX_CALL_DEPTH}")));
        }
        let out_values: Vec<String> = {
            let ctx = self.context();
            out_keys.iter().map(|k| ctx.get_key(k).unwrap_or_default()).collect()
        };
        let locals = if exec {
            self.script_variables(target)
        } else if self.options.inherit_locals {
            self.state.vars.locals().clone()
        } else {
            VarStore::new()
        };
        let saved_macros = exec.then(|| {
            let macros = self.script_macros(target);
            std::mem::replace(&mut self.local_macros, macros)
        });

        let frame = Frame::new(target, section, in_params, out_values);
        let (result, frame) = self.call_section(frame, locals);

        if let Some(macros) = saved_macros {
            self.local_macros = macros;
        }
        for (key, value) in out_keys.iter().zip(frame.out_values) {
            let written = self.context().set_key(key, value);
            if let Err(e) = written {
                self.record(node, LogState::Warning, format!("cannot return {key}: {e}"));
            }
        }
        result
    }

    fn exec_loop(&mut self, node: &CommandNode, form: LoopForm, letters: bool) -> Result<(), Unwind> {
        let (call, start, end) = match form {
            LoopForm::Break => {
                return match self.state.loops.last_mut() {
                    Some(l) => {
                        l.break_requested = true;
                        self.record(node, LogState::Info, "breaking loop");
                        Ok(())
                    }
                    None => self.apply(node, Outcome::error("Loop,BREAK outside a running loop")),
                };
            }
            LoopForm::Range { call, start, end } => (call, start, end),
        };
        let range = if letters { letter_range(&start, &end) } else { number_range(&start, &end) };
        let (first, last) = match range {
            Ok(r) => r,
            Err(message) => return self.apply(node, Outcome::error(message)),
        };
        let target = match self.target(&call) {
            Ok(id) => id,
            Err(outcome) => return self.apply(node, outcome),
        };

        self.state.loops.push(LoopState { counter: String::new(), break_requested: false });
        let mut i = first;
        let mut iterations = 0usize;
        let mut result = Ok(());
        while i <= last {
            let counter = if letters { letter(i) } else { i.to_string() };
            if let Some(l) = self.state.loops.last_mut() {
                l.counter = counter;
            }
            iterations += 1;
            result = self.invoke(node, target, &call.section, call.in_params.clone(), &call.out_params, false);
            if result.is_err() {
                break;
            }
            let Some(l) = self.state.loops.last() else { break };
            if l.break_requested {
                break;
            }
            if self.options.overridable_loop_counter {
                let current = if letters {
                    l.counter.chars().next().map(|c| c.to_ascii_uppercase() as i64)
                } else {
                    l.counter.trim().parse::<i64>().ok()
                };
                if let Some(v) = current {
                    i = v;
                }
            }
            match i.checked_add(1) {
                Some(n) => i = n,
                None => break,
            }
        }
        self.state.loops.pop();

        match result {
            Ok(()) => {
                let message = format!("loop over [{}] ran {iterations} time(s)", call.section);
                self.apply(node, Outcome::success(message))
            }
            Err(Unwind::Section) => {
                self.apply(node, Outcome::error(format!("loop over [{}] failed", call.section)))
            }
            Err(e) => Err(e),
        }
    }

    fn exec_macro(&mut self, node: &CommandNode, call: &MacroCall) -> Result<(), Unwind> {
        let key = call.name.to_ascii_lowercase();
        let def = match self.global_macros.get_mut(&key) {
            Some(d) => Some(d),
            None => self.local_macros.get_mut(&key),
        };
        let mut body = match def.map(MacroDef::body) {
            None => return self.apply(node, Outcome::error(format!("unknown command or macro {:?}", call.name))),
            Some(Err(message)) => {
                return self.apply(node, Outcome::error(format!("macro {}: {message}", call.name)))
            }
            Some(Ok(body)) => body,
        };
        if self.state.frames.len() >= MAX_CALL_DEPTH {
            return self.apply(node, Outcome::critical(format!("call depth exceeds {MAX_CALL_DEPTH}")));
        }

        body.pos = node.pos;
        if let Payload::Run(c) | Payload::RunEx(c) | Payload::Exec(c) = &mut body.payload {
            if c.in_params.is_empty() {
                c.in_params = call.args.clone();
            }
        }

        let (script, section) = self
            .state
            .frames
            .last()
            .map(|f| (f.script, f.section.clone()))
            .unwrap_or_default();
        self.state.frames.push(Frame::new(script, &section, call.args.clone(), Vec::new()));
        let depth = self.state.frames.len();
        let result = self.exec_node(&body);
        self.close_frame(depth);
        self.state.frames.pop();

        match result {
            Err(Unwind::Section) => self.apply(node, Outcome::error(format!("macro {} failed", call.name))),
            other => other,
        }
    }
}

fn number_range(start: &str, end: &str) -> Result<(i64, i64), String> {
    let int = |s: &str| match Number::parse(s) {
        Some(n) if n.is_int() => Ok(n.as_i64()),
        _ => Err(format!("loop index {s:?} is not an integer")),
    };
    Ok((int(start)?, int(end)?))
}

fn letter_range(start: &str, end: &str) -> Result<(i64, i64), String> {
    let letter = |s: &str| {
        let mut chars = s.trim().chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii_alphabetic() => Ok(c.to_ascii_uppercase() as i64),
            _ => Err(format!("loop index {s:?} is not a single letter")),
        }
    };
    let (a, b) = (letter(start)?, letter(end)?);
    if a > b {
        return Err(format!("loop start {start:?} comes after end {end:?}"));
    }
    Ok((a, b))
}

fn letter(code: i64) -> String {
    u8::try_from(code).map(|b| (b as char).to_string()).unwrap_or_default()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::Script;

    fn engine(text: &str) -> Engine {
        let mut project = Project::new();
        project.add(Script::parse("/work/main.script", text));
        Engine::new(project, EngineOptions::default())
    }

    fn states(e: &Engine, keyword: &str) -> Vec<LogState> {
        e.events
            .iter()
            .filter(|ev| ev.command_keyword.as_deref() == Some(keyword))
            .map(|ev| ev.state)
            .collect()
    }

    #[test]
    fn echo_reaches_output() {
        let mut e = engine("[Process]\nSet,%A%,world\nEcho,hello %A%\n");
        let report = e.run();
        assert_eq!(e.output, vec!["hello world"]);
        assert_eq!(report.status, RunStatus::Done);
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn unregistered_keyword_is_error() {
        let mut e = engine("[Process]\nFileCopy,a,b\nEcho,after\n");
        let report = e.run();
        assert_eq!(states(&e, "FileCopy"), vec![LogState::Error]);
        assert!(e.output.is_empty());
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn if_else_chain() {
        let text = "[Process]\n\
            If,1,Equal,2,Echo,one\n\
            Else,If,1,Equal,1,Echo,two\n\
            Else,Echo,three\n";
        let mut e = engine(text);
        e.run();
        assert_eq!(e.output, vec!["two"]);
    }

    #[test]
    fn if_begin_end_block() {
        let text = "[Process]\nIf,A,Equal,a,Begin\nEcho,x\nEcho,y\nEnd\nElse,Echo,z\n";
        let mut e = engine(text);
        e.run();
        assert_eq!(e.output, vec!["x", "y"]);
    }

    #[test]
    fn run_passes_params_and_return_value() {
        let text = "[Process]\nRun,%ScriptFile%,Sub,hello,there\nEcho,#r\n\
            [Sub]\nEcho,#1-#2-#a\nSet,#r,done\n";
        let mut e = engine(text);
        e.run();
        assert_eq!(e.output, vec!["hello-there-2", "done"]);
    }

    #[test]
    fn run_ex_copies_out_params() {
        let text = "[Process]\nSet,%R%,before\nRunEx,%ScriptFile%,Sub,In=5,Out=%R%\nEcho,%R%\n\
            [Sub]\nEcho,#o1\nSet,#o1,#1!\n";
        let mut e = engine(text);
        e.run();
        assert_eq!(e.output, vec!["before", "5!"]);
    }

    #[test]
    fn missing_section_is_error() {
        let mut e = engine("[Process]\nRun,%ScriptFile%,Nowhere\n");
        e.run();
        assert_eq!(states(&e, "Run"), vec![LogState::Error]);
    }

    #[test]
    fn loop_counter_and_break() {
        let text = "[Process]\nLoop,%ScriptFile%,Body,1,5\n\
            [Body]\nEcho,#c\nIf,#c,Equal,3,Loop,BREAK\n";
        let mut e = engine(text);
        e.run();
        assert_eq!(e.output, vec!["1", "2", "3"]);
    }

    #[test]
    fn loop_letters_uppercase() {
        let mut e = engine("[Process]\nLoopLetter,%ScriptFile%,Body,c,e\n[Body]\nEcho,#c\n");
        e.run();
        assert_eq!(e.output, vec!["C", "D", "E"]);
    }

    #[test]
    fn loop_bad_bounds() {
        let mut e = engine("[Process]\nLoopLetter,%ScriptFile%,Body,E,C\n[Body]\nEcho,#c\n");
        e.run();
        assert_eq!(states(&e, "LoopLetter"), vec![LogState::Error]);
        let mut e = engine("[Process]\nLoop,%ScriptFile%,Body,1.5,3\n[Body]\nEcho,#c\n");
        e.run();
        assert_eq!(states(&e, "Loop"), vec![LogState::Error]);
    }

    #[test]
    fn break_outside_loop_is_error() {
        let mut e = engine("[Process]\nLoop,BREAK\n");
        e.run();
        assert_eq!(states(&e, "Loop"), vec![LogState::Error]);
    }

    #[test]
    fn overridable_counter_skips_iterations() {
        let mut project = Project::new();
        project.add(Script::parse(
            "/work/main.script",
            "[Process]\nLoop,%ScriptFile%,Body,1,6\n[Body]\nEcho,#c\nIf,#c,Equal,2,Set,#c,4\n",
        ));
        let options = EngineOptions { overridable_loop_counter: true, ..Default::default() };
        let mut e = Engine::new(project, options);
        e.run();
        assert_eq!(e.output, vec!["1", "2", "5", "6"]);
    }

    #[test]
    fn macro_with_arguments() {
        let text = "[ApiVar]\nGreet=Echo,Hi #1\n[Process]\nGreet,Bob\n";
        let mut e = engine(text);
        e.run();
        assert_eq!(e.output, vec!["Hi Bob"]);
    }

    #[test]
    fn set_macro_at_runtime() {
        let text = "[Process]\nSetMacro,Shout,\"Echo,#1!\"\nShout,hey\nSetMacro,Shout,NIL\nShout,again\n";
        let mut e = engine(text);
        e.run();
        assert_eq!(e.output, vec!["hey!"]);
        assert!(e.events.iter().any(|ev| ev.state == LogState::Error
            && ev.message.contains("unknown command or macro")));
    }

    #[test]
    fn macro_run_gets_macro_params() {
        let text = "[ApiVar]\nCallSub=Run,%ScriptFile%,Sub\n[Process]\nCallSub,x,y\n[Sub]\nEcho,#1#2\n";
        let mut e = engine(text);
        e.run();
        assert_eq!(e.output, vec!["xy"]);
    }

    #[test]
    fn unknown_macro_is_error() {
        let mut e = engine("[Process]\nNoSuchThing,1\n");
        let report = e.run();
        assert_eq!(report.worst, LogState::Error);
    }

    #[test]
    fn exit_stops_script() {
        let mut e = engine("[Process]\nEcho,a\nExit,bye\nEcho,b\n");
        let report = e.run();
        assert_eq!(e.output, vec!["a"]);
        assert_eq!(report.status, RunStatus::Exited);
        assert_eq!(report.worst, LogState::Warning);
    }

    #[test]
    fn halt_stops_run() {
        let mut project = Project::new();
        project.add(Script::parse("/w/a.script", "[Process]\nHalt,stop\nEcho,a\n"));
        project.add(Script::parse("/w/b.script", "[Process]\nEcho,b\n"));
        let mut e = Engine::new(project, EngineOptions::default());
        let report = e.run();
        assert!(e.output.is_empty());
        assert_eq!(report.status, RunStatus::Halted);
        assert_eq!(report.exit_code(), 3);
    }

    #[test]
    fn external_halt_handle() {
        let mut e = engine("[Process]\nEcho,a\n");
        e.halt_handle().halt();
        let report = e.run();
        assert_eq!(report.status, RunStatus::Halted);
        assert!(e.output.is_empty());
    }

    #[test]
    fn parser_error_aborts_script() {
        let mut project = Project::new();
        project.add(Script::parse("/w/a.script", "[Process]\nEcho,a\nFileCopy,onlyone\n"));
        project.add(Script::parse("/w/b.script", "[Process]\nEcho,b\n"));
        let mut e = Engine::new(project, EngineOptions::default());
        let report = e.run();
        assert_eq!(e.output, vec!["b"]);
        assert_eq!(report.parser_errors, 1);
        assert_eq!(report.status, RunStatus::ScriptAborted);
        assert_eq!(report.exit_code(), 2);
        let ev = e.events.iter().find(|ev| ev.state == LogState::ParserError).unwrap();
        assert_eq!(ev.line_no, 3);
    }

    #[test]
    fn critical_error_aborts_script() {
        let mut project = Project::new();
        project.add(Script::parse("/w/a.script", "[Process]\nBoom\nEcho,a\n"));
        project.add(Script::parse("/w/b.script", "[Process]\nEcho,b\n"));
        let mut e = Engine::new(project, EngineOptions::default());
        e.define_macro("Boom", "FileCopy,x,y");
        e.handlers_mut().register_fn(Keyword::FileCopy, |_, _| Outcome::critical("disk gone"));
        let report = e.run();
        assert_eq!(e.output, vec!["b"]);
        assert_eq!(report.status, RunStatus::ScriptAborted);
        assert_eq!(report.worst, LogState::CriticalError);
    }

    #[test]
    fn stop_on_error_halts() {
        let mut project = Project::new();
        project.add(Script::parse("/w/a.script", "[Process]\nFileCopy,a,b\nEcho,a\n"));
        let options = EngineOptions { stop_build_on_error: true, ..Default::default() };
        let mut e = Engine::new(project, options);
        let report = e.run();
        assert_eq!(report.status, RunStatus::Halted);
        assert!(e.output.is_empty());
    }

    #[test]
    fn best_effort_section_continues() {
        let mut project = Project::new();
        project.add(Script::parse("/w/a.script", "[Process]\nFileCopy,a,b\nEcho,a\n"));
        let options = EngineOptions { best_effort_sections: vec!["process".into()], ..Default::default() };
        let mut e = Engine::new(project, options);
        let report = e.run();
        assert_eq!(e.output, vec!["a"]);
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn error_in_callee_reported_in_caller() {
        let text = "[Process]\nSystem,ErrorOff\nRun,%ScriptFile%,Sub\nEcho,after\n\
            [Sub]\nFileCopy,a,b\nEcho,never\n";
        let mut e = engine(text);
        let report = e.run();
        assert_eq!(e.output, vec!["after"]);
        assert_eq!(states(&e, "Run"), vec![LogState::Info, LogState::Warning]);
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn error_off_range_checked() {
        let mut e = engine("[Process]\nSystem,ErrorOff,0\n");
        e.run();
        assert_eq!(states(&e, "System"), vec![LogState::Error]);
    }

    #[test]
    fn end_local_without_set_local() {
        let mut e = engine("[Process]\nSystem,EndLocal\n");
        e.run();
        assert_eq!(states(&e, "System"), vec![LogState::Error]);
    }

    #[test]
    fn unbalanced_set_local_warns_and_restores() {
        let text = "[Process]\nSet,%A%,outer\nRun,%ScriptFile%,Sub\nEcho,%A%\n\
            [Sub]\nSet,%G%,1,GLOBAL\nSystem,SetLocal\nSet,%G%,2\n";
        let mut e = engine(text);
        e.run();
        assert!(e.events.iter().any(|ev| ev.message.starts_with("UnbalancedSetLocal")));
        assert_eq!(e.output, vec!["outer"]);
    }

    #[test]
    fn fixed_variable_not_overwritten() {
        let mut e = engine("[Process]\nSet,%Tools%,x\nEcho,%Tools%\n")
            .with_fixed([("Tools", "C:\\Tools")].into_iter().collect());
        e.run();
        assert_eq!(states(&e, "Set"), vec![LogState::Warning]);
        assert_eq!(e.output, vec!["C:\\Tools"]);
    }

    #[test]
    fn script_variables_seed_globals_around_fixed_names() {
        let mut e = engine("[Variables]\n%Tools%=mine\n%Other%=ok\n[Process]\nEcho,%Tools% %Other%\n")
            .with_fixed([("Tools", "C:\\Tools")].into_iter().collect());
        e.run();
        assert_eq!(e.output, vec!["C:\\Tools ok"]);
        assert_eq!(e.variables().get_in(Scope::Global, "Other"), Some("ok"));
        assert_eq!(e.variables().get_in(Scope::Global, "Tools"), None);
    }

    #[test]
    fn set_keeps_escapes_and_nil_deletes() {
        let text = "[Process]\nSet,%A%,a#$cb\nEcho,%A%\nSet,%A%,NIL\nEcho,[%A%]\n";
        let mut e = engine(text);
        e.run();
        assert_eq!(e.output, vec!["a,b", "[]"]);
        assert_eq!(e.variables().get("A"), None);
    }

    #[test]
    fn set_permanent_persists() {
        let mut e = engine("[Process]\nSet,%Ver%,2,PERMANENT\n");
        e.run();
        assert_eq!(e.variables().get_in(Scope::Global, "Ver"), Some("2"));
        let script = e.project().get(0).unwrap();
        assert_eq!(script.variables("Variables"), vec![("Ver".to_owned(), "2".to_owned())]);
    }

    #[test]
    fn add_variables_from_section() {
        let text = "[Process]\nAddVariables,%ScriptFile%,Extra\nEcho,%X%-%Y%\n[Extra]\n%X%=1\nY=2\n";
        let mut e = engine(text);
        e.run();
        assert_eq!(e.output, vec!["1-2"]);
    }

    #[test]
    fn script_variables_seed_locals_and_globals() {
        let mut project = Project::new();
        project.add(Script::parse("/w/a.script", "[Variables]\n%Base%=A\n[Process]\nEcho,%Base%\n"));
        project.add(Script::parse("/w/b.script", "[Variables]\n%Own%=B\n[Process]\nEcho,%Base%%Own%\n"));
        let mut e = Engine::new(project, EngineOptions::default());
        e.run();
        assert_eq!(e.output, vec!["A", "AB"]);
    }

    #[test]
    fn exec_loads_target_script_variables() {
        let mut project = Project::new();
        project.add(Script::parse("/w/a.script", "[Process]\nExec,/w/b.script,Go\nEcho,[%Own%]\n"));
        project.add(Script::parse("/w/b.script", "[Variables]\n%Own%=B\n[Go]\nEcho,%Own%\n[Process]\n"));
        let mut e = Engine::new(project, EngineOptions::default());
        e.run();
        assert_eq!(&e.output[..2], &["B".to_owned(), "[]".to_owned()]);
    }

    #[test]
    fn inherit_locals_option() {
        let text = "[Process]\nSet,%L%,mine\nRun,%ScriptFile%,Sub\n[Sub]\nEcho,[%L%]\n";
        let mut e = engine(text);
        e.run();
        assert_eq!(e.output, vec!["[]"]);

        let mut project = Project::new();
        project.add(Script::parse("/work/main.script", text));
        let options = EngineOptions { inherit_locals: true, ..Default::default() };
        let mut e = Engine::new(project, options);
        e.run();
        assert_eq!(e.output, vec!["[mine]"]);
    }

    #[test]
    fn recursion_limit_is_critical() {
        let report = std::thread::Builder::new()
            .stack_size(256 << 20)
            .spawn(|| engine("[Process]\nRun,%ScriptFile%,Process\n").run())
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(report.worst, LogState::CriticalError);
        assert_eq!(report.status, RunStatus::ScriptAborted);
    }

    #[test]
    fn unavailable_probe_is_error() {
        let mut e = engine("[Process]\nIf,Online,Echo,up\n");
        e.run();
        assert_eq!(states(&e, "If"), vec![LogState::Error]);

        let mut e = engine("[Process]\nIf,Online,Echo,up\n").with_probe(|_: CondKind, _: &[String]| Some(true));
        e.run();
        assert_eq!(e.output, vec!["up"]);
    }

    #[test]
    fn exist_var_and_macro() {
        let text = "[ApiVar]\nM=Echo,m\n[Process]\nSet,%A%,1\n\
            If,ExistVar,%A%,Echo,a\nIf,ExistVar,%B%,Echo,b\nIf,ExistMacro,M,Echo,m\n";
        let mut e = engine(text);
        e.run();
        assert_eq!(e.output, vec!["a", "m"]);
    }

    #[test]
    fn script_names_resolve() {
        let mut e = engine("[Main]\nTitle=Demo\n[Process]\nEcho,%ScriptTitle%|%ScriptDir%\n");
        e.run();
        assert_eq!(e.output, vec!["Demo|/work"]);
    }

    #[test]
    fn handler_context_writes_destination() {
        let mut e = engine("[Process]\nFileSize,a.txt,%Size%\nEcho,%Size%\n");
        e.handlers_mut().register_fn(Keyword::FileSize, |p, ctx| match p {
            Payload::FileSize(q) => match ctx.set_key(&q.dest, "42") {
                Ok(()) => Outcome::success("sized"),
                Err(e) => e.into(),
            },
            _ => Outcome::error("unexpected payload"),
        });
        e.run();
        assert_eq!(e.output, vec!["42"]);
    }

    #[test]
    fn batch_members_run_in_order() {
        use std::cell::RefCell;
        let seen = Rc::new(RefCell::new(Vec::new()));
        let text = "[Process]\nTXTAddLine,f.txt,one,Append\nTXTAddLine,f.txt,two,Append\n";
        let mut e = engine(text);
        let log = seen.clone();
        e.handlers_mut().register_fn(Keyword::TXTAddLine, move |p, _| {
            if let Payload::TxtAddLine(t) = p {
                log.borrow_mut().push(t.line.clone());
            }
            Outcome::success("added")
        });
        e.run();
        assert_eq!(*seen.borrow(), vec!["one", "two"]);
    }

    #[test]
    fn report_exit_codes() {
        let mut r = RunReport { status: RunStatus::Done, worst: LogState::Warning, parser_errors: 0, scripts_run: 1 };
        assert_eq!(r.exit_code(), 0);
        r.worst = LogState::Error;
        assert_eq!(r.exit_code(), 1);
        r.worst = LogState::ParserError;
        assert_eq!(r.exit_code(), 2);
        r.status = RunStatus::Halted;
        assert_eq!(r.exit_code(), 3);
    }
}
