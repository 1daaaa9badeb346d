//! Command AST.
//!
//! A parsed line is a [`CommandNode`]: a [`Keyword`] tag, a typed
//! [`Payload`], the raw source text and its [`Position`].  The payload enum
//! has one variant per keyword; keywords whose handlers live outside the
//! interpreter and take plain positional arguments share [`Payload::Args`].
//!
//! Fields typed [`VarKey`] name a destination and are never expanded; every
//! `String` field is expanded (and unescaped) right before dispatch.

use std::fmt;

use super::condition::Condition;
use super::parser::ParseError;
use super::variables::is_var_name;

/// Index of a script within a [`crate::project::Project`].
pub type ScriptId = usize;

// ── Position ──────────────────────────────────────────────────────────────────

/// Where a command came from: script and 1-based line number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub script: ScriptId,
    pub line: usize,
}

// ── Keyword ───────────────────────────────────────────────────────────────────

macro_rules! keywords {
    ($($kw:ident),* $(,)?) => {
        /// Every command keyword the parser recognises.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Keyword {
            $($kw,)*
            /// A call to a user macro (any unrecognised keyword).
            Macro,
            /// A line that failed to parse.
            Error,
        }

        impl Keyword {
            /// All keywords reachable by name.
            pub const ALL: &'static [Keyword] = &[$(Keyword::$kw,)*];

            pub fn name(self) -> &'static str {
                match self {
                    $(Keyword::$kw => stringify!($kw),)*
                    Keyword::Macro => "Macro",
                    Keyword::Error => "Error",
                }
            }
        }
    };
}

keywords! {
    // File
    FileCopy, FileDelete, FileRename, FileMove, FileCreateBlank, FileSize, FileVersion,
    DirCopy, DirDelete, DirMove, DirMake, DirSize, PathMove,
    // Registry
    RegHiveLoad, RegHiveUnload, RegRead, RegWrite, RegDelete, RegMulti, RegImport, RegExport, RegCopy,
    // Text
    TXTAddLine, TXTDelLine, TXTReplace, TXTDelSpaces, TXTDelEmptyLines,
    // Ini
    IniWrite, IniRead, IniDelete, IniReadSection, IniAddSection, IniDeleteSection,
    IniWriteTextLine, IniMerge, IniCompact,
    // Wim
    WimMount, WimUnmount, WimInfo, WimApply, WimExtract, WimExtractBulk, WimCapture,
    WimAppend, WimDelete, WimPathAdd, WimPathDelete, WimPathRename, WimOptimize, WimExport,
    // Archive
    Compress, Decompress, Expand, CopyOrExpand,
    // Network
    WebGet,
    // Hash
    Hash,
    // Embedded files
    ExtractFile, ExtractAndRun, ExtractAllFiles, Encode,
    // Interface
    Visible, ReadInterface, WriteInterface, Message, Echo, EchoFile, UserInput, AddInterface,
    // String, Math, List
    StrFormat, Math, List,
    // Branch
    Run, RunEx, Exec, Loop, LoopEx, LoopLetter, LoopLetterEx, If, Else, Begin, End,
    // Control
    Set, SetMacro, AddVariables, Exit, Halt, Wait, Beep,
    // System
    System, ShellExecute, ShellExecuteEx, ShellExecuteDelete,
    // Debug
    Debug,
}

impl Keyword {
    /// Case-insensitive lookup by name.
    pub fn from_name(name: &str) -> Option<Keyword> {
        Keyword::ALL.iter().copied().find(|k| k.name().eq_ignore_ascii_case(name))
    }

    /// Keywords whose adjacent runs on the same file may be batched.
    pub fn is_fusable(self) -> bool {
        matches!(
            self,
            Keyword::TXTAddLine
                | Keyword::TXTDelLine
                | Keyword::TXTReplace
                | Keyword::IniRead
                | Keyword::IniWrite
                | Keyword::IniDelete
                | Keyword::Visible
        )
    }

    /// Keywords executed by the engine itself rather than a handler.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            Keyword::Run
                | Keyword::RunEx
                | Keyword::Exec
                | Keyword::Loop
                | Keyword::LoopEx
                | Keyword::LoopLetter
                | Keyword::LoopLetterEx
                | Keyword::If
                | Keyword::Else
                | Keyword::Begin
                | Keyword::End
                | Keyword::Set
                | Keyword::SetMacro
                | Keyword::AddVariables
                | Keyword::Exit
                | Keyword::Halt
                | Keyword::System
                | Keyword::Macro
                | Keyword::Error
        )
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Variable keys ─────────────────────────────────────────────────────────────

/// A writable location named in a command.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VarKey {
    /// `%Name%`
    Var(String),
    /// `#n` (1-based section in-parameter)
    InParam(usize),
    /// `#on` (1-based section out-parameter)
    OutParam(usize),
    /// `#r`
    ReturnValue,
    /// `#c`
    LoopCounter,
}

impl VarKey {
    /// Parse a destination key.  Returns `None` for anything that is not a
    /// variable reference.
    pub fn parse(s: &str) -> Option<VarKey> {
        let s = s.trim();
        if let Some(inner) = s.strip_prefix('%').and_then(|r| r.strip_suffix('%')) {
            return is_var_name(inner).then(|| VarKey::Var(inner.to_owned()));
        }
        let rest = s.strip_prefix('#')?;
        if rest.eq_ignore_ascii_case("r") {
            return Some(VarKey::ReturnValue);
        }
        if rest.eq_ignore_ascii_case("c") {
            return Some(VarKey::LoopCounter);
        }
        if let Some(digits) = rest.strip_prefix(['o', 'O']) {
            return parse_index(digits).map(VarKey::OutParam);
        }
        parse_index(rest).map(VarKey::InParam)
    }
}

/// Highest `#n` / `#on` accepted as a destination.
pub const MAX_PARAM_INDEX: usize = 256;

fn parse_index(digits: &str) -> Option<usize> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().filter(|&n| (1..=MAX_PARAM_INDEX).contains(&n))
}

impl fmt::Display for VarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarKey::Var(name) => write!(f, "%{name}%"),
            VarKey::InParam(n) => write!(f, "#{n}"),
            VarKey::OutParam(n) => write!(f, "#o{n}"),
            VarKey::ReturnValue => f.write_str("#r"),
            VarKey::LoopCounter => f.write_str("#c"),
        }
    }
}

// ── Payloads: control commands ────────────────────────────────────────────────

/// Where `Set` / `SetMacro` store their value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetScope {
    Local,
    Global,
    Permanent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetVar {
    pub key: VarKey,
    pub value: String,
    pub scope: SetScope,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetMacro {
    pub name: String,
    pub command: String,
    pub scope: SetScope,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddVariables {
    pub script: String,
    pub section: String,
    pub global: bool,
}

/// `Run` / `Exec` / `RunEx` target and parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub script: String,
    pub section: String,
    pub in_params: Vec<String>,
    pub out_params: Vec<VarKey>,
}

/// `Loop*` forms.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopForm {
    /// `Loop,BREAK`
    Break,
    Range { call: Call, start: String, end: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfBlock {
    pub condition: Condition,
    /// The embedded command, or the folded `Begin`…`End` block.
    pub block: Vec<CommandNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElseBlock {
    pub block: Vec<CommandNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SystemCmd {
    /// `System,ErrorOff[,count]`
    ErrorOff(Option<String>),
    SetLocal,
    EndLocal,
    /// Any other sub-command; handled externally.
    Other { sub: String, args: Vec<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MacroCall {
    pub name: String,
    pub args: Vec<String>,
}

// ── Payloads: handler commands ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Echo {
    pub message: String,
    pub warn: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileCopy {
    pub src: String,
    pub dest: String,
    pub preserve: bool,
    pub no_warn: bool,
    pub no_rec: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileDelete {
    pub path: String,
    pub no_warn: bool,
    pub no_rec: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileCreateBlank {
    pub path: String,
    pub preserve: bool,
    pub no_warn: bool,
    pub encoding: Option<String>,
}

/// Two-path commands (`FileRename`, `FileMove`, `DirCopy`, `DirMove`, `PathMove`).
#[derive(Debug, Clone, PartialEq)]
pub struct SrcDest {
    pub src: String,
    pub dest: String,
}

/// Path-to-variable queries (`FileSize`, `FileVersion`, `DirSize`).
#[derive(Debug, Clone, PartialEq)]
pub struct PathQuery {
    pub path: String,
    pub dest: VarKey,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegRead {
    pub hive: String,
    pub key: String,
    pub value_name: String,
    pub dest: VarKey,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegData {
    None,
    Single(String),
    List(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegTarget {
    /// Create the key only.
    Key,
    Value { name: String, data: RegData },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegWrite {
    pub hive: String,
    pub value_type: u32,
    pub key: String,
    pub target: RegTarget,
    pub no_warn: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegDelete {
    pub hive: String,
    pub key: String,
    pub value_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddLineMode {
    Append,
    Prepend,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxtAddLine {
    pub file: String,
    pub line: String,
    pub mode: AddLineMode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxtDelLine {
    pub file: String,
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxtReplace {
    pub file: String,
    pub old: String,
    pub new: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IniRead {
    pub file: String,
    pub section: String,
    pub key: String,
    pub dest: VarKey,
    pub default: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IniWrite {
    pub file: String,
    pub section: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IniDelete {
    pub file: String,
    pub section: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Visible {
    /// Interface key, without the surrounding `%`.  Never expanded.
    pub control: String,
    pub visible: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hash {
    pub algorithm: String,
    pub path: String,
    pub dest: VarKey,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Wait {
    pub seconds: String,
}

/// `Math,<Op>,...`
#[derive(Debug, Clone, PartialEq)]
pub enum MathOp {
    /// Add, Sub, Mul, Div, Pow, BoolAnd, BoolOr, BoolXor, BitAnd, BitOr, BitXor
    Binary { op: MathBinary, dest: VarKey, lhs: String, rhs: String },
    /// IntDiv,<QuotientVar>,<RemainderVar>,<Src1>,<Src2>
    IntDiv { quotient: VarKey, remainder: VarKey, lhs: String, rhs: String },
    /// Neg, Abs, BoolNot, BitNot, Hex, Dec
    Unary { op: MathUnary, dest: VarKey, src: String },
    /// BitShift,<DestVar>,<Src>,<LEFT|RIGHT>,<Shift>
    BitShift { dest: VarKey, src: String, left: bool, shift: String },
    /// Ceil, Floor, Round: `<DestVar>,<Src>,<Unit>`
    Rounding { op: MathRound, dest: VarKey, src: String, unit: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathBinary {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    BoolAnd,
    BoolOr,
    BoolXor,
    BitAnd,
    BitOr,
    BitXor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathUnary {
    Neg,
    Abs,
    BoolNot,
    BitNot,
    Hex,
    Dec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathRound {
    Ceil,
    Floor,
    Round,
}

/// `StrFormat,<Op>,...`
#[derive(Debug, Clone, PartialEq)]
pub enum StrFormatOp {
    /// Inc, Dec: `<%DestVar%>,<Amount>` (in place)
    Arith { dec: bool, dest: VarKey, amount: String },
    /// Left, Right: `<Src>,<Count>,<DestVar>`
    Cut { right: bool, src: String, count: String, dest: VarKey },
    /// Mid: `<Src>,<Start>,<Length>,<DestVar>` (1-based start)
    Mid { src: String, start: String, len: String, dest: VarKey },
    /// Len, UCase, LCase, FileName, DirPath, Ext: `<Src>,<DestVar>`
    Unary { op: StrUnary, src: String, dest: VarKey },
    /// LTrim, RTrim, CTrim: `<Src>,<Count|Chars>,<DestVar>`
    Trim { op: StrTrim, src: String, arg: String, dest: VarKey },
    /// Pos, PosX: `<Src>,<SubStr>,<DestVar>` (1-based; 0 when absent)
    Pos { case_sensitive: bool, src: String, sub: String, dest: VarKey },
    /// Replace, ReplaceX: `<Src>,<Old>,<New>,<DestVar>`
    Replace { case_sensitive: bool, src: String, old: String, new: String, dest: VarKey },
    /// Split: `<Src>,<Delim>,<Index>,<DestVar>` (index 0 yields the count)
    Split { src: String, delim: String, index: String, dest: VarKey },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrUnary {
    Len,
    UCase,
    LCase,
    NTrim,
    FileName,
    DirPath,
    Ext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrTrim {
    Left,
    Right,
    Chars,
}

// ── Payload ───────────────────────────────────────────────────────────────────

/// Typed arguments of a parsed command.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    // Control (engine-owned)
    Set(SetVar),
    SetMacro(SetMacro),
    AddVariables(AddVariables),
    Exit { message: String, no_warn: bool },
    Halt { message: String },
    Run(Call),
    RunEx(Call),
    Exec(Call),
    Loop(LoopForm),
    LoopEx(LoopForm),
    LoopLetter(LoopForm),
    LoopLetterEx(LoopForm),
    If(IfBlock),
    Else(ElseBlock),
    Begin,
    End,
    System(SystemCmd),
    Macro(MacroCall),

    // Handler-dispatched
    Echo(Echo),
    Wait(Wait),
    Beep { kind: String },
    Math(MathOp),
    StrFormat(StrFormatOp),
    FileCopy(FileCopy),
    FileDelete(FileDelete),
    FileCreateBlank(FileCreateBlank),
    FileRename(SrcDest),
    FileMove(SrcDest),
    DirCopy(SrcDest),
    DirMove(SrcDest),
    PathMove(SrcDest),
    DirDelete { path: String },
    DirMake { path: String },
    FileSize(PathQuery),
    FileVersion(PathQuery),
    DirSize(PathQuery),
    RegRead(RegRead),
    RegWrite(RegWrite),
    RegDelete(RegDelete),
    TxtAddLine(TxtAddLine),
    TxtDelLine(TxtDelLine),
    TxtReplace(TxtReplace),
    IniRead(IniRead),
    IniWrite(IniWrite),
    IniDelete(IniDelete),
    Visible(Visible),
    Hash(Hash),
    /// Positional arguments for keywords without a dedicated payload.
    Args(Vec<String>),

    /// Adjacent same-keyword commands on one file, executed in order.
    Batch(Vec<CommandNode>),
    /// The line failed to parse; never executed.
    Invalid(ParseError),
}

impl Payload {
    /// Apply `f` to every expandable string field, in argument order.
    ///
    /// [`VarKey`] fields, embedded blocks and batch members are skipped.
    pub fn visit_strings<E>(
        &mut self,
        f: &mut dyn FnMut(&mut String) -> Result<(), E>,
    ) -> Result<(), E> {
        match self {
            Payload::Set(p) => f(&mut p.value)?,
            Payload::SetMacro(p) => f(&mut p.command)?,
            Payload::AddVariables(p) => {
                f(&mut p.script)?;
                f(&mut p.section)?;
            }
            Payload::Exit { message, .. } | Payload::Halt { message } => f(message)?,
            Payload::Run(c) | Payload::RunEx(c) | Payload::Exec(c) => visit_call(c, f)?,
            Payload::Loop(l) | Payload::LoopEx(l) | Payload::LoopLetter(l) | Payload::LoopLetterEx(l) => {
                if let LoopForm::Range { call, start, end } = l {
                    f(&mut call.script)?;
                    f(&mut call.section)?;
                    f(start)?;
                    f(end)?;
                    for p in &mut call.in_params {
                        f(p)?;
                    }
                }
            }
            Payload::System(SystemCmd::ErrorOff(Some(n))) => f(n)?,
            Payload::System(SystemCmd::Other { args, .. }) => {
                for a in args {
                    f(a)?;
                }
            }
            Payload::Macro(m) => {
                for a in &mut m.args {
                    f(a)?;
                }
            }
            Payload::Echo(p) => f(&mut p.message)?,
            Payload::Wait(p) => f(&mut p.seconds)?,
            Payload::Beep { kind } => f(kind)?,
            Payload::Math(op) => visit_math(op, f)?,
            Payload::StrFormat(op) => visit_str_format(op, f)?,
            Payload::FileCopy(p) => {
                f(&mut p.src)?;
                f(&mut p.dest)?;
            }
            Payload::FileDelete(p) => f(&mut p.path)?,
            Payload::FileCreateBlank(p) => {
                f(&mut p.path)?;
                if let Some(e) = &mut p.encoding {
                    f(e)?;
                }
            }
            Payload::FileRename(p)
            | Payload::FileMove(p)
            | Payload::DirCopy(p)
            | Payload::DirMove(p)
            | Payload::PathMove(p) => {
                f(&mut p.src)?;
                f(&mut p.dest)?;
            }
            Payload::DirDelete { path } | Payload::DirMake { path } => f(path)?,
            Payload::FileSize(p) | Payload::FileVersion(p) | Payload::DirSize(p) => f(&mut p.path)?,
            Payload::RegRead(p) => {
                f(&mut p.hive)?;
                f(&mut p.key)?;
                f(&mut p.value_name)?;
            }
            Payload::RegWrite(p) => {
                f(&mut p.hive)?;
                f(&mut p.key)?;
                if let RegTarget::Value { name, data } = &mut p.target {
                    f(name)?;
                    match data {
                        RegData::None => {}
                        RegData::Single(s) => f(s)?,
                        RegData::List(items) => {
                            for s in items {
                                f(s)?;
                            }
                        }
                    }
                }
            }
            Payload::RegDelete(p) => {
                f(&mut p.hive)?;
                f(&mut p.key)?;
                if let Some(v) = &mut p.value_name {
                    f(v)?;
                }
            }
            Payload::TxtAddLine(p) => {
                f(&mut p.file)?;
                f(&mut p.line)?;
            }
            Payload::TxtDelLine(p) => {
                f(&mut p.file)?;
                f(&mut p.prefix)?;
            }
            Payload::TxtReplace(p) => {
                f(&mut p.file)?;
                f(&mut p.old)?;
                f(&mut p.new)?;
            }
            Payload::IniRead(p) => {
                f(&mut p.file)?;
                f(&mut p.section)?;
                f(&mut p.key)?;
                if let Some(d) = &mut p.default {
                    f(d)?;
                }
            }
            Payload::IniWrite(p) => {
                f(&mut p.file)?;
                f(&mut p.section)?;
                f(&mut p.key)?;
                f(&mut p.value)?;
            }
            Payload::IniDelete(p) => {
                f(&mut p.file)?;
                f(&mut p.section)?;
                f(&mut p.key)?;
            }
            Payload::Visible(p) => f(&mut p.visible)?,
            Payload::Hash(p) => {
                f(&mut p.algorithm)?;
                f(&mut p.path)?;
            }
            Payload::Args(args) => {
                for a in args {
                    f(a)?;
                }
            }
            Payload::System(_)
            | Payload::If(_)
            | Payload::Else(_)
            | Payload::Begin
            | Payload::End
            | Payload::Batch(_)
            | Payload::Invalid(_) => {}
        }
        Ok(())
    }

    /// The file a fusable command targets, if any.
    pub fn target_file(&self) -> Option<&str> {
        match self {
            Payload::TxtAddLine(p) => Some(&p.file),
            Payload::TxtDelLine(p) => Some(&p.file),
            Payload::TxtReplace(p) => Some(&p.file),
            Payload::IniRead(p) => Some(&p.file),
            Payload::IniWrite(p) => Some(&p.file),
            Payload::IniDelete(p) => Some(&p.file),
            // Interface controls all live in the calling script.
            Payload::Visible(_) => Some(""),
            _ => None,
        }
    }
}

fn visit_call<E>(c: &mut Call, f: &mut dyn FnMut(&mut String) -> Result<(), E>) -> Result<(), E> {
    f(&mut c.script)?;
    f(&mut c.section)?;
    for p in &mut c.in_params {
        f(p)?;
    }
    Ok(())
}

fn visit_math<E>(op: &mut MathOp, f: &mut dyn FnMut(&mut String) -> Result<(), E>) -> Result<(), E> {
    match op {
        MathOp::Binary { lhs, rhs, .. } | MathOp::IntDiv { lhs, rhs, .. } => {
            f(lhs)?;
            f(rhs)
        }
        MathOp::Unary { src, .. } => f(src),
        MathOp::BitShift { src, shift, .. } => {
            f(src)?;
            f(shift)
        }
        MathOp::Rounding { src, unit, .. } => {
            f(src)?;
            f(unit)
        }
    }
}

fn visit_str_format<E>(
    op: &mut StrFormatOp,
    f: &mut dyn FnMut(&mut String) -> Result<(), E>,
) -> Result<(), E> {
    match op {
        StrFormatOp::Arith { amount, .. } => f(amount),
        StrFormatOp::Cut { src, count, .. } => {
            f(src)?;
            f(count)
        }
        StrFormatOp::Mid { src, start, len, .. } => {
            f(src)?;
            f(start)?;
            f(len)
        }
        StrFormatOp::Unary { src, .. } => f(src),
        StrFormatOp::Trim { src, arg, .. } => {
            f(src)?;
            f(arg)
        }
        StrFormatOp::Pos { src, sub, .. } => {
            f(src)?;
            f(sub)
        }
        StrFormatOp::Replace { src, old, new, .. } => {
            f(src)?;
            f(old)?;
            f(new)
        }
        StrFormatOp::Split { src, delim, index, .. } => {
            f(src)?;
            f(delim)?;
            f(index)
        }
    }
}

// ── CommandNode ───────────────────────────────────────────────────────────────

/// One parsed command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandNode {
    pub keyword: Keyword,
    pub payload: Payload,
    pub raw: String,
    pub pos: Position,
}

impl CommandNode {
    pub fn invalid(raw: impl Into<String>, pos: Position, error: ParseError) -> Self {
        CommandNode {
            keyword: Keyword::Error,
            payload: Payload::Invalid(error),
            raw: raw.into(),
            pos,
        }
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self.payload, Payload::Invalid(_))
    }

    /// Every invalid node in this command, including nested blocks.
    pub fn collect_invalid<'a>(&'a self, out: &mut Vec<&'a CommandNode>) {
        match &self.payload {
            Payload::Invalid(_) => out.push(self),
            Payload::If(b) => b.block.iter().for_each(|n| n.collect_invalid(out)),
            Payload::Else(b) => b.block.iter().for_each(|n| n.collect_invalid(out)),
            Payload::Batch(nodes) => nodes.iter().for_each(|n| n.collect_invalid(out)),
            _ => {}
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_lookup_ignores_case() {
        assert_eq!(Keyword::from_name("echo"), Some(Keyword::Echo));
        assert_eq!(Keyword::from_name("TXTADDLINE"), Some(Keyword::TXTAddLine));
        assert_eq!(Keyword::from_name("iniread"), Some(Keyword::IniRead));
        assert_eq!(Keyword::from_name("NoSuchCommand"), None);
    }

    #[test]
    fn macro_and_error_are_not_named_keywords() {
        assert_eq!(Keyword::from_name("Macro"), None);
        assert_eq!(Keyword::from_name("Error"), None);
    }

    #[test]
    fn var_key_forms() {
        assert_eq!(VarKey::parse("%Dest%"), Some(VarKey::Var("Dest".into())));
        assert_eq!(VarKey::parse("#3"), Some(VarKey::InParam(3)));
        assert_eq!(VarKey::parse("#o2"), Some(VarKey::OutParam(2)));
        assert_eq!(VarKey::parse("#O1"), Some(VarKey::OutParam(1)));
        assert_eq!(VarKey::parse("#r"), Some(VarKey::ReturnValue));
        assert_eq!(VarKey::parse("#C"), Some(VarKey::LoopCounter));
    }

    #[test]
    fn var_key_index_is_bounded() {
        assert_eq!(VarKey::parse("#256"), Some(VarKey::InParam(MAX_PARAM_INDEX)));
        assert_eq!(VarKey::parse("#257"), None);
        assert_eq!(VarKey::parse("#4000000000"), None);
        assert_eq!(VarKey::parse("#o99999"), None);
    }

    #[test]
    fn var_key_rejects_non_references() {
        assert_eq!(VarKey::parse("Dest"), None);
        assert_eq!(VarKey::parse("%%"), None);
        assert_eq!(VarKey::parse("%A B%"), None);
        assert_eq!(VarKey::parse("#0"), None);
        assert_eq!(VarKey::parse("#x"), None);
    }

    #[test]
    fn var_key_display_round_trips() {
        for s in ["%Dest%", "#4", "#o1", "#r", "#c"] {
            assert_eq!(VarKey::parse(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn visit_strings_skips_var_keys() {
        let mut p = Payload::IniRead(IniRead {
            file: "a.ini".into(),
            section: "S".into(),
            key: "K".into(),
            dest: VarKey::Var("Out".into()),
            default: None,
        });
        let mut seen = Vec::new();
        p.visit_strings::<()>(&mut |s| {
            seen.push(s.clone());
            s.make_ascii_uppercase();
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec!["a.ini", "S", "K"]);
        match p {
            Payload::IniRead(r) => {
                assert_eq!(r.file, "A.INI");
                assert_eq!(r.dest, VarKey::Var("Out".into()));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn fusable_keywords() {
        assert!(Keyword::IniWrite.is_fusable());
        assert!(!Keyword::Echo.is_fusable());
    }
}
