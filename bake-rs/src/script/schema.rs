//! Command schema registry.
//!
//! Each keyword has a [`Schema`]: an ordered list of [`Overload`]s, each an
//! accepted argument-count range plus a constructor that turns the tokens
//! into a typed [`Payload`].  Overloads are tried in order; the first whose
//! range fits and whose constructor does not report
//! [`ArgError::Mismatch`] wins.
//!
//! `RegWrite` is the canonical polymorphic case:
//!
//! | Args (after stripping a trailing `NOWARN`) | Meaning |
//! |------|---------|
//! | 3 | create key |
//! | 4 | value without data |
//! | 5 | value with one datum |
//! | 5+ | multi-string or binary value |

use super::command::*;
use super::condition::Condition;
use super::lexer::Token;
use super::parser;
use super::value::Number;

/// Upper bound for variadic overloads.
pub const MANY: usize = usize::MAX;

// ── Types ─────────────────────────────────────────────────────────────────────

/// Tokens after the keyword, with the line position for embedded commands.
#[derive(Debug, Clone, Copy)]
pub struct Args<'a> {
    pub tokens: &'a [Token],
    pub pos: Position,
}

impl<'a> Args<'a> {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn get(&self, i: usize) -> &'a str {
        self.tokens.get(i).map(|t| t.text.as_str()).unwrap_or("")
    }

    pub fn string(&self, i: usize) -> String {
        self.get(i).to_owned()
    }

    pub fn strings_from(&self, i: usize) -> Vec<String> {
        self.tokens.iter().skip(i).map(|t| t.text.clone()).collect()
    }

    fn var_key(&self, i: usize) -> Result<VarKey, ArgError> {
        VarKey::parse(self.get(i))
            .ok_or_else(|| ArgError::Invalid(format!("{:?} is not a variable key", self.get(i))))
    }
}

/// Why a constructor refused its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgError {
    /// Not this overload; try the next one.
    Mismatch,
    /// This overload, but the arguments are wrong.
    Invalid(String),
}

pub type Build = fn(&Args<'_>) -> Result<Payload, ArgError>;

#[derive(Clone, Copy)]
pub struct Overload {
    pub min: usize,
    pub max: usize,
    pub build: Build,
}

impl Overload {
    fn fits(&self, n: usize) -> bool {
        self.min <= n && n <= self.max
    }

    fn describe(&self) -> String {
        match (self.min, self.max) {
            (min, MANY) => format!("{min}+"),
            (min, max) if min == max => min.to_string(),
            (min, max) => format!("{min}-{max}"),
        }
    }
}

#[derive(Clone, Copy)]
pub struct Schema {
    pub keyword: Keyword,
    pub overloads: &'static [Overload],
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{keyword} takes {accepted} arguments, got {got}")]
pub struct ArityError {
    pub keyword: Keyword,
    pub accepted: String,
    pub got: usize,
}

/// Failure of [`Schema::build`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    Arity(ArityError),
    Invalid(String),
}

impl Schema {
    /// Accepted argument counts, e.g. `"2-5"` or `"1 or 4+"`.
    pub fn accepted(&self) -> String {
        let parts: Vec<String> = self.overloads.iter().map(Overload::describe).collect();
        let mut uniq: Vec<String> = Vec::new();
        for p in parts {
            if !uniq.contains(&p) {
                uniq.push(p);
            }
        }
        uniq.join(" or ")
    }

    pub fn build(&self, args: &Args<'_>) -> Result<Payload, SchemaError> {
        for overload in self.overloads.iter().filter(|o| o.fits(args.len())) {
            match (overload.build)(args) {
                Ok(payload) => return Ok(payload),
                Err(ArgError::Mismatch) => continue,
                Err(ArgError::Invalid(msg)) => return Err(SchemaError::Invalid(msg)),
            }
        }
        Err(SchemaError::Arity(ArityError {
            keyword: self.keyword,
            accepted: self.accepted(),
            got: args.len(),
        }))
    }
}

macro_rules! overloads {
    ($(($min:expr, $max:expr, $build:expr)),+ $(,)?) => {{
        const OVERLOADS: &[Overload] = &[$(Overload { min: $min, max: $max, build: $build }),+];
        OVERLOADS
    }};
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// The schema for `keyword`.  `Macro` and `Error` have none: macro calls are
/// built by the parser and error nodes are never constructed from tokens.
pub fn lookup(keyword: Keyword) -> Option<Schema> {
    use Keyword as K;
    let overloads: &'static [Overload] = match keyword {
        // File
        K::FileCopy => overloads![(2, 5, file_copy)],
        K::FileDelete => overloads![(1, 3, file_delete)],
        K::FileRename => overloads![(2, 2, |a| Ok(Payload::FileRename(src_dest(a))))],
        K::FileMove => overloads![(2, 2, |a| Ok(Payload::FileMove(src_dest(a))))],
        K::DirCopy => overloads![(2, 2, |a| Ok(Payload::DirCopy(src_dest(a))))],
        K::DirMove => overloads![(2, 2, |a| Ok(Payload::DirMove(src_dest(a))))],
        K::PathMove => overloads![(2, 2, |a| Ok(Payload::PathMove(src_dest(a))))],
        K::FileCreateBlank => overloads![(1, 4, file_create_blank)],
        K::FileSize => overloads![(2, 2, |a| Ok(Payload::FileSize(path_query(a)?)))],
        K::FileVersion => overloads![(2, 2, |a| Ok(Payload::FileVersion(path_query(a)?)))],
        K::DirSize => overloads![(2, 2, |a| Ok(Payload::DirSize(path_query(a)?)))],
        K::DirDelete => overloads![(1, 1, |a| Ok(Payload::DirDelete { path: a.string(0) }))],
        K::DirMake => overloads![(1, 1, |a| Ok(Payload::DirMake { path: a.string(0) }))],

        // Registry
        K::RegRead => overloads![(4, 4, reg_read)],
        K::RegWrite => overloads![
            (3, 4, reg_write_key),
            (4, 5, reg_write_empty),
            (5, 6, reg_write_single),
            (5, MANY, reg_write_list),
        ],
        K::RegDelete => overloads![(2, 3, reg_delete)],
        K::RegHiveLoad => overloads![(2, 2, positional)],
        K::RegHiveUnload | K::RegImport => overloads![(1, 1, positional)],
        K::RegMulti => overloads![(4, 6, positional)],
        K::RegExport => overloads![(3, 3, positional)],
        K::RegCopy => overloads![(4, 5, positional)],

        // Text
        K::TXTAddLine => overloads![(3, 3, txt_add_line)],
        K::TXTDelLine => overloads![(2, 2, |a| {
            Ok(Payload::TxtDelLine(TxtDelLine { file: a.string(0), prefix: a.string(1) }))
        })],
        K::TXTReplace => overloads![(3, 3, |a| {
            Ok(Payload::TxtReplace(TxtReplace { file: a.string(0), old: a.string(1), new: a.string(2) }))
        })],
        K::TXTDelSpaces | K::TXTDelEmptyLines => overloads![(1, 1, positional)],

        // Ini
        K::IniRead => overloads![(4, 5, ini_read)],
        K::IniWrite => overloads![(4, 4, |a| {
            Ok(Payload::IniWrite(IniWrite {
                file: a.string(0),
                section: a.string(1),
                key: a.string(2),
                value: a.string(3),
            }))
        })],
        K::IniDelete => overloads![(3, 3, |a| {
            Ok(Payload::IniDelete(IniDelete { file: a.string(0), section: a.string(1), key: a.string(2) }))
        })],
        K::IniReadSection => overloads![(3, 4, positional)],
        K::IniAddSection | K::IniDeleteSection | K::IniMerge => overloads![(2, 2, positional)],
        K::IniWriteTextLine => overloads![(3, 4, positional)],
        K::IniCompact => overloads![(1, 1, positional)],

        // Wim
        K::WimMount => overloads![(4, 4, positional)],
        K::WimUnmount => overloads![(1, 2, positional)],
        K::WimInfo => overloads![(3, 4, positional)],
        K::WimApply | K::WimCapture => overloads![(3, 6, positional)],
        K::WimExtract => overloads![(4, 6, positional)],
        K::WimExtractBulk | K::WimPathAdd => overloads![(4, 7, positional)],
        K::WimAppend => overloads![(2, 7, positional)],
        K::WimDelete => overloads![(2, 3, positional)],
        K::WimPathDelete => overloads![(3, 5, positional)],
        K::WimPathRename => overloads![(4, 5, positional)],
        K::WimOptimize => overloads![(1, 3, positional)],
        K::WimExport => overloads![(3, 8, positional)],

        // Archive
        K::Compress => overloads![(3, 4, positional)],
        K::Decompress => overloads![(2, 3, positional)],
        K::Expand => overloads![(2, 5, positional)],
        K::CopyOrExpand => overloads![(2, 4, positional)],

        // Network, hash
        K::WebGet => overloads![(2, 6, positional)],
        K::Hash => overloads![(3, 3, hash)],

        // Embedded files
        K::ExtractFile => overloads![(4, 4, positional)],
        K::ExtractAndRun => overloads![(3, 4, positional)],
        K::ExtractAllFiles | K::Encode => overloads![(3, 4, positional)],

        // Interface
        K::Visible => overloads![(2, 2, visible)],
        K::ReadInterface => overloads![(3, 5, positional)],
        K::WriteInterface => overloads![(3, 4, positional)],
        K::Message => overloads![(1, 3, positional)],
        K::Echo => overloads![(1, 2, echo)],
        K::EchoFile => overloads![(1, 3, positional)],
        K::UserInput => overloads![(3, 4, positional)],
        K::AddInterface => overloads![(3, 3, positional)],

        // String, Math, List
        K::StrFormat => overloads![(2, 5, str_format)],
        K::Math => overloads![(3, 5, math)],
        K::List => overloads![(3, MANY, positional)],

        // Branch
        K::Run => overloads![(2, MANY, |a| Ok(Payload::Run(call(a))))],
        K::Exec => overloads![(2, MANY, |a| Ok(Payload::Exec(call(a))))],
        K::RunEx => overloads![(2, MANY, |a| Ok(Payload::RunEx(call_ex(a, 2)?)))],
        K::Loop => overloads![(1, 1, loop_break), (4, MANY, |a| Ok(Payload::Loop(loop_range(a)?)))],
        K::LoopLetter => overloads![
            (1, 1, loop_break_letter),
            (4, MANY, |a| Ok(Payload::LoopLetter(loop_range(a)?))),
        ],
        K::LoopEx => overloads![
            (1, 1, loop_break_ex),
            (4, MANY, |a| Ok(Payload::LoopEx(loop_range_ex(a)?))),
        ],
        K::LoopLetterEx => overloads![
            (1, 1, loop_break_letter_ex),
            (4, MANY, |a| Ok(Payload::LoopLetterEx(loop_range_ex(a)?))),
        ],
        K::If => overloads![(2, MANY, if_block)],
        K::Else => overloads![(1, MANY, else_block)],
        K::Begin => overloads![(0, 0, |_| Ok(Payload::Begin))],
        K::End => overloads![(0, 0, |_| Ok(Payload::End))],

        // Control
        K::Set => overloads![(2, 3, set)],
        K::SetMacro => overloads![(2, 3, set_macro)],
        K::AddVariables => overloads![(2, 3, add_variables)],
        K::Exit => overloads![(0, 2, exit)],
        K::Halt => overloads![(0, 1, |a| Ok(Payload::Halt { message: a.string(0) }))],
        K::Wait => overloads![(1, 1, |a| Ok(Payload::Wait(Wait { seconds: a.string(0) })))],
        K::Beep => overloads![(1, 1, beep)],

        // System
        K::System => overloads![(1, MANY, system)],
        K::ShellExecute | K::ShellExecuteDelete => overloads![(2, 5, positional)],
        K::ShellExecuteEx => overloads![(2, 4, positional)],

        K::Debug => overloads![(1, MANY, positional)],

        K::Macro | K::Error => return None,
    };
    Some(Schema { keyword, overloads })
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn positional(a: &Args<'_>) -> Result<Payload, ArgError> {
    Ok(Payload::Args(a.strings_from(0)))
}

/// `true` if the string still holds a variable or parameter reference and
/// so cannot be validated until runtime.
fn is_dynamic(s: &str) -> bool {
    s.contains('%') || s.contains('#')
}

/// Match each token against `allowed` flags (case-insensitive).  Returns the
/// canonical spelling of every flag seen; a flag may appear only once.
fn flags(tokens: &[Token], allowed: &[&'static str]) -> Result<Vec<&'static str>, ArgError> {
    let mut seen = Vec::new();
    for t in tokens {
        let flag = allowed
            .iter()
            .find(|f| f.eq_ignore_ascii_case(&t.text))
            .ok_or_else(|| ArgError::Invalid(format!("invalid flag {:?}", t.text)))?;
        if seen.contains(flag) {
            return Err(ArgError::Invalid(format!("flag {flag} given twice")));
        }
        seen.push(*flag);
    }
    Ok(seen)
}

fn src_dest(a: &Args<'_>) -> SrcDest {
    SrcDest { src: a.string(0), dest: a.string(1) }
}

fn path_query(a: &Args<'_>) -> Result<PathQuery, ArgError> {
    Ok(PathQuery { path: a.string(0), dest: a.var_key(1)? })
}

// ── File ──────────────────────────────────────────────────────────────────────

fn file_copy(a: &Args<'_>) -> Result<Payload, ArgError> {
    let f = flags(&a.tokens[2..], &["PRESERVE", "NOWARN", "NOREC"])?;
    Ok(Payload::FileCopy(FileCopy {
        src: a.string(0),
        dest: a.string(1),
        preserve: f.contains(&"PRESERVE"),
        no_warn: f.contains(&"NOWARN"),
        no_rec: f.contains(&"NOREC"),
    }))
}

fn file_delete(a: &Args<'_>) -> Result<Payload, ArgError> {
    let f = flags(&a.tokens[1..], &["NOWARN", "NOREC"])?;
    Ok(Payload::FileDelete(FileDelete {
        path: a.string(0),
        no_warn: f.contains(&"NOWARN"),
        no_rec: f.contains(&"NOREC"),
    }))
}

const ENCODINGS: &[&str] = &["UTF8", "UTF16", "UTF16BE", "ANSI"];

fn file_create_blank(a: &Args<'_>) -> Result<Payload, ArgError> {
    let f = flags(&a.tokens[1..], &["PRESERVE", "NOWARN", "UTF8", "UTF16", "UTF16BE", "ANSI"])?;
    let mut encodings = f.iter().filter(|x| ENCODINGS.contains(*x));
    let encoding = encodings.next().map(|e| e.to_string());
    if encodings.next().is_some() {
        return Err(ArgError::Invalid("more than one encoding given".into()));
    }
    Ok(Payload::FileCreateBlank(FileCreateBlank {
        path: a.string(0),
        preserve: f.contains(&"PRESERVE"),
        no_warn: f.contains(&"NOWARN"),
        encoding,
    }))
}

// ── Registry ──────────────────────────────────────────────────────────────────

const HIVES: &[&str] = &[
    "HKLM", "HKEY_LOCAL_MACHINE", "HKCU", "HKEY_CURRENT_USER", "HKCR", "HKEY_CLASSES_ROOT",
    "HKU", "HKEY_USERS", "HKCC", "HKEY_CURRENT_CONFIG",
];

fn hive(s: &str) -> Result<String, ArgError> {
    if is_dynamic(s) || HIVES.iter().any(|h| h.eq_ignore_ascii_case(s)) {
        Ok(s.to_owned())
    } else {
        Err(ArgError::Invalid(format!("invalid registry hive {s:?}")))
    }
}

fn reg_read(a: &Args<'_>) -> Result<Payload, ArgError> {
    Ok(Payload::RegRead(RegRead {
        hive: hive(a.get(0))?,
        key: a.string(1),
        value_name: a.string(2),
        dest: a.var_key(3)?,
    }))
}

fn reg_delete(a: &Args<'_>) -> Result<Payload, ArgError> {
    Ok(Payload::RegDelete(RegDelete {
        hive: hive(a.get(0))?,
        key: a.string(1),
        value_name: (a.len() == 3).then(|| a.string(2)),
    }))
}

const REG_NONE: u32 = 0;
const REG_SZ: u32 = 1;
const REG_EXPAND_SZ: u32 = 2;
const REG_BINARY: u32 = 3;
const REG_DWORD: u32 = 4;
const REG_MULTI_SZ: u32 = 7;
const REG_QWORD: u32 = 11;

/// Common prefix of every `RegWrite` form: the hive, value type and key path,
/// plus the data tokens with a trailing `NOWARN` stripped.
struct RegWriteHead<'a> {
    hive: String,
    value_type: u32,
    key: String,
    rest: &'a [Token],
    no_warn: bool,
}

fn reg_write_head<'a>(a: &Args<'a>) -> Result<RegWriteHead<'a>, ArgError> {
    let mut tokens = a.tokens;
    let mut no_warn = false;
    if tokens.len() > 3 && tokens[tokens.len() - 1].text.eq_ignore_ascii_case("NOWARN") {
        no_warn = true;
        tokens = &tokens[..tokens.len() - 1];
    }
    let type_str = a.get(1);
    if is_dynamic(type_str) {
        return Err(ArgError::Invalid("registry value type must be a constant".into()));
    }
    let value_type = Number::parse_with_hex(type_str)
        .filter(|n| n.is_int())
        .map(|n| n.as_i64())
        .and_then(|n| u32::try_from(n).ok())
        .filter(|t| {
            [REG_NONE, REG_SZ, REG_EXPAND_SZ, REG_BINARY, REG_DWORD, REG_MULTI_SZ, REG_QWORD]
                .contains(t)
        })
        .ok_or_else(|| ArgError::Invalid(format!("invalid registry value type {type_str:?}")))?;
    Ok(RegWriteHead {
        hive: hive(a.get(0))?,
        value_type,
        key: a.string(2),
        rest: &tokens[3..],
        no_warn,
    })
}

fn reg_write(h: RegWriteHead<'_>, target: RegTarget) -> Payload {
    Payload::RegWrite(RegWrite {
        hive: h.hive,
        value_type: h.value_type,
        key: h.key,
        target,
        no_warn: h.no_warn,
    })
}

fn reg_write_key(a: &Args<'_>) -> Result<Payload, ArgError> {
    let h = reg_write_head(a)?;
    if !h.rest.is_empty() {
        return Err(ArgError::Mismatch);
    }
    Ok(reg_write(h, RegTarget::Key))
}

fn reg_write_empty(a: &Args<'_>) -> Result<Payload, ArgError> {
    let h = reg_write_head(a)?;
    if h.rest.len() != 1 {
        return Err(ArgError::Mismatch);
    }
    let name = h.rest[0].text.clone();
    Ok(reg_write(h, RegTarget::Value { name, data: RegData::None }))
}

fn reg_write_single(a: &Args<'_>) -> Result<Payload, ArgError> {
    let h = reg_write_head(a)?;
    if h.rest.len() != 2 || h.value_type == REG_MULTI_SZ {
        return Err(ArgError::Mismatch);
    }
    let name = h.rest[0].text.clone();
    let datum = h.rest[1].text.clone();
    Ok(reg_write(h, RegTarget::Value { name, data: RegData::Single(datum) }))
}

fn reg_write_list(a: &Args<'_>) -> Result<Payload, ArgError> {
    let h = reg_write_head(a)?;
    if h.rest.len() < 2 {
        return Err(ArgError::Mismatch);
    }
    if h.value_type != REG_MULTI_SZ && h.value_type != REG_BINARY {
        return Err(ArgError::Invalid(format!(
            "value type {} takes a single datum, got {}",
            h.value_type,
            h.rest.len() - 1
        )));
    }
    let name = h.rest[0].text.clone();
    let items = h.rest[1..].iter().map(|t| t.text.clone()).collect();
    Ok(reg_write(h, RegTarget::Value { name, data: RegData::List(items) }))
}

// ── Text, Ini, Interface ──────────────────────────────────────────────────────

fn txt_add_line(a: &Args<'_>) -> Result<Payload, ArgError> {
    let mode = match a.get(2) {
        m if m.eq_ignore_ascii_case("Append") => AddLineMode::Append,
        m if m.eq_ignore_ascii_case("Prepend") => AddLineMode::Prepend,
        m => return Err(ArgError::Invalid(format!("invalid mode {m:?}; expected Append or Prepend"))),
    };
    Ok(Payload::TxtAddLine(TxtAddLine { file: a.string(0), line: a.string(1), mode }))
}

fn ini_read(a: &Args<'_>) -> Result<Payload, ArgError> {
    let default = match a.tokens.get(4) {
        None => None,
        Some(t) => match strip_prefix_ci(&t.text, "Default=") {
            Some(v) => Some(v.to_owned()),
            None => {
                return Err(ArgError::Invalid(format!("expected Default=<value>, got {:?}", t.text)))
            }
        },
    };
    Ok(Payload::IniRead(IniRead {
        file: a.string(0),
        section: a.string(1),
        key: a.string(2),
        dest: a.var_key(3)?,
        default,
    }))
}

fn visible(a: &Args<'_>) -> Result<Payload, ArgError> {
    match a.var_key(0)? {
        VarKey::Var(control) => Ok(Payload::Visible(Visible { control, visible: a.string(1) })),
        other => Err(ArgError::Invalid(format!("{other} is not an interface key"))),
    }
}

fn echo(a: &Args<'_>) -> Result<Payload, ArgError> {
    let f = flags(&a.tokens[1..], &["WARN"])?;
    Ok(Payload::Echo(Echo { message: a.string(0), warn: f.contains(&"WARN") }))
}

const HASH_TYPES: &[&str] = &["MD5", "SHA1", "SHA256", "SHA384", "SHA512"];

fn hash(a: &Args<'_>) -> Result<Payload, ArgError> {
    let algorithm = a.get(0);
    if !is_dynamic(algorithm) && !HASH_TYPES.iter().any(|h| h.eq_ignore_ascii_case(algorithm)) {
        return Err(ArgError::Invalid(format!("invalid hash type {algorithm:?}")));
    }
    Ok(Payload::Hash(Hash { algorithm: algorithm.to_owned(), path: a.string(1), dest: a.var_key(2)? }))
}

// ── StrFormat, Math ───────────────────────────────────────────────────────────

fn expect_len(a: &Args<'_>, op: &str, n: usize) -> Result<(), ArgError> {
    if a.len() == n {
        Ok(())
    } else {
        Err(ArgError::Invalid(format!("{op} takes {} arguments, got {}", n - 1, a.len() - 1)))
    }
}

fn str_format(a: &Args<'_>) -> Result<Payload, ArgError> {
    let op = a.get(0);
    let is = |name: &str| op.eq_ignore_ascii_case(name);
    let unary = |u| -> Result<StrFormatOp, ArgError> {
        expect_len(a, op, 3)?;
        Ok(StrFormatOp::Unary { op: u, src: a.string(1), dest: a.var_key(2)? })
    };
    let trim = |t| -> Result<StrFormatOp, ArgError> {
        expect_len(a, op, 4)?;
        Ok(StrFormatOp::Trim { op: t, src: a.string(1), arg: a.string(2), dest: a.var_key(3)? })
    };

    let parsed = if is("Inc") || is("Dec") {
        expect_len(a, op, 3)?;
        StrFormatOp::Arith { dec: is("Dec"), dest: a.var_key(1)?, amount: a.string(2) }
    } else if is("Left") || is("Right") {
        expect_len(a, op, 4)?;
        StrFormatOp::Cut { right: is("Right"), src: a.string(1), count: a.string(2), dest: a.var_key(3)? }
    } else if is("Mid") {
        expect_len(a, op, 5)?;
        StrFormatOp::Mid { src: a.string(1), start: a.string(2), len: a.string(3), dest: a.var_key(4)? }
    } else if is("Len") {
        unary(StrUnary::Len)?
    } else if is("UCase") {
        unary(StrUnary::UCase)?
    } else if is("LCase") {
        unary(StrUnary::LCase)?
    } else if is("NTrim") {
        unary(StrUnary::NTrim)?
    } else if is("FileName") {
        unary(StrUnary::FileName)?
    } else if is("DirPath") {
        unary(StrUnary::DirPath)?
    } else if is("Ext") {
        unary(StrUnary::Ext)?
    } else if is("LTrim") {
        trim(StrTrim::Left)?
    } else if is("RTrim") {
        trim(StrTrim::Right)?
    } else if is("CTrim") {
        trim(StrTrim::Chars)?
    } else if is("Pos") || is("PosX") {
        expect_len(a, op, 4)?;
        StrFormatOp::Pos { case_sensitive: is("PosX"), src: a.string(1), sub: a.string(2), dest: a.var_key(3)? }
    } else if is("Replace") || is("ReplaceX") {
        expect_len(a, op, 5)?;
        StrFormatOp::Replace {
            case_sensitive: is("ReplaceX"),
            src: a.string(1),
            old: a.string(2),
            new: a.string(3),
            dest: a.var_key(4)?,
        }
    } else if is("Split") {
        expect_len(a, op, 5)?;
        StrFormatOp::Split { src: a.string(1), delim: a.string(2), index: a.string(3), dest: a.var_key(4)? }
    } else {
        return Err(ArgError::Invalid(format!("unknown StrFormat operation {op:?}")));
    };
    Ok(Payload::StrFormat(parsed))
}

const MATH_BINARY: &[(&str, MathBinary)] = &[
    ("Add", MathBinary::Add),
    ("Sub", MathBinary::Sub),
    ("Mul", MathBinary::Mul),
    ("Div", MathBinary::Div),
    ("Pow", MathBinary::Pow),
    ("BoolAnd", MathBinary::BoolAnd),
    ("BoolOr", MathBinary::BoolOr),
    ("BoolXor", MathBinary::BoolXor),
    ("BitAnd", MathBinary::BitAnd),
    ("BitOr", MathBinary::BitOr),
    ("BitXor", MathBinary::BitXor),
];

const MATH_UNARY: &[(&str, MathUnary)] = &[
    ("Neg", MathUnary::Neg),
    ("Abs", MathUnary::Abs),
    ("BoolNot", MathUnary::BoolNot),
    ("BitNot", MathUnary::BitNot),
    ("Hex", MathUnary::Hex),
    ("Dec", MathUnary::Dec),
];

const MATH_ROUND: &[(&str, MathRound)] = &[
    ("Ceil", MathRound::Ceil),
    ("Floor", MathRound::Floor),
    ("Round", MathRound::Round),
];

fn find_op<T: Copy>(table: &[(&str, T)], name: &str) -> Option<T> {
    table.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|&(_, op)| op)
}

fn math(a: &Args<'_>) -> Result<Payload, ArgError> {
    let name = a.get(0);
    let op = if let Some(op) = find_op(MATH_BINARY, name) {
        expect_len(a, name, 4)?;
        MathOp::Binary { op, dest: a.var_key(1)?, lhs: a.string(2), rhs: a.string(3) }
    } else if let Some(op) = find_op(MATH_UNARY, name) {
        expect_len(a, name, 3)?;
        MathOp::Unary { op, dest: a.var_key(1)?, src: a.string(2) }
    } else if let Some(op) = find_op(MATH_ROUND, name) {
        expect_len(a, name, 4)?;
        MathOp::Rounding { op, dest: a.var_key(1)?, src: a.string(2), unit: a.string(3) }
    } else if name.eq_ignore_ascii_case("IntDiv") {
        expect_len(a, name, 5)?;
        MathOp::IntDiv {
            quotient: a.var_key(1)?,
            remainder: a.var_key(2)?,
            lhs: a.string(3),
            rhs: a.string(4),
        }
    } else if name.eq_ignore_ascii_case("BitShift") {
        expect_len(a, name, 5)?;
        let left = match a.get(3) {
            d if d.eq_ignore_ascii_case("LEFT") => true,
            d if d.eq_ignore_ascii_case("RIGHT") => false,
            d => return Err(ArgError::Invalid(format!("invalid shift direction {d:?}"))),
        };
        MathOp::BitShift { dest: a.var_key(1)?, src: a.string(2), left, shift: a.string(4) }
    } else {
        return Err(ArgError::Invalid(format!("unknown Math operation {name:?}")));
    };
    Ok(Payload::Math(op))
}

// ── Branch ────────────────────────────────────────────────────────────────────

fn call(a: &Args<'_>) -> Call {
    Call {
        script: a.string(0),
        section: a.string(1),
        in_params: a.strings_from(2),
        out_params: Vec::new(),
    }
}

/// `In=`/`Out=` parameter list starting at token `from`.
fn call_ex(a: &Args<'_>, from: usize) -> Result<Call, ArgError> {
    let mut c = Call {
        script: a.string(0),
        section: a.string(1),
        in_params: Vec::new(),
        out_params: Vec::new(),
    };
    for t in a.tokens.iter().skip(from) {
        let text = t.text.as_str();
        if let Some(v) = strip_prefix_ci(text, "In=") {
            c.in_params.push(v.to_owned());
        } else if let Some(v) = strip_prefix_ci(text, "Out=") {
            let key = VarKey::parse(v)
                .ok_or_else(|| ArgError::Invalid(format!("Out= needs a variable key, got {v:?}")))?;
            c.out_params.push(key);
        } else {
            return Err(ArgError::Invalid(format!("parameter {text:?} must start with In= or Out=")));
        }
    }
    Ok(c)
}

fn strip_prefix_ci<'s>(s: &'s str, prefix: &str) -> Option<&'s str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

fn is_break(a: &Args<'_>) -> Result<LoopForm, ArgError> {
    if a.get(0).eq_ignore_ascii_case("BREAK") {
        Ok(LoopForm::Break)
    } else {
        Err(ArgError::Mismatch)
    }
}

fn loop_break(a: &Args<'_>) -> Result<Payload, ArgError> {
    is_break(a).map(Payload::Loop)
}

fn loop_break_letter(a: &Args<'_>) -> Result<Payload, ArgError> {
    is_break(a).map(Payload::LoopLetter)
}

fn loop_break_ex(a: &Args<'_>) -> Result<Payload, ArgError> {
    is_break(a).map(Payload::LoopEx)
}

fn loop_break_letter_ex(a: &Args<'_>) -> Result<Payload, ArgError> {
    is_break(a).map(Payload::LoopLetterEx)
}

/// `<script>,<section>,<start>,<end>[,params...]`
fn loop_range(a: &Args<'_>) -> Result<LoopForm, ArgError> {
    let mut call = call(a);
    call.in_params = a.strings_from(4);
    Ok(LoopForm::Range { call, start: a.string(2), end: a.string(3) })
}

fn loop_range_ex(a: &Args<'_>) -> Result<LoopForm, ArgError> {
    let call = call_ex(a, 4)?;
    Ok(LoopForm::Range { call, start: a.string(2), end: a.string(3) })
}

fn embedded(a: &Args<'_>, tokens: &[Token]) -> Result<CommandNode, ArgError> {
    if tokens.is_empty() {
        return Err(ArgError::Invalid("missing embedded command".into()));
    }
    let node = parser::parse_tokens(tokens, a.pos);
    match node.payload {
        Payload::Invalid(e) => Err(ArgError::Invalid(format!("embedded command: {e}"))),
        _ => Ok(node),
    }
}

fn if_block(a: &Args<'_>) -> Result<Payload, ArgError> {
    let (condition, used) = Condition::parse(a.tokens).map_err(ArgError::Invalid)?;
    let node = embedded(a, &a.tokens[used..])?;
    Ok(Payload::If(IfBlock { condition, block: vec![node] }))
}

fn else_block(a: &Args<'_>) -> Result<Payload, ArgError> {
    let node = embedded(a, a.tokens)?;
    Ok(Payload::Else(ElseBlock { block: vec![node] }))
}

// ── Control ───────────────────────────────────────────────────────────────────

fn scope_flag(a: &Args<'_>, i: usize, allow_permanent: bool) -> Result<SetScope, ArgError> {
    match a.tokens.get(i) {
        None => Ok(SetScope::Local),
        Some(t) if t.text.eq_ignore_ascii_case("GLOBAL") => Ok(SetScope::Global),
        Some(t) if allow_permanent && t.text.eq_ignore_ascii_case("PERMANENT") => Ok(SetScope::Permanent),
        Some(t) => Err(ArgError::Invalid(format!("invalid flag {:?}", t.text))),
    }
}

fn set(a: &Args<'_>) -> Result<Payload, ArgError> {
    Ok(Payload::Set(SetVar {
        key: a.var_key(0)?,
        value: a.string(1),
        scope: scope_flag(a, 2, true)?,
    }))
}

/// Macro names share the keyword alphabet.
pub fn is_macro_name(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

fn set_macro(a: &Args<'_>) -> Result<Payload, ArgError> {
    let name = a.get(0);
    if !is_dynamic(name) && !is_macro_name(name) {
        return Err(ArgError::Invalid(format!("invalid macro name {name:?}")));
    }
    Ok(Payload::SetMacro(SetMacro {
        name: name.to_owned(),
        command: a.string(1),
        scope: scope_flag(a, 2, true)?,
    }))
}

fn add_variables(a: &Args<'_>) -> Result<Payload, ArgError> {
    Ok(Payload::AddVariables(AddVariables {
        script: a.string(0),
        section: a.string(1),
        global: scope_flag(a, 2, false)? == SetScope::Global,
    }))
}

fn exit(a: &Args<'_>) -> Result<Payload, ArgError> {
    let no_warn = match a.tokens.get(1) {
        None => false,
        Some(t) if t.text.eq_ignore_ascii_case("NOWARN") => true,
        Some(t) => return Err(ArgError::Invalid(format!("invalid flag {:?}", t.text))),
    };
    Ok(Payload::Exit { message: a.string(0), no_warn })
}

const BEEP_TYPES: &[&str] = &["OK", "Error", "Asterisk", "Confirmation"];

fn beep(a: &Args<'_>) -> Result<Payload, ArgError> {
    let kind = a.get(0);
    if !is_dynamic(kind) && !BEEP_TYPES.iter().any(|b| b.eq_ignore_ascii_case(kind)) {
        return Err(ArgError::Invalid(format!("invalid beep type {kind:?}")));
    }
    Ok(Payload::Beep { kind: kind.to_owned() })
}

fn system(a: &Args<'_>) -> Result<Payload, ArgError> {
    let sub = a.get(0);
    let extra = a.len() - 1;
    let cmd = if sub.eq_ignore_ascii_case("ErrorOff") {
        if extra > 1 {
            return Err(ArgError::Invalid("ErrorOff takes at most one argument".into()));
        }
        SystemCmd::ErrorOff(a.tokens.get(1).map(|t| t.text.clone()))
    } else if sub.eq_ignore_ascii_case("SetLocal") || sub.eq_ignore_ascii_case("EndLocal") {
        if extra != 0 {
            return Err(ArgError::Invalid(format!("{sub} takes no arguments")));
        }
        if sub.eq_ignore_ascii_case("SetLocal") {
            SystemCmd::SetLocal
        } else {
            SystemCmd::EndLocal
        }
    } else {
        SystemCmd::Other { sub: sub.to_owned(), args: a.strings_from(1) }
    };
    Ok(Payload::System(cmd))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
