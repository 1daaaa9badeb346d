//! `If` conditions.
//!
//! A condition is either a comparison (`<a>,<Op>,<b>`) or an existence
//! predicate (`ExistFile,<path>` …), optionally prefixed with `Not`.
//!
//! ## Comparison
//!
//! | Op | Aliases |
//! |----|---------|
//! | `Equal` | `==` |
//! | `NotEqual` | `!=` (folded to `Not` + `Equal`) |
//! | `Smaller` | `<` |
//! | `Bigger` | `>` |
//! | `SmallerEqual` | `<=` |
//! | `BiggerEqual` | `>=` |
//! | `EqualX` | `===` (case-sensitive) |
//!
//! Operands are compared by [`compare`]: string equality first, then as
//! versions, then as decimal numbers.  Hex is never recognised here.
//!
//! ## Existence predicates
//!
//! Files, directories, sections, variables and macros are answered by the
//! engine through [`ConditionEnv`].  Registry, WIM, network and UI
//! predicates go to a pluggable [`ConditionProbe`]; [`NullProbe`] answers
//! none of them.

use std::cmp::Ordering;
use std::fmt;
use std::path::Path;

use super::lexer::Token;
use super::value::{Number, Version};

// ── Condition ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CondKind {
    // Comparisons: args = [lhs, rhs]
    Equal,
    EqualX,
    Smaller,
    Bigger,
    SmallerEqual,
    BiggerEqual,
    // Existence
    ExistFile,
    ExistDir,
    ExistSection,
    ExistVar,
    ExistMacro,
    // Probed
    ExistRegSection,
    ExistRegSubKey,
    ExistRegKey,
    ExistRegValue,
    ExistRegMulti,
    WimExistIndex,
    WimExistFile,
    WimExistDir,
    WimExistImageInfo,
    Ping,
    Online,
    Question,
}

impl CondKind {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            CondKind::Equal
                | CondKind::EqualX
                | CondKind::Smaller
                | CondKind::Bigger
                | CondKind::SmallerEqual
                | CondKind::BiggerEqual
        )
    }

    /// Predicates the engine cannot answer on its own.
    pub fn is_probed(self) -> bool {
        !self.is_comparison()
            && !matches!(
                self,
                CondKind::ExistFile
                    | CondKind::ExistDir
                    | CondKind::ExistSection
                    | CondKind::ExistVar
                    | CondKind::ExistMacro
            )
    }
}

impl fmt::Display for CondKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A parsed `If` condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub kind: CondKind,
    pub not: bool,
    pub args: Vec<String>,
}

/// Existence predicates and their argument counts.
const EXISTENCE: &[(&str, CondKind, usize)] = &[
    ("ExistFile", CondKind::ExistFile, 1),
    ("ExistDir", CondKind::ExistDir, 1),
    ("ExistSection", CondKind::ExistSection, 2),
    ("ExistRegSection", CondKind::ExistRegSection, 2),
    ("ExistRegSubKey", CondKind::ExistRegSubKey, 2),
    ("ExistRegKey", CondKind::ExistRegKey, 3),
    ("ExistRegValue", CondKind::ExistRegValue, 3),
    ("ExistRegMulti", CondKind::ExistRegMulti, 4),
    ("ExistVar", CondKind::ExistVar, 1),
    ("ExistMacro", CondKind::ExistMacro, 1),
    ("WimExistIndex", CondKind::WimExistIndex, 2),
    ("WimExistFile", CondKind::WimExistFile, 3),
    ("WimExistDir", CondKind::WimExistDir, 3),
    ("WimExistImageInfo", CondKind::WimExistImageInfo, 3),
    ("Ping", CondKind::Ping, 1),
    ("Online", CondKind::Online, 0),
];

/// Negated spellings accepted from older scripts.
const LEGACY_NEGATED: &[(&str, CondKind, usize)] = &[
    ("NotExistFile", CondKind::ExistFile, 1),
    ("NotExistDir", CondKind::ExistDir, 1),
    ("NotExistSection", CondKind::ExistSection, 2),
    ("NotExistRegSection", CondKind::ExistRegSection, 2),
    ("NotExistRegKey", CondKind::ExistRegKey, 3),
    ("NotExistVar", CondKind::ExistVar, 1),
];

const COMPARISONS: &[(&str, &str, CondKind)] = &[
    ("Equal", "==", CondKind::Equal),
    ("EqualX", "===", CondKind::EqualX),
    ("Smaller", "<", CondKind::Smaller),
    ("Bigger", ">", CondKind::Bigger),
    ("SmallerEqual", "<=", CondKind::SmallerEqual),
    ("BiggerEqual", ">=", CondKind::BiggerEqual),
];

impl Condition {
    /// Parse a condition from the front of `tokens`, returning it with the
    /// number of tokens consumed.  The remaining tokens are the embedded
    /// command.
    pub fn parse(tokens: &[Token]) -> Result<(Condition, usize), String> {
        let text = |i: usize| tokens.get(i).map(|t| t.text.as_str());
        let need = |n: usize, name: &str| {
            if tokens.len() < n {
                Err(format!("condition {name} needs at least {n} arguments"))
            } else {
                Ok(())
            }
        };

        let head = text(0).ok_or("empty condition")?;
        let (mut not, at) = if head.eq_ignore_ascii_case("Not") { (true, 1) } else { (false, 0) };
        let word = text(at).ok_or("missing condition after Not")?;

        let build = |kind, not, count: usize| Condition {
            kind,
            not,
            args: tokens[at + 1..at + 1 + count].iter().map(|t| t.text.clone()).collect(),
        };

        if let Some(&(name, kind, count)) =
            EXISTENCE.iter().find(|(n, ..)| n.eq_ignore_ascii_case(word))
        {
            need(at + 1 + count, name)?;
            return Ok((build(kind, not, count), at + 1 + count));
        }
        if let Some(&(name, kind, count)) =
            LEGACY_NEGATED.iter().find(|(n, ..)| n.eq_ignore_ascii_case(word))
        {
            if not {
                return Err("Not cannot be combined with a negated condition".into());
            }
            need(at + 1 + count, name)?;
            return Ok((build(kind, true, count), at + 1 + count));
        }
        if word.eq_ignore_ascii_case("Question") {
            // Question,<msg>[,<timeout>,<default>]
            let timed = text(at + 2)
                .is_some_and(|t| t.bytes().last().is_some_and(|b| b.is_ascii_digit()));
            let count = if timed { 3 } else { 1 };
            need(at + 1 + count, "Question")?;
            return Ok((build(CondKind::Question, not, count), at + 1 + count));
        }

        // <a>,<Op>,<b>
        if tokens.len() < at + 3 {
            return Err("incomplete comparison".into());
        }
        let op = &tokens[at + 1].text;
        let kind = if op.eq_ignore_ascii_case("NotEqual") || op == "!=" {
            if not {
                return Err("Not cannot be combined with NotEqual".into());
            }
            not = true;
            CondKind::Equal
        } else {
            COMPARISONS
                .iter()
                .find(|(name, sym, _)| name.eq_ignore_ascii_case(op) || sym == op)
                .map(|&(_, _, kind)| kind)
                .ok_or_else(|| format!("unknown comparison {op:?}"))?
        };
        let cond = Condition {
            kind,
            not,
            args: vec![tokens[at].text.clone(), tokens[at + 2].text.clone()],
        };
        Ok((cond, at + 3))
    }
}

// ── Comparison ────────────────────────────────────────────────────────────────

/// Outcome of comparing two operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Equal,
    Smaller,
    Bigger,
    NotEqual,
}

impl From<Ordering> for Comparison {
    fn from(o: Ordering) -> Self {
        match o {
            Ordering::Less => Comparison::Smaller,
            Ordering::Equal => Comparison::Equal,
            Ordering::Greater => Comparison::Bigger,
        }
    }
}

/// Compare two operands: string equality, then versions, then decimal
/// numbers.  Operands that are neither are only ever `NotEqual`.
pub fn compare(a: &str, b: &str, case_sensitive: bool) -> Comparison {
    let same = if case_sensitive { a == b } else { a.eq_ignore_ascii_case(b) };
    if same {
        return Comparison::Equal;
    }
    if let (Some(va), Some(vb)) = (Version::parse(a), Version::parse(b)) {
        return va.cmp(&vb).into();
    }
    if let (Some(na), Some(nb)) = (Number::parse(a), Number::parse(b)) {
        return na.cmp_value(nb).into();
    }
    Comparison::NotEqual
}

fn holds(kind: CondKind, a: &str, b: &str) -> bool {
    let c = compare(a, b, kind == CondKind::EqualX);
    match kind {
        CondKind::Equal | CondKind::EqualX => c == Comparison::Equal,
        CondKind::Smaller => c == Comparison::Smaller,
        CondKind::Bigger => c == Comparison::Bigger,
        CondKind::SmallerEqual => matches!(c, Comparison::Smaller | Comparison::Equal),
        CondKind::BiggerEqual => matches!(c, Comparison::Bigger | Comparison::Equal),
        _ => false,
    }
}

// ── Evaluation ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConditionError {
    #[error("condition {0} is not available")]
    Unavailable(CondKind),
    #[error("{0:?} is not a variable key")]
    BadVarKey(String),
    #[error("condition {kind} expects {expected} arguments, got {got}")]
    ArgCount { kind: CondKind, expected: usize, got: usize },
}

/// Answers predicates that need registry, WIM, network or UI access.
pub trait ConditionProbe {
    /// `None` means the predicate is not supported.
    fn probe(&mut self, kind: CondKind, args: &[String]) -> Option<bool>;
}

/// A probe that supports nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProbe;

impl ConditionProbe for NullProbe {
    fn probe(&mut self, _kind: CondKind, _args: &[String]) -> Option<bool> {
        None
    }
}

impl<F: FnMut(CondKind, &[String]) -> Option<bool>> ConditionProbe for F {
    fn probe(&mut self, kind: CondKind, args: &[String]) -> Option<bool> {
        self(kind, args)
    }
}

/// What a condition may ask of the running engine.
pub trait ConditionEnv {
    fn section_exists(&self, script: &str, section: &str) -> bool;
    /// `key` is written as in the script (`%Name%`, `#1`, …).
    fn var_exists(&self, key: &str) -> Result<bool, ConditionError>;
    fn macro_exists(&self, name: &str) -> bool;
    fn probe(&mut self, kind: CondKind, args: &[String]) -> Option<bool>;
}

/// Evaluate an already-expanded condition.
pub fn evaluate(cond: &Condition, env: &mut dyn ConditionEnv) -> Result<bool, ConditionError> {
    let arg = |i: usize| cond.args.get(i).map(String::as_str).unwrap_or("");
    let result = match cond.kind {
        k if k.is_comparison() => {
            if cond.args.len() != 2 {
                return Err(ConditionError::ArgCount { kind: k, expected: 2, got: cond.args.len() });
            }
            holds(k, arg(0), arg(1))
        }
        CondKind::ExistFile => file_exists(arg(0)),
        CondKind::ExistDir => Path::new(arg(0)).is_dir(),
        CondKind::ExistSection => env.section_exists(arg(0), arg(1)),
        CondKind::ExistVar => env.var_exists(arg(0))?,
        CondKind::ExistMacro => env.macro_exists(arg(0)),
        k => env.probe(k, &cond.args).ok_or(ConditionError::Unavailable(k))?,
    };
    Ok(result != cond.not)
}

/// `true` if `path` names a file.  `*` and `?` in the last component match
/// against the directory listing.
fn file_exists(path: &str) -> bool {
    let p = Path::new(path);
    let Some(name) = p.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if !name.contains(['*', '?']) {
        return p.is_file();
    }
    let dir = match p.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries.flatten().any(|e| {
        e.file_type().is_ok_and(|t| t.is_file())
            && e.file_name().to_str().is_some_and(|n| wildcard_match(name, n))
    })
}

/// Case-insensitive `*`/`?` glob on a single path component.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.to_lowercase().chars().collect();
    let t: Vec<char> = text.to_lowercase().chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while ti < t.len() {
        match p.get(pi) {
            Some('*') => {
                backtrack = Some((pi, ti));
                pi += 1;
            }
            Some(&c) if c == '?' || c == t[ti] => {
                pi += 1;
                ti += 1;
            }
            _ => match backtrack {
                Some((bp, bt)) => {
                    pi = bp + 1;
                    ti = bt + 1;
                    backtrack = Some((bp, bt + 1));
                }
                None => return false,
            },
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

// ── Tests ─────────────────────────────────────────────────────────────────────
