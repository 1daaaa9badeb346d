//! Built-in command handlers.
//!
//! These are the handlers that need nothing but the variable store:
//!
//! | Keyword | Effect |
//! |---------|--------|
//! | `Echo` | append the message to the engine output |
//! | `Math` | numeric, boolean and bitwise arithmetic |
//! | `StrFormat` | string slicing, case, trimming, search and split |
//! | `Wait` | sleep for a number of seconds |
//! | `Beep` | log a beep |
//!
//! Each handler receives its payload with every string already expanded.
//! Operations work through an inner function returning
//! `Result<Outcome, String>`; an `Err` becomes an `Error` outcome.

use std::time::Duration;

use super::command::{
    Echo, Keyword, MathBinary, MathOp, MathRound, MathUnary, Payload, StrFormatOp, StrTrim, StrUnary,
    VarKey,
};
use super::engine::EngineContext;
use super::handler::{HandlerRegistry, Outcome};
use super::value::{bool_str, parse_bool, Number};

/// Register every built-in handler.
pub fn register(r: &mut HandlerRegistry) {
    r.register_fn(Keyword::Echo, |p, ctx| dispatch(p, ctx, |p, ctx| match p {
        Payload::Echo(e) => Ok(echo(e, ctx)),
        _ => Err(mismatch(p)),
    }));
    r.register_fn(Keyword::Math, |p, ctx| dispatch(p, ctx, |p, ctx| match p {
        Payload::Math(op) => math(op, ctx),
        _ => Err(mismatch(p)),
    }));
    r.register_fn(Keyword::StrFormat, |p, ctx| dispatch(p, ctx, |p, ctx| match p {
        Payload::StrFormat(op) => str_format(op, ctx),
        _ => Err(mismatch(p)),
    }));
    r.register_fn(Keyword::Wait, |p, ctx| dispatch(p, ctx, |p, _| match p {
        Payload::Wait(w) => wait(&w.seconds),
        _ => Err(mismatch(p)),
    }));
    r.register_fn(Keyword::Beep, |p, ctx| dispatch(p, ctx, |p, _| match p {
        Payload::Beep { kind } => Ok(Outcome::success(format!("Beep {kind}"))),
        _ => Err(mismatch(p)),
    }));
}

fn dispatch(
    p: &Payload,
    ctx: &mut EngineContext<'_>,
    f: impl FnOnce(&Payload, &mut EngineContext<'_>) -> Result<Outcome, String>,
) -> Outcome {
    f(p, ctx).unwrap_or_else(Outcome::error)
}

fn mismatch(p: &Payload) -> String {
    format!("unexpected payload {p:?}")
}

// ── Echo, Wait ────────────────────────────────────────────────────────────────

fn echo(e: &Echo, ctx: &mut EngineContext<'_>) -> Outcome {
    ctx.print(e.message.clone());
    if e.warn {
        Outcome::warning(e.message.clone())
    } else {
        Outcome::success(e.message.clone())
    }
}

fn wait(seconds: &str) -> Result<Outcome, String> {
    let secs = Number::parse(seconds)
        .map(Number::as_f64)
        .filter(|s| *s >= 0.0)
        .ok_or_else(|| format!("[{seconds}] is not a valid number of seconds"))?;
    std::thread::sleep(Duration::from_secs_f64(secs));
    Ok(Outcome::success(format!("slept {secs} second(s)")))
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn store(ctx: &mut EngineContext<'_>, key: &VarKey, value: impl Into<String>) -> Result<Outcome, String> {
    let value = value.into();
    ctx.set_key(key, value.clone()).map_err(|e| e.to_string())?;
    Ok(Outcome::success(format!("{key} set to [{value}]")))
}

fn get_num(s: &str) -> Result<Number, String> {
    Number::parse_with_hex(s).ok_or_else(|| format!("[{s}] is not a valid number"))
}

fn get_int(s: &str) -> Result<i64, String> {
    match Number::parse_with_hex(s) {
        Some(Number::Int(n)) => Ok(n),
        _ => Err(format!("[{s}] is not a valid integer")),
    }
}

fn get_uint(s: &str) -> Result<u64, String> {
    let t = s.trim();
    let parsed = match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => t.parse::<u64>().ok(),
    };
    parsed.ok_or_else(|| format!("[{s}] is not a valid unsigned integer"))
}

fn get_bool(s: &str) -> Result<bool, String> {
    parse_bool(s).ok_or_else(|| format!("[{s}] is not a valid boolean value"))
}

/// Non-negative count or index.
fn get_count(s: &str) -> Result<usize, String> {
    let n = get_int(s)?;
    usize::try_from(n).map_err(|_| format!("[{s}] must not be negative"))
}

// ── Math ──────────────────────────────────────────────────────────────────────

fn math(op: &MathOp, ctx: &mut EngineContext<'_>) -> Result<Outcome, String> {
    match op {
        MathOp::Binary { op, dest, lhs, rhs } => {
            let result = binary(*op, lhs, rhs)?;
            store(ctx, dest, result)
        }
        MathOp::IntDiv { quotient, remainder, lhs, rhs } => {
            let (a, b) = (get_int(lhs)?, get_int(rhs)?);
            let q = a.checked_div(b).ok_or_else(|| format!("cannot divide [{a}] by [{b}]"))?;
            let r = a.checked_rem(b).ok_or_else(|| format!("cannot divide [{a}] by [{b}]"))?;
            store(ctx, quotient, q.to_string())?;
            store(ctx, remainder, r.to_string())?;
            Ok(Outcome::success(format!("{a} / {b} = {q} remainder {r}")))
        }
        MathOp::Unary { op, dest, src } => {
            let result = unary(*op, src)?;
            store(ctx, dest, result)
        }
        MathOp::BitShift { dest, src, left, shift } => {
            let v = get_uint(src)?;
            let n = u32::try_from(get_count(shift)?).map_err(|_| format!("[{shift}] is too large"))?;
            let shifted = if *left { v.checked_shl(n) } else { v.checked_shr(n) };
            store(ctx, dest, shifted.unwrap_or(0).to_string())
        }
        MathOp::Rounding { op, dest, src, unit } => {
            let v = get_int(src)?;
            let unit = get_int(unit)?;
            if unit <= 0 {
                return Err(format!("[{unit}] must be a positive integer"));
            }
            let rounded = round_to(*op, v, unit).ok_or_else(|| format!("rounding [{v}] to [{unit}] overflows"))?;
            store(ctx, dest, rounded.to_string())
        }
    }
}

fn binary(op: MathBinary, lhs: &str, rhs: &str) -> Result<String, String> {
    use MathBinary as B;
    let overflow = || format!("arithmetic overflow in [{lhs}] and [{rhs}]");
    Ok(match op {
        B::Add | B::Sub | B::Mul | B::Div => {
            let (a, b) = (get_num(lhs)?, get_num(rhs)?);
            arith(op, a, b)?.to_string()
        }
        B::Pow => {
            let base = get_num(lhs)?;
            let exp = u32::try_from(get_count(rhs)?).map_err(|_| overflow())?;
            match base {
                Number::Int(n) => n.checked_pow(exp).ok_or_else(overflow)?.to_string(),
                Number::Float(x) => Number::Float(x.powi(exp as i32)).to_string(),
            }
        }
        B::BoolAnd => bool_str(get_bool(lhs)? && get_bool(rhs)?).to_owned(),
        B::BoolOr => bool_str(get_bool(lhs)? || get_bool(rhs)?).to_owned(),
        B::BoolXor => bool_str(get_bool(lhs)? ^ get_bool(rhs)?).to_owned(),
        B::BitAnd => (get_uint(lhs)? & get_uint(rhs)?).to_string(),
        B::BitOr => (get_uint(lhs)? | get_uint(rhs)?).to_string(),
        B::BitXor => (get_uint(lhs)? ^ get_uint(rhs)?).to_string(),
    })
}

/// Integer arithmetic while both sides are integers and the result is
/// exact; real arithmetic otherwise.
fn arith(op: MathBinary, a: Number, b: Number) -> Result<Number, String> {
    use MathBinary as B;
    if let (Number::Int(x), Number::Int(y)) = (a, b) {
        let exact = match op {
            B::Add => x.checked_add(y),
            B::Sub => x.checked_sub(y),
            B::Mul => x.checked_mul(y),
            B::Div if y == 0 => return Err("division by zero".into()),
            B::Div => (x.checked_rem(y) == Some(0)).then(|| x / y),
            _ => None,
        };
        if let Some(n) = exact {
            return Ok(Number::Int(n));
        }
    }
    let (x, y) = (a.as_f64(), b.as_f64());
    let r = match op {
        B::Add => x + y,
        B::Sub => x - y,
        B::Mul => x * y,
        B::Div if y == 0.0 => return Err("division by zero".into()),
        B::Div => x / y,
        _ => return Err(format!("{op:?} is not arithmetic")),
    };
    if r.is_finite() { Ok(Number::Float(r)) } else { Err("arithmetic overflow".into()) }
}

fn unary(op: MathUnary, src: &str) -> Result<String, String> {
    Ok(match op {
        MathUnary::Neg => match get_num(src)? {
            Number::Int(n) => n.checked_neg().ok_or_else(|| format!("cannot negate [{src}]"))?.to_string(),
            Number::Float(x) => Number::Float(-x).to_string(),
        },
        MathUnary::Abs => match get_num(src)? {
            Number::Int(n) => n.checked_abs().ok_or_else(|| format!("cannot take abs of [{src}]"))?.to_string(),
            Number::Float(x) => Number::Float(x.abs()).to_string(),
        },
        MathUnary::BoolNot => bool_str(!get_bool(src)?).to_owned(),
        MathUnary::BitNot => {
            let v = get_uint(src)?;
            match u32::try_from(v) {
                Ok(small) => (!small).to_string(),
                Err(_) => (!v).to_string(),
            }
        }
        MathUnary::Hex => hex(get_int(src)?),
        MathUnary::Dec => get_uint(src)?.to_string(),
    })
}

/// `0x`-prefixed upper-case hex, 8 digits wide when the value fits in 32
/// bits (negative values as two's complement) and 16 digits otherwise.
fn hex(n: i64) -> String {
    if let Ok(v) = u32::try_from(n) {
        format!("0x{v:08X}")
    } else if let Ok(v) = i32::try_from(n) {
        format!("0x{:08X}", v as u32)
    } else {
        format!("0x{:016X}", n as u64)
    }
}

/// `None` when the result does not fit in an `i64`.  `unit` must be positive.
fn round_to(op: MathRound, v: i64, unit: i64) -> Option<i64> {
    let rem = v.rem_euclid(unit);
    if rem == 0 {
        return Some(v);
    }
    let floor = v.checked_sub(rem);
    match op {
        MathRound::Floor => floor,
        MathRound::Ceil => floor?.checked_add(unit),
        MathRound::Round if rem >= unit - rem => floor?.checked_add(unit),
        MathRound::Round => floor,
    }
}

// ── StrFormat ─────────────────────────────────────────────────────────────────

fn str_format(op: &StrFormatOp, ctx: &mut EngineContext<'_>) -> Result<Outcome, String> {
    match op {
        StrFormatOp::Arith { dec, dest, amount } => {
            let amount = get_int(amount)?;
            let current = ctx.get_key(dest).unwrap_or_default();
            let next = step(&current, if *dec { amount.checked_neg() } else { Some(amount) })?;
            store(ctx, dest, next)
        }
        StrFormatOp::Cut { right, src, count, dest } => {
            let n = get_count(count)?;
            let len = src.chars().count();
            let out: String = if *right {
                src.chars().skip(len.saturating_sub(n)).collect()
            } else {
                src.chars().take(n).collect()
            };
            store(ctx, dest, out)
        }
        StrFormatOp::Mid { src, start, len, dest } => {
            let start = get_count(start)?;
            if start == 0 {
                return Err("Mid start index is 1-based".into());
            }
            let len = get_count(len)?;
            let out: String = src.chars().skip(start - 1).take(len).collect();
            store(ctx, dest, out)
        }
        StrFormatOp::Unary { op, src, dest } => {
            let out = match op {
                StrUnary::Len => src.chars().count().to_string(),
                StrUnary::UCase => src.to_uppercase(),
                StrUnary::LCase => src.to_lowercase(),
                StrUnary::NTrim => src.trim_end_matches(|c: char| c.is_ascii_digit()).to_owned(),
                StrUnary::FileName => file_name(src).to_owned(),
                StrUnary::DirPath => dir_path(src)?.to_owned(),
                StrUnary::Ext => extension(src).to_owned(),
            };
            store(ctx, dest, out)
        }
        StrFormatOp::Trim { op, src, arg, dest } => {
            let out: String = match op {
                StrTrim::Left => src.chars().skip(get_count(arg)?).collect(),
                StrTrim::Right => {
                    let keep = src.chars().count().saturating_sub(get_count(arg)?);
                    src.chars().take(keep).collect()
                }
                StrTrim::Chars if arg.is_empty() => return Err("CTrim needs at least one character".into()),
                StrTrim::Chars => src.trim_matches(|c: char| arg.contains(c)).to_owned(),
            };
            store(ctx, dest, out)
        }
        StrFormatOp::Pos { case_sensitive, src, sub, dest } => {
            let pos = char_pos(src, sub, *case_sensitive);
            store(ctx, dest, pos.to_string())
        }
        StrFormatOp::Replace { case_sensitive, src, old, new, dest } => {
            let out = replace(src, old, new, *case_sensitive)?;
            store(ctx, dest, out)
        }
        StrFormatOp::Split { src, delim, index, dest } => {
            let index = get_count(index)?;
            let parts: Vec<&str> = if delim.is_empty() {
                vec![src.as_str()]
            } else {
                src.split(|c: char| delim.contains(c)).collect()
            };
            match index {
                0 => store(ctx, dest, parts.len().to_string()),
                i => match parts.get(i - 1) {
                    Some(part) => store(ctx, dest, *part),
                    None => Ok(Outcome::info(format!("index [{i}] out of bounds [{}]", parts.len()))),
                },
            }
        }
    }
}

/// Add `amount` to an integer, or move a single ASCII letter along the
/// alphabet without leaving its case.
fn step(current: &str, amount: Option<i64>) -> Result<String, String> {
    let amount = amount.ok_or("increment overflow")?;
    if let Some(n) = Number::parse(current).filter(|n| n.is_int()) {
        return n.as_i64().checked_add(amount).map(|v| v.to_string()).ok_or_else(|| "increment overflow".into());
    }
    let mut chars = current.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphabetic() => {
            let base = if c.is_ascii_uppercase() { b'A' } else { b'a' };
            let idx = i64::from(c as u8 - base) + amount;
            u8::try_from(idx)
                .ok()
                .filter(|i| *i < 26)
                .map(|i| char::from(base + i).to_string())
                .ok_or_else(|| format!("[{current}] moved by {amount} is not a letter"))
        }
        _ => Err(format!("[{current}] is not a valid integer or letter")),
    }
}

/// 1-based char position of `sub` in `src`, or 0.
fn char_pos(src: &str, sub: &str, case_sensitive: bool) -> usize {
    if sub.is_empty() {
        return 0;
    }
    let found = if case_sensitive {
        src.find(sub)
    } else {
        regex::RegexBuilder::new(&regex::escape(sub))
            .case_insensitive(true)
            .build()
            .ok()
            .and_then(|re| re.find(src).map(|m| m.start()))
    };
    found.map_or(0, |byte| src[..byte].chars().count() + 1)
}

fn replace(src: &str, old: &str, new: &str, case_sensitive: bool) -> Result<String, String> {
    if old.is_empty() {
        return Ok(src.to_owned());
    }
    if case_sensitive {
        return Ok(src.replace(old, new));
    }
    let re = regex::RegexBuilder::new(&regex::escape(old))
        .case_insensitive(true)
        .build()
        .map_err(|e| e.to_string())?;
    Ok(re.replace_all(src, regex::NoExpand(new)).into_owned())
}

fn is_sep(c: char) -> bool {
    c == '\\' || c == '/'
}

fn file_name(path: &str) -> &str {
    path.rsplit(is_sep).next().unwrap_or(path)
}

/// Directory part including the trailing separator.
fn dir_path(path: &str) -> Result<&str, String> {
    if path.contains('\\') && path.contains('/') {
        return Err(format!("path [{path}] mixes separators"));
    }
    Ok(path.rfind(is_sep).map_or("", |i| &path[..=i]))
}

/// Extension including the dot, or empty.
fn extension(path: &str) -> &str {
    let name = file_name(path);
    match name.rfind('.') {
        Some(i) if i + 1 < name.len() => &name[i..],
        _ => "",
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
