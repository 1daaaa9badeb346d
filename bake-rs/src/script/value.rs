//! On-demand coercion of string values.
//!
//! Every script value is a string.  Commands that need a number, a boolean
//! or a version parse the expanded string with the helpers here; nothing is
//! coerced at variable-expansion time.
//!
//! | Form | Example | Accepted by |
//! |------|---------|-------------|
//! | decimal integer | `-12` | everything |
//! | decimal real | `3.25` | everything |
//! | hex integer | `0x1F` | [`Number::parse_with_hex`] only (arithmetic commands) |
//! | version | `10.0.19041` | [`Version::parse`] |

use std::cmp::Ordering;
use std::fmt;

// ── Number ────────────────────────────────────────────────────────────────────

/// A numeric value parsed from a script string.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Number::Int(n) => write!(f, "{n}"),
            // Integral reals print without a fractional part.
            Number::Float(x) if x.fract() == 0.0 && x.abs() < 1e15 => write!(f, "{}", *x as i64),
            Number::Float(x) => write!(f, "{x}"),
        }
    }
}

impl Number {
    /// Parse a decimal integer or real.  Hex is rejected.
    pub fn parse(s: &str) -> Option<Number> {
        let t = s.trim();
        if t.is_empty() || !t.bytes().all(|b| b.is_ascii_digit() || b == b'.' || b == b'-' || b == b'+') {
            return None;
        }
        if let Ok(n) = t.parse::<i64>() {
            return Some(Number::Int(n));
        }
        t.parse::<f64>().ok().filter(|x| x.is_finite()).map(Number::Float)
    }

    /// Parse like [`Number::parse`], additionally accepting `0x`-prefixed hex.
    pub fn parse_with_hex(s: &str) -> Option<Number> {
        let t = s.trim();
        let hex = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X"));
        match hex {
            Some(digits) if !digits.is_empty() => {
                u64::from_str_radix(digits, 16).ok().map(|n| Number::Int(n as i64))
            }
            Some(_) => None,
            None => Number::parse(t),
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(n) => n as f64,
            Number::Float(x) => x,
        }
    }

    /// Integer view; reals are truncated toward zero.
    pub fn as_i64(self) -> i64 {
        match self {
            Number::Int(n) => n,
            Number::Float(x) => x as i64,
        }
    }

    pub fn is_int(self) -> bool {
        matches!(self, Number::Int(_))
    }

    pub fn cmp_value(self, other: Number) -> Ordering {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a.cmp(&b),
            (a, b) => a.as_f64().partial_cmp(&b.as_f64()).unwrap_or(Ordering::Equal),
        }
    }
}

/// Parse `True`/`False` (case-insensitive) or a number (non-zero is true).
pub fn parse_bool(s: &str) -> Option<bool> {
    let t = s.trim();
    if t.eq_ignore_ascii_case("true") {
        Some(true)
    } else if t.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        Number::parse_with_hex(t).map(|n| n.as_f64() != 0.0)
    }
}

/// Canonical string form of a boolean.
pub fn bool_str(b: bool) -> &'static str {
    if b { "True" } else { "False" }
}

// ── Version ───────────────────────────────────────────────────────────────────

/// A dotted version of one to four non-negative components.
///
/// A missing minor is `0`; a missing build or revision is `-1`, so
/// `11.1` sorts before `11.1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: i64,
    pub minor: i64,
    pub build: i64,
    pub revision: i64,
}

impl Version {
    pub fn parse(s: &str) -> Option<Version> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.is_empty() || parts.len() > 4 {
            return None;
        }
        let mut nums = [0i64, 0, -1, -1];
        for (slot, part) in nums.iter_mut().zip(&parts) {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            *slot = part.parse().ok()?;
        }
        let [major, minor, build, revision] = nums;
        Some(Version { major, minor, build, revision })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_decimal() {
        assert_eq!(Number::parse("42"), Some(Number::Int(42)));
        assert_eq!(Number::parse(" -7 "), Some(Number::Int(-7)));
        assert_eq!(Number::parse("2.5"), Some(Number::Float(2.5)));
        assert_eq!(Number::parse("abc"), None);
        assert_eq!(Number::parse(""), None);
    }

    #[test]
    fn plain_parse_rejects_hex_and_exponent() {
        assert_eq!(Number::parse("0xF"), None);
        assert_eq!(Number::parse("1e3"), None);
        assert_eq!(Number::parse("inf"), None);
    }

    #[test]
    fn hex_only_when_requested() {
        assert_eq!(Number::parse_with_hex("0xF"), Some(Number::Int(15)));
        assert_eq!(Number::parse_with_hex("0X10"), Some(Number::Int(16)));
        assert_eq!(Number::parse_with_hex("0x"), None);
        assert_eq!(Number::parse_with_hex("12"), Some(Number::Int(12)));
    }

    #[test]
    fn display_forms() {
        assert_eq!(Number::Int(3).to_string(), "3");
        assert_eq!(Number::Float(4.0).to_string(), "4");
        assert_eq!(Number::Float(0.5).to_string(), "0.5");
    }

    #[test]
    fn mixed_comparison() {
        assert_eq!(Number::Int(2).cmp_value(Number::Float(2.5)), Ordering::Less);
        assert_eq!(Number::Int(-1).cmp_value(Number::Int(0)), Ordering::Less);
    }

    #[test]
    fn bools() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("false"), Some(false));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("2"), Some(true));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn version_padding() {
        let a = Version::parse("11.1").unwrap();
        let b = Version::parse("11.1.0").unwrap();
        assert!(a < b);
        assert_eq!(Version::parse("5"), Version::parse("5.0"));
        assert!(Version::parse("5").unwrap() < Version::parse("5.1.2600").unwrap());
    }

    #[test]
    fn version_rejects_garbage() {
        assert_eq!(Version::parse("1.2.3.4.5"), None);
        assert_eq!(Version::parse("1..2"), None);
        assert_eq!(Version::parse("-1"), None);
        assert_eq!(Version::parse("0xC"), None);
        assert_eq!(Version::parse("A"), None);
    }
}
