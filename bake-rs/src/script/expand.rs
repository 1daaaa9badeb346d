//! Variable and parameter expansion.
//!
//! Each pass first substitutes section parameters, then `%Name%` references:
//!
//! | Form | Value |
//! |------|-------|
//! | `#1` … `#N` | in-parameter (empty when absent) |
//! | `#a` | in-parameter count |
//! | `#o1` … `#oN` | current value of an out-parameter |
//! | `#oa` | out-parameter count |
//! | `#r` | section return value |
//! | `#c` | innermost loop counter (left as-is outside a loop) |
//! | `##` | protects the following text (`##1` stays `##1`) |
//! | `%Name%` | variable (empty when undefined) |
//!
//! Passes repeat until no `%Name%` remains; a value that keeps producing
//! references is reported as [`ExpandError::Cycle`] after
//! [`MAX_EXPANSION_PASSES`], or as soon as the text grows past
//! [`MAX_EXPANDED_LEN`] bytes.  Escape sequences survive expansion untouched
//! and are decoded afterwards by [`preprocess`].

use std::sync::OnceLock;

use regex::Regex;

use super::lexer;

pub const MAX_EXPANSION_PASSES: usize = 32;
pub const MAX_EXPANDED_LEN: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExpandError {
    #[error("expansion of {input:?} did not settle after {MAX_EXPANSION_PASSES} passes or {MAX_EXPANDED_LEN} bytes")]
    Cycle { input: String },
}

/// Source of values during expansion.
pub trait Resolve {
    fn var(&self, name: &str) -> Option<String>;

    fn in_param(&self, _n: usize) -> Option<String> {
        None
    }

    fn in_count(&self) -> usize {
        0
    }

    fn out_param(&self, _n: usize) -> Option<String> {
        None
    }

    fn out_count(&self) -> usize {
        0
    }

    fn return_value(&self) -> String {
        String::new()
    }

    fn loop_counter(&self) -> Option<String> {
        None
    }
}

fn var_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"%([^ %]+)%").expect("static regex"))
}

/// `true` if `s` still contains a `%Name%` reference.
pub fn has_var_ref(s: &str) -> bool {
    s.contains('%') && var_regex().is_match(s)
}

/// Expand `s` to its fixed point.
pub fn expand<R: Resolve + ?Sized>(s: &str, r: &R) -> Result<String, ExpandError> {
    let cycle = || ExpandError::Cycle { input: s.to_owned() };
    let mut cur = s.to_owned();
    for _ in 0..MAX_EXPANSION_PASSES {
        cur = expand_params(&cur, r).ok_or_else(cycle)?;
        if !has_var_ref(&cur) {
            return Ok(cur);
        }
        cur = expand_vars(&cur, r).ok_or_else(cycle)?;
    }
    if has_var_ref(&cur) {
        Err(cycle())
    } else {
        expand_params(&cur, r).ok_or_else(cycle)
    }
}

/// One pass of `%Name%` substitution, `None` once the result is too long.
fn expand_vars<R: Resolve + ?Sized>(s: &str, r: &R) -> Option<String> {
    let mut out = String::with_capacity(s.len());
    let mut lit = 0;
    for caps in var_regex().captures_iter(s) {
        let whole = caps.get(0)?;
        out.push_str(&s[lit..whole.start()]);
        out.push_str(&r.var(&caps[1]).unwrap_or_default());
        lit = whole.end();
        if out.len() > MAX_EXPANDED_LEN {
            return None;
        }
    }
    out.push_str(&s[lit..]);
    (out.len() <= MAX_EXPANDED_LEN).then_some(out)
}

/// Expand, then decode escape sequences.
pub fn preprocess<R: Resolve + ?Sized>(s: &str, r: &R) -> Result<String, ExpandError> {
    Ok(lexer::unescape(&expand(s, r)?))
}

fn digits(b: &[u8]) -> usize {
    b.iter().take_while(|c| c.is_ascii_digit()).count()
}

fn index(b: &[u8]) -> Option<usize> {
    std::str::from_utf8(b).ok()?.parse().ok()
}

/// One pass of `#` parameter substitution, `None` once the result is too
/// long.
fn expand_params<R: Resolve + ?Sized>(s: &str, r: &R) -> Option<String> {
    if !s.contains('#') {
        return Some(s.to_owned());
    }
    let b = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut lit = 0;
    let mut i = 0;
    while i < b.len() {
        if b[i] != b'#' {
            i += 1;
            continue;
        }
        let (value, len) = match b.get(i + 1) {
            // `##` and `#$` are left for the escape decoder.
            Some(b'#' | b'$') => (None, 2),
            Some(b'a' | b'A') => (Some(r.in_count().to_string()), 2),
            Some(b'r' | b'R') => (Some(r.return_value()), 2),
            Some(b'c' | b'C') => (r.loop_counter(), 2),
            Some(b'o' | b'O') => match b.get(i + 2) {
                Some(b'a' | b'A') => (Some(r.out_count().to_string()), 3),
                Some(d) if d.is_ascii_digit() => {
                    let n = digits(&b[i + 2..]);
                    let value = index(&b[i + 2..i + 2 + n]).and_then(|k| r.out_param(k));
                    (Some(value.unwrap_or_default()), 2 + n)
                }
                _ => (None, 2),
            },
            Some(d) if d.is_ascii_digit() => {
                let n = digits(&b[i + 1..]);
                match index(&b[i + 1..i + 1 + n]) {
                    Some(0) => (None, 1 + n),
                    k => (Some(k.and_then(|k| r.in_param(k)).unwrap_or_default()), 1 + n),
                }
            }
            _ => (None, 1),
        };
        if let Some(v) = value {
            out.push_str(&s[lit..i]);
            out.push_str(&v);
            lit = i + len;
            if out.len() > MAX_EXPANDED_LEN {
                return None;
            }
        }
        i += len;
    }
    out.push_str(&s[lit..]);
    (out.len() <= MAX_EXPANDED_LEN).then_some(out)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Env {
        vars: HashMap<String, String>,
        params: Vec<String>,
        outs: Vec<String>,
        ret: String,
        counter: Option<String>,
    }

    impl Env {
        fn with(pairs: &[(&str, &str)]) -> Self {
            Env {
                vars: pairs.iter().map(|(k, v)| (k.to_lowercase(), v.to_string())).collect(),
                ..Default::default()
            }
        }
    }

    impl Resolve for Env {
        fn var(&self, name: &str) -> Option<String> {
            self.vars.get(&name.to_lowercase()).cloned()
        }
        fn in_param(&self, n: usize) -> Option<String> {
            self.params.get(n - 1).cloned()
        }
        fn in_count(&self) -> usize {
            self.params.len()
        }
        fn out_param(&self, n: usize) -> Option<String> {
            self.outs.get(n - 1).cloned()
        }
        fn out_count(&self) -> usize {
            self.outs.len()
        }
        fn return_value(&self) -> String {
            self.ret.clone()
        }
        fn loop_counter(&self) -> Option<String> {
            self.counter.clone()
        }
    }

    #[test]
    fn simple_variable() {
        let env = Env::with(&[("Dest", "X:\\")]);
        assert_eq!(expand("%Dest%Windows", &env).unwrap(), "X:\\Windows");
        assert_eq!(expand("%dest%", &env).unwrap(), "X:\\");
    }

    #[test]
    fn undefined_is_empty() {
        assert_eq!(expand("[%Nope%]", &Env::default()).unwrap(), "[]");
    }

    #[test]
    fn nested_references_resolve() {
        let env = Env::with(&[("A", "%B%\\a"), ("B", "%C%\\b"), ("C", "root")]);
        assert_eq!(expand("%A%", &env).unwrap(), "root\\b\\a");
    }

    #[test]
    fn self_reference_is_cycle() {
        let env = Env::with(&[("A", "x%A%")]);
        assert_eq!(expand("%A%", &env), Err(ExpandError::Cycle { input: "%A%".into() }));
        let env = Env::with(&[("A", "%B%"), ("B", "%A%")]);
        assert!(expand("%A%", &env).is_err());
    }

    #[test]
    fn doubling_self_reference_is_cycle() {
        let env = Env::with(&[("A", "%A%%A%")]);
        assert_eq!(expand("%A%", &env), Err(ExpandError::Cycle { input: "%A%".into() }));
        let env = Env::with(&[("A", "%B%%B%%B%"), ("B", "xy%A%")]);
        assert!(matches!(expand("-%A%-", &env), Err(ExpandError::Cycle { .. })));
    }

    #[test]
    fn long_values_within_limit_expand() {
        let big = "x".repeat(MAX_EXPANDED_LEN / 4);
        let env = Env::with(&[("A", big.as_str())]);
        assert_eq!(expand("%A%%A%", &env).unwrap().len(), MAX_EXPANDED_LEN / 2);
        assert!(expand("%A%%A%%A%%A%%A%", &env).is_err());
    }

    #[test]
    fn lone_percent_is_literal() {
        assert_eq!(expand("100% done", &Env::default()).unwrap(), "100% done");
        assert_eq!(expand("% spaced %", &Env::default()).unwrap(), "% spaced %");
    }

    #[test]
    fn section_params() {
        let env = Env { params: vec!["one".into(), "two".into()], ..Default::default() };
        assert_eq!(expand("#1-#2-#3", &env).unwrap(), "one-two-");
        assert_eq!(expand("#a", &env).unwrap(), "2");
        assert_eq!(expand("#12", &env).unwrap(), "");
    }

    #[test]
    fn double_hash_protects() {
        let env = Env { params: vec!["one".into()], ..Default::default() };
        assert_eq!(expand("##1", &env).unwrap(), "##1");
        assert_eq!(preprocess("##1", &env).unwrap(), "#1");
    }

    #[test]
    fn out_params_and_return() {
        let env = Env { outs: vec!["o1".into()], ret: "done".into(), ..Default::default() };
        assert_eq!(expand("#o1|#oa|#o2|#r|#R", &env).unwrap(), "o1|1||done|done");
        assert_eq!(expand("#ox", &env).unwrap(), "#ox");
    }

    #[test]
    fn loop_counter_only_inside_loop() {
        let mut env = Env::default();
        assert_eq!(expand("n=#c", &env).unwrap(), "n=#c");
        env.counter = Some("3".into());
        assert_eq!(expand("n=#c", &env).unwrap(), "n=3");
    }

    #[test]
    fn param_value_with_reference_expands() {
        let env = Env { params: vec!["%A%".into()], ..Env::with(&[("A", "deep")]) };
        assert_eq!(expand("#1", &env).unwrap(), "deep");
    }

    #[test]
    fn escape_percent_is_not_a_reference() {
        let env = Env::with(&[("A", "bad")]);
        assert_eq!(preprocess("#$pA#$p", &env).unwrap(), "%A%");
    }

    #[test]
    fn escapes_survive_expand() {
        assert_eq!(expand("a#$cb", &Env::default()).unwrap(), "a#$cb");
        assert_eq!(preprocess("a#$cb", &Env::default()).unwrap(), "a,b");
    }

    #[test]
    fn hash_zero_is_literal() {
        assert_eq!(expand("#0", &Env::default()).unwrap(), "#0");
    }

    #[test]
    fn multibyte_text_is_preserved() {
        let env = Env { params: vec!["é".into()], ..Default::default() };
        assert_eq!(expand("ü#1ß", &env).unwrap(), "üéß");
    }
}
