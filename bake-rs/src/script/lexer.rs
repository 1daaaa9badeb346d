//! Command-line splitter and escape table.
//!
//! A command line is a comma-separated list of arguments:
//!
//! ```text
//! TXTAddLine,%Dest%,"Hello, World",Append
//! ```
//!
//! | Rule | Behaviour |
//! |------|-----------|
//! | separator | top-level `,`; surrounding whitespace is trimmed |
//! | quoting | a token *starting* with `"` runs to the closing `"`; `""` inside is kept verbatim |
//! | after a quote | only whitespace may appear before the next `,` |
//! | trailing `,` | yields a trailing empty token |
//! | unterminated `"` | the rest of the line is the token (not an error) |
//!
//! Escape sequences are **not** decoded by [`split`].  They are decoded by
//! [`unescape`] per token, after variable expansion, so `#$p` can produce a
//! literal `%` that is never mistaken for a variable reference.

use std::sync::OnceLock;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};

/// Newline produced by `#$x`.
pub const NEWLINE_SEQ: &str = "\r\n";

// ── Token ─────────────────────────────────────────────────────────────────────

/// One argument of a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Argument text with outer quotes removed.
    pub text: String,
    /// `true` if the argument was written in double quotes.
    pub quoted: bool,
}

impl Token {
    pub fn plain(text: impl Into<String>) -> Self {
        Token { text: text.into(), quoted: false }
    }

    /// Render the token back to source form, quoting when required.
    pub fn to_source(&self) -> String {
        if self.quoted || needs_quotes(&self.text) {
            format!("\"{}\"", self.text)
        } else {
            self.text.clone()
        }
    }
}

/// Errors from [`split`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LexError {
    #[error("unexpected text {found:?} after closing quote")]
    TrailingText { found: String },
}

// ── Splitting ─────────────────────────────────────────────────────────────────

/// Split a command line into tokens.
pub fn split(line: &str) -> Result<Vec<Token>, LexError> {
    let mut tokens = Vec::new();
    let mut rest = Some(line);
    while let Some(r) = rest {
        let (token, next) = next_token(r)?;
        tokens.push(token);
        rest = next;
    }
    Ok(tokens)
}

/// Split off the first argument, returning it and the unconsumed remainder
/// (`None` when the line is exhausted).
fn next_token(s: &str) -> Result<(Token, Option<&str>), LexError> {
    let s = s.trim();

    let Some(body) = s.strip_prefix('"') else {
        return Ok(match s.find(',') {
            Some(idx) => (Token::plain(s[..idx].trim()), Some(&s[idx + 1..])),
            None => (Token::plain(s), None),
        });
    };

    // Locate the closing quote, stepping over `""` pairs.
    let mut from = 0;
    let close = loop {
        match body[from..].find('"') {
            Some(off) => {
                let q = from + off;
                if body[q + 1..].starts_with('"') {
                    from = q + 2;
                } else {
                    break q;
                }
            }
            None => {
                tracing::debug!(line = s, "unterminated quote consumes rest of line");
                return Ok((Token { text: body.to_owned(), quoted: true }, None));
            }
        }
    };

    let text = body[..close].to_owned();
    let after = &body[close + 1..];
    let (between, next) = match after.find(',') {
        Some(idx) => (&after[..idx], Some(&after[idx + 1..])),
        None => (after, None),
    };
    if !between.trim().is_empty() {
        return Err(LexError::TrailingText { found: between.trim().to_owned() });
    }
    Ok((Token { text, quoted: true }, next))
}

fn needs_quotes(text: &str) -> bool {
    text.contains(',') || text.trim() != text
}

/// Join plain argument strings into a command line, quoting those that
/// contain a comma or surrounding whitespace.
pub fn join<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|a| {
            let a = a.as_ref();
            if needs_quotes(a) { format!("\"{a}\"") } else { a.to_owned() }
        })
        .collect::<Vec<_>>()
        .join(",")
}

// ── Escapes ───────────────────────────────────────────────────────────────────

const ESCAPES: [&str; 7] = ["##", "#$c", "#$p", "#$q", "#$s", "#$t", "#$x"];
const UNESCAPED: [&str; 7] = ["#", ",", "%", "\"", " ", "\t", NEWLINE_SEQ];

fn escape_matcher() -> &'static AhoCorasick {
    static MATCHER: OnceLock<AhoCorasick> = OnceLock::new();
    MATCHER.get_or_init(|| {
        AhoCorasickBuilder::new()
            .ascii_case_insensitive(true)
            .match_kind(MatchKind::LeftmostFirst)
            .build(ESCAPES)
    })
}

/// Decode the `#$x`-style escape table.  Unknown `#$?` sequences are left
/// untouched.
pub fn unescape(s: &str) -> String {
    if !s.contains('#') {
        return s.to_owned();
    }
    escape_matcher().replace_all(s, &UNESCAPED)
}

/// Inverse of [`unescape`] for the characters that would otherwise be
/// significant to the splitter or the expander.
pub fn escape(s: &str, escape_percent: bool) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '#' => out.push_str("##"),
            ',' => out.push_str("#$c"),
            '"' => out.push_str("#$q"),
            '\t' => out.push_str("#$t"),
            '%' if escape_percent => out.push_str("#$p"),
            '\r' if chars.peek() == Some(&'\n') => {
                chars.next();
                out.push_str("#$x");
            }
            c => out.push(c),
        }
    }
    out
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(line: &str) -> Vec<String> {
        split(line).unwrap().into_iter().map(|t| t.text).collect()
    }

    #[test]
    fn plain_split() {
        assert_eq!(texts("Echo,Hello"), vec!["Echo", "Hello"]);
    }

    #[test]
    fn whitespace_is_trimmed() {
        assert_eq!(texts("  Set , %A% ,  1  "), vec!["Set", "%A%", "1"]);
    }

    #[test]
    fn quoted_comma_is_literal() {
        let toks = split(r#"TXTAddLine,%Dest%,"Hello, World",Append"#).unwrap();
        assert_eq!(toks[2], Token { text: "Hello, World".into(), quoted: true });
        assert_eq!(toks[3].text, "Append");
    }

    #[test]
    fn quoted_keeps_inner_whitespace() {
        assert_eq!(texts(r#"Echo,"  padded  ""#), vec!["Echo", "  padded  "]);
    }

    #[test]
    fn doubled_quote_kept_verbatim() {
        assert_eq!(texts(r#"Echo,"Hello""World",x"#), vec!["Echo", r#"Hello""World"#, "x"]);
    }

    #[test]
    fn trailing_comma_yields_empty_token() {
        assert_eq!(texts("Echo,A,"), vec!["Echo", "A", ""]);
    }

    #[test]
    fn empty_middle_token() {
        assert_eq!(texts("A,,B"), vec!["A", "", "B"]);
    }

    #[test]
    fn unterminated_quote_consumes_rest() {
        let toks = split(r#"Echo,"abc,def"#).unwrap();
        assert_eq!(toks.len(), 2);
        assert_eq!(toks[1], Token { text: "abc,def".into(), quoted: true });
    }

    #[test]
    fn text_after_closing_quote_is_error() {
        let err = split(r#"Echo,"abc"def,x"#).unwrap_err();
        assert_eq!(err, LexError::TrailingText { found: "def".into() });
    }

    #[test]
    fn whitespace_after_closing_quote_allowed() {
        assert_eq!(texts(r#"Echo,"abc"   ,x"#), vec!["Echo", "abc", "x"]);
    }

    #[test]
    fn quote_inside_plain_token_is_literal() {
        assert_eq!(texts(r#"Echo,a"b,c"#), vec!["Echo", r#"a"b"#, "c"]);
    }

    #[test]
    fn escapes_are_not_decoded_by_split() {
        assert_eq!(texts("Echo,A#$cB"), vec!["Echo", "A#$cB"]);
    }

    #[test]
    fn unescape_table() {
        assert_eq!(unescape("A#$cB"), "A,B");
        assert_eq!(unescape("#$p%Var%#$P"), "%%Var%%");
        assert_eq!(unescape("say #$qhi#$q"), "say \"hi\"");
        assert_eq!(unescape("a#$sb#$tc"), "a b\tc");
        assert_eq!(unescape("1#$x2"), "1\r\n2");
        assert_eq!(unescape("##1"), "#1");
    }

    #[test]
    fn unescape_is_case_insensitive() {
        assert_eq!(unescape("#$C#$Q#$S"), ",\" ");
    }

    #[test]
    fn unknown_escape_left_alone() {
        assert_eq!(unescape("#$z#"), "#$z#");
    }

    #[test]
    fn double_hash_protects_escape() {
        assert_eq!(unescape("##$c"), "#$c");
    }

    #[test]
    fn escape_then_unescape() {
        let s = "a,b \"c\"\t#$c 100%\r\n";
        assert_eq!(unescape(&escape(s, true)), s);
        assert_eq!(escape("50%", false), "50%");
    }

    #[test]
    fn join_quotes_when_needed() {
        assert_eq!(join(&["Echo", "a,b", " x", "y"]), r#"Echo,"a,b"," x",y"#);
    }

    #[test]
    fn to_source_respects_quoted_flag() {
        assert_eq!(Token { text: "abc".into(), quoted: true }.to_source(), "\"abc\"");
        assert_eq!(Token::plain("abc").to_source(), "abc");
    }
}
