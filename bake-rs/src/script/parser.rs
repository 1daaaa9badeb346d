//! Section parser.
//!
//! Turns the raw lines of a section into a tree of [`CommandNode`]s:
//!
//! 1. physical lines ending in `,\` are joined with the next line;
//! 2. each logical line is split and built through the schema registry;
//! 3. `If`/`Else` nodes whose embedded command is `Begin` absorb the lines
//!    up to the matching `End`;
//! 4. optionally, adjacent fusable commands on the same file are grouped
//!    into a [`Payload::Batch`].
//!
//! A line that fails any step becomes an error node carrying its
//! [`ParseError`]; parsing always continues so every bad line is reported.

use super::command::{CommandNode, Keyword, MacroCall, Payload, Position, ScriptId};
use super::lexer::{self, LexError, Token};
use super::schema::{self, ArityError, Args, SchemaError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Arity(#[from] ArityError),
    #[error("{keyword}: {message}")]
    Invalid { keyword: Keyword, message: String },
    #[error("invalid command keyword {0:?}")]
    BadKeyword(String),
    #[error("{0}")]
    Syntax(String),
}

/// One rejected line.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionError {
    pub pos: Position,
    pub raw: String,
    pub error: ParseError,
}

/// Result of [`parse_section`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedSection {
    pub nodes: Vec<CommandNode>,
    pub errors: Vec<SectionError>,
}

impl ParsedSection {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

// ── Lines ─────────────────────────────────────────────────────────────────────

/// Empty lines and `//`, `#`, `;` comments carry no command.
pub fn is_blank(line: &str) -> bool {
    let t = line.trim();
    t.is_empty() || t.starts_with("//") || t.starts_with('#') || t.starts_with(';')
}

/// Parse a single line.  Returns `None` for blank and comment lines.
pub fn parse_line(line: &str, pos: Position) -> Option<CommandNode> {
    if is_blank(line) {
        return None;
    }
    let raw = line.trim();
    Some(match lexer::split(raw) {
        Ok(tokens) => build_node(&tokens, raw.to_owned(), pos),
        Err(e) => CommandNode::invalid(raw, pos, e.into()),
    })
}

/// Build a command from already-split tokens (used for embedded commands).
pub fn parse_tokens(tokens: &[Token], pos: Position) -> CommandNode {
    let raw = tokens.iter().map(Token::to_source).collect::<Vec<_>>().join(",");
    build_node(tokens, raw, pos)
}

fn build_node(tokens: &[Token], raw: String, pos: Position) -> CommandNode {
    let Some(first) = tokens.first() else {
        return CommandNode::invalid(raw, pos, ParseError::Syntax("empty command".into()));
    };
    let word = first.text.as_str();
    if first.quoted || !schema::is_macro_name(word) {
        return CommandNode::invalid(raw, pos, ParseError::BadKeyword(word.to_owned()));
    }
    let args = Args { tokens: &tokens[1..], pos };

    let Some(keyword) = Keyword::from_name(word) else {
        let payload = Payload::Macro(MacroCall { name: word.to_owned(), args: args.strings_from(0) });
        return CommandNode { keyword: Keyword::Macro, payload, raw, pos };
    };
    let Some(schema) = schema::lookup(keyword) else {
        return CommandNode::invalid(raw, pos, ParseError::BadKeyword(word.to_owned()));
    };
    match schema.build(&args) {
        Ok(payload) => CommandNode { keyword, payload, raw, pos },
        Err(SchemaError::Arity(e)) => CommandNode::invalid(raw, pos, e.into()),
        Err(SchemaError::Invalid(message)) => {
            CommandNode::invalid(raw, pos, ParseError::Invalid { keyword, message })
        }
    }
}

// ── Sections ──────────────────────────────────────────────────────────────────

/// Parse the lines of one section.  `first_line` is the 1-based line number
/// of `lines[0]` in its script.
pub fn parse_section<S: AsRef<str>>(
    lines: &[S],
    script: ScriptId,
    first_line: usize,
    optimize: bool,
) -> ParsedSection {
    let mut flat = Vec::new();
    for (line_no, text) in join_continuations(lines, first_line) {
        let pos = Position { script, line: line_no };
        match text {
            Ok(text) => flat.extend(parse_line(&text, pos)),
            Err((raw, e)) => flat.push(CommandNode::invalid(raw, pos, e)),
        }
    }

    let mut iter = flat.into_iter();
    let (mut nodes, _) = fold_blocks(&mut iter, false);
    if optimize {
        nodes = fuse(nodes);
    }

    let mut invalid = Vec::new();
    for node in &nodes {
        node.collect_invalid(&mut invalid);
    }
    let errors = invalid
        .into_iter()
        .filter_map(|n| match &n.payload {
            Payload::Invalid(e) => Some(SectionError { pos: n.pos, raw: n.raw.clone(), error: e.clone() }),
            _ => None,
        })
        .collect();
    ParsedSection { nodes, errors }
}

type Logical = (usize, Result<String, (String, ParseError)>);

fn is_continued(text: &str) -> bool {
    text.ends_with(",\\")
        && lexer::split(text)
            .ok()
            .and_then(|t| t.last().cloned())
            .is_some_and(|t| !t.quoted && t.text == "\\")
}

/// Join `,\` continuation lines.  Each logical line keeps the number of its
/// first physical line.
fn join_continuations<S: AsRef<str>>(lines: &[S], first_line: usize) -> Vec<Logical> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let line_no = first_line + i;
        let mut text = lines[i].as_ref().trim().to_owned();
        let mut failure = None;
        while !is_blank(&text) && is_continued(&text) {
            text.pop();
            i += 1;
            match lines.get(i).map(|l| l.as_ref().trim()) {
                None => {
                    failure = Some("line continuation at end of section");
                    break;
                }
                Some(next) if is_blank(next) => {
                    failure = Some("line continuation into an empty or comment line");
                    break;
                }
                Some(next) => text.push_str(next),
            }
        }
        out.push(match failure {
            None => (line_no, Ok(text)),
            Some(msg) => (line_no, Err((text, ParseError::Syntax(msg.into())))),
        });
        i += 1;
    }
    out
}

/// The block slot a `Begin` will fill: the innermost `If`/`Else` whose
/// embedded command is `Begin`.
fn block_slot(node: &mut CommandNode) -> Option<&mut Vec<CommandNode>> {
    let block = match &mut node.payload {
        Payload::If(b) => &mut b.block,
        Payload::Else(b) => &mut b.block,
        _ => return None,
    };
    if block.len() != 1 {
        return None;
    }
    if block[0].keyword == Keyword::Begin {
        return Some(block);
    }
    block_slot(&mut block[0])
}

fn opens_block(node: &mut CommandNode) -> bool {
    block_slot(node).is_some()
}

/// Fold `Begin`…`End` blocks.  Returns the nodes and whether a closing
/// `End` was consumed.
fn fold_blocks(iter: &mut impl Iterator<Item = CommandNode>, nested: bool) -> (Vec<CommandNode>, bool) {
    let mut out: Vec<CommandNode> = Vec::new();
    while let Some(mut node) = iter.next() {
        match node.keyword {
            Keyword::End if nested => return (out, true),
            Keyword::End => {
                out.push(CommandNode::invalid(node.raw, node.pos, ParseError::Syntax("End without Begin".into())));
                continue;
            }
            Keyword::Begin => {
                out.push(CommandNode::invalid(
                    node.raw,
                    node.pos,
                    ParseError::Syntax("Begin must be the command of an If or Else".into()),
                ));
                continue;
            }
            Keyword::Else => {
                let follows = out.last().is_some_and(|p| matches!(p.keyword, Keyword::If | Keyword::Else));
                if !follows {
                    out.push(CommandNode::invalid(
                        node.raw,
                        node.pos,
                        ParseError::Syntax("Else must follow If or Else".into()),
                    ));
                    continue;
                }
            }
            _ => {}
        }

        if opens_block(&mut node) {
            let (inner, closed) = fold_blocks(iter, true);
            if !closed {
                out.push(CommandNode::invalid(node.raw, node.pos, ParseError::Syntax("Begin without End".into())));
                out.extend(inner);
                continue;
            }
            if let Some(slot) = block_slot(&mut node) {
                *slot = inner;
            }
        }
        out.push(node);
    }
    (out, false)
}

// ── Fusion ────────────────────────────────────────────────────────────────────

fn batch_target(node: &CommandNode) -> Option<&str> {
    match &node.payload {
        Payload::Batch(members) => members.first().and_then(|m| m.payload.target_file()),
        p => p.target_file(),
    }
}

fn can_fuse(prev: &CommandNode, next: &CommandNode) -> bool {
    next.keyword.is_fusable()
        && prev.keyword == next.keyword
        && matches!((batch_target(prev), next.payload.target_file()),
            (Some(a), Some(b)) if a.eq_ignore_ascii_case(b))
}

/// Group adjacent same-keyword commands on one file into `Batch` nodes.
pub fn fuse(nodes: Vec<CommandNode>) -> Vec<CommandNode> {
    let mut out: Vec<CommandNode> = Vec::with_capacity(nodes.len());
    for mut node in nodes {
        match &mut node.payload {
            Payload::If(b) => b.block = fuse(std::mem::take(&mut b.block)),
            Payload::Else(b) => b.block = fuse(std::mem::take(&mut b.block)),
            _ => {}
        }
        if let Some(prev) = out.last_mut().filter(|p| can_fuse(p, &node)) {
            prev.raw.push('\n');
            prev.raw.push_str(&node.raw);
            if let Payload::Batch(members) = &mut prev.payload {
                members.push(node);
            } else {
                let first = CommandNode {
                    keyword: prev.keyword,
                    payload: std::mem::replace(&mut prev.payload, Payload::Batch(Vec::new())),
                    raw: prev.raw.lines().next().unwrap_or_default().to_owned(),
                    pos: prev.pos,
                };
                prev.payload = Payload::Batch(vec![first, node]);
            }
            continue;
        }
        out.push(node);
    }
    out
}

// ── Tests ─────────────────────────────────────────────────────────────────────
