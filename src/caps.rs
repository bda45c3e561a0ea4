//! Capabilities string parsing.
//!
//! A capabilities string is a nested parenthesised property list, e.g.
//! `(prot(monitor)type(lcd)model(P2411)cmds(01 02 03)vcp(02 10 14(05 08) 60(0F 11 12)))`.
//! The parser is tolerant: unknown properties are preserved verbatim,
//! malformed subtrees are recorded with their byte offset and skipped, and
//! duplicate top-level properties are merged.

use {
    crate::{
        error::{DdcResult, Error, Status},
        vcp::FeatureCode,
    },
    std::collections::BTreeMap,
};

/// A parsed group: a sequence of tokens, each optionally followed by its own
/// nested group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapTree {
    /// The group's items in source order.
    pub items: Vec<CapItem>,
}

/// One token of a group, with its nested group if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapItem {
    /// The token text.
    pub name: String,
    /// The parenthesised group following the token, if present.
    pub sub: Option<CapTree>,
}

impl CapTree {
    /// The first bare token, if any. Properties like `model` carry their
    /// value this way.
    pub fn first(&self) -> Option<&str> {
        self.items.first().map(|i| i.name.as_str())
    }

    fn merge(&mut self, other: CapTree) {
        self.items.extend(other.items);
    }
}

/// A malformed region of the capabilities string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapDefect {
    /// Byte offset of the offending region, zero when unknown.
    pub offset: usize,
    /// What was wrong.
    pub message: String,
}

/// Parsed capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Top-level properties keyed by name, duplicates merged.
    pub properties: BTreeMap<String, CapTree>,
    /// Supported VCP features; `None` means continuous (no enumeration).
    pub vcp: BTreeMap<FeatureCode, Option<Vec<u8>>>,
    /// The `model` property, if present.
    pub model: Option<String>,
    /// The `mccs_ver` property parsed into (major, minor).
    pub mccs_version: Option<(u8, u8)>,
    /// Regions that did not parse, preserved for diagnostics.
    pub defects: Vec<CapDefect>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Open,
    Close,
    Atom,
}

struct Lexer<'a> {
    text: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(text: &'a [u8]) -> Self {
        Lexer { text, pos: 0 }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.text.len() && self.text[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<Token> {
        self.skip_ws();
        match self.text.get(self.pos)? {
            b'(' => Some(Token::Open),
            b')' => Some(Token::Close),
            _ => Some(Token::Atom),
        }
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn atom(&mut self) -> (usize, String) {
        self.skip_ws();
        let start = self.pos;
        while self.pos < self.text.len() && !b"()".contains(&self.text[self.pos]) && !self.text[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
        (
            start,
            String::from_utf8_lossy(&self.text[start..self.pos]).into_owned(),
        )
    }
}

fn parse_group(lex: &mut Lexer, defects: &mut Vec<CapDefect>) -> CapTree {
    let mut tree = CapTree::default();
    loop {
        match lex.peek() {
            None => {
                defects.push(CapDefect {
                    offset: lex.pos,
                    message: "unterminated group".into(),
                });
                return tree;
            },
            Some(Token::Close) => {
                lex.bump();
                return tree;
            },
            Some(Token::Open) => {
                // a group with no preceding token; parse and record
                let offset = lex.pos;
                lex.bump();
                let orphan = parse_group(lex, defects);
                defects.push(CapDefect {
                    offset,
                    message: "group without a property token".into(),
                });
                let _ = orphan;
            },
            Some(Token::Atom) => {
                let (_, name) = lex.atom();
                let sub = match lex.peek() {
                    Some(Token::Open) => {
                        lex.bump();
                        Some(parse_group(lex, defects))
                    },
                    _ => None,
                };
                tree.items.push(CapItem { name, sub });
            },
        }
    }
}

fn parse_hex_byte(s: &str) -> Option<u8> {
    u8::from_str_radix(s, 16).ok()
}

fn extract_vcp(tree: &CapTree, defects: &mut Vec<CapDefect>) -> BTreeMap<FeatureCode, Option<Vec<u8>>> {
    let mut vcp = BTreeMap::new();
    for item in &tree.items {
        let Some(code) = parse_hex_byte(&item.name) else {
            defects.push(CapDefect {
                offset: 0,
                message: format!("vcp entry {:?} is not a hex feature code", item.name),
            });
            continue;
        };
        let values = item.sub.as_ref().map(|sub| {
            sub.items
                .iter()
                .filter_map(|v| {
                    let parsed = parse_hex_byte(&v.name);
                    if parsed.is_none() {
                        defects.push(CapDefect {
                            offset: 0,
                            message: format!("vcp x{:02X} value {:?} is not hex", code, v.name),
                        });
                    }
                    parsed
                })
                .collect::<Vec<u8>>()
        });
        vcp.insert(code, values);
    }
    vcp
}

/// Parse a raw capabilities string.
///
/// Fails only when the blob has no parseable outer group at all; anything
/// recoverable is preserved in [`Capabilities::defects`].
pub fn parse_capabilities(raw: &[u8]) -> DdcResult<Capabilities> {
    let mut lex = Lexer::new(raw);
    match lex.peek() {
        Some(Token::Open) => lex.bump(),
        _ => {
            return Err(Error::new(
                Status::InvalidResponse,
                "caps::parse",
                "capabilities string does not start with '('",
            ))
        },
    }

    let mut defects = Vec::new();
    let outer = parse_group(&mut lex, &mut defects);

    let mut properties: BTreeMap<String, CapTree> = BTreeMap::new();
    for item in outer.items {
        let sub = item.sub.unwrap_or_default();
        properties
            .entry(item.name)
            .and_modify(|existing| existing.merge(sub.clone()))
            .or_insert(sub);
    }

    let vcp = properties
        .get("vcp")
        .map(|tree| extract_vcp(tree, &mut defects))
        .unwrap_or_default();

    let model = properties
        .get("model")
        .and_then(|t| t.first())
        .map(str::to_owned);

    let mccs_version = properties.get("mccs_ver").and_then(|t| t.first()).and_then(|v| {
        let (major, minor) = v.split_once('.')?;
        Some((major.parse().ok()?, minor.parse().ok()?))
    });

    Ok(Capabilities {
        properties,
        vcp,
        model,
        mccs_version,
        defects,
    })
}
