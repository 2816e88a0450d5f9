//! IMAP reply tokenizer
//!
//! Turns the text lines of a server reply into a nested structure of
//! atoms and lists: bare atoms, quoted strings (quotes stripped), and
//! parenthesized groups at arbitrary depth. Groups may span reply lines.

use crate::transport::Reply;

/// One parsed element of a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Atom(String),
    List(Vec<Token>),
}

impl Token {
    #[must_use]
    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Self::Atom(s) => Some(s),
            Self::List(_) => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[Token]> {
        match self {
            Self::Atom(_) => None,
            Self::List(items) => Some(items),
        }
    }
}

/// Parse a reply into `(ok, tokens)`.
///
/// `ok` is true exactly when the status word uppercases to `OK`. Quoted
/// strings are delimited by `"` and cannot contain one; quoted-string
/// escaping is not modeled, so a `\"` sequence inside a string splits it.
/// A stray `)` with no open group is dropped, and groups still open at
/// input exhaustion contribute their partial content at their depth.
#[must_use]
pub fn parse_imap(reply: &Reply) -> (bool, Vec<Token>) {
    let mut stack: Vec<Vec<Token>> = vec![Vec::new()];
    for line in &reply.lines {
        scan_line(line, &mut stack);
    }
    while stack.len() > 1 {
        if let Some(group) = stack.pop()
            && let Some(parent) = stack.last_mut()
        {
            parent.push(Token::List(group));
        }
    }
    (reply.is_ok(), stack.pop().unwrap_or_default())
}

fn scan_line(line: &str, stack: &mut Vec<Vec<Token>>) {
    let mut rest = line;
    while let Some(c) = rest.chars().next() {
        match c {
            '"' => {
                let Some(end) = rest[1..].find('"') else {
                    // Unterminated quote: nothing more tokenizes on this line.
                    return;
                };
                if let Some(top) = stack.last_mut() {
                    top.push(Token::Atom(rest[1..=end].to_string()));
                }
                rest = &rest[end + 2..];
            }
            '(' => {
                stack.push(Vec::new());
                rest = &rest[1..];
            }
            ')' => {
                if stack.len() > 1
                    && let Some(group) = stack.pop()
                    && let Some(parent) = stack.last_mut()
                {
                    parent.push(Token::List(group));
                }
                rest = &rest[1..];
            }
            c if c.is_whitespace() => {
                rest = &rest[c.len_utf8()..];
            }
            _ => {
                let end = rest
                    .find(|c: char| c.is_whitespace() || matches!(c, '(' | ')' | '"'))
                    .unwrap_or(rest.len());
                if let Some(top) = stack.last_mut() {
                    top.push(Token::Atom(rest[..end].to_string()));
                }
                rest = &rest[end..];
            }
        }
    }
}
