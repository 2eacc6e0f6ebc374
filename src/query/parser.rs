use crate::core::error::{Error, ErrorKind, Result};
use crate::query::ast::{Comparison, Operator, Query};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    And,
    Or,
    Not,
    LPar,
    RPar,
    Colon,
    Eq,
    Lt,
    Gt,
    Le,
    Ge,
    Atom,
    Quoted,
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    value: String,
    pos: usize,
}

/// Query text -> Query IR
///
/// Operators are applied strictly left-to-right as encountered; juxtaposed
/// clauses are an implicit AND. A chained comparison `A < name < B`
/// desugars into `name > A & name < B`.
pub struct QueryParser {
    chars: Vec<char>,
    pos: usize,
    token: Option<Token>,
}

impl QueryParser {
    pub fn new() -> Self {
        QueryParser {
            chars: Vec::new(),
            pos: 0,
            token: None,
        }
    }

    pub fn parse(&mut self, input: &str) -> Result<Query> {
        self.chars = input.chars().collect();
        self.pos = 0;
        self.token = None;
        self.query()
    }

    fn query(&mut self) -> Result<Query> {
        let mut result = Query::Null;
        loop {
            let kind = self.lookahead()?.kind;
            if kind == TokenKind::Eof || kind == TokenKind::RPar {
                return Ok(result);
            }
            let clause = self.composite_query()?;
            result = result.merge(clause, Operator::And);
        }
    }

    fn composite_query(&mut self) -> Result<Query> {
        let mut result = self.primary_query()?;
        loop {
            let op = match self.lookahead()?.kind {
                TokenKind::And => Operator::And,
                TokenKind::Or => Operator::Or,
                TokenKind::Not => Operator::Diff,
                _ => return Ok(result),
            };
            self.shift_token();
            let operand = self.primary_query()?;
            result = result.merge(operand, op);
        }
    }

    fn primary_query(&mut self) -> Result<Query> {
        let token = self.lookahead()?.clone();
        match token.kind {
            TokenKind::Atom | TokenKind::Quoted => self.term_or_property_query(),
            TokenKind::LPar => self.grouped_query(),
            _ => Err(self.parse_error(format!("unexpected token {:?}", token.kind), token.pos)),
        }
    }

    fn term_or_property_query(&mut self) -> Result<Query> {
        let term = self.string()?;
        match self.lookahead()?.kind {
            TokenKind::Colon => {
                self.shift_token();
                match term.as_str() {
                    "flag" => Ok(Query::Flag(self.string()?)),
                    "noflag" => Ok(Query::NoFlag(self.string()?)),
                    _ => Ok(Query::property(
                        term,
                        self.string()?,
                        Comparison::ApproxIncludes,
                    )),
                }
            }
            TokenKind::Eq => {
                self.shift_token();
                Ok(Query::property(term, self.string()?, Comparison::Equal))
            }
            TokenKind::Lt | TokenKind::Gt | TokenKind::Le | TokenKind::Ge => {
                self.property_cmp_query(term)
            }
            _ => Ok(Query::Term(term)),
        }
    }

    fn property_cmp_query(&mut self, name: String) -> Result<Query> {
        let token = self.shift_token().expect("comparison token");
        let cmp = match token.kind {
            TokenKind::Lt => Comparison::LessThan,
            TokenKind::Gt => Comparison::GreaterThan,
            TokenKind::Le => Comparison::LessOrEqual,
            TokenKind::Ge => Comparison::GreaterOrEqual,
            _ => unreachable!(),
        };
        let value = self.string()?;
        let result = Query::property(name, value.clone(), cmp);
        let next = self.lookahead()?.kind;
        if matches!(
            next,
            TokenKind::Lt | TokenKind::Gt | TokenKind::Le | TokenKind::Ge
        ) {
            // Chained range: restate the left comparison in terms of the
            // shared middle operand, then AND with the right comparison.
            let q1 = swap(result);
            let q2 = self.property_cmp_query(value)?;
            return Ok(Query::Composite {
                op: Operator::And,
                operands: vec![q1, q2],
            });
        }
        Ok(result)
    }

    fn grouped_query(&mut self) -> Result<Query> {
        self.shift_token();
        let result = self.query()?;
        self.match_token(&[TokenKind::RPar])?;
        Ok(result)
    }

    fn string(&mut self) -> Result<String> {
        let token = self.match_token(&[TokenKind::Atom, TokenKind::Quoted])?;
        Ok(token.value)
    }

    fn match_token(&mut self, expected: &[TokenKind]) -> Result<Token> {
        let token = self.lookahead()?.clone();
        if !expected.contains(&token.kind) {
            return Err(self.parse_error(
                format!(
                    "unexpected token {:?} (expected {:?})",
                    token.kind, expected
                ),
                token.pos,
            ));
        }
        self.shift_token();
        Ok(token)
    }

    fn lookahead(&mut self) -> Result<&Token> {
        if self.token.is_none() {
            self.token = Some(self.next_token()?);
        }
        Ok(self.token.as_ref().expect("lookahead token"))
    }

    fn shift_token(&mut self) -> Option<Token> {
        self.token.take()
    }

    fn next_token(&mut self) -> Result<Token> {
        while self.pos < self.chars.len() && self.chars[self.pos].is_whitespace() {
            self.pos += 1;
        }
        let start = self.pos;
        if start >= self.chars.len() {
            return Ok(Token {
                kind: TokenKind::Eof,
                value: String::new(),
                pos: start,
            });
        }
        let c = self.chars[start];
        let (kind, len) = match c {
            '&' => (TokenKind::And, 1),
            '|' => (TokenKind::Or, 1),
            // NOT only begins a token here; inside an atom `-` is ordinary
            '!' | '-' => (TokenKind::Not, 1),
            '(' => (TokenKind::LPar, 1),
            ')' => (TokenKind::RPar, 1),
            ':' => (TokenKind::Colon, 1),
            '=' => (TokenKind::Eq, 1),
            '<' => {
                if self.peek(start + 1) == Some('=') {
                    (TokenKind::Le, 2)
                } else {
                    (TokenKind::Lt, 1)
                }
            }
            '>' => {
                if self.peek(start + 1) == Some('=') {
                    (TokenKind::Ge, 2)
                } else {
                    (TokenKind::Gt, 1)
                }
            }
            '"' => return self.quoted_token(start),
            _ => return self.atom_token(start),
        };
        self.pos = start + len;
        Ok(Token {
            kind,
            value: self.chars[start..start + len].iter().collect(),
            pos: start,
        })
    }

    fn quoted_token(&mut self, start: usize) -> Result<Token> {
        let mut value = String::new();
        let mut i = start + 1;
        while i < self.chars.len() {
            match self.chars[i] {
                '"' => {
                    self.pos = i + 1;
                    return Ok(Token {
                        kind: TokenKind::Quoted,
                        value,
                        pos: start,
                    });
                }
                '\\' => {
                    match self.peek(i + 1) {
                        Some(c @ ('"' | '\\')) => {
                            value.push(c);
                            i += 2;
                        }
                        _ => {
                            return Err(
                                self.parse_error("invalid escape in quoted string".to_string(), i)
                            );
                        }
                    }
                }
                '\0' | '\r' | '\n' => {
                    return Err(self.parse_error("unknown character in quoted string".to_string(), i));
                }
                c => {
                    value.push(c);
                    i += 1;
                }
            }
        }
        Err(self.parse_error("unterminated quoted string".to_string(), start))
    }

    fn atom_token(&mut self, start: usize) -> Result<Token> {
        let mut i = start;
        while i < self.chars.len() {
            let c = self.chars[i];
            if c.is_whitespace() || matches!(c, ':' | '=' | '<' | '>' | '&' | '|' | '!' | '(' | ')' | '"') {
                break;
            }
            i += 1;
        }
        self.pos = i;
        let value: String = self.chars[start..i].iter().collect();
        // Case-insensitive word spellings of the operators
        let kind = match value.to_lowercase().as_str() {
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "not" => TokenKind::Not,
            "pe" => TokenKind::Colon,
            "eq" => TokenKind::Eq,
            "le" => TokenKind::Le,
            "ge" => TokenKind::Ge,
            "lt" => TokenKind::Lt,
            "gt" => TokenKind::Gt,
            _ => TokenKind::Atom,
        };
        Ok(Token {
            kind,
            value,
            pos: start,
        })
    }

    fn peek(&self, i: usize) -> Option<char> {
        self.chars.get(i).copied()
    }

    fn parse_error(&self, message: String, pos: usize) -> Error {
        log::debug!("query parse error at {}: {}", pos, message);
        Error::new(ErrorKind::Parse, format!("{} at position {}", message, pos))
    }
}

impl Default for QueryParser {
    fn default() -> Self {
        Self::new()
    }
}

/// `A cmp B` restated as `B cmp' A`
fn swap(query: Query) -> Query {
    match query {
        Query::Property { name, value, cmp } => Query::Property {
            name: value,
            value: name,
            cmp: cmp.swapped(),
        },
        other => other,
    }
}

impl Query {
    /// Parse the compact query text syntax
    pub fn parse(input: &str) -> Result<Query> {
        QueryParser::new().parse(input)
    }
}
