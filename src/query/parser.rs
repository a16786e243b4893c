//! Hand-rolled parser for the restricted SQL grammar (spec §4.E). Kept
//! narrow and table-free on purpose — not a `sqlparser`-crate dependency —
//! the same call this teacher's own SQL-shaped surfaces never had to make,
//! but mirrored here on the narrow-grammar approach the `kimberlite-query`
//! and `eidetica` reference crates take for their own internal dialects.
//!
//! ```text
//! query  := verb args FROM "<store>" [ where_clause ] [ ORDER BY <idx> [DESC] ]
//!           [ LIMIT n ] [ OFFSET n ]
//! verb   := SELECT | COUNT | SUM | AVG | MIN | MAX | CONCAT
//! args   := "*" | <field> | "(" <field> {, <field>} ")"
//! ```

use crate::backend::Direction;
use crate::error::{Error, Result};
use crate::key::Key;
use crate::keyrange::{KeyRange, Where};
use crate::query::ir::{MapSpec, QueryIr, Reduce};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Star,
    LParen,
    RParen,
    Comma,
    Op(String),
    Eof,
}

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Lexer { src, pos: 0 }
    }

    fn bytes(&self) -> &[u8] {
        self.src.as_bytes()
    }

    fn peek_char(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn next_token(&mut self) -> Result<Token> {
        self.skip_ws();
        let Some(c) = self.peek_char() else {
            return Ok(Token::Eof);
        };

        match c {
            '*' => {
                self.pos += 1;
                Ok(Token::Star)
            }
            '(' => {
                self.pos += 1;
                Ok(Token::LParen)
            }
            ')' => {
                self.pos += 1;
                Ok(Token::RParen)
            }
            ',' => {
                self.pos += 1;
                Ok(Token::Comma)
            }
            '\'' | '"' => self.lex_string(c),
            '>' | '<' | '=' | '!' => self.lex_op(),
            c if c.is_ascii_digit() || c == '-' => self.lex_number(),
            c if c.is_alphabetic() || c == '_' => self.lex_ident(),
            other => Err(Error::sql_parse(
                format!("unexpected character '{other}'"),
                self.src[self.pos..].to_string(),
            )),
        }
    }

    fn lex_string(&mut self, quote: char) -> Result<Token> {
        let start = self.pos;
        self.pos += quote.len_utf8();
        let mut out = String::new();
        loop {
            match self.peek_char() {
                None => {
                    return Err(Error::sql_parse(
                        "unterminated string literal",
                        self.src[start..].to_string(),
                    ))
                }
                Some(c) if c == quote => {
                    self.pos += c.len_utf8();
                    break;
                }
                Some(c) => {
                    out.push(c);
                    self.pos += c.len_utf8();
                }
            }
        }
        Ok(Token::Str(out))
    }

    fn lex_op(&mut self) -> Result<Token> {
        let start = self.pos;
        let first = self.bytes()[self.pos] as char;
        self.pos += 1;
        if let Some('=') = self.peek_char() {
            self.pos += 1;
        }
        let _ = first;
        Ok(Token::Op(self.src[start..self.pos].to_string()))
    }

    fn lex_number(&mut self) -> Result<Token> {
        let start = self.pos;
        if self.peek_char() == Some('-') {
            self.pos += 1;
        }
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() || c == '.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        self.src[start..self.pos]
            .parse::<f64>()
            .map(Token::Num)
            .map_err(|_| Error::sql_parse("invalid numeric literal", self.src[start..self.pos].to_string()))
    }

    fn lex_ident(&mut self) -> Result<Token> {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        Ok(Token::Ident(self.src[start..self.pos].to_string()))
    }
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
    source: &'a str,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Result<Self> {
        let mut lexer = Lexer::new(src);
        let current = lexer.next_token()?;
        Ok(Parser {
            lexer,
            current,
            source: src,
        })
    }

    fn advance(&mut self) -> Result<Token> {
        let prev = std::mem::replace(&mut self.current, self.lexer.next_token()?);
        Ok(prev)
    }

    fn expect_ident_ci(&mut self, word: &str) -> Result<()> {
        match &self.current {
            Token::Ident(s) if s.eq_ignore_ascii_case(word) => {
                self.advance()?;
                Ok(())
            }
            _ => Err(self.err(format!("expected '{}'", word.to_uppercase()))),
        }
    }

    fn err(&self, message: impl Into<String>) -> Error {
        Error::sql_parse(message.into(), self.source.to_string())
    }

    fn parse_query(&mut self) -> Result<QueryIr> {
        let verb = match self.advance()? {
            Token::Ident(s) => s.to_uppercase(),
            _ => return Err(self.err("expected a verb (SELECT/COUNT/SUM/AVG/MIN/MAX/CONCAT)")),
        };

        let args = self.parse_args()?;

        self.expect_ident_ci("from")?;
        let store_name = match self.advance()? {
            Token::Str(s) => s,
            _ => return Err(self.err("expected a quoted store name after FROM")),
        };

        let mut ir = QueryIr::new(store_name);

        match verb.as_str() {
            "SELECT" => ir.map = Some(args_to_map(&args)),
            "COUNT" => ir.reduce = Some(Reduce::Count),
            "SUM" => ir.reduce = Some(Reduce::Sum(single_field(&args, &verb)?)),
            "AVG" => ir.reduce = Some(Reduce::Avg(single_field(&args, &verb)?)),
            "MIN" => ir.reduce = Some(Reduce::Min(single_field(&args, &verb)?)),
            "MAX" => ir.reduce = Some(Reduce::Max(single_field(&args, &verb)?)),
            "CONCAT" => ir.reduce = Some(Reduce::Concat(single_field(&args, &verb)?)),
            other => return Err(self.err(format!("unknown verb '{other}'"))),
        }

        if let Token::Ident(s) = &self.current {
            if s.eq_ignore_ascii_case("where") {
                self.advance()?;
                ir.wheres = self.parse_where_clause()?;
            }
        }

        if let Token::Ident(s) = &self.current {
            if s.eq_ignore_ascii_case("order") {
                self.advance()?;
                self.expect_ident_ci("by")?;
                let index = match self.advance()? {
                    Token::Ident(s) => s,
                    _ => return Err(self.err("expected index name after ORDER BY")),
                };
                ir.index = Some(index);
                if let Token::Ident(s) = &self.current {
                    if s.eq_ignore_ascii_case("desc") {
                        self.advance()?;
                        ir.direction = Direction::Prev;
                    }
                }
            }
        }

        if let Token::Ident(s) = &self.current {
            if s.eq_ignore_ascii_case("limit") {
                self.advance()?;
                ir.limit = Some(self.parse_uint()?);
            }
        }

        if let Token::Ident(s) = &self.current {
            if s.eq_ignore_ascii_case("offset") {
                self.advance()?;
                ir.offset = Some(self.parse_uint()?);
            }
        }

        if self.current != Token::Eof {
            return Err(self.err("trailing input after a complete query"));
        }

        Ok(ir)
    }

    fn parse_uint(&mut self) -> Result<u64> {
        match self.advance()? {
            Token::Num(n) if n >= 0.0 && n.fract() == 0.0 => Ok(n as u64),
            _ => Err(self.err("expected a non-negative integer")),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<String>> {
        match &self.current {
            Token::Star => {
                self.advance()?;
                Ok(vec!["*".to_string()])
            }
            Token::Ident(field) => {
                let field = field.clone();
                self.advance()?;
                Ok(vec![field])
            }
            Token::LParen => {
                self.advance()?;
                let mut fields = Vec::new();
                loop {
                    match self.advance()? {
                        Token::Ident(s) => fields.push(s),
                        _ => return Err(self.err("expected a field name")),
                    }
                    match &self.current {
                        Token::Comma => {
                            self.advance()?;
                        }
                        Token::RParen => {
                            self.advance()?;
                            break;
                        }
                        _ => return Err(self.err("expected ',' or ')'")),
                    }
                }
                Ok(fields)
            }
            _ => Err(self.err("expected '*', a field name, or '(' field list ')'")),
        }
    }

    fn parse_where_clause(&mut self) -> Result<Vec<Where>> {
        let mut ranges: Vec<(String, KeyRange)> = Vec::new();

        loop {
            let field = match self.advance()? {
                Token::Ident(s) => s,
                _ => return Err(self.err("expected a field name in WHERE clause")),
            };
            let op = match self.advance()? {
                Token::Op(op) => op,
                _ => return Err(self.err("expected a comparison operator")),
            };
            let value = match self.advance()? {
                Token::Num(n) => Key::Number(n),
                Token::Str(s) => Key::Text(s),
                _ => return Err(self.err("expected a literal value")),
            };

            let existing = ranges.iter_mut().find(|(f, _)| f == &field);
            let bound_range = match existing {
                Some((_, range)) => range,
                None => {
                    ranges.push((field.clone(), KeyRange::unbounded()));
                    &mut ranges.last_mut().unwrap().1
                }
            };

            apply_condition(bound_range, &op, value, &field)?;

            if let Token::Ident(s) = &self.current {
                if s.eq_ignore_ascii_case("and") {
                    self.advance()?;
                    continue;
                }
            }
            break;
        }

        Ok(ranges.into_iter().map(|(f, r)| Where::new(f, r)).collect())
    }
}

fn apply_condition(range: &mut KeyRange, op: &str, value: Key, field: &str) -> Result<()> {
    match op {
        "=" => {
            if range.lower.is_some() || range.upper.is_some() {
                return Err(Error::sql_parse(
                    format!("field '{field}' combines '=' with another condition"),
                    field.to_string(),
                ));
            }
            *range = KeyRange::only(value);
        }
        ">" | ">=" => {
            if range.lower.is_some() {
                return Err(Error::sql_parse(
                    format!("field '{field}' has more than one lower bound"),
                    field.to_string(),
                ));
            }
            range.lower = Some(value);
            range.lower_open = op == ">";
        }
        "<" | "<=" => {
            if range.upper.is_some() {
                return Err(Error::sql_parse(
                    format!("field '{field}' has more than one upper bound"),
                    field.to_string(),
                ));
            }
            range.upper = Some(value);
            range.upper_open = op == "<";
        }
        other => {
            return Err(Error::sql_parse(
                format!("unsupported operator '{other}'"),
                field.to_string(),
            ))
        }
    }
    Ok(())
}

fn args_to_map(args: &[String]) -> MapSpec {
    match args {
        [one] if one == "*" => MapSpec::Whole,
        [one] => MapSpec::Field(one.clone()),
        many => MapSpec::Fields(many.to_vec()),
    }
}

fn single_field(args: &[String], verb: &str) -> Result<String> {
    match args {
        [field] if field != "*" => Ok(field.clone()),
        [field] => Ok(field.clone()), // COUNT(*) — accepted, the field name is unused
        _ => Err(Error::sql_parse(
            format!("{verb} takes exactly one field"),
            verb.to_string(),
        )),
    }
}

/// Parses a query string into `QueryIr`. A parse failure produces
/// `SqlParseError` carrying the offending fragment.
pub fn parse(sql: &str) -> Result<QueryIr> {
    let mut parser = Parser::new(sql)?;
    parser.parse_query()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_select_star_with_where_and_order() {
        let ir = parse("SELECT * FROM \"orders\" WHERE price >= 1 AND price < 4 ORDER BY price").unwrap();
        assert_eq!(ir.store_name, "orders");
        assert_eq!(ir.wheres.len(), 1);
        assert_eq!(ir.index.as_deref(), Some("price"));
    }

    #[test]
    fn parses_sum_aggregate() {
        let ir = parse("SUM(price) FROM \"orders\"").unwrap();
        assert_eq!(ir.reduce, Some(Reduce::Sum("price".to_string())));
    }

    #[test]
    fn duplicate_bound_on_same_field_is_a_parse_error() {
        let err = parse("SELECT * FROM \"orders\" WHERE price >= 1 AND price >= 2").unwrap_err();
        assert_eq!(err.kind(), "SqlParseError");
    }

    #[test]
    fn desc_order_by_selects_prev_direction() {
        let ir = parse("SELECT * FROM \"orders\" ORDER BY price DESC").unwrap();
        assert_eq!(ir.direction, Direction::Prev);
    }
}
