//! Expression language for query conditions
//!
//! A small JavaScript-flavoured grammar, enough for the conditions the agent
//! evaluates after substitution:
//!
//! ```text
//! expr       := or
//! or         := and ( "||" and )*
//! and        := equality ( "&&" equality )*
//! equality   := relational ( ( "==" | "!=" | "===" | "!==" ) relational )*
//! relational := additive ( ( "<" | "<=" | ">" | ">=" ) additive )*
//! additive   := term ( ( "+" | "-" ) term )*
//! term       := unary ( ( "*" | "/" | "%" ) unary )*
//! unary      := ( "!" | "-" | "+" ) unary | primary
//! primary    := number | string | "true" | "false" | "null"
//!             | "(" expr ")" | "[" list "]" | "{" members "}"
//! ```
//!
//! Coercion follows the usual loose-equality and truthiness rules: `0`, `""`,
//! `null`, `false`, and `NaN` are falsy, `"2" == 2`, and `+` concatenates as
//! soon as one side is a string.

use super::QueryError;
use std::collections::BTreeMap;
use std::fmt;

/// Runtime value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) => true,
        }
    }

    fn to_number(&self) -> f64 {
        match self {
            Value::Null => 0.0,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Number(n) => *n,
            Value::Str(s) => {
                let s = s.trim();
                if s.is_empty() {
                    0.0
                } else {
                    s.parse().unwrap_or(f64::NAN)
                }
            }
            Value::Array(_) | Value::Object(_) => Value::Str(self.to_string()).to_number(),
        }
    }

    fn is_composite(&self) -> bool {
        matches!(self, Value::Array(_) | Value::Object(_))
    }

    fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Null, _) | (_, Value::Null) => false,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            // Composite values compare by identity, and two literals are never identical.
            (a, b) if a.is_composite() && b.is_composite() => false,
            (Value::Bool(_), _) => Value::Number(self.to_number()).loose_eq(other),
            (_, Value::Bool(_)) => self.loose_eq(&Value::Number(other.to_number())),
            (a, b) if a.is_composite() => Value::Str(a.to_string()).loose_eq(b),
            (a, b) if b.is_composite() => a.loose_eq(&Value::Str(b.to_string())),
            (a, b) => a.to_number() == b.to_number(),
        }
    }

    fn strict_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            _ => false,
        }
    }

    fn compare(&self, other: &Value, op: &Token) -> bool {
        let ordering = match (self, other) {
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            _ => self.to_number().partial_cmp(&other.to_number()),
        };
        let Some(ordering) = ordering else {
            return false;
        };
        match op {
            Token::Lt => ordering.is_lt(),
            Token::Le => ordering.is_le(),
            Token::Gt => ordering.is_gt(),
            Token::Ge => ordering.is_ge(),
            _ => false,
        }
    }

    fn add(&self, other: &Value) -> Value {
        let stringy = |v: &Value| matches!(v, Value::Str(_)) || v.is_composite();
        if stringy(self) || stringy(other) {
            Value::Str(format!("{}{}", self, other))
        } else {
            Value::Number(self.to_number() + other.to_number())
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) if n.is_nan() => f.write_str("NaN"),
            Value::Number(n) if n.is_infinite() => {
                f.write_str(if *n > 0.0 { "Infinity" } else { "-Infinity" })
            }
            Value::Number(n) => write!(f, "{}", n),
            Value::Str(s) => f.write_str(s),
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    if *item != Value::Null {
                        write!(f, "{}", item)?;
                    }
                }
                Ok(())
            }
            Value::Object(_) => f.write_str("[object Object]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Not,
    And,
    Or,
    Eq,
    Ne,
    StrictEq,
    StrictNe,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
}

fn tokenize(input: &str) -> Result<Vec<Token>, QueryError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        let next2 = chars.get(i + 2).copied();

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && next.is_some_and(|n| n.is_ascii_digit())) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_digit() {
                    i = j;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text: String = chars[start..i].iter().collect();
            let number = text
                .parse::<f64>()
                .map_err(|_| QueryError::Syntax(format!("invalid number '{}'", text)))?;
            tokens.push(Token::Number(number));
            continue;
        }

        if c == '"' || c == '\'' {
            let (s, end) = read_string(&chars, i)?;
            tokens.push(Token::Str(s));
            i = end;
            continue;
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '$' | '.'))
            {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }

        let (token, width) = match (c, next, next2) {
            ('=', Some('='), Some('=')) => (Token::StrictEq, 3),
            ('!', Some('='), Some('=')) => (Token::StrictNe, 3),
            ('=', Some('='), _) => (Token::Eq, 2),
            ('!', Some('='), _) => (Token::Ne, 2),
            ('<', Some('='), _) => (Token::Le, 2),
            ('>', Some('='), _) => (Token::Ge, 2),
            ('&', Some('&'), _) => (Token::And, 2),
            ('|', Some('|'), _) => (Token::Or, 2),
            ('!', _, _) => (Token::Not, 1),
            ('<', _, _) => (Token::Lt, 1),
            ('>', _, _) => (Token::Gt, 1),
            ('+', _, _) => (Token::Plus, 1),
            ('-', _, _) => (Token::Minus, 1),
            ('*', _, _) => (Token::Star, 1),
            ('/', _, _) => (Token::Slash, 1),
            ('%', _, _) => (Token::Percent, 1),
            ('(', _, _) => (Token::LParen, 1),
            (')', _, _) => (Token::RParen, 1),
            ('[', _, _) => (Token::LBracket, 1),
            (']', _, _) => (Token::RBracket, 1),
            ('{', _, _) => (Token::LBrace, 1),
            ('}', _, _) => (Token::RBrace, 1),
            (',', _, _) => (Token::Comma, 1),
            (':', _, _) => (Token::Colon, 1),
            _ => {
                return Err(QueryError::Syntax(format!(
                    "unexpected character '{}' at {}",
                    c, i
                )))
            }
        };
        tokens.push(token);
        i += width;
    }

    Ok(tokens)
}

fn read_string(chars: &[char], start: usize) -> Result<(String, usize), QueryError> {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;

    while i < chars.len() {
        match chars[i] {
            c if c == quote => return Ok((out, i + 1)),
            '\\' => {
                let escaped = chars
                    .get(i + 1)
                    .ok_or_else(|| QueryError::Syntax("unterminated escape".to_string()))?;
                match escaped {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    'b' => out.push('\u{8}'),
                    'f' => out.push('\u{c}'),
                    'u' => {
                        let hex: String = chars.iter().skip(i + 2).take(4).collect();
                        let code = u32::from_str_radix(&hex, 16)
                            .ok()
                            .filter(|_| hex.len() == 4)
                            .ok_or_else(|| {
                                QueryError::Syntax(format!("invalid unicode escape '{}'", hex))
                            })?;
                        out.push(char::from_u32(code).unwrap_or('\u{fffd}'));
                        i += 4;
                    }
                    other => out.push(*other),
                }
                i += 2;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }

    Err(QueryError::Syntax("unterminated string literal".to_string()))
}

/// Nesting limit for groups, literals and unary operators
const MAX_DEPTH: usize = 128;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn nested<F>(&mut self, parse: F) -> Result<Value, QueryError>
    where
        F: FnOnce(&mut Self) -> Result<Value, QueryError>,
    {
        if self.depth >= MAX_DEPTH {
            return Err(QueryError::Syntax("expression nested too deeply".to_string()));
        }
        self.depth += 1;
        let value = parse(self);
        self.depth -= 1;
        value
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> Result<(), QueryError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(QueryError::Syntax(format!(
                "expected {:?}, found {:?}",
                token,
                self.peek()
            )))
        }
    }

    fn or(&mut self) -> Result<Value, QueryError> {
        let mut left = self.and()?;
        while self.eat(&Token::Or) {
            let right = self.and()?;
            left = if left.truthy() { left } else { right };
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Value, QueryError> {
        let mut left = self.equality()?;
        while self.eat(&Token::And) {
            let right = self.equality()?;
            left = if left.truthy() { right } else { left };
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Value, QueryError> {
        let mut left = self.relational()?;
        loop {
            let op = match self.peek() {
                Some(t @ (Token::Eq | Token::Ne | Token::StrictEq | Token::StrictNe)) => t.clone(),
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.relational()?;
            left = Value::Bool(match op {
                Token::Eq => left.loose_eq(&right),
                Token::Ne => !left.loose_eq(&right),
                Token::StrictEq => left.strict_eq(&right),
                _ => !left.strict_eq(&right),
            });
        }
    }

    fn relational(&mut self) -> Result<Value, QueryError> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(t @ (Token::Lt | Token::Le | Token::Gt | Token::Ge)) => t.clone(),
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.additive()?;
            left = Value::Bool(left.compare(&right, &op));
        }
    }

    fn additive(&mut self) -> Result<Value, QueryError> {
        let mut left = self.term()?;
        loop {
            if self.eat(&Token::Plus) {
                let right = self.term()?;
                left = left.add(&right);
            } else if self.eat(&Token::Minus) {
                let right = self.term()?;
                left = Value::Number(left.to_number() - right.to_number());
            } else {
                return Ok(left);
            }
        }
    }

    fn term(&mut self) -> Result<Value, QueryError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(t @ (Token::Star | Token::Slash | Token::Percent)) => t.clone(),
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.unary()?;
            let (a, b) = (left.to_number(), right.to_number());
            left = Value::Number(match op {
                Token::Star => a * b,
                Token::Slash => a / b,
                _ => a % b,
            });
        }
    }

    fn unary(&mut self) -> Result<Value, QueryError> {
        if self.eat(&Token::Not) {
            return Ok(Value::Bool(!self.nested(Self::unary)?.truthy()));
        }
        if self.eat(&Token::Minus) {
            return Ok(Value::Number(-self.nested(Self::unary)?.to_number()));
        }
        if self.eat(&Token::Plus) {
            return Ok(Value::Number(self.nested(Self::unary)?.to_number()));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Value, QueryError> {
        match self.peek() {
            Some(Token::LParen | Token::LBracket | Token::LBrace) => {
                self.nested(Self::atom)
            }
            _ => self.atom(),
        }
    }

    fn atom(&mut self) -> Result<Value, QueryError> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Value::Number(n)),
            Some(Token::Str(s)) => Ok(Value::Str(s)),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                "null" | "undefined" => Ok(Value::Null),
                "NaN" => Ok(Value::Number(f64::NAN)),
                "Infinity" => Ok(Value::Number(f64::INFINITY)),
                _ => Err(QueryError::UndefinedIdentifier(name)),
            },
            Some(Token::LParen) => {
                let value = self.or()?;
                self.expect(&Token::RParen)?;
                Ok(value)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.or()?);
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(&Token::Comma)?;
                    }
                }
                Ok(Value::Array(items))
            }
            Some(Token::LBrace) => {
                let mut members = BTreeMap::new();
                if !self.eat(&Token::RBrace) {
                    loop {
                        let key = match self.advance() {
                            Some(Token::Str(s)) | Some(Token::Ident(s)) => s,
                            other => {
                                return Err(QueryError::Syntax(format!(
                                    "expected object key, found {:?}",
                                    other
                                )))
                            }
                        };
                        self.expect(&Token::Colon)?;
                        members.insert(key, self.or()?);
                        if self.eat(&Token::RBrace) {
                            break;
                        }
                        self.expect(&Token::Comma)?;
                    }
                }
                Ok(Value::Object(members))
            }
            Some(other) => Err(QueryError::Syntax(format!("unexpected token {:?}", other))),
            None => Err(QueryError::Syntax("unexpected end of expression".to_string())),
        }
    }
}

/// Evaluate an expression to its raw value
pub fn eval(input: &str) -> Result<Value, QueryError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(QueryError::Syntax("empty expression".to_string()));
    }

    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let value = parser.or()?;
    if let Some(extra) = parser.peek() {
        return Err(QueryError::Syntax(format!("unexpected token {:?}", extra)));
    }
    Ok(value)
}
