//! Tokenizer for rule expressions.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    True,
    False,
    Null,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Colon,
    Not,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Empty,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "identifier '{name}'"),
            Token::Str(s) => write!(f, "string '{s}'"),
            Token::Int(i) => write!(f, "number {i}"),
            Token::Float(v) => write!(f, "number {v}"),
            Token::True => write!(f, "'true'"),
            Token::False => write!(f, "'false'"),
            Token::Null => write!(f, "'null'"),
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
            Token::LBracket => write!(f, "'['"),
            Token::RBracket => write!(f, "']'"),
            Token::Comma => write!(f, "','"),
            Token::Dot => write!(f, "'.'"),
            Token::Colon => write!(f, "':'"),
            Token::Not => write!(f, "'!'"),
            Token::And => write!(f, "'&&'"),
            Token::Or => write!(f, "'||'"),
            Token::Eq => write!(f, "'=='"),
            Token::Ne => write!(f, "'!='"),
            Token::Lt => write!(f, "'<'"),
            Token::Gt => write!(f, "'>'"),
            Token::Le => write!(f, "'<='"),
            Token::Ge => write!(f, "'>='"),
            Token::Empty => write!(f, "'empty'"),
            Token::Plus => write!(f, "'+'"),
            Token::Minus => write!(f, "'-'"),
            Token::Star => write!(f, "'*'"),
            Token::Slash => write!(f, "'/'"),
            Token::Percent => write!(f, "'%'"),
        }
    }
}

pub(crate) struct Lexer<'a> {
    input: &'a [u8],
    cursor: usize,
}

impl<'a> Lexer<'a> {
    pub(crate) fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            cursor: 0,
        }
    }

    /// Tokenize the whole input.
    pub(crate) fn tokenize(mut self) -> Result<Vec<Token>, String> {
        let mut tokens = Vec::new();
        while let Some(token) = self.next_token()? {
            tokens.push(token);
        }
        Ok(tokens)
    }

    fn next_token(&mut self) -> Result<Option<Token>, String> {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.cursor += 1;
        }
        let Some(byte) = self.peek() else {
            return Ok(None);
        };
        let token = match byte {
            b'(' => self.single(Token::LParen),
            b')' => self.single(Token::RParen),
            b'[' => self.single(Token::LBracket),
            b']' => self.single(Token::RBracket),
            b',' => self.single(Token::Comma),
            b':' => self.single(Token::Colon),
            b'+' => self.single(Token::Plus),
            b'-' => self.single(Token::Minus),
            b'*' => self.single(Token::Star),
            b'/' => self.single(Token::Slash),
            b'%' => self.single(Token::Percent),
            b'.' if !self.peek_at(1).is_some_and(|b| b.is_ascii_digit()) => {
                self.single(Token::Dot)
            }
            b'!' => self.one_or_two(b'=', Token::Ne, Token::Not),
            b'<' => self.one_or_two(b'=', Token::Le, Token::Lt),
            b'>' => self.one_or_two(b'=', Token::Ge, Token::Gt),
            b'=' => {
                if self.peek_at(1) == Some(b'=') {
                    self.cursor += 2;
                    Token::Eq
                } else {
                    return Err(format!("unexpected '=' at offset {}", self.cursor));
                }
            }
            b'&' => self.doubled(b'&', Token::And)?,
            b'|' => self.doubled(b'|', Token::Or)?,
            b'\'' | b'"' => self.string(byte)?,
            b'0'..=b'9' | b'.' => self.number()?,
            b if b.is_ascii_alphabetic() || b == b'_' || b == b'$' => self.word(),
            other => {
                return Err(format!(
                    "unexpected character '{}' at offset {}",
                    other as char, self.cursor
                ));
            }
        };
        Ok(Some(token))
    }

    fn single(&mut self, token: Token) -> Token {
        self.cursor += 1;
        token
    }

    fn one_or_two(&mut self, second: u8, long: Token, short: Token) -> Token {
        if self.peek_at(1) == Some(second) {
            self.cursor += 2;
            long
        } else {
            self.cursor += 1;
            short
        }
    }

    fn doubled(&mut self, byte: u8, token: Token) -> Result<Token, String> {
        if self.peek_at(1) == Some(byte) {
            self.cursor += 2;
            Ok(token)
        } else {
            Err(format!(
                "expected '{0}{0}' at offset {1}",
                byte as char, self.cursor
            ))
        }
    }

    fn string(&mut self, quote: u8) -> Result<Token, String> {
        let start = self.cursor;
        self.cursor += 1;
        let mut parsed = String::new();
        loop {
            let remaining = std::str::from_utf8(&self.input[self.cursor..])
                .map_err(|_| "invalid UTF-8 in string literal".to_string())?;
            let Some(current) = remaining.chars().next() else {
                return Err(format!("unterminated string starting at offset {start}"));
            };
            self.cursor += current.len_utf8();
            match current {
                c if c as u32 == quote as u32 => break,
                '\\' => {
                    let Some(escaped) = self.peek() else {
                        return Err(format!("unterminated string starting at offset {start}"));
                    };
                    self.cursor += 1;
                    let translated = match escaped {
                        b'\\' => '\\',
                        b'\'' => '\'',
                        b'"' => '"',
                        b'n' => '\n',
                        b't' => '\t',
                        other => {
                            return Err(format!("unknown escape '\\{}'", other as char));
                        }
                    };
                    parsed.push(translated);
                }
                c => parsed.push(c),
            }
        }
        Ok(Token::Str(parsed))
    }

    fn number(&mut self) -> Result<Token, String> {
        let start = self.cursor;
        let mut is_float = false;
        while let Some(byte) = self.peek() {
            match byte {
                b'0'..=b'9' => self.cursor += 1,
                b'.' if !is_float && self.peek_at(1).is_some_and(|b| b.is_ascii_digit()) => {
                    is_float = true;
                    self.cursor += 1;
                }
                b'e' | b'E' => {
                    is_float = true;
                    self.cursor += 1;
                    if matches!(self.peek(), Some(b'+' | b'-')) {
                        self.cursor += 1;
                    }
                }
                _ => break,
            }
        }
        let text = std::str::from_utf8(&self.input[start..self.cursor])
            .map_err(|_| "invalid UTF-8 in number".to_string())?;
        if is_float {
            text.parse::<f64>()
                .map(Token::Float)
                .map_err(|e| format!("invalid number '{text}': {e}"))
        } else {
            text.parse::<i64>()
                .map(Token::Int)
                .map_err(|e| format!("invalid number '{text}': {e}"))
        }
    }

    fn word(&mut self) -> Token {
        let start = self.cursor;
        while self
            .peek()
            .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'$')
        {
            self.cursor += 1;
        }
        // the loop only advanced over ASCII bytes
        let word = String::from_utf8_lossy(&self.input[start..self.cursor]).into_owned();
        match word.as_str() {
            "true" => Token::True,
            "false" => Token::False,
            "null" => Token::Null,
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            "eq" => Token::Eq,
            "ne" => Token::Ne,
            "lt" => Token::Lt,
            "gt" => Token::Gt,
            "le" => Token::Le,
            "ge" => Token::Ge,
            "empty" => Token::Empty,
            "div" => Token::Slash,
            "mod" => Token::Percent,
            _ => Token::Ident(word),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.cursor).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.input.get(self.cursor + offset).copied()
    }
}
