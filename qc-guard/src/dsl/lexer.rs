//! Turns rule text into a token stream.
//!
//! The lexer fails fast: an illegal character, an unterminated string or an
//! impossible date literal is reported at its byte offset, and nothing is
//! ever skipped silently.

use super::token::{Keyword, Operator, Token, TokenKind};
use crate::core::{DATE_FORMAT, DEFAULT_MAX_RULE_LENGTH};
use crate::error::LexError;
use chrono::NaiveDate;

/// Tokenizes rule text using the default length limit.
pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    Lexer::new(source).tokenize()
}

pub struct Lexer<'a> {
    source: &'a str,
    chars: Vec<(usize, char)>,
    index: usize,
    max_length: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().collect(),
            index: 0,
            max_length: DEFAULT_MAX_RULE_LENGTH,
        }
    }

    /// Rejects rule text longer than `max_length` characters.
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    /// Consumes the lexer, producing tokens terminated by `Eof`.
    pub fn tokenize(mut self) -> Result<Vec<Token>, LexError> {
        if let Some(&(offset, ch)) = self.chars.get(self.max_length) {
            return Err(LexError::new(offset, ch).with_detail(format!(
                "rule text exceeds {} characters",
                self.max_length
            )));
        }

        let mut tokens = Vec::new();
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() {
                self.index += 1;
                continue;
            }
            let offset = self.offset();
            let kind = if ch == '"' || ch == '\'' {
                self.string(ch)?
            } else if ch.is_ascii_digit() {
                match self.date()? {
                    Some(date) => TokenKind::Date(date),
                    None => self.number()?,
                }
            } else if ch.is_ascii_alphabetic() || ch == '_' {
                self.word()
            } else {
                self.symbol(ch)?
            };
            tokens.push(Token::new(kind, offset));
        }
        tokens.push(Token::new(TokenKind::Eof, self.source.len()));
        Ok(tokens)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.index).map(|&(_, ch)| ch)
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.index + ahead).map(|&(_, ch)| ch)
    }

    fn offset(&self) -> usize {
        self.offset_of(self.index)
    }

    fn offset_of(&self, index: usize) -> usize {
        self.chars
            .get(index)
            .map(|&(offset, _)| offset)
            .unwrap_or(self.source.len())
    }

    fn slice(&self, start: usize, end: usize) -> &'a str {
        &self.source[self.offset_of(start)..self.offset_of(end)]
    }

    fn string(&mut self, quote: char) -> Result<TokenKind, LexError> {
        let start = self.offset();
        self.index += 1;
        let mut literal = String::new();
        loop {
            let Some(ch) = self.peek() else {
                return Err(LexError::new(start, quote).with_detail("unterminated string literal"));
            };
            self.index += 1;
            if ch == quote {
                return Ok(TokenKind::Str(literal));
            }
            if ch != '\\' {
                literal.push(ch);
                continue;
            }
            let escape_offset = self.offset();
            let escaped = match self.peek() {
                Some('"') => '"',
                Some('\'') => '\'',
                Some('\\') => '\\',
                Some('n') => '\n',
                Some('t') => '\t',
                Some(other) => {
                    return Err(LexError::new(escape_offset, other).with_detail("unknown escape"))
                }
                None => {
                    return Err(
                        LexError::new(start, quote).with_detail("unterminated string literal")
                    )
                }
            };
            literal.push(escaped);
            self.index += 1;
        }
    }

    /// Recognizes `YYYY-MM-DD` ahead of numbers; `Ok(None)` when the input
    /// does not have that shape.
    fn date(&mut self) -> Result<Option<NaiveDate>, LexError> {
        const SHAPE: &[bool] = &[
            true, true, true, true, false, true, true, false, true, true,
        ];
        for (ahead, &digit) in SHAPE.iter().enumerate() {
            match self.peek_at(ahead) {
                Some(ch) if digit && ch.is_ascii_digit() => {}
                Some('-') if !digit => {}
                _ => return Ok(None),
            }
        }
        if self
            .peek_at(SHAPE.len())
            .is_some_and(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            return Ok(None);
        }

        let start = self.index;
        let text = self.slice(start, start + SHAPE.len());
        let date = NaiveDate::parse_from_str(text, DATE_FORMAT).map_err(|_| {
            LexError::new(self.offset(), text.chars().next().unwrap_or('0'))
                .with_detail(format!("'{text}' is not a valid date"))
        })?;
        self.index += SHAPE.len();
        Ok(Some(date))
    }

    fn number(&mut self) -> Result<TokenKind, LexError> {
        let start = self.index;
        while self.peek().is_some_and(|ch| ch.is_ascii_digit()) {
            self.index += 1;
        }
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|ch| ch.is_ascii_digit()) {
            self.index += 1;
            while self.peek().is_some_and(|ch| ch.is_ascii_digit()) {
                self.index += 1;
            }
        }
        // `12abc` is neither a number nor an identifier
        if let Some(ch) = self.peek().filter(|ch| ch.is_ascii_alphabetic() || *ch == '_') {
            return Err(LexError::new(self.offset(), ch).with_detail("malformed number"));
        }
        let text = self.slice(start, self.index);
        text.parse::<f64>()
            .map(TokenKind::Number)
            .map_err(|_| LexError::new(self.offset_of(start), '0').with_detail("malformed number"))
    }

    fn word(&mut self) -> TokenKind {
        let start = self.index;
        while self
            .peek()
            .is_some_and(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            self.index += 1;
        }
        let word = self.slice(start, self.index);
        match Keyword::from_word(word) {
            Some(keyword) => TokenKind::Keyword(keyword),
            None => TokenKind::Identifier(word.to_string()),
        }
    }

    fn symbol(&mut self, ch: char) -> Result<TokenKind, LexError> {
        let offset = self.offset();
        let next = self.peek_at(1);
        let (kind, width) = match (ch, next) {
            ('(', _) => (TokenKind::LParen, 1),
            (')', _) => (TokenKind::RParen, 1),
            (',', _) => (TokenKind::Comma, 1),
            ('+', _) => (TokenKind::Operator(Operator::Plus), 1),
            ('-', _) => (TokenKind::Operator(Operator::Minus), 1),
            ('<', Some('=')) => (TokenKind::Operator(Operator::Le), 2),
            ('<', Some('>')) => (TokenKind::Operator(Operator::Ne), 2),
            ('<', _) => (TokenKind::Operator(Operator::Lt), 1),
            ('>', Some('=')) => (TokenKind::Operator(Operator::Ge), 2),
            ('>', _) => (TokenKind::Operator(Operator::Gt), 1),
            ('=', Some('=')) => (TokenKind::Operator(Operator::Eq), 2),
            ('=', _) => (TokenKind::Operator(Operator::Eq), 1),
            ('!', Some('=')) => (TokenKind::Operator(Operator::Ne), 2),
            _ => return Err(LexError::new(offset, ch)),
        };
        self.index += width;
        Ok(kind)
    }
}
