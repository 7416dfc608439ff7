use std::iter::Peekable;
use std::str::Chars;

use strum_macros::{Display, EnumString};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
pub enum TokenType {
    // Single-character tokens.
    TokenLeftParen,
    TokenRightParen,
    TokenLeftBrace,
    TokenRightBrace,
    TokenComma,
    TokenDot,
    TokenMinus,
    TokenPlus,
    TokenSemicolon,
    TokenSlash,
    TokenStar,

    // One or two character tokens.
    TokenBang,
    TokenBangEqual,
    TokenEqual,
    TokenEqualEqual,
    TokenGreater,
    TokenGreaterEqual,
    TokenLess,
    TokenLessEqual,

    // Literals.
    TokenIdentifier,
    TokenString,
    TokenNumber,

    // Keywords.
    TokenAnd,
    TokenBreak,
    TokenClass,
    TokenContinue,
    TokenElse,
    TokenFalse,
    TokenFun,
    TokenIf,
    TokenNil,
    TokenOr,
    TokenPrint,
    TokenReturn,
    TokenSuper,
    TokenThis,
    TokenTrue,
    TokenVar,
    TokenWhile,

    TokenError,
    TokenEof,
}

static KEYWORDS: phf::Map<&'static str, TokenType> = phf::phf_map! {
    "and" => TokenType::TokenAnd,
    "break" => TokenType::TokenBreak,
    "class" => TokenType::TokenClass,
    "continue" => TokenType::TokenContinue,
    "else" => TokenType::TokenElse,
    "false" => TokenType::TokenFalse,
    "fun" => TokenType::TokenFun,
    "if" => TokenType::TokenIf,
    "nil" => TokenType::TokenNil,
    "or" => TokenType::TokenOr,
    "print" => TokenType::TokenPrint,
    "return" => TokenType::TokenReturn,
    "super" => TokenType::TokenSuper,
    "this" => TokenType::TokenThis,
    "true" => TokenType::TokenTrue,
    "var" => TokenType::TokenVar,
    "while" => TokenType::TokenWhile,
};

/// A lexeme slice of the source. String tokens keep their quotes; the
/// parser strips them.
#[derive(Debug, Clone, Copy)]
pub struct Token<'a> {
    pub token_type: TokenType,
    pub value: &'a str,
    pub line: usize,
}

pub struct Scanner<'a> {
    source: &'a str,
    chars: Peekable<Chars<'a>>,
    start: usize,
    current: usize,
    line: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(source: &'a str) -> Scanner<'a> {
        Scanner {
            source,
            chars: source.chars().peekable(),
            start: 0,
            current: 0,
            line: 1,
        }
    }

    pub fn scan_token(&mut self) -> Token<'a> {
        self.skip_whitespace();
        self.start = self.current;

        if self.is_end() {
            return self.make_token(TokenType::TokenEof);
        }

        let c = self.advance();

        if Self::is_alpha(c) {
            return self.make_identifier_token();
        }

        if Self::is_digit(c) {
            return self.make_number_token();
        }

        match c {
            '(' => self.make_token(TokenType::TokenLeftParen),
            ')' => self.make_token(TokenType::TokenRightParen),
            '{' => self.make_token(TokenType::TokenLeftBrace),
            '}' => self.make_token(TokenType::TokenRightBrace),
            ';' => self.make_token(TokenType::TokenSemicolon),
            ',' => self.make_token(TokenType::TokenComma),
            '.' => self.make_token(TokenType::TokenDot),
            '-' => self.make_token(TokenType::TokenMinus),
            '+' => self.make_token(TokenType::TokenPlus),
            '/' => self.make_token(TokenType::TokenSlash),
            '*' => self.make_token(TokenType::TokenStar),
            '"' => self.make_string_token(),
            '!' => {
                if self.match_char('=') {
                    self.make_token(TokenType::TokenBangEqual)
                } else {
                    self.make_token(TokenType::TokenBang)
                }
            }
            '=' => {
                if self.match_char('=') {
                    self.make_token(TokenType::TokenEqualEqual)
                } else {
                    self.make_token(TokenType::TokenEqual)
                }
            }
            '<' => {
                if self.match_char('=') {
                    self.make_token(TokenType::TokenLessEqual)
                } else {
                    self.make_token(TokenType::TokenLess)
                }
            }
            '>' => {
                if self.match_char('=') {
                    self.make_token(TokenType::TokenGreaterEqual)
                } else {
                    self.make_token(TokenType::TokenGreater)
                }
            }
            _ => self.error_token("Unexpected character."),
        }
    }

    fn is_digit(ch: char) -> bool {
        ch.is_ascii_digit()
    }

    fn is_alpha(ch: char) -> bool {
        ch.is_ascii_alphabetic() || ch == '_'
    }

    fn make_identifier_token(&mut self) -> Token<'a> {
        while let Some(&c) = self.peek() {
            if Self::is_alpha(c) || Self::is_digit(c) {
                self.advance();
            } else {
                break;
            }
        }
        let lexeme = &self.source[self.start..self.current];
        let token_type = KEYWORDS
            .get(lexeme)
            .copied()
            .unwrap_or(TokenType::TokenIdentifier);
        self.make_token(token_type)
    }

    fn make_number_token(&mut self) -> Token<'a> {
        while let Some(&c) = self.peek() {
            if Self::is_digit(c) {
                self.advance();
            } else {
                break;
            }
        }

        if self.peek() == Some(&'.') {
            if let Some(c) = self.peek_next() {
                if Self::is_digit(c) {
                    self.advance();
                    while let Some(&c) = self.peek() {
                        if Self::is_digit(c) {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
            }
        }

        self.make_token(TokenType::TokenNumber)
    }

    fn make_string_token(&mut self) -> Token<'a> {
        loop {
            match self.peek() {
                Some('"') => break,
                Some('\n') => {
                    self.line += 1;
                    self.advance();
                }
                Some(_) => {
                    self.advance();
                }
                None => return self.error_token("Unterminated string."),
            }
        }
        self.advance();
        self.make_token(TokenType::TokenString)
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek().copied() {
                Some('\n') => {
                    self.line += 1;
                    self.advance();
                }
                Some('/') if self.peek_next() == Some('/') => {
                    while let Some(&c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                _ => return,
            }
        }
    }

    fn peek(&mut self) -> Option<&char> {
        self.chars.peek()
    }

    fn peek_next(&self) -> Option<char> {
        let mut iter = self.chars.clone();
        iter.next();
        iter.next()
    }

    fn is_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn make_token(&self, token_type: TokenType) -> Token<'a> {
        Token {
            token_type,
            value: &self.source[self.start..self.current],
            line: self.line,
        }
    }

    fn error_token(&self, reason: &'static str) -> Token<'a> {
        Token {
            token_type: TokenType::TokenError,
            value: reason,
            line: self.line,
        }
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.peek() == Some(&expected) {
            self.advance();
            return true;
        }
        false
    }

    fn advance(&mut self) -> char {
        match self.chars.next() {
            Some(c) => {
                self.current += c.len_utf8();
                c
            }
            None => '\0',
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(source: &str) -> Vec<Token<'_>> {
        let mut scanner = Scanner::new(source);
        let mut tokens = Vec::new();
        loop {
            let token = scanner.scan_token();
            let done = token.token_type == TokenType::TokenEof;
            tokens.push(token);
            if done {
                break;
            }
        }
        tokens
    }

    #[test]
    fn keywords_and_identifiers() {
        let tokens = scan_all("this while break continue fun fun1 whilewhile");
        let types: Vec<TokenType> = tokens.iter().map(|t| t.token_type).collect();
        assert_eq!(
            types,
            vec![
                TokenType::TokenThis,
                TokenType::TokenWhile,
                TokenType::TokenBreak,
                TokenType::TokenContinue,
                TokenType::TokenFun,
                TokenType::TokenIdentifier,
                TokenType::TokenIdentifier,
                TokenType::TokenEof,
            ]
        );
        assert_eq!(tokens[5].value, "fun1");
    }

    #[test]
    fn for_is_just_an_identifier() {
        let tokens = scan_all("for");
        assert_eq!(tokens[0].token_type, TokenType::TokenIdentifier);
        assert_eq!(tokens[0].value, "for");
    }

    #[test]
    fn two_character_operators() {
        let tokens = scan_all("! != = == < <= > >=");
        let types: Vec<TokenType> = tokens.iter().map(|t| t.token_type).collect();
        assert_eq!(
            types,
            vec![
                TokenType::TokenBang,
                TokenType::TokenBangEqual,
                TokenType::TokenEqual,
                TokenType::TokenEqualEqual,
                TokenType::TokenLess,
                TokenType::TokenLessEqual,
                TokenType::TokenGreater,
                TokenType::TokenGreaterEqual,
                TokenType::TokenEof,
            ]
        );
    }

    #[test]
    fn numbers_with_and_without_fraction() {
        let tokens = scan_all("12 3.5 7.");
        assert_eq!(tokens[0].value, "12");
        assert_eq!(tokens[1].value, "3.5");
        // A trailing dot is not part of the number.
        assert_eq!(tokens[2].value, "7");
        assert_eq!(tokens[3].token_type, TokenType::TokenDot);
    }

    #[test]
    fn string_tokens_keep_their_quotes() {
        let tokens = scan_all("\"hello\"");
        assert_eq!(tokens[0].token_type, TokenType::TokenString);
        assert_eq!(tokens[0].value, "\"hello\"");
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let tokens = scan_all("\"oops");
        assert_eq!(tokens[0].token_type, TokenType::TokenError);
        assert_eq!(tokens[0].value, "Unterminated string.");
    }

    #[test]
    fn lines_advance_through_whitespace_comments_and_strings() {
        let source = "one\n// comment\ntwo \"a\nb\" three";
        let tokens = scan_all(source);
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[1].line, 3);
        assert_eq!(tokens[1].value, "two");
        assert_eq!(tokens[2].token_type, TokenType::TokenString);
        assert_eq!(tokens[3].value, "three");
        assert_eq!(tokens[3].line, 4);
    }

    #[test]
    fn comments_run_to_end_of_line() {
        let tokens = scan_all("1 // 2 + 3\n4");
        assert_eq!(tokens[0].value, "1");
        assert_eq!(tokens[1].value, "4");
        assert_eq!(tokens[1].line, 2);
    }

    #[test]
    fn unexpected_character() {
        let tokens = scan_all("%");
        assert_eq!(tokens[0].token_type, TokenType::TokenError);
    }
}
