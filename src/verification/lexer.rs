//! Source tokenizer shared by static checks and structure matching.
//!
//! Comments and whitespace are dropped, string and character literals stay
//! whole. Two comment syntaxes are understood: C-like (`//`, `/* */`) and
//! Python (`#`), picked from the file extension.

use serde::{Deserialize, Serialize};

/// Comment and literal syntax of a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    CLike,
    Python,
}

impl Language {
    /// Guesses the language from a path's extension.
    pub fn from_path(path: &str) -> Self {
        let ext = path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
        match ext.as_deref() {
            Some("py") | Some("pyw") | Some("pyi") | Some("sh") | Some("cfg") | Some("toml") => {
                Language::Python
            }
            _ => Language::CLike,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Ident,
    Number,
    Literal,
    Punct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    /// 1-based line of the token's first byte.
    pub line: usize,
    /// Leading whitespace width of that line.
    pub indent: usize,
}

impl Token {
    pub fn is(&self, text: &str) -> bool {
        self.text == text
    }
}

const PUNCT3: &[&str] = &["<<=", ">>=", "...", "**=", "//=", "->*"];
const PUNCT2: &[&str] = &[
    "==", "!=", "<=", ">=", "->", "&&", "||", "++", "--", "<<", ">>", "+=", "-=", "*=", "/=",
    "%=", "&=", "|=", "^=", "::", "**", ":=", "##",
];

/// Tokenizes `source`; invalid UTF-8 is replaced first.
pub fn tokenize(source: &[u8], language: Language) -> Vec<Token> {
    let text = String::from_utf8_lossy(source);
    Lexer::new(&text, language).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    indent: usize,
    at_line_start: bool,
    language: Language,
    tokens: Vec<Token>,
}

impl Lexer {
    fn new(text: &str, language: Language) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
            line: 1,
            indent: 0,
            at_line_start: true,
            language,
            tokens: Vec::new(),
        }
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.indent = 0;
            self.at_line_start = true;
        }
        Some(c)
    }

    fn push(&mut self, kind: TokenKind, text: String, line: usize, indent: usize) {
        self.tokens.push(Token {
            kind,
            text,
            line,
            indent,
        });
    }

    fn starts_with(&self, s: &str) -> bool {
        s.chars().enumerate().all(|(i, c)| self.peek(i) == Some(c))
    }

    fn run(mut self) -> Vec<Token> {
        while let Some(c) = self.peek(0) {
            if c == '\n' {
                self.bump();
                continue;
            }
            if c.is_whitespace() {
                if self.at_line_start {
                    self.indent += if c == '\t' { 8 } else { 1 };
                }
                self.bump();
                continue;
            }
            let (line, indent) = (self.line, self.indent);
            self.at_line_start = false;

            if self.skip_comment() {
                continue;
            }

            if c.is_alphabetic() || c == '_' {
                let ident = self.take_while(|c| c.is_alphanumeric() || c == '_');
                if matches!(self.peek(0), Some('"') | Some('\''))
                    && is_string_prefix(&ident, self.language)
                {
                    let literal = self.take_string();
                    self.push(TokenKind::Literal, format!("{ident}{literal}"), line, indent);
                } else {
                    self.push(TokenKind::Ident, ident, line, indent);
                }
                continue;
            }

            if c.is_ascii_digit()
                || (c == '.' && self.peek(1).is_some_and(|d| d.is_ascii_digit()))
            {
                let number = self.take_number();
                self.push(TokenKind::Number, number, line, indent);
                continue;
            }

            if c == '"' || c == '\'' {
                let literal = self.take_string();
                self.push(TokenKind::Literal, literal, line, indent);
                continue;
            }

            let punct = PUNCT3
                .iter()
                .chain(PUNCT2.iter())
                .find(|p| self.starts_with(p))
                .map(|p| p.to_string())
                .unwrap_or_else(|| c.to_string());
            for _ in 0..punct.chars().count() {
                self.bump();
            }
            self.push(TokenKind::Punct, punct, line, indent);
        }
        self.tokens
    }

    fn skip_comment(&mut self) -> bool {
        match self.language {
            Language::Python => {
                if self.peek(0) == Some('#') {
                    self.take_while(|c| c != '\n');
                    return true;
                }
            }
            Language::CLike => {
                if self.starts_with("//") {
                    self.take_while(|c| c != '\n');
                    return true;
                }
                if self.starts_with("/*") {
                    self.bump();
                    self.bump();
                    while self.peek(0).is_some() && !self.starts_with("*/") {
                        self.bump();
                    }
                    self.bump();
                    self.bump();
                    return true;
                }
            }
        }
        false
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek(0) {
            if !pred(c) {
                break;
            }
            out.push(c);
            self.bump();
        }
        out
    }

    fn take_number(&mut self) -> String {
        let mut out = String::new();
        let hex = self.starts_with("0x") || self.starts_with("0X");
        while let Some(c) = self.peek(0) {
            let exponent_sign = (c == '+' || c == '-')
                && !hex
                && matches!(out.chars().last(), Some('e') | Some('E'));
            if c.is_alphanumeric() || c == '_' || c == '.' || exponent_sign {
                out.push(c);
                self.bump();
            } else {
                break;
            }
        }
        out
    }

    /// Consumes a quoted literal starting at the current quote character.
    fn take_string(&mut self) -> String {
        let Some(quote) = self.peek(0) else {
            return String::new();
        };
        let triple = self.language == Language::Python
            && self.peek(1) == Some(quote)
            && self.peek(2) == Some(quote);
        let mut out = String::new();

        if triple {
            for _ in 0..3 {
                out.extend(self.bump());
            }
            let closing: String = std::iter::repeat(quote).take(3).collect();
            while self.peek(0).is_some() && !self.starts_with(&closing) {
                if self.peek(0) == Some('\\') {
                    out.extend(self.bump());
                }
                out.extend(self.bump());
            }
            for _ in 0..3 {
                out.extend(self.bump());
            }
            return out;
        }

        out.extend(self.bump());
        while let Some(c) = self.peek(0) {
            if c == '\n' {
                // Unterminated; stop at the line end.
                break;
            }
            out.extend(self.bump());
            if c == '\\' {
                if self.peek(0).is_some_and(|n| n != '\n') {
                    out.extend(self.bump());
                }
                continue;
            }
            if c == quote {
                break;
            }
        }
        out
    }
}

fn is_string_prefix(ident: &str, language: Language) -> bool {
    match language {
        Language::Python => {
            ident.len() <= 2
                && ident
                    .chars()
                    .all(|c| matches!(c.to_ascii_lowercase(), 'r' | 'b' | 'f' | 'u'))
        }
        Language::CLike => matches!(ident, "L" | "u" | "U" | "u8" | "R"),
    }
}

/// Token texts only.
pub fn texts(tokens: &[Token]) -> Vec<&str> {
    tokens.iter().map(|t| t.text.as_str()).collect()
}
