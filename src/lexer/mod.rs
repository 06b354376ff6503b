use logos::Logos;

/// State threaded through the lexer so every token knows its source line.
/// Newlines never reach the compiler; they only bump the counter.
#[derive(Debug, Clone)]
pub struct LineTracker {
    pub line: u32,
}

impl Default for LineTracker {
    fn default() -> Self {
        LineTracker { line: 1 }
    }
}

fn newline(lex: &mut logos::Lexer<TokenKind>) -> logos::Skip {
    lex.extras.line += 1;
    logos::Skip
}

/// String literals may span lines; count the embedded newlines.
fn string_literal(lex: &mut logos::Lexer<TokenKind>) -> String {
    let s = lex.slice();
    lex.extras.line += s.bytes().filter(|b| *b == b'\n').count() as u32;
    s[1..s.len() - 1].to_string()
}

#[derive(Logos, Debug, PartialEq, Clone)]
#[logos(extras = LineTracker)]
#[logos(skip r"[ \t\r]+")]
#[logos(skip(r"//[^\n]*", allow_greedy = true))]
pub enum TokenKind {
    // Punctuation
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token(";")]
    Semicolon,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,
    #[token("..")]
    DotDot,
    #[token("->")]
    Arrow,
    #[token("|")]
    Pipe,

    // Operators; two-character forms win by maximal munch
    #[token("-")]
    Minus,
    #[token("+")]
    Plus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("!")]
    Bang,
    #[token("!=")]
    BangEqual,
    #[token("=")]
    Equal,
    #[token("==")]
    EqualEqual,
    #[token(">")]
    Greater,
    #[token(">=")]
    GreaterEqual,
    #[token("<")]
    Less,
    #[token("<=")]
    LessEqual,

    // Keywords
    #[token("and")]
    And,
    #[token("assert")]
    Assert,
    #[token("class")]
    Class,
    #[token("else")]
    Else,
    #[token("false")]
    False,
    #[token("for")]
    For,
    #[token("fun")]
    Fun,
    #[token("if")]
    If,
    #[token("let")]
    Let,
    #[token("nil")]
    Nil,
    #[token("nothing")]
    Nothing,
    #[token("or")]
    Or,
    #[token("print")]
    Print,
    #[token("return")]
    Return,
    #[token("this")]
    This,
    #[token("true")]
    True,
    #[token("var")]
    Var,
    #[token("when")]
    When,
    #[token("while")]
    While,

    // Literals
    #[regex(r"[0-9]+(\.[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Number(f64),

    #[regex(r#""[^"]*""#, string_literal)]
    Str(String),

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[token("\n", newline)]
    Newline,

    /// Malformed input, carried as a token so the compiler can report it
    /// through its normal error path and keep scanning.
    Error(String),

    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
}

impl Token {
    pub fn eof(line: u32) -> Token {
        Token { kind: TokenKind::Eof, line }
    }
}

/// Pull-based lexer: each call to `next_token` produces exactly one token,
/// then an endless run of `Eof` once the source is exhausted.
pub struct Lexer<'src> {
    inner: logos::Lexer<'src, TokenKind>,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Lexer<'src> {
        Lexer {
            inner: TokenKind::lexer(source),
        }
    }

    pub fn next_token(&mut self) -> Token {
        match self.inner.next() {
            Some(Ok(kind)) => Token {
                kind,
                line: self.inner.extras.line,
            },
            Some(Err(())) => Token {
                kind: TokenKind::Error(describe_bad_input(self.inner.slice())),
                line: self.inner.extras.line,
            },
            None => Token::eof(self.inner.extras.line),
        }
    }
}

fn describe_bad_input(slice: &str) -> String {
    if slice.starts_with('"') {
        "unterminated string".to_string()
    } else {
        format!("unexpected character '{slice}'")
    }
}
