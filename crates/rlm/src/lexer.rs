use crate::error::{ExecResult, ExecutionError};

#[derive(Clone, Debug, PartialEq)]
pub enum TokKind {
    Int(i64),
    Float(f64),
    Str(String),
    /// Inner text of an f-string, escapes still raw; the parser splits the
    /// brace structure and recursively parses embedded expressions.
    FStr { text: String, raw: bool },
    Bytes(Vec<u8>),
    Name(String),
    Kw(Kw),
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Shl,
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    Ne,
    Assign,
    AugAssign(crate::ast::BinOp),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Semicolon,
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kw {
    And,
    Or,
    Not,
    If,
    Elif,
    Else,
    For,
    While,
    Break,
    Continue,
    Pass,
    Def,
    Return,
    Lambda,
    In,
    Is,
    True,
    False,
    None,
    Try,
    Except,
    Finally,
    Raise,
    As,
    Import,
    From,
    Class,
    Global,
    Nonlocal,
    Del,
    With,
    Async,
    Await,
    Yield,
    Assert,
}

fn keyword(name: &str) -> Option<Kw> {
    Some(match name {
        "and" => Kw::And,
        "or" => Kw::Or,
        "not" => Kw::Not,
        "if" => Kw::If,
        "elif" => Kw::Elif,
        "else" => Kw::Else,
        "for" => Kw::For,
        "while" => Kw::While,
        "break" => Kw::Break,
        "continue" => Kw::Continue,
        "pass" => Kw::Pass,
        "def" => Kw::Def,
        "return" => Kw::Return,
        "lambda" => Kw::Lambda,
        "in" => Kw::In,
        "is" => Kw::Is,
        "True" => Kw::True,
        "False" => Kw::False,
        "None" => Kw::None,
        "try" => Kw::Try,
        "except" => Kw::Except,
        "finally" => Kw::Finally,
        "raise" => Kw::Raise,
        "as" => Kw::As,
        "import" => Kw::Import,
        "from" => Kw::From,
        "class" => Kw::Class,
        "global" => Kw::Global,
        "nonlocal" => Kw::Nonlocal,
        "del" => Kw::Del,
        "with" => Kw::With,
        "async" => Kw::Async,
        "await" => Kw::Await,
        "yield" => Kw::Yield,
        "assert" => Kw::Assert,
        _ => return None,
    })
}

#[derive(Clone, Debug)]
pub struct Tok {
    pub kind: TokKind,
    pub line: usize,
    pub col: usize,
}

pub fn tokenize(source: &str) -> ExecResult<Vec<Tok>> {
    Lexer::new(source).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
    paren_depth: usize,
    indents: Vec<usize>,
    toks: Vec<Tok>,
    at_line_start: bool,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            paren_depth: 0,
            indents: vec![0],
            toks: Vec::new(),
            at_line_start: true,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += 1;
        if ch == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(ch)
    }

    fn err(&self, message: impl AsRef<str>) -> ExecutionError {
        ExecutionError::syntax(self.line, self.col, message)
    }

    fn push(&mut self, kind: TokKind) {
        self.toks.push(Tok {
            kind,
            line: self.line,
            col: self.col,
        });
    }

    fn run(mut self) -> ExecResult<Vec<Tok>> {
        while self.pos < self.chars.len() {
            if self.at_line_start && self.paren_depth == 0 {
                self.handle_indentation()?;
                if self.pos >= self.chars.len() {
                    break;
                }
            }
            let Some(ch) = self.peek() else { break };
            match ch {
                ' ' | '\t' => {
                    self.bump();
                }
                '#' => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                '\r' => {
                    self.bump();
                }
                '\n' => {
                    self.bump();
                    if self.paren_depth == 0 {
                        if !matches!(
                            self.toks.last().map(|t| &t.kind),
                            None | Some(TokKind::Newline) | Some(TokKind::Indent)
                                | Some(TokKind::Dedent)
                        ) {
                            self.push(TokKind::Newline);
                        }
                        self.at_line_start = true;
                    }
                }
                '\\' if self.peek_at(1) == Some('\n')
                    || (self.peek_at(1) == Some('\r') && self.peek_at(2) == Some('\n')) =>
                {
                    self.bump();
                    while self.peek() == Some('\r') {
                        self.bump();
                    }
                    self.bump();
                }
                c if c.is_ascii_digit() => self.lex_number()?,
                '.' if self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) => {
                    self.lex_number()?
                }
                '"' | '\'' => self.lex_string("")?,
                c if c.is_alphabetic() || c == '_' => self.lex_name()?,
                _ => self.lex_operator()?,
            }
        }
        if !matches!(
            self.toks.last().map(|t| &t.kind),
            None | Some(TokKind::Newline)
        ) {
            self.push(TokKind::Newline);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(TokKind::Dedent);
        }
        self.push(TokKind::Eof);
        Ok(self.toks)
    }

    /// Measures leading whitespace of a logical line and emits Indent/Dedent
    /// tokens. Blank and comment-only lines produce nothing.
    fn handle_indentation(&mut self) -> ExecResult<()> {
        loop {
            let mut width = 0usize;
            while let Some(c) = self.peek() {
                match c {
                    ' ' => {
                        width += 1;
                        self.bump();
                    }
                    '\t' => {
                        width = (width / 8 + 1) * 8;
                        self.bump();
                    }
                    _ => break,
                }
            }
            match self.peek() {
                Some('\n') => {
                    self.bump();
                    continue;
                }
                Some('\r') => {
                    self.bump();
                    continue;
                }
                Some('#') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                    continue;
                }
                None => {
                    self.at_line_start = false;
                    return Ok(());
                }
                _ => {
                    self.at_line_start = false;
                    let current = *self.indents.last().expect("indent stack is never empty");
                    if width > current {
                        self.indents.push(width);
                        self.push(TokKind::Indent);
                    } else if width < current {
                        while *self.indents.last().expect("indent stack") > width {
                            self.indents.pop();
                            self.push(TokKind::Dedent);
                        }
                        if *self.indents.last().expect("indent stack") != width {
                            return Err(self.err("unindent does not match any outer level"));
                        }
                    }
                    return Ok(());
                }
            }
        }
    }

    fn lex_number(&mut self) -> ExecResult<()> {
        let (line, col) = (self.line, self.col);
        let mut text = String::new();
        if self.peek() == Some('0')
            && matches!(
                self.peek_at(1),
                Some('x') | Some('X') | Some('o') | Some('O') | Some('b') | Some('B')
            )
        {
            self.bump();
            let base_ch = self.bump().expect("radix prefix");
            let radix = match base_ch.to_ascii_lowercase() {
                'x' => 16,
                'o' => 8,
                _ => 2,
            };
            while let Some(c) = self.peek() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    text.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
            let digits = text.replace('_', "");
            let value = i64::from_str_radix(&digits, radix)
                .map_err(|_| ExecutionError::syntax(line, col, "invalid integer literal"))?;
            self.toks.push(Tok {
                kind: TokKind::Int(value),
                line,
                col,
            });
            return Ok(());
        }
        let mut is_float = false;
        while let Some(c) = self.peek() {
            match c {
                '0'..='9' | '_' => {
                    text.push(c);
                    self.bump();
                }
                '.' if !is_float && self.peek_at(1) != Some('.') => {
                    is_float = true;
                    text.push(c);
                    self.bump();
                }
                'e' | 'E'
                    if self
                        .peek_at(1)
                        .is_some_and(|n| n.is_ascii_digit() || n == '+' || n == '-') =>
                {
                    is_float = true;
                    text.push(c);
                    self.bump();
                    if matches!(self.peek(), Some('+') | Some('-')) {
                        text.push(self.bump().expect("sign"));
                    }
                }
                _ => break,
            }
        }
        let digits = text.replace('_', "");
        let kind = if is_float {
            let value: f64 = digits
                .parse()
                .map_err(|_| ExecutionError::syntax(line, col, "invalid float literal"))?;
            TokKind::Float(value)
        } else {
            let value: i64 = digits
                .parse()
                .map_err(|_| ExecutionError::syntax(line, col, "integer literal too large"))?;
            TokKind::Int(value)
        };
        self.toks.push(Tok { kind, line, col });
        Ok(())
    }

    fn lex_name(&mut self) -> ExecResult<()> {
        let (line, col) = (self.line, self.col);
        let mut name = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                name.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if matches!(self.peek(), Some('"') | Some('\'')) {
            let lowered = name.to_ascii_lowercase();
            if lowered.chars().all(|c| matches!(c, 'r' | 'b' | 'f')) && lowered.len() <= 2 {
                return self.lex_string(&lowered);
            }
        }
        let kind = match keyword(&name) {
            Some(kw) => TokKind::Kw(kw),
            None => TokKind::Name(name),
        };
        self.toks.push(Tok { kind, line, col });
        Ok(())
    }

    fn lex_string(&mut self, prefix: &str) -> ExecResult<()> {
        let (line, col) = (self.line, self.col);
        let raw = prefix.contains('r');
        let is_bytes = prefix.contains('b');
        let is_fstr = prefix.contains('f');
        if is_bytes && is_fstr {
            return Err(self.err("bytes literal cannot be an f-string"));
        }
        let quote = self.bump().expect("opening quote");
        let triple = self.peek() == Some(quote) && self.peek_at(1) == Some(quote);
        if triple {
            self.bump();
            self.bump();
        }
        let mut text = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(ExecutionError::syntax(line, col, "unterminated string literal"));
            };
            if c == quote {
                if triple {
                    if self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote) {
                        self.bump();
                        self.bump();
                        self.bump();
                        break;
                    }
                    text.push(c);
                    self.bump();
                } else {
                    self.bump();
                    break;
                }
            } else if c == '\\' {
                // keep escapes raw here; decoding happens below (or in the
                // f-string parser) so quote-escapes don't end the literal
                text.push(c);
                self.bump();
                if let Some(next) = self.peek() {
                    text.push(next);
                    self.bump();
                }
            } else if c == '\n' && !triple {
                return Err(ExecutionError::syntax(line, col, "unterminated string literal"));
            } else {
                text.push(c);
                self.bump();
            }
        }
        let kind = if is_fstr {
            TokKind::FStr { text, raw }
        } else if is_bytes {
            let decoded = if raw {
                text.bytes().collect()
            } else {
                decode_bytes_escapes(&text).map_err(|m| ExecutionError::syntax(line, col, m))?
            };
            TokKind::Bytes(decoded)
        } else {
            let decoded = if raw {
                text
            } else {
                decode_str_escapes(&text).map_err(|m| ExecutionError::syntax(line, col, m))?
            };
            TokKind::Str(decoded)
        };
        self.toks.push(Tok { kind, line, col });
        Ok(())
    }

    fn lex_operator(&mut self) -> ExecResult<()> {
        use crate::ast::BinOp;
        let (line, col) = (self.line, self.col);
        let ch = self.bump().expect("operator char");
        let next = self.peek();
        let after = self.peek_at(1);
        let (extra, kind) = match (ch, next, after) {
            ('*', Some('*'), Some('=')) => (2, TokKind::AugAssign(BinOp::Pow)),
            ('*', Some('*'), _) => (1, TokKind::DoubleStar),
            ('*', Some('='), _) => (1, TokKind::AugAssign(BinOp::Mul)),
            ('*', _, _) => (0, TokKind::Star),
            ('/', Some('/'), Some('=')) => (2, TokKind::AugAssign(BinOp::FloorDiv)),
            ('/', Some('/'), _) => (1, TokKind::DoubleSlash),
            ('/', Some('='), _) => (1, TokKind::AugAssign(BinOp::Div)),
            ('/', _, _) => (0, TokKind::Slash),
            ('+', Some('='), _) => (1, TokKind::AugAssign(BinOp::Add)),
            ('+', _, _) => (0, TokKind::Plus),
            ('-', Some('='), _) => (1, TokKind::AugAssign(BinOp::Sub)),
            ('-', _, _) => (0, TokKind::Minus),
            ('%', Some('='), _) => (1, TokKind::AugAssign(BinOp::Mod)),
            ('%', _, _) => (0, TokKind::Percent),
            ('&', Some('='), _) => (1, TokKind::AugAssign(BinOp::BitAnd)),
            ('&', _, _) => (0, TokKind::Amp),
            ('|', Some('='), _) => (1, TokKind::AugAssign(BinOp::BitOr)),
            ('|', _, _) => (0, TokKind::Pipe),
            ('^', Some('='), _) => (1, TokKind::AugAssign(BinOp::BitXor)),
            ('^', _, _) => (0, TokKind::Caret),
            ('~', _, _) => (0, TokKind::Tilde),
            ('<', Some('<'), Some('=')) => (2, TokKind::AugAssign(BinOp::Shl)),
            ('<', Some('<'), _) => (1, TokKind::Shl),
            ('<', Some('='), _) => (1, TokKind::Le),
            ('<', _, _) => (0, TokKind::Lt),
            ('>', Some('>'), Some('=')) => (2, TokKind::AugAssign(BinOp::Shr)),
            ('>', Some('>'), _) => (1, TokKind::Shr),
            ('>', Some('='), _) => (1, TokKind::Ge),
            ('>', _, _) => (0, TokKind::Gt),
            ('=', Some('='), _) => (1, TokKind::EqEq),
            ('=', _, _) => (0, TokKind::Assign),
            ('!', Some('='), _) => (1, TokKind::Ne),
            ('(', _, _) => (0, TokKind::LParen),
            (')', _, _) => (0, TokKind::RParen),
            ('[', _, _) => (0, TokKind::LBracket),
            (']', _, _) => (0, TokKind::RBracket),
            ('{', _, _) => (0, TokKind::LBrace),
            ('}', _, _) => (0, TokKind::RBrace),
            (',', _, _) => (0, TokKind::Comma),
            (':', _, _) => (0, TokKind::Colon),
            ('.', _, _) => (0, TokKind::Dot),
            (';', _, _) => (0, TokKind::Semicolon),
            _ => {
                return Err(ExecutionError::syntax(
                    line,
                    col,
                    format!("unexpected character '{ch}'"),
                ));
            }
        };
        match kind {
            TokKind::LParen | TokKind::LBracket | TokKind::LBrace => self.paren_depth += 1,
            TokKind::RParen | TokKind::RBracket | TokKind::RBrace => {
                self.paren_depth = self.paren_depth.saturating_sub(1);
            }
            _ => {}
        }
        for _ in 0..extra {
            self.bump();
        }
        self.toks.push(Tok { kind, line, col });
        Ok(())
    }
}

pub fn decode_str_escapes(text: &str) -> Result<String, String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('0') => out.push('\0'),
            Some('a') => out.push('\x07'),
            Some('b') => out.push('\x08'),
            Some('f') => out.push('\x0c'),
            Some('v') => out.push('\x0b'),
            Some('\n') => {}
            Some('x') => {
                let hi = chars.next().ok_or("truncated \\x escape")?;
                let lo = chars.next().ok_or("truncated \\x escape")?;
                let byte = u8::from_str_radix(&format!("{hi}{lo}"), 16)
                    .map_err(|_| "invalid \\x escape")?;
                out.push(byte as char);
            }
            Some('u') => {
                let mut code = String::new();
                for _ in 0..4 {
                    code.push(chars.next().ok_or("truncated \\u escape")?);
                }
                let code = u32::from_str_radix(&code, 16).map_err(|_| "invalid \\u escape")?;
                out.push(char::from_u32(code).ok_or("invalid \\u escape")?);
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    Ok(out)
}

pub fn decode_bytes_escapes(text: &str) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            if !c.is_ascii() {
                return Err("bytes literal may only contain ASCII characters".to_owned());
            }
            out.push(c as u8);
            continue;
        }
        match chars.next() {
            Some('n') => out.push(b'\n'),
            Some('t') => out.push(b'\t'),
            Some('r') => out.push(b'\r'),
            Some('\\') => out.push(b'\\'),
            Some('\'') => out.push(b'\''),
            Some('"') => out.push(b'"'),
            Some('0') => out.push(0),
            Some('\n') => {}
            Some('x') => {
                let hi = chars.next().ok_or("truncated \\x escape")?;
                let lo = chars.next().ok_or("truncated \\x escape")?;
                let byte = u8::from_str_radix(&format!("{hi}{lo}"), 16)
                    .map_err(|_| "invalid \\x escape")?;
                out.push(byte);
            }
            Some(other) => {
                out.push(b'\\');
                if !other.is_ascii() {
                    return Err("bytes literal may only contain ASCII characters".to_owned());
                }
                out.push(other as u8);
            }
            None => out.push(b'\\'),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokKind> {
        tokenize(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn tokenizes_assignment() {
        let toks = kinds("x = 1 + 2\n");
        assert_eq!(
            toks,
            vec![
                TokKind::Name("x".to_owned()),
                TokKind::Assign,
                TokKind::Int(1),
                TokKind::Plus,
                TokKind::Int(2),
                TokKind::Newline,
                TokKind::Eof,
            ]
        );
    }

    #[test]
    fn indentation_produces_indent_dedent() {
        let toks = kinds("if x:\n    y = 1\nz = 2\n");
        assert!(toks.contains(&TokKind::Indent));
        assert!(toks.contains(&TokKind::Dedent));
    }

    #[test]
    fn newlines_inside_parens_are_joined() {
        let toks = kinds("x = [1,\n     2]\n");
        let newlines = toks
            .iter()
            .filter(|k| matches!(k, TokKind::Newline))
            .count();
        assert_eq!(newlines, 1);
    }

    #[test]
    fn string_escapes_decode() {
        let toks = kinds(r#"s = 'a\nb\x41'"#);
        assert!(toks.contains(&TokKind::Str("a\nbA".to_owned())));
    }

    #[test]
    fn fstring_keeps_raw_text() {
        let toks = kinds(r#"f"{x}!""#);
        assert!(toks.iter().any(|k| matches!(
            k,
            TokKind::FStr { text, .. } if text == "{x}!"
        )));
    }

    #[test]
    fn bytes_literal() {
        let toks = kinds(r#"b'ab\x00'"#);
        assert!(toks.contains(&TokKind::Bytes(vec![b'a', b'b', 0])));
    }

    #[test]
    fn bad_dedent_is_syntax_error() {
        let err = tokenize("if x:\n    y = 1\n  z = 2\n").unwrap_err();
        assert!(err.message.contains("unindent"));
    }

    #[test]
    fn triple_quoted_string_spans_lines() {
        let toks = kinds("s = '''a\nb'''\n");
        assert!(toks.contains(&TokKind::Str("a\nb".to_owned())));
    }

    #[test]
    fn hex_and_underscored_ints() {
        let toks = kinds("a = 0xff\nb = 1_000\n");
        assert!(toks.contains(&TokKind::Int(255)));
        assert!(toks.contains(&TokKind::Int(1000)));
    }
}
