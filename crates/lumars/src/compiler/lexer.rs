// Lexer: byte-at-a-time state machine over a buffered reader, with
// one-token lookahead. Names and string literals are interned as they
// are read; reserved words are classified by the interned string's
// reserved index.

use smol_str::SmolStr;

use crate::gc::StringId;
use crate::lua_value::conversions::str_to_number;
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

/// Reserved words, in token order.
pub const RESERVED_WORDS: [&str; 22] = [
    "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "goto", "if",
    "in", "local", "nil", "not", "or", "repeat", "return", "then", "true", "until", "while",
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Token {
    // Reserved words (same order as RESERVED_WORDS).
    And,
    Break,
    Do,
    Else,
    ElseIf,
    End,
    False,
    For,
    Function,
    Goto,
    If,
    In,
    Local,
    Nil,
    Not,
    Or,
    Repeat,
    Return,
    Then,
    True,
    Until,
    While,
    // Multi-byte symbols.
    Concat,
    Dots,
    Eq,
    Ge,
    Le,
    Ne,
    DbColon,
    Eos,
    // Tokens with payloads.
    Number(f64),
    Name(StringId),
    Str(StringId),
    /// Single-byte punctuation.
    Char(u8),
}

fn reserved_token(index: u8) -> Token {
    match index {
        1 => Token::And,
        2 => Token::Break,
        3 => Token::Do,
        4 => Token::Else,
        5 => Token::ElseIf,
        6 => Token::End,
        7 => Token::False,
        8 => Token::For,
        9 => Token::Function,
        10 => Token::Goto,
        11 => Token::If,
        12 => Token::In,
        13 => Token::Local,
        14 => Token::Nil,
        15 => Token::Not,
        16 => Token::Or,
        17 => Token::Repeat,
        18 => Token::Return,
        19 => Token::Then,
        20 => Token::True,
        21 => Token::Until,
        22 => Token::While,
        _ => unreachable!("bad reserved index"),
    }
}

/// Buffered pull over a chunk-producing callback (the loader input:
/// successive buffers, terminated by None).
pub struct Zio<'a> {
    reader: Box<dyn FnMut() -> Option<Vec<u8>> + 'a>,
    buf: Vec<u8>,
    pos: usize,
}

impl<'a> Zio<'a> {
    pub fn new(reader: Box<dyn FnMut() -> Option<Vec<u8>> + 'a>) -> Self {
        Zio {
            reader,
            buf: Vec::new(),
            pos: 0,
        }
    }

    pub fn from_slice(data: &'a [u8]) -> Self {
        let mut given = false;
        Zio::new(Box::new(move || {
            if given {
                None
            } else {
                given = true;
                Some(data.to_vec())
            }
        }))
    }

    fn next_byte(&mut self) -> Option<u8> {
        loop {
            if self.pos < self.buf.len() {
                let b = self.buf[self.pos];
                self.pos += 1;
                return Some(b);
            }
            match (self.reader)() {
                Some(chunk) if !chunk.is_empty() => {
                    self.buf = chunk;
                    self.pos = 0;
                }
                Some(_) => continue,
                None => return None,
            }
        }
    }
}

pub struct LexState<'a> {
    z: Zio<'a>,
    /// Current byte (None at end of stream).
    current: Option<u8>,
    pub line: u32,
    /// Line of the token consumed before `t`.
    pub lastline: u32,
    pub t: Token,
    ahead: Option<Token>,
    ahead_line: u32,
    pub source: StringId,
    buff: Vec<u8>,
}

impl<'a> LexState<'a> {
    /// Build a lexer over a loader stream, stripping an optional UTF-8
    /// BOM and an optional first-line shebang (replaced by a newline
    /// so line counts are preserved).
    pub fn new(vm: &mut LuaVM, mut z: Zio<'a>, source: StringId) -> Self {
        let mut current = z.next_byte();
        // BOM strip.
        if current == Some(0xEF) {
            let b2 = z.next_byte();
            if b2 == Some(0xBB) {
                let b3 = z.next_byte();
                if b3 == Some(0xBF) {
                    current = z.next_byte();
                } else {
                    current = b3;
                }
            } else {
                current = b2;
            }
        }
        // Shebang skip.
        if current == Some(b'#') {
            loop {
                match z.next_byte() {
                    Some(b'\n') | Some(b'\r') | None => break,
                    _ => {}
                }
            }
            current = Some(b'\n');
        }
        let _ = vm;
        LexState {
            z,
            current,
            line: 1,
            lastline: 1,
            t: Token::Eos,
            ahead: None,
            ahead_line: 1,
            source,
            buff: Vec::with_capacity(32),
        }
    }

    #[inline(always)]
    fn advance(&mut self) {
        self.current = self.z.next_byte();
    }

    #[inline(always)]
    fn save(&mut self, b: u8) {
        self.buff.push(b);
    }

    fn save_and_advance(&mut self) {
        if let Some(b) = self.current {
            self.save(b);
        }
        self.advance();
    }

    fn is_newline(&self) -> bool {
        matches!(self.current, Some(b'\n') | Some(b'\r'))
    }

    /// Skip a newline sequence (\n, \r, \r\n, \n\r), counting lines.
    fn inc_line(&mut self, vm: &mut LuaVM) -> LuaResult<()> {
        let old = self.current;
        debug_assert!(self.is_newline());
        self.advance();
        if self.is_newline() && self.current != old {
            self.advance();
        }
        self.line += 1;
        if self.line == u32::MAX {
            return Err(self.error(vm, "chunk has too many lines", None));
        }
        Ok(())
    }

    // ============ Errors ============

    /// Spelling of a token for messages (identifier-sized, so a small
    /// string avoids the heap for the common cases).
    pub fn token_text(&self, vm: &LuaVM, t: &Token) -> SmolStr {
        match t {
            Token::Number(n) => crate::lua_value::conversions::number_to_str(*n).into(),
            Token::Name(id) | Token::Str(id) => vm.str_display(*id).into(),
            Token::Char(c) => SmolStr::new((*c as char).to_string()),
            Token::Concat => "..".into(),
            Token::Dots => "...".into(),
            Token::Eq => "==".into(),
            Token::Ge => ">=".into(),
            Token::Le => "<=".into(),
            Token::Ne => "~=".into(),
            Token::DbColon => "::".into(),
            Token::Eos => "<eof>".into(),
            Token::And => "and".into(),
            Token::Break => "break".into(),
            Token::Do => "do".into(),
            Token::Else => "else".into(),
            Token::ElseIf => "elseif".into(),
            Token::End => "end".into(),
            Token::False => "false".into(),
            Token::For => "for".into(),
            Token::Function => "function".into(),
            Token::Goto => "goto".into(),
            Token::If => "if".into(),
            Token::In => "in".into(),
            Token::Local => "local".into(),
            Token::Nil => "nil".into(),
            Token::Not => "not".into(),
            Token::Or => "or".into(),
            Token::Repeat => "repeat".into(),
            Token::Return => "return".into(),
            Token::Then => "then".into(),
            Token::True => "true".into(),
            Token::Until => "until".into(),
            Token::While => "while".into(),
        }
    }

    /// Syntax error with raw offending text instead of a token.
    fn error_text(&self, vm: &mut LuaVM, msg: &str, text: &str) -> LuaError {
        let src = crate::lua_vm::debug_info::chunk_id(vm.str_bytes(self.source));
        let full = format!("{}:{}: {} near '{}'", src, self.line, msg, text);
        match vm.new_string(&full) {
            Ok(v) => {
                vm.th_mut().err_obj = v;
                LuaError::Syntax
            }
            Err(_) => LuaError::Mem,
        }
    }

    /// Syntax error "chunk:line: msg [near 'token']".
    pub fn error(&self, vm: &mut LuaVM, msg: &str, near: Option<&Token>) -> LuaError {
        let src = crate::lua_vm::debug_info::chunk_id(vm.str_bytes(self.source));
        let text = match near {
            Some(t) => format!(" near '{}'", self.token_text(vm, t)),
            None => String::new(),
        };
        let full = format!("{}:{}: {}{}", src, self.line, msg, text);
        match vm.new_string(&full) {
            Ok(v) => {
                vm.th_mut().err_obj = v;
                LuaError::Syntax
            }
            Err(_) => LuaError::Mem,
        }
    }

    pub fn error_near(&self, vm: &mut LuaVM, msg: &str) -> LuaError {
        let t = self.t;
        self.error(vm, msg, Some(&t))
    }

    // ============ Token pump ============

    pub fn next(&mut self, vm: &mut LuaVM) -> LuaResult<()> {
        self.lastline = self.line;
        if let Some(t) = self.ahead.take() {
            self.t = t;
            self.line = self.ahead_line.max(self.line);
            return Ok(());
        }
        self.t = self.lex(vm)?;
        Ok(())
    }

    /// One-token lookahead.
    pub fn peek(&mut self, vm: &mut LuaVM) -> LuaResult<Token> {
        if self.ahead.is_none() {
            let save_line = self.line;
            let t = self.lex(vm)?;
            self.ahead = Some(t);
            self.ahead_line = self.line;
            self.line = save_line;
        }
        Ok(self.ahead.unwrap())
    }

    fn lex(&mut self, vm: &mut LuaVM) -> LuaResult<Token> {
        self.buff.clear();
        loop {
            let Some(c) = self.current else {
                return Ok(Token::Eos);
            };
            match c {
                b'\n' | b'\r' => {
                    self.inc_line(vm)?;
                }
                b' ' | b'\t' | 0x0B | 0x0C => self.advance(),
                b'-' => {
                    self.advance();
                    if self.current != Some(b'-') {
                        return Ok(Token::Char(b'-'));
                    }
                    self.advance();
                    if self.current == Some(b'[') {
                        let sep = self.skip_sep();
                        self.buff.clear();
                        if sep >= 0 {
                            self.read_long_string(vm, sep, false)?;
                            self.buff.clear();
                            continue;
                        }
                    }
                    // Short comment: to end of line.
                    while self.current.is_some() && !self.is_newline() {
                        self.advance();
                    }
                }
                b'[' => {
                    let sep = self.skip_sep();
                    if sep >= 0 {
                        let id = self.read_long_string(vm, sep, true)?;
                        return Ok(Token::Str(id.unwrap()));
                    }
                    if sep == -1 {
                        return Ok(Token::Char(b'['));
                    }
                    return Err(self.error(vm, "invalid long string delimiter", None));
                }
                b'=' => {
                    self.advance();
                    if self.current == Some(b'=') {
                        self.advance();
                        return Ok(Token::Eq);
                    }
                    return Ok(Token::Char(b'='));
                }
                b'<' => {
                    self.advance();
                    if self.current == Some(b'=') {
                        self.advance();
                        return Ok(Token::Le);
                    }
                    return Ok(Token::Char(b'<'));
                }
                b'>' => {
                    self.advance();
                    if self.current == Some(b'=') {
                        self.advance();
                        return Ok(Token::Ge);
                    }
                    return Ok(Token::Char(b'>'));
                }
                b'~' => {
                    self.advance();
                    if self.current == Some(b'=') {
                        self.advance();
                        return Ok(Token::Ne);
                    }
                    return Ok(Token::Char(b'~'));
                }
                b':' => {
                    self.advance();
                    if self.current == Some(b':') {
                        self.advance();
                        return Ok(Token::DbColon);
                    }
                    return Ok(Token::Char(b':'));
                }
                b'"' | b'\'' => {
                    return self.read_string(vm, c);
                }
                b'.' => {
                    self.save_and_advance();
                    if self.current == Some(b'.') {
                        self.save_and_advance();
                        if self.current == Some(b'.') {
                            self.advance();
                            return Ok(Token::Dots);
                        }
                        return Ok(Token::Concat);
                    }
                    if !matches!(self.current, Some(b'0'..=b'9')) {
                        return Ok(Token::Char(b'.'));
                    }
                    return self.read_numeral(vm);
                }
                b'0'..=b'9' => {
                    return self.read_numeral(vm);
                }
                _ if c == b'_' || c.is_ascii_alphabetic() => {
                    while let Some(c) = self.current {
                        if c == b'_' || c.is_ascii_alphanumeric() {
                            self.save_and_advance();
                        } else {
                            break;
                        }
                    }
                    let bytes = std::mem::take(&mut self.buff);
                    let v = vm.new_string_bytes(&bytes)?;
                    self.buff = bytes;
                    let id = v.as_string_id().unwrap();
                    let reserved = vm.pool.string(id).reserved;
                    if reserved > 0 {
                        return Ok(reserved_token(reserved));
                    }
                    return Ok(Token::Name(id));
                }
                _ => {
                    self.advance();
                    return Ok(Token::Char(c));
                }
            }
        }
    }

    // ============ Numbers ============

    fn read_numeral(&mut self, vm: &mut LuaVM) -> LuaResult<Token> {
        // Accept a permissive shape, then validate with the numeric
        // parser: digits with radix point, exponents (e/E for decimal,
        // p/P for hex), and sign characters directly after an
        // exponent marker.
        let hex = self.current == Some(b'0') && {
            self.save_and_advance();
            if matches!(self.current, Some(b'x') | Some(b'X')) {
                self.save_and_advance();
                true
            } else {
                false
            }
        };
        let exp_chars: &[u8] = if hex { b"pP" } else { b"eE" };
        while let Some(c) = self.current {
            if exp_chars.contains(&c) {
                self.save_and_advance();
                if matches!(self.current, Some(b'+') | Some(b'-')) {
                    self.save_and_advance();
                }
            } else if c.is_ascii_hexdigit() || c == b'.' {
                self.save_and_advance();
            } else {
                break;
            }
        }
        let text = String::from_utf8_lossy(&self.buff).into_owned();
        match str_to_number(&text) {
            Some(n) => Ok(Token::Number(n)),
            None => Err(self.error_text(vm, "malformed number", &text)),
        }
    }

    // ============ Strings ============

    /// Count `=` signs of a long bracket. Returns the level, or -1
    /// when this is not a long bracket (a lone '['), or -2 on an
    /// unfinished `[=` run. The opening byte is consumed on success.
    fn skip_sep(&mut self) -> i32 {
        debug_assert!(self.current == Some(b'['));
        self.advance();
        let mut count = 0;
        while self.current == Some(b'=') {
            self.advance();
            count += 1;
        }
        if self.current == Some(b'[') {
            self.advance();
            count
        } else if count == 0 {
            -1
        } else {
            -2
        }
    }

    /// Body of a `[[...]]` string or comment; the opening bracket has
    /// been consumed.
    fn read_long_string(
        &mut self,
        vm: &mut LuaVM,
        sep: i32,
        is_string: bool,
    ) -> LuaResult<Option<StringId>> {
        // A newline right after the opening bracket is skipped.
        if self.is_newline() {
            self.inc_line(vm)?;
        }
        loop {
            match self.current {
                None => {
                    let what = if is_string {
                        "unfinished long string"
                    } else {
                        "unfinished long comment"
                    };
                    return Err(self.error(vm, what, Some(&Token::Eos)));
                }
                Some(b']') => {
                    // Possible closing bracket with matching level.
                    self.advance();
                    let mut count = 0;
                    while self.current == Some(b'=') {
                        self.advance();
                        count += 1;
                    }
                    if count == sep && self.current == Some(b']') {
                        self.advance();
                        if is_string {
                            let v = vm.new_string_bytes(&self.buff)?;
                            return Ok(Some(v.as_string_id().unwrap()));
                        }
                        return Ok(None);
                    }
                    if is_string {
                        self.save(b']');
                        for _ in 0..count {
                            self.save(b'=');
                        }
                    }
                }
                Some(b'\n') | Some(b'\r') => {
                    if is_string {
                        self.save(b'\n');
                    }
                    self.inc_line(vm)?;
                }
                Some(c) => {
                    if is_string {
                        self.save(c);
                    }
                    self.advance();
                }
            }
        }
    }

    fn read_string(&mut self, vm: &mut LuaVM, quote: u8) -> LuaResult<Token> {
        self.advance();
        while self.current != Some(quote) {
            match self.current {
                None => return Err(self.error(vm, "unfinished string", Some(&Token::Eos))),
                Some(b'\n') | Some(b'\r') => {
                    return Err(self.error(vm, "unfinished string", None));
                }
                Some(b'\\') => {
                    self.advance();
                    match self.current {
                        Some(b'a') => {
                            self.save(0x07);
                            self.advance();
                        }
                        Some(b'b') => {
                            self.save(0x08);
                            self.advance();
                        }
                        Some(b'f') => {
                            self.save(0x0C);
                            self.advance();
                        }
                        Some(b'n') => {
                            self.save(b'\n');
                            self.advance();
                        }
                        Some(b'r') => {
                            self.save(b'\r');
                            self.advance();
                        }
                        Some(b't') => {
                            self.save(b'\t');
                            self.advance();
                        }
                        Some(b'v') => {
                            self.save(0x0B);
                            self.advance();
                        }
                        Some(b'x') => {
                            self.advance();
                            let mut v: u32 = 0;
                            for _ in 0..2 {
                                let Some(c) = self.current else {
                                    return Err(self.error(vm, "hexadecimal digit expected", None));
                                };
                                if !c.is_ascii_hexdigit() {
                                    return Err(self.error(vm, "hexadecimal digit expected", None));
                                }
                                v = v * 16 + hex_value(c);
                                self.advance();
                            }
                            self.save(v as u8);
                        }
                        Some(b'z') => {
                            // Skip following whitespace, including
                            // newlines.
                            self.advance();
                            while let Some(c) = self.current {
                                if c == b'\n' || c == b'\r' {
                                    self.inc_line(vm)?;
                                } else if c.is_ascii_whitespace() {
                                    self.advance();
                                } else {
                                    break;
                                }
                            }
                        }
                        Some(b'\n') | Some(b'\r') => {
                            self.inc_line(vm)?;
                            self.save(b'\n');
                        }
                        Some(c @ b'0'..=b'9') => {
                            // Up to three decimal digits.
                            let mut v: u32 = 0;
                            let mut n = 0;
                            let mut c = c;
                            loop {
                                v = v * 10 + (c - b'0') as u32;
                                n += 1;
                                self.advance();
                                match self.current {
                                    Some(d @ b'0'..=b'9') if n < 3 => c = d,
                                    _ => break,
                                }
                            }
                            if v > 255 {
                                return Err(self.error(vm, "decimal escape too large", None));
                            }
                            self.save(v as u8);
                        }
                        Some(c @ (b'\\' | b'"' | b'\'')) => {
                            self.save(c);
                            self.advance();
                        }
                        _ => return Err(self.error(vm, "invalid escape sequence", None)),
                    }
                }
                Some(c) => {
                    self.save(c);
                    self.advance();
                }
            }
        }
        self.advance();
        let v = vm.new_string_bytes(&self.buff)?;
        Ok(Token::Str(v.as_string_id().unwrap()))
    }
}

#[inline(always)]
fn hex_value(b: u8) -> u32 {
    match b {
        b'0'..=b'9' => (b - b'0') as u32,
        b'a'..=b'f' => (b - b'a' + 10) as u32,
        _ => (b - b'A' + 10) as u32,
    }
}
