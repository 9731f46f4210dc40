use std::{
    cell::RefCell,
    fmt::{self, Display, Formatter},
    io::Read,
    rc::Rc,
};

use crate::{
    charreader::{CharReaderError, LineReader},
    intern::{PathRef, StrInterner, StrRef},
};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SourceLoc {
    pub pathref: PathRef,
    pub line: u32,
    pub column: u32,
}

#[derive(thiserror::Error, Debug)]
pub enum LexerError {
    #[error("read error: {source}")]
    ReadError {
        loc: SourceLoc,
        source: CharReaderError,
    },

    #[error("malformed number: \"{value}\"")]
    MalformedNumber { loc: SourceLoc, value: String },

    #[error("unterminated string")]
    UnterminatedString { loc: SourceLoc },

    #[error("unrecognized input: \"{value}\"")]
    UnrecognizedInput { loc: SourceLoc, value: String },
}

impl LexerError {
    #[inline]
    pub fn loc(&self) -> SourceLoc {
        match self {
            Self::ReadError { loc, .. } => *loc,
            Self::MalformedNumber { loc, .. } => *loc,
            Self::UnterminatedString { loc } => *loc,
            Self::UnrecognizedInput { loc, .. } => *loc,
        }
    }

    /// Read errors abort the run; everything else is a per-statement
    /// diagnostic.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ReadError { .. })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OperationName {
    Adc,
    Add,
    And,
    Bit,
    Call,
    Ccf,
    Cp,
    Cpd,
    Cpdr,
    Cpi,
    Cpir,
    Cpl,
    Daa,
    Dec,
    Di,
    Djnz,
    Ei,
    Ex,
    Exx,
    Halt,
    Im,
    In,
    Inc,
    Ind,
    Indr,
    Ini,
    Inir,
    Jp,
    Jr,
    Ld,
    Ldd,
    Lddr,
    Ldi,
    Ldir,
    Neg,
    Nop,
    Or,
    Otdr,
    Otir,
    Out,
    Outd,
    Outi,
    Pop,
    Push,
    Res,
    Ret,
    Reti,
    Retn,
    Rl,
    Rla,
    Rlc,
    Rlca,
    Rld,
    Rr,
    Rra,
    Rrc,
    Rrca,
    Rrd,
    Rst,
    Sbc,
    Scf,
    Set,
    Sla,
    Sra,
    Srl,
    Sub,
    Xor,
}

impl OperationName {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "ADC" => Some(Self::Adc),
            "ADD" => Some(Self::Add),
            "AND" => Some(Self::And),
            "BIT" => Some(Self::Bit),
            "CALL" => Some(Self::Call),
            "CCF" => Some(Self::Ccf),
            "CP" => Some(Self::Cp),
            "CPD" => Some(Self::Cpd),
            "CPDR" => Some(Self::Cpdr),
            "CPI" => Some(Self::Cpi),
            "CPIR" => Some(Self::Cpir),
            "CPL" => Some(Self::Cpl),
            "DAA" => Some(Self::Daa),
            "DEC" => Some(Self::Dec),
            "DI" => Some(Self::Di),
            "DJNZ" => Some(Self::Djnz),
            "EI" => Some(Self::Ei),
            "EX" => Some(Self::Ex),
            "EXX" => Some(Self::Exx),
            "HALT" => Some(Self::Halt),
            "IM" => Some(Self::Im),
            "IN" => Some(Self::In),
            "INC" => Some(Self::Inc),
            "IND" => Some(Self::Ind),
            "INDR" => Some(Self::Indr),
            "INI" => Some(Self::Ini),
            "INIR" => Some(Self::Inir),
            "JP" => Some(Self::Jp),
            "JR" => Some(Self::Jr),
            "LD" => Some(Self::Ld),
            "LDD" => Some(Self::Ldd),
            "LDDR" => Some(Self::Lddr),
            "LDI" => Some(Self::Ldi),
            "LDIR" => Some(Self::Ldir),
            "NEG" => Some(Self::Neg),
            "NOP" => Some(Self::Nop),
            "OR" => Some(Self::Or),
            "OTDR" | "OUTDR" => Some(Self::Otdr),
            "OTIR" | "OUTIR" => Some(Self::Otir),
            "OUT" => Some(Self::Out),
            "OUTD" => Some(Self::Outd),
            "OUTI" => Some(Self::Outi),
            "POP" => Some(Self::Pop),
            "PUSH" => Some(Self::Push),
            "RES" => Some(Self::Res),
            "RET" => Some(Self::Ret),
            "RETI" => Some(Self::Reti),
            "RETN" => Some(Self::Retn),
            "RL" => Some(Self::Rl),
            "RLA" => Some(Self::Rla),
            "RLC" => Some(Self::Rlc),
            "RLCA" => Some(Self::Rlca),
            "RLD" => Some(Self::Rld),
            "RR" => Some(Self::Rr),
            "RRA" => Some(Self::Rra),
            "RRC" => Some(Self::Rrc),
            "RRCA" => Some(Self::Rrca),
            "RRD" => Some(Self::Rrd),
            "RST" => Some(Self::Rst),
            "SBC" => Some(Self::Sbc),
            "SCF" => Some(Self::Scf),
            "SET" => Some(Self::Set),
            "SLA" => Some(Self::Sla),
            "SRA" => Some(Self::Sra),
            "SRL" => Some(Self::Srl),
            "SUB" => Some(Self::Sub),
            "XOR" => Some(Self::Xor),
            _ => None,
        }
    }
}

impl Display for OperationName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format!("{self:?}").to_uppercase())
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DirectiveName {
    Include,
    Cseg,
    Dseg,
    Public,
    Extrn,
    Defb,
    Defw,
    Defs,
    Equ,
}

impl DirectiveName {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "INCLUDE" => Some(Self::Include),
            "CSEG" => Some(Self::Cseg),
            "DSEG" => Some(Self::Dseg),
            "PUBLIC" => Some(Self::Public),
            "EXTRN" | "EXT" => Some(Self::Extrn),
            "DEFB" | "DB" => Some(Self::Defb),
            "DEFW" | "DW" => Some(Self::Defw),
            "DEFS" | "DS" => Some(Self::Defs),
            "EQU" => Some(Self::Equ),
            _ => None,
        }
    }
}

impl Display for DirectiveName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format!("{self:?}").to_uppercase())
    }
}

/// Structured-flow keywords.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum KeywordName {
    If,
    Else,
    ElseIf,
    EndIf,
    Do,
    While,
    Wend,
    Dwnz,
}

impl KeywordName {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "IF" => Some(Self::If),
            "ELSE" => Some(Self::Else),
            "ELSEIF" => Some(Self::ElseIf),
            "ENDIF" => Some(Self::EndIf),
            "DO" => Some(Self::Do),
            "WHILE" => Some(Self::While),
            "WEND" => Some(Self::Wend),
            "DWNZ" => Some(Self::Dwnz),
            _ => None,
        }
    }
}

impl Display for KeywordName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format!("{self:?}").to_uppercase())
    }
}

/// Word-shaped expression operators. `OR`/`XOR`/`AND` arrive as
/// operations and double as operators inside expressions.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OperatorName {
    Shl,
    Shr,
    Mod,
    Not,
    Low,
    High,
}

impl OperatorName {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "SHL" => Some(Self::Shl),
            "SHR" => Some(Self::Shr),
            "MOD" => Some(Self::Mod),
            "NOT" => Some(Self::Not),
            "LOW" => Some(Self::Low),
            "HIGH" => Some(Self::High),
            _ => None,
        }
    }
}

impl Display for OperatorName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format!("{self:?}").to_uppercase())
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegisterName {
    A,
    B,
    C,
    D,
    E,
    H,
    L,
    I,
    R,
    AF,
    BC,
    DE,
    HL,
    SP,
    IX,
    IY,
    AFPrime,
}

impl RegisterName {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "A" => Some(Self::A),
            "B" => Some(Self::B),
            "C" => Some(Self::C),
            "D" => Some(Self::D),
            "E" => Some(Self::E),
            "H" => Some(Self::H),
            "L" => Some(Self::L),
            "I" => Some(Self::I),
            "R" => Some(Self::R),
            "AF" => Some(Self::AF),
            "BC" => Some(Self::BC),
            "DE" => Some(Self::DE),
            "HL" => Some(Self::HL),
            "SP" => Some(Self::SP),
            "IX" => Some(Self::IX),
            "IY" => Some(Self::IY),
            "AF'" => Some(Self::AFPrime),
            _ => None,
        }
    }
}

impl Display for RegisterName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::AFPrime => write!(f, "AF'"),
            _ => write!(f, "{}", format!("{self:?}").to_uppercase()),
        }
    }
}

/// Condition codes other than carry; carry arrives as the register `C`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FlagName {
    NotZero,
    Zero,
    NotCarry,
    ParityOdd,
    ParityEven,
    Positive,
    Negative,
}

impl FlagName {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "NZ" => Some(Self::NotZero),
            "Z" => Some(Self::Zero),
            "NC" => Some(Self::NotCarry),
            "PO" => Some(Self::ParityOdd),
            "PE" => Some(Self::ParityEven),
            "P" => Some(Self::Positive),
            "M" => Some(Self::Negative),
            _ => None,
        }
    }
}

impl Display for FlagName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::NotZero => "NZ",
                Self::Zero => "Z",
                Self::NotCarry => "NC",
                Self::ParityOdd => "PO",
                Self::ParityEven => "PE",
                Self::Positive => "P",
                Self::Negative => "M",
            }
        )
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SymbolName {
    ParenOpen,
    ParenClose,
    Plus,
    Minus,
    Star,
    Div,
    Comma,
    Colon,
    Pipe,
}

impl SymbolName {
    fn parse(c: char) -> Option<Self> {
        match c {
            '(' => Some(Self::ParenOpen),
            ')' => Some(Self::ParenClose),
            '+' => Some(Self::Plus),
            '-' => Some(Self::Minus),
            '*' => Some(Self::Star),
            '/' => Some(Self::Div),
            ',' => Some(Self::Comma),
            ':' => Some(Self::Colon),
            '|' => Some(Self::Pipe),
            _ => None,
        }
    }
}

impl Display for SymbolName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::ParenOpen => "(",
                Self::ParenClose => ")",
                Self::Plus => "+",
                Self::Minus => "-",
                Self::Star => "*",
                Self::Div => "/",
                Self::Comma => ",",
                Self::Colon => ":",
                Self::Pipe => "|",
            }
        )
    }
}

#[derive(Debug, Copy, Clone)]
pub enum Token {
    NewLine { loc: SourceLoc },
    String { loc: SourceLoc, value: StrRef },
    Number { loc: SourceLoc, value: i32 },
    Operation { loc: SourceLoc, name: OperationName },
    Directive { loc: SourceLoc, name: DirectiveName },
    Keyword { loc: SourceLoc, name: KeywordName },
    Operator { loc: SourceLoc, name: OperatorName },
    Register { loc: SourceLoc, name: RegisterName },
    Flag { loc: SourceLoc, name: FlagName },
    Identifier { loc: SourceLoc, value: StrRef },
    Symbol { loc: SourceLoc, name: SymbolName },
}

impl Token {
    #[inline]
    pub fn loc(&self) -> SourceLoc {
        match self {
            Self::NewLine { loc }
            | Self::String { loc, .. }
            | Self::Number { loc, .. }
            | Self::Operation { loc, .. }
            | Self::Directive { loc, .. }
            | Self::Keyword { loc, .. }
            | Self::Operator { loc, .. }
            | Self::Register { loc, .. }
            | Self::Flag { loc, .. }
            | Self::Identifier { loc, .. }
            | Self::Symbol { loc, .. } => *loc,
        }
    }

    pub fn as_display(&self, interner: &Rc<RefCell<StrInterner>>) -> String {
        match self {
            Self::NewLine { .. } => "end of line".to_string(),
            Self::String { value, .. } => {
                let interner = interner.as_ref().borrow();
                format!("the string \"{}\"", interner.get(*value).unwrap_or(""))
            }
            Self::Number { value, .. } => format!("the number {value}"),
            Self::Operation { name, .. } => format!("\"{name}\""),
            Self::Directive { name, .. } => format!("\"{name}\""),
            Self::Keyword { name, .. } => format!("\"{name}\""),
            Self::Operator { name, .. } => format!("\"{name}\""),
            Self::Register { name, .. } => format!("the register \"{name}\""),
            Self::Flag { name, .. } => format!("the condition \"{name}\""),
            Self::Identifier { value, .. } => {
                let interner = interner.as_ref().borrow();
                format!("the identifier \"{}\"", interner.get(*value).unwrap_or(""))
            }
            Self::Symbol { name, .. } => format!("\"{name}\""),
        }
    }
}

enum State {
    Initial,
    InComment,
    InString,
    InNumber,
    InIdentifier,
}

#[inline]
fn is_identifier_start(c: char) -> bool {
    c.is_ascii_alphabetic() || matches!(c, '_' | '$' | '.' | '?' | '@')
}

#[inline]
fn is_identifier_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '.' | '?' | '@' | '\'')
}

pub struct Lexer<R> {
    str_interner: Rc<RefCell<StrInterner>>,
    loc: SourceLoc,
    tok_loc: SourceLoc,
    reader: LineReader<R>,
    stash: Option<char>,
    state: State,
    buffer: String,
    quote: char,
    eof: bool,
}

impl<R: Read> Lexer<R> {
    pub fn new(str_interner: Rc<RefCell<StrInterner>>, pathref: PathRef, reader: R) -> Self {
        Self {
            str_interner,
            loc: SourceLoc {
                pathref,
                line: 1,
                column: 0,
            },
            tok_loc: SourceLoc {
                pathref,
                line: 1,
                column: 0,
            },
            reader: LineReader::new(reader),
            stash: None,
            state: State::Initial,
            buffer: String::new(),
            quote: '"',
            eof: false,
        }
    }

    /// The source text of the line terminated by the most recent
    /// `NewLine` token.
    #[inline]
    pub fn take_line(&mut self) -> String {
        self.reader.take_line()
    }

    /// The text accumulated so far on the current line (used to list an
    /// `INCLUDE` line before switching files).
    #[inline]
    pub fn flush_partial_line(&mut self) -> String {
        self.reader.flush_line();
        self.reader.take_line()
    }

    fn number(&mut self) -> Result<Token, LexerError> {
        let text = self.buffer.to_uppercase();
        let malformed = || LexerError::MalformedNumber {
            loc: self.tok_loc,
            value: text.clone(),
        };
        let value = if let Some(digits) = text.strip_suffix('H') {
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(malformed());
            }
            i64::from_str_radix(digits, 16).map_err(|_| malformed())?
        } else {
            if !text.bytes().all(|b| b.is_ascii_digit()) {
                return Err(malformed());
            }
            text.parse::<i64>().map_err(|_| malformed())?
        };
        if value > i32::MAX as i64 {
            return Err(malformed());
        }
        Ok(Token::Number {
            loc: self.tok_loc,
            value: value as i32,
        })
    }

    fn identifier(&mut self) -> Token {
        let text = self.buffer.to_uppercase();
        let loc = self.tok_loc;
        if let Some(name) = OperationName::parse(&text) {
            return Token::Operation { loc, name };
        }
        if let Some(name) = DirectiveName::parse(&text) {
            return Token::Directive { loc, name };
        }
        if let Some(name) = KeywordName::parse(&text) {
            return Token::Keyword { loc, name };
        }
        if let Some(name) = OperatorName::parse(&text) {
            return Token::Operator { loc, name };
        }
        if let Some(name) = RegisterName::parse(&text) {
            return Token::Register { loc, name };
        }
        if let Some(name) = FlagName::parse(&text) {
            return Token::Flag { loc, name };
        }
        let value = self.str_interner.borrow_mut().intern(&text);
        Token::Identifier { loc, value }
    }
}

impl<R: Read> Iterator for Lexer<R> {
    type Item = Result<Token, LexerError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let c = match self.stash.take() {
                Some(c) => c,
                None => match self.reader.next() {
                    None => {
                        if self.eof {
                            return None;
                        }
                        self.eof = true;
                        if matches!(self.state, State::Initial) && self.reader.line_is_empty() {
                            return None;
                        }
                        // Pretend the file ends with a newline so the
                        // last line terminates normally.
                        self.reader.flush_line();
                        '\n'
                    }
                    Some(Err(e)) => {
                        return Some(Err(LexerError::ReadError {
                            loc: self.loc,
                            source: e,
                        }));
                    }
                    Some(Ok(c)) => {
                        self.loc.column += 1;
                        c
                    }
                },
            };

            match self.state {
                State::Initial => match c {
                    '\n' => {
                        let loc = self.loc;
                        self.loc.line += 1;
                        self.loc.column = 0;
                        return Some(Ok(Token::NewLine { loc }));
                    }

                    _ if c.is_whitespace() => continue,

                    ';' => {
                        self.state = State::InComment;
                    }

                    '"' | '\'' => {
                        self.state = State::InString;
                        self.quote = c;
                        self.tok_loc = self.loc;
                        self.buffer.clear();
                    }

                    '0'..='9' => {
                        self.state = State::InNumber;
                        self.tok_loc = self.loc;
                        self.buffer.clear();
                        self.buffer.push(c);
                    }

                    _ if is_identifier_start(c) => {
                        self.state = State::InIdentifier;
                        self.tok_loc = self.loc;
                        self.buffer.clear();
                        self.buffer.push(c);
                    }

                    _ => match SymbolName::parse(c) {
                        Some(name) => {
                            return Some(Ok(Token::Symbol {
                                loc: self.loc,
                                name,
                            }))
                        }
                        None => {
                            return Some(Err(LexerError::UnrecognizedInput {
                                loc: self.loc,
                                value: format!("{c}"),
                            }))
                        }
                    },
                },

                State::InComment => match c {
                    '\n' => {
                        self.state = State::Initial;
                        self.stash = Some(c);
                    }

                    _ => {}
                },

                State::InString => match c {
                    '\n' => {
                        self.state = State::Initial;
                        self.stash = Some(c);
                        return Some(Err(LexerError::UnterminatedString { loc: self.tok_loc }));
                    }

                    _ if c == self.quote => {
                        self.state = State::Initial;
                        let value = self.str_interner.borrow_mut().intern(&self.buffer);
                        return Some(Ok(Token::String {
                            loc: self.tok_loc,
                            value,
                        }));
                    }

                    _ => self.buffer.push(c),
                },

                State::InNumber => match c {
                    _ if c.is_ascii_alphanumeric() => self.buffer.push(c),

                    _ => {
                        self.state = State::Initial;
                        self.stash = Some(c);
                        return Some(self.number());
                    }
                },

                State::InIdentifier => match c {
                    _ if is_identifier_continue(c) => self.buffer.push(c),

                    _ => {
                        self.state = State::Initial;
                        self.stash = Some(c);
                        return Some(Ok(self.identifier()));
                    }
                },
            }
        }
    }
}
