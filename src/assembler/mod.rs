use std::{cell::RefCell, fmt, io::Read, mem, path::Path, rc::Rc};

use fxhash::FxHashSet;

use crate::{
    addr::{AddrKind, Address, Part},
    fileman::{FileManager, FileSystem},
    intern::{PathRef, StrInterner, StrRef},
    lexer::{
        DirectiveName, FlagName, KeywordName, Lexer, LexerError, OperationName, OperatorName,
        RegisterName, SourceLoc, SymbolName, Token,
    },
    listing::{Listing, ListingLine},
    object::Object,
    segment::Segment,
    symtab::{Define, Symtab},
};

#[cfg(test)]
mod tests;

const MAX_ERROR_COUNT: usize = 100;
const MAX_PASS_COUNT: u32 = 32;
const FIRST_AUTO_LABEL: u16 = 0x8000;

#[derive(thiserror::Error, Debug)]
#[error("{0}")]
pub struct AssemblerError(String);

/// Statement-level failures are reported and the driver skips to the next
/// statement; fatal failures (I/O) abort the run.
enum StmtError {
    Error(String),
    Fatal(String),
}

type StmtResult<T> = Result<T, (SourceLoc, StmtError)>;

impl From<LexerError> for (SourceLoc, StmtError) {
    fn from(e: LexerError) -> Self {
        let loc = e.loc();
        if e.is_fatal() {
            (loc, StmtError::Fatal(format!("{e}")))
        } else {
            (loc, StmtError::Error(format!("{e}")))
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Cond {
    NotZero,
    Zero,
    NotCarry,
    Carry,
    ParityOdd,
    ParityEven,
    Positive,
    Negative,
}

impl Cond {
    fn from_flag(flag: FlagName) -> Self {
        match flag {
            FlagName::NotZero => Self::NotZero,
            FlagName::Zero => Self::Zero,
            FlagName::NotCarry => Self::NotCarry,
            FlagName::ParityOdd => Self::ParityOdd,
            FlagName::ParityEven => Self::ParityEven,
            FlagName::Positive => Self::Positive,
            FlagName::Negative => Self::Negative,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Self::NotZero => 0,
            Self::Zero => 1,
            Self::NotCarry => 2,
            Self::Carry => 3,
            Self::ParityOdd => 4,
            Self::ParityEven => 5,
            Self::Positive => 6,
            Self::Negative => 7,
        }
    }

    fn negate(self) -> Self {
        match self {
            Self::NotZero => Self::Zero,
            Self::Zero => Self::NotZero,
            Self::NotCarry => Self::Carry,
            Self::Carry => Self::NotCarry,
            Self::ParityOdd => Self::ParityEven,
            Self::ParityEven => Self::ParityOdd,
            Self::Positive => Self::Negative,
            Self::Negative => Self::Positive,
        }
    }

    /// Only four conditions have a `JR` form.
    fn jr_opcode(self) -> Option<u8> {
        match self {
            Self::NotZero => Some(0x20),
            Self::Zero => Some(0x28),
            Self::NotCarry => Some(0x30),
            Self::Carry => Some(0x38),
            _ => None,
        }
    }

    #[inline]
    fn jp_opcode(self) -> u8 {
        0xC2 | (self.bits() << 3)
    }

    #[inline]
    fn call_opcode(self) -> u8 {
        0xC4 | (self.bits() << 3)
    }

    #[inline]
    fn ret_opcode(self) -> u8 {
        0xC0 | (self.bits() << 3)
    }
}

impl fmt::Display for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::NotZero => "NZ",
                Self::Zero => "Z",
                Self::NotCarry => "NC",
                Self::Carry => "C",
                Self::ParityOdd => "PO",
                Self::ParityEven => "PE",
                Self::Positive => "P",
                Self::Negative => "M",
            }
        )
    }
}

/// Open structured-flow constructs, innermost last.
enum Block {
    If {
        else_id: Option<u16>,
        end_id: u16,
    },
    While {
        begin_id: u16,
        repeat_id: u16,
        end_id: Option<u16>,
        back_cond: Option<Cond>,
        saw_while: bool,
    },
}

#[inline]
fn reg_bits(name: RegisterName) -> Option<u8> {
    match name {
        RegisterName::B => Some(0),
        RegisterName::C => Some(1),
        RegisterName::D => Some(2),
        RegisterName::E => Some(3),
        RegisterName::H => Some(4),
        RegisterName::L => Some(5),
        RegisterName::A => Some(7),
        _ => None,
    }
}

#[inline]
fn pair_bits(name: RegisterName) -> Option<u8> {
    match name {
        RegisterName::BC => Some(0),
        RegisterName::DE => Some(1),
        RegisterName::HL => Some(2),
        RegisterName::SP => Some(3),
        _ => None,
    }
}

#[inline]
fn index_prefix(name: RegisterName) -> Option<u8> {
    match name {
        RegisterName::IX => Some(0xDD),
        RegisterName::IY => Some(0xFD),
        _ => None,
    }
}

#[derive(Debug)]
pub struct Output {
    pub object: Object,
    pub listing: Listing,
}

pub struct Assembler<S, R> {
    file_manager: FileManager<S>,
    str_interner: Rc<RefCell<StrInterner>>,
    lexers: Vec<Lexer<R>>,
    lexer: Option<Lexer<R>>,
    symtab: Symtab,
    code: Segment,
    data: Segment,
    in_data: bool,
    usages: Vec<(Address, Address)>,
    blocks: Vec<Block>,
    listing: Listing,
    pass: u32,
    next_auto: u16,
    errors: Vec<String>,
    error_positions: FxHashSet<(PathRef, u32)>,

    stash: Vec<Token>,
    loc: Option<SourceLoc>,
    line_start: u16,
    line_kind: AddrKind,
    line_depth: usize,
}

impl<S, R> Assembler<S, R>
where
    S: FileSystem<Reader = R>,
    R: Read,
{
    pub fn new(file_system: S) -> Self {
        Self {
            file_manager: FileManager::new(file_system),
            str_interner: Rc::new(RefCell::new(StrInterner::new())),
            lexers: Vec::new(),
            lexer: None,
            symtab: Symtab::new(),
            code: Segment::new(AddrKind::Code),
            data: Segment::new(AddrKind::Data),
            in_data: false,
            usages: Vec::new(),
            blocks: Vec::new(),
            listing: Listing::new(),
            pass: 0,
            next_auto: FIRST_AUTO_LABEL,
            errors: Vec::new(),
            error_positions: FxHashSet::default(),

            stash: Vec::new(),
            loc: None,
            line_start: 0,
            line_kind: AddrKind::Code,
            line_depth: 0,
        }
    }

    pub fn add_search_path<C: AsRef<Path>, P: AsRef<Path>>(
        &mut self,
        cwd: C,
        path: P,
    ) -> Result<(), AssemblerError> {
        let path = path.as_ref();
        self.file_manager.add_search_path(cwd, path).map_err(|e| {
            AssemblerError(format!(
                "Failed to find include path \"{}\": {e}",
                path.display()
            ))
        })?;
        Ok(())
    }

    /// Run passes until symbol addresses stop changing, then hand back the
    /// object and the final pass's listing.
    #[must_use]
    pub fn assemble<C: AsRef<Path>, P: AsRef<Path>>(
        mut self,
        cwd: C,
        path: P,
    ) -> Result<Output, AssemblerError> {
        loop {
            self.pass += 1;
            self.run_pass(cwd.as_ref(), path.as_ref())?;
            if !self.errors.is_empty() {
                return Err(AssemblerError(self.errors.join("\n")));
            }
            if self.pass >= 2 && !self.symtab.take_address_changed() {
                break;
            }
            if self.pass >= MAX_PASS_COUNT {
                return Err(AssemblerError(format!(
                    "Address resolution did not converge after {MAX_PASS_COUNT} passes"
                )));
            }
        }

        let object = self.build_object();
        Ok(Output {
            object,
            listing: mem::take(&mut self.listing),
        })
    }

    fn begin_pass(&mut self) {
        self.code.clear();
        self.data.clear();
        self.in_data = false;
        self.usages.clear();
        self.blocks.clear();
        self.listing.clear();
        self.next_auto = FIRST_AUTO_LABEL;
        self.stash.clear();
        self.lexers.clear();
        self.lexer = None;
        self.line_start = 0;
        self.line_kind = AddrKind::Code;
        self.line_depth = 0;
    }

    fn run_pass(&mut self, cwd: &Path, path: &Path) -> Result<(), AssemblerError> {
        self.begin_pass();

        let (pathref, reader) = match self.file_manager.open(cwd, path) {
            Ok(Some(tup)) => tup,
            Ok(None) => {
                return Err(AssemblerError(format!(
                    "File not found: \"{}\"",
                    path.display()
                )))
            }
            Err(e) => {
                return Err(AssemblerError(format!(
                    "Failed to open \"{}\" for reading: {e}",
                    path.display()
                )))
            }
        };
        self.lexer = Some(Lexer::new(self.str_interner.clone(), pathref, reader));
        self.loc = Some(SourceLoc {
            pathref,
            line: 1,
            column: 0,
        });

        loop {
            if self.errors.len() >= MAX_ERROR_COUNT {
                break;
            }
            match self.statement() {
                Ok(true) => {
                    if self.code.overflowed() || self.data.overflowed() {
                        let loc = self.loc();
                        self.report(loc, "Segment grew past 64K");
                        break;
                    }
                }
                Ok(false) => break,
                Err((_, StmtError::Fatal(msg))) => return Err(AssemblerError(msg)),
                Err((loc, StmtError::Error(msg))) => {
                    self.report(loc, &msg);
                    self.recover()?;
                }
            }
        }

        if !self.blocks.is_empty() {
            let loc = self.loc();
            let msg = match self.blocks.last() {
                Some(Block::If { .. }) => "Missing \"ENDIF\"",
                _ => "Missing \"WEND\"",
            };
            self.report(loc, msg);
        }
        Ok(())
    }

    /// Skip to the end of the statement after an error.
    fn recover(&mut self) -> Result<(), AssemblerError> {
        loop {
            match self.next() {
                Err(e) if e.is_fatal() => return Err(AssemblerError(format!("{e}"))),
                Err(_) => continue,
                Ok(None) => return Ok(()),
                Ok(Some(Token::NewLine { .. })) => {
                    self.flush_line();
                    return Ok(());
                }
                Ok(Some(Token::Symbol {
                    name: SymbolName::Pipe,
                    ..
                })) => return Ok(()),
                Ok(Some(_)) => continue,
            }
        }
    }

    #[inline]
    fn loc(&self) -> SourceLoc {
        self.loc.unwrap()
    }

    #[must_use]
    fn peek(&mut self) -> Result<Option<&Token>, LexerError> {
        loop {
            if !self.stash.is_empty() {
                return Ok(self.stash.last());
            }
            match &mut self.lexer {
                Some(lexer) => match lexer.next().transpose()? {
                    Some(tok) => {
                        self.loc = Some(tok.loc());
                        self.stash.push(tok);
                        return Ok(self.stash.last());
                    }
                    None => {
                        self.lexer = self.lexers.pop();
                    }
                },
                None => return Ok(None),
            }
        }
    }

    #[must_use]
    fn next(&mut self) -> Result<Option<Token>, LexerError> {
        self.peek()?;
        Ok(self.stash.pop())
    }

    #[inline]
    fn push_back(&mut self, tok: Token) {
        self.stash.push(tok);
    }

    fn format_msg(&self, loc: SourceLoc, msg: &str) -> String {
        let file = self.file_manager.basename(loc.pathref);
        format!("{file}({line}): {msg}", line = loc.line)
    }

    /// Record a diagnostic; only the first message per source line is
    /// kept.
    fn report(&mut self, loc: SourceLoc, msg: &str) {
        if self.error_positions.insert((loc.pathref, loc.line)) {
            let msg = self.format_msg(loc, msg);
            self.errors.push(msg);
        }
    }

    /// Relocatable-where-const-required; pass 1 stays silent so forward
    /// references do not spuriously error.
    fn usage_error(&mut self, loc: SourceLoc) {
        if self.pass >= 2 {
            self.report(loc, "Address usage error");
        }
    }

    fn end_of_input_err<T>(&mut self) -> StmtResult<T> {
        Err((
            self.loc(),
            StmtError::Error("Unexpected end of input".to_string()),
        ))
    }

    #[inline]
    #[must_use]
    fn expect_symbol(&mut self, sym: SymbolName) -> StmtResult<()> {
        match self.next()? {
            Some(Token::Symbol { name, .. }) if name == sym => Ok(()),
            Some(tok) => Err((
                tok.loc(),
                StmtError::Error(format!(
                    "Missing \"{sym}\", found {}",
                    tok.as_display(&self.str_interner)
                )),
            )),
            None => self.end_of_input_err(),
        }
    }

    #[inline]
    #[must_use]
    fn expect_register(&mut self, reg: RegisterName) -> StmtResult<()> {
        match self.next()? {
            Some(Token::Register { name, .. }) if name == reg => Ok(()),
            Some(Token::Register { loc, name }) => Err((
                loc,
                StmtError::Error(format!("Invalid register \"{name}\", expected \"{reg}\"")),
            )),
            Some(tok) => Err((
                tok.loc(),
                StmtError::Error(format!(
                    "Unexpected {}, expected the register \"{reg}\"",
                    tok.as_display(&self.str_interner)
                )),
            )),
            None => self.end_of_input_err(),
        }
    }

    #[inline]
    #[must_use]
    fn peeked_symbol(&mut self, sym: SymbolName) -> StmtResult<Option<Token>> {
        match self.peek()? {
            Some(&tok @ Token::Symbol { name, .. }) if name == sym => Ok(Some(tok)),
            _ => Ok(None),
        }
    }

    fn expect_identifier(&mut self) -> StmtResult<(SourceLoc, StrRef)> {
        match self.next()? {
            Some(Token::Identifier { loc, value }) => Ok((loc, value)),
            Some(tok) => Err((
                tok.loc(),
                StmtError::Error(format!(
                    "Missing identifier, found {}",
                    tok.as_display(&self.str_interner)
                )),
            )),
            None => self.end_of_input_err(),
        }
    }

    fn symbol_name(&self, id: u16) -> String {
        if id >= FIRST_AUTO_LABEL {
            format!("L{id:04X}")
        } else {
            self.str_interner
                .as_ref()
                .borrow()
                .get(StrRef(id))
                .unwrap_or("?")
                .to_string()
        }
    }

    // ------------------------------------------------------------------
    // Segments and emission

    #[inline]
    fn seg(&self) -> &Segment {
        if self.in_data {
            &self.data
        } else {
            &self.code
        }
    }

    #[inline]
    fn seg_mut(&mut self) -> &mut Segment {
        if self.in_data {
            &mut self.data
        } else {
            &mut self.code
        }
    }

    #[inline]
    fn here(&self) -> Address {
        self.seg().here()
    }

    #[inline]
    fn emit(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.seg_mut().emit(b);
        }
    }

    #[inline]
    fn emit_byte(&mut self, byte: u8) {
        self.seg_mut().emit(byte);
    }

    /// Emit a 16-bit operand. Relocatable and external addresses leave a
    /// fix-up at the emitted offset for the linker.
    fn emit_addr_word(&mut self, loc: SourceLoc, addr: Address) {
        match addr.kind {
            AddrKind::Const => {
                if !(-32768..=65535).contains(&addr.value) {
                    self.report(
                        loc,
                        &format!("Expression result ({}) will not fit in a word", addr.value),
                    );
                }
                self.seg_mut().emit_word(addr.value as u16);
            }
            AddrKind::Code | AddrKind::Data | AddrKind::External => {
                let at = self.here();
                self.usages.push((at, addr.unwrapped()));
                self.seg_mut().emit_word(addr.value as u16);
            }
            AddrKind::Undefined => {
                self.seg_mut().emit_word(0);
            }
        }
    }

    /// Emit an 8-bit immediate. A `LOW`/`HIGH` selection of a relocatable
    /// leaves a byte fix-up; a bare relocatable cannot fit and is an
    /// address usage error.
    fn emit_addr_byte(&mut self, loc: SourceLoc, addr: Address) {
        match addr.kind {
            AddrKind::Const => {
                if !(-128..=255).contains(&addr.value) {
                    self.report(
                        loc,
                        &format!("Expression result ({}) will not fit in a byte", addr.value),
                    );
                }
                self.emit_byte(addr.value as u8);
            }
            AddrKind::Code | AddrKind::Data | AddrKind::External => {
                if addr.part == Part::Word {
                    self.usage_error(loc);
                    self.emit_byte(addr.value as u8);
                } else {
                    let at = self.here();
                    self.usages.push((at, addr.unwrapped()));
                    let byte = match addr.part {
                        Part::High => (addr.value >> 8) as u8,
                        _ => addr.value as u8,
                    };
                    self.emit_byte(byte);
                }
            }
            AddrKind::Undefined => self.emit_byte(0),
        }
    }

    /// A constant the instruction needs right now (bit numbers, reset
    /// vectors, sizes, displacements).
    fn require_const(&mut self, loc: SourceLoc, addr: Address) -> i32 {
        if addr.is_reloc() {
            self.usage_error(loc);
        }
        addr.value
    }

    /// Signed displacement byte.
    fn const_ibyte(&mut self, loc: SourceLoc, addr: Address) -> u8 {
        let value = self.require_const(loc, addr);
        if !addr.is_undefined() && !(-128..=127).contains(&value) {
            self.report(
                loc,
                &format!("Expression result ({value}) will not fit in a byte"),
            );
        }
        value as u8
    }

    // ------------------------------------------------------------------
    // Relative jumps

    /// Offset from the next instruction to `target`, when relative
    /// addressing is possible at all: the target must be a defined
    /// address in the current segment.
    fn rel_offset(&self, target: Address) -> Option<i32> {
        if target.kind != self.seg().kind() || target.part != Part::Word {
            return None;
        }
        Some(target.value - (self.seg().tail() as i32 + 2))
    }

    /// The offset byte for a short jump, if the target is in range. The
    /// upper bound is +128 inclusive; the encoded byte wraps there.
    fn short_branch(&self, target: Address) -> Option<u8> {
        let off = self.rel_offset(target)?;
        if (-128..=128).contains(&off) {
            Some(off as u8)
        } else {
            None
        }
    }

    /// Jump to a target address: short form when it fits, absolute
    /// otherwise. Undefined (pass-1 forward) targets take the long form.
    fn emit_jump_to(&mut self, loc: SourceLoc, cond: Option<Cond>, target: Address) {
        match (cond, self.short_branch(target)) {
            (None, Some(off)) => self.emit(&[0x18, off]),
            (Some(c), Some(off)) if c.jr_opcode().is_some() => {
                self.emit(&[c.jr_opcode().unwrap(), off])
            }
            (None, _) => {
                self.emit_byte(0xC3);
                self.emit_addr_word(loc, target);
            }
            (Some(c), _) => {
                self.emit_byte(c.jp_opcode());
                self.emit_addr_word(loc, target);
            }
        }
    }

    fn emit_jump(&mut self, loc: SourceLoc, cond: Option<Cond>, target_id: u16) {
        let target = self
            .symtab
            .address(target_id)
            .unwrap_or_else(Address::undefined);
        self.emit_jump_to(loc, cond, target);
    }

    /// `DJNZ` with the out-of-range rewrite to `DEC B; JP NZ`.
    fn emit_djnz(&mut self, loc: SourceLoc, target: Address) {
        if let Some(off) = self.short_branch(target) {
            self.emit(&[0x10, off]);
        } else {
            self.emit(&[0x05, 0xC2]);
            self.emit_addr_word(loc, target);
        }
    }

    // ------------------------------------------------------------------
    // Symbols

    fn define_symbol(&mut self, loc: SourceLoc, id: u16, address: Address) {
        match self.symtab.define(id, self.pass, address) {
            Define::Ok => {}
            Define::Redefined => {
                let name = self.symbol_name(id);
                self.report(loc, &format!("Multiple definition: \"{name}\""));
            }
        }
    }

    fn auto_label(&mut self) -> u16 {
        let id = self.next_auto;
        self.next_auto = self.next_auto.wrapping_add(1);
        id
    }

    fn define_auto_here(&mut self, loc: SourceLoc, id: u16) {
        let here = self.here();
        self.define_symbol(loc, id, here);
    }

    // ------------------------------------------------------------------
    // Listing

    fn flush_line_with(&mut self, text: String) {
        let bytes = {
            let seg = self.seg();
            let start = (self.line_start as usize).min(seg.bytes().len());
            seg.bytes()[start..].to_vec()
        };
        self.listing.push(ListingLine {
            kind: self.line_kind,
            addr: self.line_start,
            bytes,
            depth: self.line_depth,
            text,
        });
        self.line_sync();
    }

    fn flush_line(&mut self) {
        let text = self
            .lexer
            .as_mut()
            .map(|lexer| lexer.take_line())
            .unwrap_or_default();
        self.flush_line_with(text);
    }

    fn line_sync(&mut self) {
        self.line_start = self.seg().tail();
        self.line_kind = self.seg().kind();
        self.line_depth = self.blocks.len();
    }

    // ------------------------------------------------------------------
    // Expressions

    #[must_use]
    fn expr(&mut self) -> StmtResult<(SourceLoc, Address)> {
        self.expr_prec_0()
    }

    fn fold(
        &mut self,
        lhs: Address,
        lloc: SourceLoc,
        rhs: Address,
        rloc: SourceLoc,
        f: impl Fn(i32, i32) -> i32,
    ) -> Address {
        if lhs.is_undefined() || rhs.is_undefined() {
            return Address::undefined();
        }
        let l = self.require_const(lloc, lhs);
        let r = self.require_const(rloc, rhs);
        Address::constant(f(l, r))
    }

    fn fold_div(
        &mut self,
        lhs: Address,
        lloc: SourceLoc,
        rhs: Address,
        rloc: SourceLoc,
        rem: bool,
    ) -> Address {
        if lhs.is_undefined() || rhs.is_undefined() {
            return Address::undefined();
        }
        let l = self.require_const(lloc, lhs);
        let r = self.require_const(rloc, rhs);
        if r == 0 {
            self.report(rloc, "Division by zero");
            return Address::constant(0);
        }
        Address::constant(if rem {
            l.wrapping_rem(r)
        } else {
            l.wrapping_div(r)
        })
    }

    /// `+`/`-` are the one place a relocatable left operand is legal.
    fn fold_addsub(
        &mut self,
        lhs: Address,
        rhs: Address,
        rloc: SourceLoc,
        sub: bool,
    ) -> Address {
        if lhs.is_undefined() || rhs.is_undefined() {
            return Address::undefined();
        }
        if rhs.is_reloc() {
            self.usage_error(rloc);
        }
        let r = rhs.value;
        if lhs.is_reloc() {
            if sub {
                lhs.sub_const(r)
            } else {
                lhs.add_const(r)
            }
        } else if sub {
            Address::constant(lhs.value.wrapping_sub(r))
        } else {
            Address::constant(lhs.value.wrapping_add(r))
        }
    }

    fn expr_prec_0(&mut self) -> StmtResult<(SourceLoc, Address)> {
        let (loc, mut lhs) = self.expr_prec_1()?;
        loop {
            match self.peek()? {
                Some(&Token::Operation {
                    name: OperationName::Or,
                    ..
                }) => {
                    self.next()?;
                    let (rloc, rhs) = self.expr_prec_1()?;
                    lhs = self.fold(lhs, loc, rhs, rloc, |l, r| l | r);
                }
                Some(&Token::Operation {
                    name: OperationName::Xor,
                    ..
                }) => {
                    self.next()?;
                    let (rloc, rhs) = self.expr_prec_1()?;
                    lhs = self.fold(lhs, loc, rhs, rloc, |l, r| l ^ r);
                }
                _ => return Ok((loc, lhs)),
            }
        }
    }

    fn expr_prec_1(&mut self) -> StmtResult<(SourceLoc, Address)> {
        let (loc, mut lhs) = self.expr_prec_2()?;
        loop {
            match self.peek()? {
                Some(&Token::Operation {
                    name: OperationName::And,
                    ..
                }) => {
                    self.next()?;
                    let (rloc, rhs) = self.expr_prec_2()?;
                    lhs = self.fold(lhs, loc, rhs, rloc, |l, r| l & r);
                }
                _ => return Ok((loc, lhs)),
            }
        }
    }

    fn expr_prec_2(&mut self) -> StmtResult<(SourceLoc, Address)> {
        let (loc, mut lhs) = self.expr_prec_3()?;
        loop {
            match self.peek()? {
                Some(&Token::Operator {
                    name: OperatorName::Shl,
                    ..
                }) => {
                    self.next()?;
                    let (rloc, rhs) = self.expr_prec_3()?;
                    lhs = self.fold(lhs, loc, rhs, rloc, |l, r| l.wrapping_shl(r as u32));
                }
                Some(&Token::Operator {
                    name: OperatorName::Shr,
                    ..
                }) => {
                    self.next()?;
                    let (rloc, rhs) = self.expr_prec_3()?;
                    lhs = self.fold(lhs, loc, rhs, rloc, |l, r| {
                        ((l as u32).wrapping_shr(r as u32)) as i32
                    });
                }
                _ => return Ok((loc, lhs)),
            }
        }
    }

    fn expr_prec_3(&mut self) -> StmtResult<(SourceLoc, Address)> {
        let (loc, mut lhs) = self.expr_prec_4()?;
        loop {
            match self.peek()? {
                Some(&Token::Symbol {
                    name: SymbolName::Plus,
                    ..
                }) => {
                    self.next()?;
                    let (rloc, rhs) = self.expr_prec_4()?;
                    lhs = self.fold_addsub(lhs, rhs, rloc, false);
                }
                Some(&Token::Symbol {
                    name: SymbolName::Minus,
                    ..
                }) => {
                    self.next()?;
                    let (rloc, rhs) = self.expr_prec_4()?;
                    lhs = self.fold_addsub(lhs, rhs, rloc, true);
                }
                _ => return Ok((loc, lhs)),
            }
        }
    }

    fn expr_prec_4(&mut self) -> StmtResult<(SourceLoc, Address)> {
        let (loc, mut lhs) = self.expr_prec_5()?;
        loop {
            match self.peek()? {
                Some(&Token::Symbol {
                    name: SymbolName::Star,
                    ..
                }) => {
                    self.next()?;
                    let (rloc, rhs) = self.expr_prec_5()?;
                    lhs = self.fold(lhs, loc, rhs, rloc, |l, r| l.wrapping_mul(r));
                }
                Some(&Token::Symbol {
                    name: SymbolName::Div,
                    ..
                }) => {
                    self.next()?;
                    let (rloc, rhs) = self.expr_prec_5()?;
                    lhs = self.fold_div(lhs, loc, rhs, rloc, false);
                }
                Some(&Token::Operator {
                    name: OperatorName::Mod,
                    ..
                }) => {
                    self.next()?;
                    let (rloc, rhs) = self.expr_prec_5()?;
                    lhs = self.fold_div(lhs, loc, rhs, rloc, true);
                }
                _ => return Ok((loc, lhs)),
            }
        }
    }

    fn expr_prec_5(&mut self) -> StmtResult<(SourceLoc, Address)> {
        match self.peek()? {
            Some(&Token::Symbol {
                loc,
                name: SymbolName::Minus,
            }) => {
                self.next()?;
                let (vloc, addr) = self.expr_prec_5()?;
                if addr.is_undefined() {
                    return Ok((loc, Address::undefined()));
                }
                let value = self.require_const(vloc, addr);
                Ok((loc, Address::constant(value.wrapping_neg())))
            }

            Some(&Token::Symbol {
                loc,
                name: SymbolName::Plus,
            }) => {
                self.next()?;
                let (_, addr) = self.expr_prec_5()?;
                Ok((loc, addr.unwrapped()))
            }

            Some(&Token::Operator {
                loc,
                name: OperatorName::Not,
            }) => {
                self.next()?;
                let (vloc, addr) = self.expr_prec_5()?;
                if addr.is_undefined() {
                    return Ok((loc, Address::undefined()));
                }
                let value = self.require_const(vloc, addr);
                Ok((loc, Address::constant(!value)))
            }

            Some(&Token::Operator {
                loc,
                name: OperatorName::Low,
            }) => {
                self.next()?;
                let (_, addr) = self.expr_prec_5()?;
                Ok((loc, addr.low()))
            }

            Some(&Token::Operator {
                loc,
                name: OperatorName::High,
            }) => {
                self.next()?;
                let (_, addr) = self.expr_prec_5()?;
                Ok((loc, addr.high()))
            }

            _ => self.factor(),
        }
    }

    fn factor(&mut self) -> StmtResult<(SourceLoc, Address)> {
        match self.peek()? {
            Some(&Token::Number { loc, value }) => {
                self.next()?;
                Ok((loc, Address::constant(value)))
            }

            // A character constant: the first character of a string.
            Some(&Token::String { loc, value }) => {
                self.next()?;
                let byte = {
                    let interner = self.str_interner.as_ref().borrow();
                    interner.get(value).and_then(|s| s.bytes().next())
                };
                match byte {
                    Some(b) => Ok((loc, Address::constant(b as i32))),
                    None => Err((
                        loc,
                        StmtError::Error("Empty string in expression".to_string()),
                    )),
                }
            }

            Some(&Token::Identifier { loc, value }) => {
                self.next()?;
                match self.symtab.address(value.0) {
                    Some(addr) => Ok((loc, addr.unwrapped())),
                    None => {
                        if self.pass >= 2 {
                            let name = self.symbol_name(value.0);
                            self.report(loc, &format!("Undefined identifier: \"{name}\""));
                        }
                        Ok((loc, Address::undefined()))
                    }
                }
            }

            Some(&Token::Symbol {
                loc,
                name: SymbolName::ParenOpen,
            }) => {
                self.next()?;
                let (_, inner) = self.expr_prec_0()?;
                self.expect_symbol(SymbolName::ParenClose)?;
                let mut inner = inner;
                inner.parenthesized = true;
                Ok((loc, inner))
            }

            Some(&tok) => Err((
                tok.loc(),
                StmtError::Error(format!(
                    "Unexpected {} in expression",
                    tok.as_display(&self.str_interner)
                )),
            )),

            None => self.end_of_input_err(),
        }
    }

    // ------------------------------------------------------------------
    // Conditions

    fn parse_condition(&mut self) -> StmtResult<Option<Cond>> {
        Ok(match self.peek()? {
            Some(&Token::Flag { name, .. }) => {
                self.next()?;
                Some(Cond::from_flag(name))
            }
            Some(&Token::Register {
                name: RegisterName::C,
                ..
            }) => {
                self.next()?;
                Some(Cond::Carry)
            }
            _ => None,
        })
    }

    fn expect_condition(&mut self, loc: SourceLoc) -> StmtResult<Cond> {
        match self.parse_condition()? {
            Some(cond) => Ok(cond),
            None => Err((loc, StmtError::Error("Missing condition".to_string()))),
        }
    }

    // ------------------------------------------------------------------
    // Statements

    /// One statement. Returns false at end of input.
    fn statement(&mut self) -> StmtResult<bool> {
        match self.peek()? {
            None => Ok(false),

            Some(Token::NewLine { .. }) => {
                self.next()?;
                self.flush_line();
                Ok(true)
            }

            Some(Token::Symbol {
                name: SymbolName::Pipe,
                ..
            }) => {
                self.next()?;
                Ok(true)
            }

            Some(&Token::Identifier { loc, value }) => {
                self.next()?;
                self.identifier_statement(loc, value)?;
                Ok(true)
            }

            Some(&Token::Directive { loc, name }) => {
                self.next()?;
                self.directive(loc, name)?;
                Ok(true)
            }

            Some(&Token::Keyword { loc, name }) => {
                self.next()?;
                self.flow(loc, name)?;
                Ok(true)
            }

            Some(&Token::Operation { loc, name }) => {
                self.next()?;
                self.operation(loc, name)?;
                Ok(true)
            }

            Some(&tok) => Err((
                tok.loc(),
                StmtError::Error(format!(
                    "Unexpected {}",
                    tok.as_display(&self.str_interner)
                )),
            )),
        }
    }

    fn identifier_statement(&mut self, loc: SourceLoc, value: StrRef) -> StmtResult<()> {
        match self.peek()? {
            Some(Token::Symbol {
                name: SymbolName::Colon,
                ..
            }) => {
                self.next()?;
                let here = self.here();
                self.define_symbol(loc, value.0, here);
                Ok(())
            }

            Some(Token::Directive {
                name: DirectiveName::Equ,
                ..
            }) => {
                self.next()?;
                let (_, addr) = self.expr()?;
                self.define_symbol(loc, value.0, addr.unwrapped());
                Ok(())
            }

            _ => Err((
                loc,
                StmtError::Error(format!(
                    "Expected \":\" or \"EQU\" after the identifier \"{}\"",
                    self.symbol_name(value.0)
                )),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Directives

    fn directive(&mut self, loc: SourceLoc, name: DirectiveName) -> StmtResult<()> {
        match name {
            DirectiveName::Include => self.include(),

            DirectiveName::Cseg => {
                self.in_data = false;
                self.line_sync();
                Ok(())
            }

            DirectiveName::Dseg => {
                self.in_data = true;
                self.line_sync();
                Ok(())
            }

            DirectiveName::Public => loop {
                let (iloc, value) = self.expect_identifier()?;
                self.symtab.mark_public(value.0);
                if self.pass >= 2 && self.symtab.address(value.0).is_none() {
                    let name = self.symbol_name(value.0);
                    self.report(iloc, &format!("Undefined identifier: \"{name}\""));
                }
                if self.peeked_symbol(SymbolName::Comma)?.is_some() {
                    self.next()?;
                    continue;
                }
                return Ok(());
            },

            DirectiveName::Extrn => loop {
                let (iloc, value) = self.expect_identifier()?;
                self.define_symbol(iloc, value.0, Address::external(value.0));
                if self.peeked_symbol(SymbolName::Comma)?.is_some() {
                    self.next()?;
                    continue;
                }
                return Ok(());
            },

            DirectiveName::Defb => loop {
                match self.peek()? {
                    Some(&Token::String { value, .. }) => {
                        self.next()?;
                        let bytes = {
                            let interner = self.str_interner.as_ref().borrow();
                            interner.get(value).unwrap_or("").as_bytes().to_vec()
                        };
                        self.emit(&bytes);
                    }
                    _ => {
                        let (eloc, addr) = self.expr()?;
                        self.emit_addr_byte(eloc, addr);
                    }
                }
                if self.peeked_symbol(SymbolName::Comma)?.is_some() {
                    self.next()?;
                    continue;
                }
                return Ok(());
            },

            DirectiveName::Defw => loop {
                let (eloc, addr) = self.expr()?;
                self.emit_addr_word(eloc, addr);
                if self.peeked_symbol(SymbolName::Comma)?.is_some() {
                    self.next()?;
                    continue;
                }
                return Ok(());
            },

            DirectiveName::Defs => {
                let (sloc, addr) = self.expr()?;
                let size = self.require_const(sloc, addr);
                if !addr.is_undefined() && !(0..=0xFFFF).contains(&size) {
                    self.report(
                        sloc,
                        &format!("Expression result ({size}) is not a valid size"),
                    );
                }
                let fill = if self.peeked_symbol(SymbolName::Comma)?.is_some() {
                    self.next()?;
                    let (floc, fill) = self.expr()?;
                    let value = self.require_const(floc, fill);
                    if !fill.is_undefined() && !(-128..=255).contains(&value) {
                        self.report(
                            floc,
                            &format!("Expression result ({value}) will not fit in a byte"),
                        );
                    }
                    value as u8
                } else {
                    0
                };
                for _ in 0..size.clamp(0, 0xFFFF) {
                    self.emit_byte(fill);
                }
                Ok(())
            }

            DirectiveName::Equ => Err((
                loc,
                StmtError::Error("Missing identifier before \"EQU\"".to_string()),
            )),
        }
    }

    fn include(&mut self) -> StmtResult<()> {
        match self.next()? {
            Some(Token::String { loc: sloc, value }) => {
                let path = {
                    let interner = self.str_interner.as_ref().borrow();
                    interner.get(value).unwrap_or("").to_string()
                };
                let (pathref, reader) = match self.file_manager.open_include(sloc.pathref, &path)
                {
                    Ok(Some(tup)) => tup,
                    Ok(None) => {
                        let msg = self.format_msg(sloc, &format!("File not found: \"{path}\""));
                        return Err((sloc, StmtError::Fatal(msg)));
                    }
                    Err(e) => {
                        let msg = self.format_msg(
                            sloc,
                            &format!("Failed to open \"{path}\" for reading: {e}"),
                        );
                        return Err((sloc, StmtError::Fatal(msg)));
                    }
                };

                // List the include line now so the nested lines appear
                // after it.
                let text = self.lexer.as_mut().unwrap().flush_partial_line();
                self.flush_line_with(text);

                self.lexers.push(self.lexer.take().unwrap());
                self.lexer = Some(Lexer::new(self.str_interner.clone(), pathref, reader));
                Ok(())
            }
            Some(tok) => Err((
                tok.loc(),
                StmtError::Error(format!(
                    "Unexpected {}, expected a file name string",
                    tok.as_display(&self.str_interner)
                )),
            )),
            None => self.end_of_input_err(),
        }
    }

    // ------------------------------------------------------------------
    // Structured flow

    fn flow(&mut self, loc: SourceLoc, name: KeywordName) -> StmtResult<()> {
        match name {
            KeywordName::If => {
                let cond = self.expect_condition(loc)?;
                let else_id = self.auto_label();
                let end_id = self.auto_label();
                self.emit_jump(loc, Some(cond.negate()), else_id);
                self.blocks.push(Block::If {
                    else_id: Some(else_id),
                    end_id,
                });
                Ok(())
            }

            KeywordName::Else => {
                let (else_id, end_id) = match self.blocks.last() {
                    Some(&Block::If { else_id, end_id }) => (else_id, end_id),
                    _ => {
                        return Err((loc, StmtError::Error("No \"IF\" statement".to_string())))
                    }
                };
                let else_id = match else_id {
                    Some(id) => id,
                    None => {
                        return Err((
                            loc,
                            StmtError::Error("Multiple \"ELSE\" statements".to_string()),
                        ))
                    }
                };
                self.emit_jump(loc, None, end_id);
                self.define_auto_here(loc, else_id);
                if let Some(Block::If { else_id, .. }) = self.blocks.last_mut() {
                    *else_id = None;
                }
                Ok(())
            }

            KeywordName::ElseIf => {
                let cond = self.expect_condition(loc)?;
                let (else_id, end_id) = match self.blocks.last() {
                    Some(&Block::If { else_id, end_id }) => (else_id, end_id),
                    _ => {
                        return Err((loc, StmtError::Error("No \"IF\" statement".to_string())))
                    }
                };
                let else_id = match else_id {
                    Some(id) => id,
                    None => {
                        return Err((
                            loc,
                            StmtError::Error("Multiple \"ELSE\" statements".to_string()),
                        ))
                    }
                };
                self.emit_jump(loc, None, end_id);
                self.define_auto_here(loc, else_id);
                let new_else = self.auto_label();
                self.emit_jump(loc, Some(cond.negate()), new_else);
                if let Some(Block::If { else_id, .. }) = self.blocks.last_mut() {
                    *else_id = Some(new_else);
                }
                Ok(())
            }

            KeywordName::EndIf => {
                let (else_id, end_id) = match self.blocks.last() {
                    Some(&Block::If { else_id, end_id }) => (else_id, end_id),
                    _ => {
                        return Err((loc, StmtError::Error("No \"IF\" statement".to_string())))
                    }
                };
                self.blocks.pop();
                if let Some(else_id) = else_id {
                    self.define_auto_here(loc, else_id);
                }
                self.define_auto_here(loc, end_id);
                Ok(())
            }

            KeywordName::Do => {
                let begin_id = self.auto_label();
                let repeat_id = self.auto_label();
                let end_id = self.auto_label();
                self.define_auto_here(loc, begin_id);
                self.blocks.push(Block::While {
                    begin_id,
                    repeat_id,
                    end_id: Some(end_id),
                    back_cond: None,
                    saw_while: false,
                });
                Ok(())
            }

            KeywordName::While => {
                let cond = self.expect_condition(loc)?;
                let (repeat_id, end_id) = match self.blocks.last() {
                    Some(&Block::While {
                        repeat_id, end_id, ..
                    }) => (repeat_id, end_id),
                    _ => {
                        return Err((
                            loc,
                            StmtError::Error("No \"WHILE\" statement".to_string()),
                        ))
                    }
                };
                // Short form: when the previous pass put the back edge
                // right behind us, the exit jump is useless. Defer the
                // condition to the back edge and drop the end label.
                let near_back_edge = match self.symtab.address(repeat_id) {
                    Some(target) if target.kind == self.seg().kind() => {
                        target.value - (self.seg().tail() as i32 + 2) <= 1
                    }
                    _ => false,
                };
                let defer = near_back_edge || end_id.is_none();
                if defer {
                    if let Some(Block::While {
                        end_id,
                        back_cond,
                        saw_while,
                        ..
                    }) = self.blocks.last_mut()
                    {
                        *end_id = None;
                        *back_cond = Some(cond);
                        *saw_while = true;
                    }
                } else {
                    self.emit_jump(loc, Some(cond.negate()), end_id.unwrap());
                    if let Some(Block::While { saw_while, .. }) = self.blocks.last_mut() {
                        *saw_while = true;
                    }
                }
                Ok(())
            }

            KeywordName::Wend => {
                let (begin_id, repeat_id, end_id, back_cond) = match self.blocks.last() {
                    Some(&Block::While {
                        begin_id,
                        repeat_id,
                        end_id,
                        back_cond,
                        ..
                    }) => (begin_id, repeat_id, end_id, back_cond),
                    _ => {
                        return Err((
                            loc,
                            StmtError::Error("No \"WHILE\" statement".to_string()),
                        ))
                    }
                };
                self.blocks.pop();
                self.define_auto_here(loc, repeat_id);
                match end_id {
                    Some(end_id) => {
                        self.emit_jump(loc, None, begin_id);
                        self.define_auto_here(loc, end_id);
                    }
                    None => {
                        self.emit_jump(loc, back_cond, begin_id);
                    }
                }
                Ok(())
            }

            KeywordName::Dwnz => {
                let (begin_id, repeat_id, saw_while) = match self.blocks.last() {
                    Some(&Block::While {
                        begin_id,
                        repeat_id,
                        saw_while,
                        ..
                    }) => (begin_id, repeat_id, saw_while),
                    _ => {
                        return Err((
                            loc,
                            StmtError::Error("No \"WHILE\" statement".to_string()),
                        ))
                    }
                };
                if saw_while {
                    return Err((
                        loc,
                        StmtError::Error(
                            "\"WHILE\" and \"WNZ\" cannot be used in the same syntax".to_string(),
                        ),
                    ));
                }
                self.blocks.pop();
                self.define_auto_here(loc, repeat_id);
                let target = self
                    .symtab
                    .address(begin_id)
                    .unwrap_or_else(Address::undefined);
                self.emit_djnz(loc, target);
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Instructions

    fn operation(&mut self, loc: SourceLoc, name: OperationName) -> StmtResult<()> {
        use OperationName::*;
        match name {
            Nop => self.emit(&[0x00]),
            Halt => self.emit(&[0x76]),
            Di => self.emit(&[0xF3]),
            Ei => self.emit(&[0xFB]),
            Exx => self.emit(&[0xD9]),
            Daa => self.emit(&[0x27]),
            Cpl => self.emit(&[0x2F]),
            Ccf => self.emit(&[0x3F]),
            Scf => self.emit(&[0x37]),
            Rlca => self.emit(&[0x07]),
            Rla => self.emit(&[0x17]),
            Rrca => self.emit(&[0x0F]),
            Rra => self.emit(&[0x1F]),

            Neg => self.emit(&[0xED, 0x44]),
            Reti => self.emit(&[0xED, 0x4D]),
            Retn => self.emit(&[0xED, 0x45]),
            Rld => self.emit(&[0xED, 0x6F]),
            Rrd => self.emit(&[0xED, 0x67]),
            Ldi => self.emit(&[0xED, 0xA0]),
            Ldir => self.emit(&[0xED, 0xB0]),
            Ldd => self.emit(&[0xED, 0xA8]),
            Lddr => self.emit(&[0xED, 0xB8]),
            Cpi => self.emit(&[0xED, 0xA1]),
            Cpir => self.emit(&[0xED, 0xB1]),
            Cpd => self.emit(&[0xED, 0xA9]),
            Cpdr => self.emit(&[0xED, 0xB9]),
            Ini => self.emit(&[0xED, 0xA2]),
            Inir => self.emit(&[0xED, 0xB2]),
            Ind => self.emit(&[0xED, 0xAA]),
            Indr => self.emit(&[0xED, 0xBA]),
            Outi => self.emit(&[0xED, 0xA3]),
            Otir => self.emit(&[0xED, 0xB3]),
            Outd => self.emit(&[0xED, 0xAB]),
            Otdr => self.emit(&[0xED, 0xBB]),

            Ld => self.op_ld(loc)?,
            Ex => self.op_ex(loc)?,
            Push => self.op_push_pop(loc, true)?,
            Pop => self.op_push_pop(loc, false)?,

            Rlc => self.op_rotate(loc, 0x00)?,
            Rrc => self.op_rotate(loc, 0x08)?,
            Rl => self.op_rotate(loc, 0x10)?,
            Rr => self.op_rotate(loc, 0x18)?,
            Sla => self.op_rotate(loc, 0x20)?,
            Sra => self.op_rotate(loc, 0x28)?,
            Srl => self.op_rotate(loc, 0x38)?,

            Add => self.op_add(loc)?,
            Adc => self.op_adc_sbc(loc, true)?,
            Sbc => self.op_adc_sbc(loc, false)?,
            Sub => self.alu_operand(loc, 0x90, 0xD6)?,
            And => self.alu_operand(loc, 0xA0, 0xE6)?,
            Xor => self.alu_operand(loc, 0xA8, 0xEE)?,
            Or => self.alu_operand(loc, 0xB0, 0xF6)?,
            Cp => self.alu_operand(loc, 0xB8, 0xFE)?,

            Inc => self.op_inc_dec(loc, true)?,
            Dec => self.op_inc_dec(loc, false)?,

            Bit => self.op_bit(loc, 0x40)?,
            Res => self.op_bit(loc, 0x80)?,
            Set => self.op_bit(loc, 0xC0)?,

            Jp => self.op_jp(loc)?,
            Jr => self.op_jr(loc)?,
            Djnz => {
                let (tloc, target) = self.expr()?;
                self.emit_djnz(tloc, target);
            }
            Call => self.op_call(loc)?,
            Ret => {
                match self.parse_condition()? {
                    Some(cond) => self.emit(&[cond.ret_opcode()]),
                    None => self.emit(&[0xC9]),
                }
            }
            Rst => self.op_rst(loc)?,
            Im => self.op_im(loc)?,
            In => self.op_in(loc)?,
            Out => self.op_out(loc)?,
        }
        Ok(())
    }

    /// Displacement inside `(IX…)`/`(IY…)`; the index register token has
    /// been consumed, this consumes through the closing paren.
    fn index_displacement(&mut self) -> StmtResult<u8> {
        if self.peeked_symbol(SymbolName::ParenClose)?.is_some() {
            self.next()?;
            return Ok(0);
        }
        let (dloc, addr) = self.expr()?;
        let d = self.const_ibyte(dloc, addr);
        self.expect_symbol(SymbolName::ParenClose)?;
        Ok(d)
    }

    fn op_ld(&mut self, _loc: SourceLoc) -> StmtResult<()> {
        match self.next()? {
            None => self.end_of_input_err(),

            Some(Token::Register { loc: rloc, name }) => {
                self.expect_symbol(SymbolName::Comma)?;
                match name {
                    RegisterName::A => self.ld_r_src(7, true),
                    RegisterName::B
                    | RegisterName::C
                    | RegisterName::D
                    | RegisterName::E
                    | RegisterName::H
                    | RegisterName::L => self.ld_r_src(reg_bits(name).unwrap(), false),
                    RegisterName::I => {
                        self.expect_register(RegisterName::A)?;
                        self.emit(&[0xED, 0x47]);
                        Ok(())
                    }
                    RegisterName::R => {
                        self.expect_register(RegisterName::A)?;
                        self.emit(&[0xED, 0x4F]);
                        Ok(())
                    }
                    RegisterName::BC | RegisterName::DE | RegisterName::HL | RegisterName::SP => {
                        self.ld_rp_src(name)
                    }
                    RegisterName::IX | RegisterName::IY => {
                        self.ld_index_src(index_prefix(name).unwrap())
                    }
                    _ => Err((
                        rloc,
                        StmtError::Error(format!("Invalid register \"{name}\"")),
                    )),
                }
            }

            Some(Token::Symbol {
                loc: ploc,
                name: SymbolName::ParenOpen,
            }) => self.ld_mem_dst(ploc),

            Some(tok) => Err((
                tok.loc(),
                StmtError::Error(format!(
                    "Unexpected {}, expected an \"LD\" destination",
                    tok.as_display(&self.str_interner)
                )),
            )),
        }
    }

    /// Source operand of `LD r, …`.
    fn ld_r_src(&mut self, dst: u8, is_a: bool) -> StmtResult<()> {
        match self.peek()? {
            Some(&Token::Register { loc: rloc, name }) => {
                self.next()?;
                match name {
                    _ if reg_bits(name).is_some() => {
                        self.emit(&[0x40 | (dst << 3) | reg_bits(name).unwrap()]);
                        Ok(())
                    }
                    RegisterName::I if is_a => {
                        self.emit(&[0xED, 0x57]);
                        Ok(())
                    }
                    RegisterName::R if is_a => {
                        self.emit(&[0xED, 0x5F]);
                        Ok(())
                    }
                    _ => Err((
                        rloc,
                        StmtError::Error(format!("Invalid register \"{name}\"")),
                    )),
                }
            }

            Some(&Token::Symbol {
                loc: ploc,
                name: SymbolName::ParenOpen,
            }) => {
                self.next()?;
                match self.peek()? {
                    Some(&Token::Register {
                        name: RegisterName::HL,
                        ..
                    }) => {
                        self.next()?;
                        self.expect_symbol(SymbolName::ParenClose)?;
                        self.emit(&[0x46 | (dst << 3)]);
                        Ok(())
                    }
                    Some(&Token::Register { name, .. }) if index_prefix(name).is_some() => {
                        self.next()?;
                        let prefix = index_prefix(name).unwrap();
                        let d = self.index_displacement()?;
                        self.emit(&[prefix, 0x46 | (dst << 3), d]);
                        Ok(())
                    }
                    Some(&Token::Register {
                        name: RegisterName::BC,
                        ..
                    }) if is_a => {
                        self.next()?;
                        self.expect_symbol(SymbolName::ParenClose)?;
                        self.emit(&[0x0A]);
                        Ok(())
                    }
                    Some(&Token::Register {
                        name: RegisterName::DE,
                        ..
                    }) if is_a => {
                        self.next()?;
                        self.expect_symbol(SymbolName::ParenClose)?;
                        self.emit(&[0x1A]);
                        Ok(())
                    }
                    Some(&Token::Register { loc, name }) => Err((
                        loc,
                        StmtError::Error(format!("Invalid register \"{name}\"")),
                    )),
                    _ if is_a => {
                        // LD A, (nn)
                        let (eloc, addr) = self.expr()?;
                        self.expect_symbol(SymbolName::ParenClose)?;
                        self.emit_byte(0x3A);
                        self.emit_addr_word(eloc, addr);
                        Ok(())
                    }
                    _ => Err((
                        ploc,
                        StmtError::Error(
                            "Only the register \"A\" can be loaded from a memory address"
                                .to_string(),
                        ),
                    )),
                }
            }

            _ => {
                let (eloc, addr) = self.expr()?;
                self.emit_byte(0x06 | (dst << 3));
                self.emit_addr_byte(eloc, addr);
                Ok(())
            }
        }
    }

    /// Source operand of `LD rp, …`: this is where the parenthesized
    /// marker picks the memory-load form over the immediate one.
    fn ld_rp_src(&mut self, rp: RegisterName) -> StmtResult<()> {
        match self.peek()? {
            Some(&Token::Register { loc: rloc, name }) => match (rp, name) {
                (RegisterName::SP, RegisterName::HL) => {
                    self.next()?;
                    self.emit(&[0xF9]);
                    Ok(())
                }
                (RegisterName::SP, RegisterName::IX) => {
                    self.next()?;
                    self.emit(&[0xDD, 0xF9]);
                    Ok(())
                }
                (RegisterName::SP, RegisterName::IY) => {
                    self.next()?;
                    self.emit(&[0xFD, 0xF9]);
                    Ok(())
                }
                _ => Err((
                    rloc,
                    StmtError::Error(format!("Invalid register \"{name}\"")),
                )),
            },

            _ => {
                let (eloc, addr) = self.expr()?;
                if addr.parenthesized {
                    match rp {
                        RegisterName::HL => self.emit_byte(0x2A),
                        RegisterName::BC => self.emit(&[0xED, 0x4B]),
                        RegisterName::DE => self.emit(&[0xED, 0x5B]),
                        _ => self.emit(&[0xED, 0x7B]),
                    }
                } else {
                    match rp {
                        RegisterName::HL => self.emit_byte(0x21),
                        RegisterName::BC => self.emit_byte(0x01),
                        RegisterName::DE => self.emit_byte(0x11),
                        _ => self.emit_byte(0x31),
                    }
                }
                self.emit_addr_word(eloc, addr);
                Ok(())
            }
        }
    }

    fn ld_index_src(&mut self, prefix: u8) -> StmtResult<()> {
        let (eloc, addr) = self.expr()?;
        if addr.parenthesized {
            self.emit(&[prefix, 0x2A]);
        } else {
            self.emit(&[prefix, 0x21]);
        }
        self.emit_addr_word(eloc, addr);
        Ok(())
    }

    /// `LD (…), …` destinations; the opening paren has been consumed.
    fn ld_mem_dst(&mut self, ploc: SourceLoc) -> StmtResult<()> {
        match self.peek()? {
            Some(&Token::Register {
                name: RegisterName::HL,
                ..
            }) => {
                self.next()?;
                self.expect_symbol(SymbolName::ParenClose)?;
                self.expect_symbol(SymbolName::Comma)?;
                match self.peek()? {
                    Some(&Token::Register { loc: rloc, name }) => {
                        self.next()?;
                        match reg_bits(name) {
                            Some(bits) => {
                                self.emit(&[0x70 | bits]);
                                Ok(())
                            }
                            None => Err((
                                rloc,
                                StmtError::Error(format!("Invalid register \"{name}\"")),
                            )),
                        }
                    }
                    _ => {
                        let (eloc, addr) = self.expr()?;
                        self.emit_byte(0x36);
                        self.emit_addr_byte(eloc, addr);
                        Ok(())
                    }
                }
            }

            Some(&Token::Register { name, .. }) if index_prefix(name).is_some() => {
                self.next()?;
                let prefix = index_prefix(name).unwrap();
                let d = self.index_displacement()?;
                self.expect_symbol(SymbolName::Comma)?;
                match self.peek()? {
                    Some(&Token::Register { loc: rloc, name }) => {
                        self.next()?;
                        match reg_bits(name) {
                            Some(bits) => {
                                self.emit(&[prefix, 0x70 | bits, d]);
                                Ok(())
                            }
                            None => Err((
                                rloc,
                                StmtError::Error(format!("Invalid register \"{name}\"")),
                            )),
                        }
                    }
                    _ => {
                        let (eloc, addr) = self.expr()?;
                        self.emit(&[prefix, 0x36, d]);
                        self.emit_addr_byte(eloc, addr);
                        Ok(())
                    }
                }
            }

            Some(&Token::Register {
                name: RegisterName::BC,
                ..
            }) => {
                self.next()?;
                self.expect_symbol(SymbolName::ParenClose)?;
                self.expect_symbol(SymbolName::Comma)?;
                self.expect_register(RegisterName::A)?;
                self.emit(&[0x02]);
                Ok(())
            }

            Some(&Token::Register {
                name: RegisterName::DE,
                ..
            }) => {
                self.next()?;
                self.expect_symbol(SymbolName::ParenClose)?;
                self.expect_symbol(SymbolName::Comma)?;
                self.expect_register(RegisterName::A)?;
                self.emit(&[0x12]);
                Ok(())
            }

            Some(&Token::Register { loc, name }) => Err((
                loc,
                StmtError::Error(format!("Invalid register \"{name}\"")),
            )),

            Some(_) => {
                // LD (nn), …
                let (eloc, addr) = self.expr()?;
                self.expect_symbol(SymbolName::ParenClose)?;
                self.expect_symbol(SymbolName::Comma)?;
                match self.next()? {
                    Some(Token::Register {
                        name: RegisterName::A,
                        ..
                    }) => self.emit_byte(0x32),
                    Some(Token::Register {
                        name: RegisterName::HL,
                        ..
                    }) => self.emit_byte(0x22),
                    Some(Token::Register {
                        name: RegisterName::BC,
                        ..
                    }) => self.emit(&[0xED, 0x43]),
                    Some(Token::Register {
                        name: RegisterName::DE,
                        ..
                    }) => self.emit(&[0xED, 0x53]),
                    Some(Token::Register {
                        name: RegisterName::SP,
                        ..
                    }) => self.emit(&[0xED, 0x73]),
                    Some(Token::Register {
                        name: RegisterName::IX,
                        ..
                    }) => self.emit(&[0xDD, 0x22]),
                    Some(Token::Register {
                        name: RegisterName::IY,
                        ..
                    }) => self.emit(&[0xFD, 0x22]),
                    Some(Token::Register { loc, name }) => {
                        return Err((
                            loc,
                            StmtError::Error(format!("Invalid register \"{name}\"")),
                        ))
                    }
                    Some(tok) => {
                        return Err((
                            tok.loc(),
                            StmtError::Error(format!(
                                "Unexpected {}, expected a register",
                                tok.as_display(&self.str_interner)
                            )),
                        ))
                    }
                    None => return self.end_of_input_err(),
                }
                self.emit_addr_word(eloc, addr);
                Ok(())
            }

            None => Err((ploc, StmtError::Error("Unexpected end of input".to_string()))),
        }
    }

    fn op_ex(&mut self, _loc: SourceLoc) -> StmtResult<()> {
        match self.next()? {
            Some(Token::Register {
                name: RegisterName::DE,
                ..
            }) => {
                self.expect_symbol(SymbolName::Comma)?;
                self.expect_register(RegisterName::HL)?;
                self.emit(&[0xEB]);
                Ok(())
            }
            Some(Token::Register {
                name: RegisterName::AF,
                ..
            }) => {
                self.expect_symbol(SymbolName::Comma)?;
                self.expect_register(RegisterName::AFPrime)?;
                self.emit(&[0x08]);
                Ok(())
            }
            Some(Token::Symbol {
                name: SymbolName::ParenOpen,
                ..
            }) => {
                self.expect_register(RegisterName::SP)?;
                self.expect_symbol(SymbolName::ParenClose)?;
                self.expect_symbol(SymbolName::Comma)?;
                match self.next()? {
                    Some(Token::Register {
                        name: RegisterName::HL,
                        ..
                    }) => {
                        self.emit(&[0xE3]);
                        Ok(())
                    }
                    Some(Token::Register {
                        name: RegisterName::IX,
                        ..
                    }) => {
                        self.emit(&[0xDD, 0xE3]);
                        Ok(())
                    }
                    Some(Token::Register {
                        name: RegisterName::IY,
                        ..
                    }) => {
                        self.emit(&[0xFD, 0xE3]);
                        Ok(())
                    }
                    Some(tok) => Err((
                        tok.loc(),
                        StmtError::Error(format!(
                            "Unexpected {}, expected \"HL\", \"IX\", or \"IY\"",
                            tok.as_display(&self.str_interner)
                        )),
                    )),
                    None => self.end_of_input_err(),
                }
            }
            Some(tok) => Err((
                tok.loc(),
                StmtError::Error(format!(
                    "Unexpected {}, expected \"DE\", \"AF\", or \"(SP)\"",
                    tok.as_display(&self.str_interner)
                )),
            )),
            None => self.end_of_input_err(),
        }
    }

    fn op_push_pop(&mut self, _loc: SourceLoc, push: bool) -> StmtResult<()> {
        let base = if push { 0xC5 } else { 0xC1 };
        match self.next()? {
            Some(Token::Register {
                name: RegisterName::AF,
                ..
            }) => {
                self.emit(&[base | 0x30]);
                Ok(())
            }
            Some(Token::Register {
                name: RegisterName::IX,
                ..
            }) => {
                self.emit(&[0xDD, base | 0x20]);
                Ok(())
            }
            Some(Token::Register {
                name: RegisterName::IY,
                ..
            }) => {
                self.emit(&[0xFD, base | 0x20]);
                Ok(())
            }
            Some(Token::Register { loc, name }) => match pair_bits(name) {
                Some(bits) if name != RegisterName::SP => {
                    self.emit(&[base | (bits << 4)]);
                    Ok(())
                }
                _ => Err((
                    loc,
                    StmtError::Error(format!("Invalid register \"{name}\"")),
                )),
            },
            Some(tok) => Err((
                tok.loc(),
                StmtError::Error(format!(
                    "Unexpected {}, expected a register pair",
                    tok.as_display(&self.str_interner)
                )),
            )),
            None => self.end_of_input_err(),
        }
    }

    /// CB-prefixed rotates and shifts.
    fn op_rotate(&mut self, _loc: SourceLoc, base: u8) -> StmtResult<()> {
        match self.next()? {
            Some(Token::Register { loc, name }) => match reg_bits(name) {
                Some(bits) => {
                    self.emit(&[0xCB, base | bits]);
                    Ok(())
                }
                None => Err((
                    loc,
                    StmtError::Error(format!("Invalid register \"{name}\"")),
                )),
            },
            Some(Token::Symbol {
                loc: ploc,
                name: SymbolName::ParenOpen,
            }) => match self.next()? {
                Some(Token::Register {
                    name: RegisterName::HL,
                    ..
                }) => {
                    self.expect_symbol(SymbolName::ParenClose)?;
                    self.emit(&[0xCB, base | 6]);
                    Ok(())
                }
                Some(Token::Register { name, .. }) if index_prefix(name).is_some() => {
                    let prefix = index_prefix(name).unwrap();
                    let d = self.index_displacement()?;
                    self.emit(&[prefix, 0xCB, d, base | 6]);
                    Ok(())
                }
                _ => Err((
                    ploc,
                    StmtError::Error("Expected \"(HL)\", \"(IX…)\", or \"(IY…)\"".to_string()),
                )),
            },
            Some(tok) => Err((
                tok.loc(),
                StmtError::Error(format!(
                    "Unexpected {}, expected a register or memory operand",
                    tok.as_display(&self.str_interner)
                )),
            )),
            None => self.end_of_input_err(),
        }
    }

    /// The 8-bit ALU operand shapes: register, `(HL)`, indexed, or an
    /// immediate byte.
    fn alu_operand(&mut self, _loc: SourceLoc, reg_base: u8, imm_op: u8) -> StmtResult<()> {
        match self.peek()? {
            Some(&Token::Register { loc: rloc, name }) => {
                self.next()?;
                match reg_bits(name) {
                    Some(bits) => {
                        self.emit(&[reg_base | bits]);
                        Ok(())
                    }
                    None => Err((
                        rloc,
                        StmtError::Error(format!("Invalid register \"{name}\"")),
                    )),
                }
            }

            Some(&Token::Symbol {
                name: SymbolName::ParenOpen,
                ..
            }) => {
                let paren = self.next()?.unwrap();
                match self.peek()? {
                    Some(&Token::Register {
                        name: RegisterName::HL,
                        ..
                    }) => {
                        self.next()?;
                        self.expect_symbol(SymbolName::ParenClose)?;
                        self.emit(&[reg_base | 6]);
                        Ok(())
                    }
                    Some(&Token::Register { name, .. }) if index_prefix(name).is_some() => {
                        self.next()?;
                        let prefix = index_prefix(name).unwrap();
                        let d = self.index_displacement()?;
                        self.emit(&[prefix, reg_base | 6, d]);
                        Ok(())
                    }
                    Some(&Token::Register { loc, name }) => Err((
                        loc,
                        StmtError::Error(format!("Invalid register \"{name}\"")),
                    )),
                    _ => {
                        // A parenthesized immediate expression.
                        self.push_back(paren);
                        let (eloc, addr) = self.expr()?;
                        self.emit_byte(imm_op);
                        self.emit_addr_byte(eloc, addr);
                        Ok(())
                    }
                }
            }

            _ => {
                let (eloc, addr) = self.expr()?;
                self.emit_byte(imm_op);
                self.emit_addr_byte(eloc, addr);
                Ok(())
            }
        }
    }

    fn op_add(&mut self, loc: SourceLoc) -> StmtResult<()> {
        match self.next()? {
            Some(Token::Register {
                name: RegisterName::A,
                ..
            }) => {
                self.expect_symbol(SymbolName::Comma)?;
                self.alu_operand(loc, 0x80, 0xC6)
            }
            Some(Token::Register {
                name: RegisterName::HL,
                ..
            }) => {
                self.expect_symbol(SymbolName::Comma)?;
                let bits = self.expect_pair()?;
                self.emit(&[0x09 | (bits << 4)]);
                Ok(())
            }
            Some(Token::Register { name, .. }) if index_prefix(name).is_some() => {
                let prefix = index_prefix(name).unwrap();
                self.expect_symbol(SymbolName::Comma)?;
                match self.next()? {
                    Some(Token::Register {
                        name: RegisterName::BC,
                        ..
                    }) => {
                        self.emit(&[prefix, 0x09]);
                        Ok(())
                    }
                    Some(Token::Register {
                        name: RegisterName::DE,
                        ..
                    }) => {
                        self.emit(&[prefix, 0x19]);
                        Ok(())
                    }
                    Some(Token::Register {
                        name: RegisterName::SP,
                        ..
                    }) => {
                        self.emit(&[prefix, 0x39]);
                        Ok(())
                    }
                    Some(Token::Register { name: rhs, .. }) if rhs == name => {
                        self.emit(&[prefix, 0x29]);
                        Ok(())
                    }
                    Some(Token::Register { loc: rloc, name: rhs }) => Err((
                        rloc,
                        StmtError::Error(format!("Invalid register \"{rhs}\"")),
                    )),
                    Some(tok) => Err((
                        tok.loc(),
                        StmtError::Error(format!(
                            "Unexpected {}, expected a register pair",
                            tok.as_display(&self.str_interner)
                        )),
                    )),
                    None => self.end_of_input_err(),
                }
            }
            Some(tok) => Err((
                tok.loc(),
                StmtError::Error(format!(
                    "Unexpected {}, expected \"A\", \"HL\", \"IX\", or \"IY\"",
                    tok.as_display(&self.str_interner)
                )),
            )),
            None => self.end_of_input_err(),
        }
    }

    fn op_adc_sbc(&mut self, loc: SourceLoc, adc: bool) -> StmtResult<()> {
        match self.next()? {
            Some(Token::Register {
                name: RegisterName::A,
                ..
            }) => {
                self.expect_symbol(SymbolName::Comma)?;
                if adc {
                    self.alu_operand(loc, 0x88, 0xCE)
                } else {
                    self.alu_operand(loc, 0x98, 0xDE)
                }
            }
            Some(Token::Register {
                name: RegisterName::HL,
                ..
            }) => {
                self.expect_symbol(SymbolName::Comma)?;
                let bits = self.expect_pair()?;
                let base = if adc { 0x4A } else { 0x42 };
                self.emit(&[0xED, base | (bits << 4)]);
                Ok(())
            }
            Some(tok) => Err((
                tok.loc(),
                StmtError::Error(format!(
                    "Unexpected {}, expected \"A\" or \"HL\"",
                    tok.as_display(&self.str_interner)
                )),
            )),
            None => self.end_of_input_err(),
        }
    }

    fn expect_pair(&mut self) -> StmtResult<u8> {
        match self.next()? {
            Some(Token::Register { loc, name }) => match pair_bits(name) {
                Some(bits) => Ok(bits),
                None => Err((
                    loc,
                    StmtError::Error(format!("Invalid register \"{name}\"")),
                )),
            },
            Some(tok) => Err((
                tok.loc(),
                StmtError::Error(format!(
                    "Unexpected {}, expected a register pair",
                    tok.as_display(&self.str_interner)
                )),
            )),
            None => self.end_of_input_err(),
        }
    }

    fn op_inc_dec(&mut self, _loc: SourceLoc, inc: bool) -> StmtResult<()> {
        match self.next()? {
            Some(Token::Register { loc, name }) => {
                if let Some(bits) = reg_bits(name) {
                    let base = if inc { 0x04 } else { 0x05 };
                    self.emit(&[base | (bits << 3)]);
                    return Ok(());
                }
                if let Some(bits) = pair_bits(name) {
                    let base = if inc { 0x03 } else { 0x0B };
                    self.emit(&[base | (bits << 4)]);
                    return Ok(());
                }
                if let Some(prefix) = index_prefix(name) {
                    self.emit(&[prefix, if inc { 0x23 } else { 0x2B }]);
                    return Ok(());
                }
                Err((
                    loc,
                    StmtError::Error(format!("Invalid register \"{name}\"")),
                ))
            }
            Some(Token::Symbol {
                loc: ploc,
                name: SymbolName::ParenOpen,
            }) => match self.next()? {
                Some(Token::Register {
                    name: RegisterName::HL,
                    ..
                }) => {
                    self.expect_symbol(SymbolName::ParenClose)?;
                    self.emit(&[if inc { 0x34 } else { 0x35 }]);
                    Ok(())
                }
                Some(Token::Register { name, .. }) if index_prefix(name).is_some() => {
                    let prefix = index_prefix(name).unwrap();
                    let d = self.index_displacement()?;
                    self.emit(&[prefix, if inc { 0x34 } else { 0x35 }, d]);
                    Ok(())
                }
                _ => Err((
                    ploc,
                    StmtError::Error("Expected \"(HL)\", \"(IX…)\", or \"(IY…)\"".to_string()),
                )),
            },
            Some(tok) => Err((
                tok.loc(),
                StmtError::Error(format!(
                    "Unexpected {}, expected a register or memory operand",
                    tok.as_display(&self.str_interner)
                )),
            )),
            None => self.end_of_input_err(),
        }
    }

    fn op_bit(&mut self, _loc: SourceLoc, base: u8) -> StmtResult<()> {
        let (bloc, baddr) = self.expr()?;
        let mut bit = self.require_const(bloc, baddr);
        if !baddr.is_undefined() && !(0..8).contains(&bit) {
            self.report(bloc, &format!("Bit number ({bit}) is out of range"));
            bit = 0;
        }
        let bit = (bit as u8 & 7) << 3;
        self.expect_symbol(SymbolName::Comma)?;
        match self.next()? {
            Some(Token::Register { loc, name }) => match reg_bits(name) {
                Some(bits) => {
                    self.emit(&[0xCB, base | bit | bits]);
                    Ok(())
                }
                None => Err((
                    loc,
                    StmtError::Error(format!("Invalid register \"{name}\"")),
                )),
            },
            Some(Token::Symbol {
                loc: ploc,
                name: SymbolName::ParenOpen,
            }) => match self.next()? {
                Some(Token::Register {
                    name: RegisterName::HL,
                    ..
                }) => {
                    self.expect_symbol(SymbolName::ParenClose)?;
                    self.emit(&[0xCB, base | bit | 6]);
                    Ok(())
                }
                Some(Token::Register { name, .. }) if index_prefix(name).is_some() => {
                    let prefix = index_prefix(name).unwrap();
                    let d = self.index_displacement()?;
                    self.emit(&[prefix, 0xCB, d, base | bit | 6]);
                    Ok(())
                }
                _ => Err((
                    ploc,
                    StmtError::Error("Expected \"(HL)\", \"(IX…)\", or \"(IY…)\"".to_string()),
                )),
            },
            Some(tok) => Err((
                tok.loc(),
                StmtError::Error(format!(
                    "Unexpected {}, expected a register or memory operand",
                    tok.as_display(&self.str_interner)
                )),
            )),
            None => self.end_of_input_err(),
        }
    }

    fn op_jp(&mut self, _loc: SourceLoc) -> StmtResult<()> {
        match self.peek()? {
            Some(&Token::Symbol {
                loc: ploc,
                name: SymbolName::ParenOpen,
            }) => {
                self.next()?;
                match self.next()? {
                    Some(Token::Register {
                        name: RegisterName::HL,
                        ..
                    }) => self.emit(&[0xE9]),
                    Some(Token::Register {
                        name: RegisterName::IX,
                        ..
                    }) => self.emit(&[0xDD, 0xE9]),
                    Some(Token::Register {
                        name: RegisterName::IY,
                        ..
                    }) => self.emit(&[0xFD, 0xE9]),
                    _ => {
                        return Err((
                            ploc,
                            StmtError::Error(
                                "Expected \"(HL)\", \"(IX)\", or \"(IY)\"".to_string(),
                            ),
                        ))
                    }
                }
                self.expect_symbol(SymbolName::ParenClose)?;
                Ok(())
            }
            _ => {
                let cond = self.parse_condition()?;
                if let Some(cond) = cond {
                    self.expect_symbol(SymbolName::Comma)?;
                    self.emit_byte(cond.jp_opcode());
                } else {
                    self.emit_byte(0xC3);
                }
                let (eloc, addr) = self.expr()?;
                self.emit_addr_word(eloc, addr);
                Ok(())
            }
        }
    }

    fn op_jr(&mut self, loc: SourceLoc) -> StmtResult<()> {
        let cond = self.parse_condition()?;
        if let Some(cond) = cond {
            if cond.jr_opcode().is_none() {
                return Err((
                    loc,
                    StmtError::Error(format!("\"JR\" cannot test the condition \"{cond}\"")),
                ));
            }
            self.expect_symbol(SymbolName::Comma)?;
        }
        let (tloc, target) = self.expr()?;
        self.emit_jump_to(tloc, cond, target);
        Ok(())
    }

    fn op_call(&mut self, _loc: SourceLoc) -> StmtResult<()> {
        let cond = self.parse_condition()?;
        if let Some(cond) = cond {
            self.expect_symbol(SymbolName::Comma)?;
            self.emit_byte(cond.call_opcode());
        } else {
            self.emit_byte(0xCD);
        }
        let (eloc, addr) = self.expr()?;
        self.emit_addr_word(eloc, addr);
        Ok(())
    }

    fn op_rst(&mut self, _loc: SourceLoc) -> StmtResult<()> {
        let (eloc, addr) = self.expr()?;
        let mut target = self.require_const(eloc, addr);
        if !addr.is_undefined() && (target & !0x38) != 0 {
            self.report(eloc, &format!("RST target ({target}) is out of range"));
            target = 0;
        }
        self.emit_byte(0xC7 | (target as u8 & 0x38));
        Ok(())
    }

    fn op_im(&mut self, _loc: SourceLoc) -> StmtResult<()> {
        let (eloc, addr) = self.expr()?;
        let mode = self.require_const(eloc, addr);
        let opcode = match mode {
            0 => 0x46,
            1 => 0x56,
            2 => 0x5E,
            _ => {
                if !addr.is_undefined() {
                    self.report(eloc, &format!("Interrupt mode ({mode}) is out of range"));
                }
                0x46
            }
        };
        self.emit(&[0xED, opcode]);
        Ok(())
    }

    fn op_in(&mut self, _loc: SourceLoc) -> StmtResult<()> {
        let (rloc, reg) = match self.next()? {
            Some(Token::Register { loc, name }) => (loc, name),
            Some(tok) => {
                return Err((
                    tok.loc(),
                    StmtError::Error(format!(
                        "Unexpected {}, expected a register",
                        tok.as_display(&self.str_interner)
                    )),
                ))
            }
            None => return self.end_of_input_err(),
        };
        let bits = match reg_bits(reg) {
            Some(bits) => bits,
            None => {
                return Err((
                    rloc,
                    StmtError::Error(format!("Invalid register \"{reg}\"")),
                ))
            }
        };
        self.expect_symbol(SymbolName::Comma)?;
        self.expect_symbol(SymbolName::ParenOpen)?;
        match self.peek()? {
            Some(&Token::Register {
                name: RegisterName::C,
                ..
            }) => {
                self.next()?;
                self.expect_symbol(SymbolName::ParenClose)?;
                self.emit(&[0xED, 0x40 | (bits << 3)]);
                Ok(())
            }
            _ if reg == RegisterName::A => {
                let (eloc, addr) = self.expr()?;
                self.expect_symbol(SymbolName::ParenClose)?;
                self.emit_byte(0xDB);
                self.emit_addr_byte(eloc, addr);
                Ok(())
            }
            _ => Err((
                rloc,
                StmtError::Error(format!("Invalid register \"{reg}\"")),
            )),
        }
    }

    fn op_out(&mut self, _loc: SourceLoc) -> StmtResult<()> {
        self.expect_symbol(SymbolName::ParenOpen)?;
        match self.peek()? {
            Some(&Token::Register {
                name: RegisterName::C,
                ..
            }) => {
                self.next()?;
                self.expect_symbol(SymbolName::ParenClose)?;
                self.expect_symbol(SymbolName::Comma)?;
                match self.next()? {
                    Some(Token::Register { loc, name }) => match reg_bits(name) {
                        Some(bits) => {
                            self.emit(&[0xED, 0x41 | (bits << 3)]);
                            Ok(())
                        }
                        None => Err((
                            loc,
                            StmtError::Error(format!("Invalid register \"{name}\"")),
                        )),
                    },
                    Some(tok) => Err((
                        tok.loc(),
                        StmtError::Error(format!(
                            "Unexpected {}, expected a register",
                            tok.as_display(&self.str_interner)
                        )),
                    )),
                    None => self.end_of_input_err(),
                }
            }
            _ => {
                let (eloc, addr) = self.expr()?;
                self.expect_symbol(SymbolName::ParenClose)?;
                self.expect_symbol(SymbolName::Comma)?;
                self.expect_register(RegisterName::A)?;
                self.emit_byte(0xD3);
                self.emit_addr_byte(eloc, addr);
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Object

    fn build_object(&self) -> Object {
        let publics = self.symtab.publics();
        let mut ids: Vec<u16> = publics.iter().map(|&(id, _)| id).collect();
        for (_, target) in &self.usages {
            if let Some(id) = target.id {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        ids.dedup();

        let interner = self.str_interner.as_ref().borrow();
        let ids = ids
            .into_iter()
            .map(|id| {
                let name = interner.get(StrRef(id)).unwrap_or("").to_string();
                (id, name)
            })
            .collect();

        Object {
            code: self.code.bytes().to_vec(),
            data: self.data.bytes().to_vec(),
            ids,
            publics,
            fixups: self.usages.clone(),
        }
    }
}
