/// Which segment (or neither) an address is relative to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AddrKind {
    Undefined,
    Const,
    Code,
    Data,
    External,
}

/// Which part of a word an emitted fix-up selects. `Low`/`High` are
/// produced by the `LOW`/`HIGH` operators on relocatable values.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Part {
    Word,
    Low,
    High,
}

/// The central semantic value: what the expression evaluator yields and
/// what fix-ups and public symbols carry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Address {
    pub kind: AddrKind,
    pub value: i32,
    pub id: Option<u16>,
    pub part: Part,
    pub parenthesized: bool,
}

impl Address {
    #[inline]
    pub fn undefined() -> Self {
        Self {
            kind: AddrKind::Undefined,
            value: 0,
            id: None,
            part: Part::Word,
            parenthesized: false,
        }
    }

    #[inline]
    pub fn constant(value: i32) -> Self {
        Self {
            kind: AddrKind::Const,
            value,
            id: None,
            part: Part::Word,
            parenthesized: false,
        }
    }

    #[inline]
    pub fn reloc(kind: AddrKind, value: u16) -> Self {
        Self {
            kind,
            value: value as i32,
            id: None,
            part: Part::Word,
            parenthesized: false,
        }
    }

    #[inline]
    pub fn external(id: u16) -> Self {
        Self {
            kind: AddrKind::External,
            value: 0,
            id: Some(id),
            part: Part::Word,
            parenthesized: false,
        }
    }

    #[inline]
    pub fn is_undefined(&self) -> bool {
        self.kind == AddrKind::Undefined
    }

    #[inline]
    pub fn is_const(&self) -> bool {
        self.kind == AddrKind::Const
    }

    /// Code, data, or external: anything the linker must resolve.
    #[inline]
    pub fn is_reloc(&self) -> bool {
        matches!(
            self.kind,
            AddrKind::Code | AddrKind::Data | AddrKind::External
        )
    }

    /// Strip the syntactic parenthesized marker; any operator application
    /// does this.
    #[inline]
    pub fn unwrapped(mut self) -> Self {
        self.parenthesized = false;
        self
    }

    /// `LOW x`: a const folds to its low byte; a relocatable keeps its
    /// kind and selects the low byte in the fix-up.
    pub fn low(self) -> Self {
        let mut out = self.unwrapped();
        if out.is_const() {
            out.value &= 0xFF;
        } else {
            out.part = Part::Low;
        }
        out
    }

    /// `HIGH x`: see `low`.
    pub fn high(self) -> Self {
        let mut out = self.unwrapped();
        if out.is_const() {
            out.value = (out.value >> 8) & 0xFF;
        } else {
            out.part = Part::High;
        }
        out
    }

    /// `self + rhs` where `rhs` must already be const. A relocatable or
    /// external left side carries its kind, id, and part through.
    pub fn add_const(self, rhs: i32) -> Self {
        let mut out = self.unwrapped();
        out.value = out.value.wrapping_add(rhs);
        out
    }

    #[inline]
    pub fn sub_const(self, rhs: i32) -> Self {
        self.add_const(rhs.wrapping_neg())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn const_never_carries_an_id() {
        let addr = Address::constant(0x1234);
        assert!(addr.is_const());
        assert_eq!(None, addr.id);
        assert_eq!(0x34, addr.low().value);
        assert_eq!(0x12, addr.high().value);
    }

    #[test]
    fn low_high_select_parts_of_relocs() {
        let addr = Address::reloc(AddrKind::Code, 0x1234);
        assert_eq!(Part::Low, addr.low().part);
        assert_eq!(Part::High, addr.high().part);
        assert_eq!(0x1234, addr.low().value);
    }

    #[test]
    fn reloc_plus_const_keeps_kind() {
        let addr = Address::external(0x105).add_const(2);
        assert_eq!(AddrKind::External, addr.kind);
        assert_eq!(Some(0x105), addr.id);
        assert_eq!(2, addr.value);
    }

    #[test]
    fn operators_consume_the_paren_marker() {
        let mut addr = Address::constant(5);
        addr.parenthesized = true;
        assert!(!addr.add_const(1).parenthesized);
        assert!(!addr.low().parenthesized);
    }
}
