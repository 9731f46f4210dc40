use crate::addr::{AddrKind, Address};

/// An ordered byte buffer whose tail is the current emission address.
/// Content is rewritten every pass; the buffer refuses to grow past
/// 64 KiB and latches an overflow flag instead.
pub struct Segment {
    kind: AddrKind,
    data: Vec<u8>,
    overflowed: bool,
}

impl Segment {
    #[inline]
    pub fn new(kind: AddrKind) -> Self {
        Self {
            kind,
            data: Vec::new(),
            overflowed: false,
        }
    }

    #[inline]
    pub fn kind(&self) -> AddrKind {
        self.kind
    }

    #[inline]
    pub fn tail(&self) -> u16 {
        self.data.len() as u16
    }

    #[inline]
    pub fn here(&self) -> Address {
        Address::reloc(self.kind, self.tail())
    }

    #[inline]
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    #[inline]
    pub fn emit(&mut self, byte: u8) {
        if self.data.len() >= 0x10000 {
            self.overflowed = true;
            return;
        }
        self.data.push(byte);
    }

    #[inline]
    pub fn emit_word(&mut self, word: u16) {
        let [lo, hi] = word.to_le_bytes();
        self.emit(lo);
        self.emit(hi);
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.overflowed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_tracks_emission() {
        let mut seg = Segment::new(AddrKind::Code);
        assert_eq!(0, seg.tail());
        seg.emit(0x3E);
        seg.emit_word(0x1234);
        assert_eq!(3, seg.tail());
        assert_eq!(&[0x3E, 0x34, 0x12], seg.bytes());
        assert_eq!(AddrKind::Code, seg.here().kind);
        assert_eq!(3, seg.here().value);
    }
}
