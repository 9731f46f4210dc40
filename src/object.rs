use std::io::{self, Write};

use crate::addr::{AddrKind, Address, Part};

pub const OBJ_VERSION: u16 = 0x0100;

/// The relocatable object: two segments, the names referenced by publics
/// and external fix-ups, the exported symbols, and the fix-up table the
/// linker patches. Every multi-byte field is little-endian; strings are
/// a length word followed by the bytes.
#[derive(Debug)]
pub struct Object {
    pub code: Vec<u8>,
    pub data: Vec<u8>,
    pub ids: Vec<(u16, String)>,
    pub publics: Vec<(u16, Address)>,
    pub fixups: Vec<(Address, Address)>,
}

impl Object {
    pub fn write(&self, writer: &mut dyn Write) -> io::Result<()> {
        write_word(writer, OBJ_VERSION)?;

        write_word(writer, self.code.len() as u16)?;
        writer.write_all(&self.code)?;
        write_word(writer, self.data.len() as u16)?;
        writer.write_all(&self.data)?;

        write_word(writer, self.ids.len() as u16)?;
        for (id, name) in &self.ids {
            write_word(writer, *id)?;
            write_string(writer, name)?;
        }

        write_word(writer, self.publics.len() as u16)?;
        for (id, address) in &self.publics {
            write_word(writer, *id)?;
            write_address(writer, address)?;
        }

        write_word(writer, self.fixups.len() as u16)?;
        for (offset, target) in &self.fixups {
            write_address(writer, offset)?;
            write_address(writer, target)?;
        }
        Ok(())
    }
}

#[inline]
fn write_word(writer: &mut dyn Write, word: u16) -> io::Result<()> {
    writer.write_all(&word.to_le_bytes())
}

fn write_string(writer: &mut dyn Write, s: &str) -> io::Result<()> {
    write_word(writer, s.len() as u16)?;
    writer.write_all(s.as_bytes())
}

fn write_address(writer: &mut dyn Write, address: &Address) -> io::Result<()> {
    let kind = match address.kind {
        AddrKind::Undefined => 0,
        AddrKind::Const => 1,
        AddrKind::Code => 2,
        AddrKind::Data => 3,
        AddrKind::External => 4,
    };
    let part = match address.part {
        Part::Word => 0,
        Part::Low => 1,
        Part::High => 2,
    };
    writer.write_all(&[kind, part])?;
    write_word(writer, address.id.unwrap_or(0))?;
    write_word(writer, address.value as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_stable() {
        let object = Object {
            code: vec![0xC9],
            data: vec![],
            ids: vec![(0x100, "FOO".to_string())],
            publics: vec![(0x100, Address::reloc(AddrKind::Code, 0))],
            fixups: vec![],
        };

        let mut bytes = Vec::new();
        object.write(&mut bytes).unwrap();

        #[rustfmt::skip]
        assert_eq!(vec![
            0x00, 0x01,             // version
            0x01, 0x00, 0xC9,       // code segment
            0x00, 0x00,             // data segment
            0x01, 0x00,             // id count
            0x00, 0x01,             // id
            0x03, 0x00, b'F', b'O', b'O',
            0x01, 0x00,             // public count
            0x00, 0x01,             // id
            0x02, 0x00,             // type = code, part = word
            0x00, 0x00,             // no external id
            0x00, 0x00,             // value
            0x00, 0x00,             // fixup count
        ], bytes);
    }

    #[test]
    fn fixup_addresses_round_out_the_file() {
        let target = Address::external(0x101);
        let object = Object {
            code: vec![0xCD, 0x00, 0x00],
            data: vec![],
            ids: vec![(0x101, "BAR".to_string())],
            publics: vec![],
            fixups: vec![(Address::reloc(AddrKind::Code, 1), target)],
        };

        let mut bytes = Vec::new();
        object.write(&mut bytes).unwrap();

        // One fixup: offset address then target address.
        let tail = &bytes[bytes.len() - 14..];
        #[rustfmt::skip]
        assert_eq!(&[
            0x01, 0x00,
            0x02, 0x00, 0x00, 0x00, 0x01, 0x00,  // code offset 1
            0x04, 0x00, 0x01, 0x01, 0x00, 0x00,  // external id 0x101
        ], tail);
    }
}
