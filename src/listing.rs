use std::io::{self, Write};

use crate::addr::AddrKind;

/// One source line with the bytes it produced. `depth` is the open
/// structured-block depth at the start of the line.
#[derive(Debug)]
pub struct ListingLine {
    pub kind: AddrKind,
    pub addr: u16,
    pub bytes: Vec<u8>,
    pub depth: usize,
    pub text: String,
}

#[derive(Debug, Default)]
pub struct Listing {
    lines: Vec<ListingLine>,
}

impl Listing {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn push(&mut self, line: ListingLine) {
        self.lines.push(line);
    }

    #[inline]
    pub fn clear(&mut self) {
        self.lines.clear();
    }

    #[inline]
    pub fn lines(&self) -> &[ListingLine] {
        &self.lines
    }

    pub fn write(&self, writer: &mut dyn Write) -> io::Result<()> {
        for line in &self.lines {
            let mark = match line.kind {
                AddrKind::Data => '"',
                _ => '\'',
            };
            let indent = "  ".repeat(line.depth);
            if line.bytes.is_empty() {
                writeln!(writer, "{:18}{indent}{}", "", line.text)?;
                continue;
            }
            // At most four bytes per row; longer emissions continue on
            // rows of their own.
            for (row, chunk) in line.bytes.chunks(4).enumerate() {
                let addr = line.addr.wrapping_add((row * 4) as u16);
                let bytes = format_bytes(chunk);
                if row == 0 {
                    writeln!(writer, "{addr:04X}{mark} {bytes:<12}{indent}{}", line.text)?;
                } else {
                    writeln!(writer, "{addr:04X}{mark} {bytes:<12}")?;
                }
            }
        }
        Ok(())
    }
}

fn format_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_line_layout() {
        let mut listing = Listing::new();
        listing.push(ListingLine {
            kind: AddrKind::Code,
            addr: 4,
            bytes: vec![0x3E, 0x05],
            depth: 1,
            text: "LD A, 5".to_string(),
        });

        let mut out = Vec::new();
        listing.write(&mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("0004' 3E 05"));
        assert!(out.trim_end().ends_with("LD A, 5"));
    }

    #[test]
    fn long_emissions_continue_on_extra_rows() {
        let mut listing = Listing::new();
        listing.push(ListingLine {
            kind: AddrKind::Data,
            addr: 0,
            bytes: (0..6).collect(),
            depth: 0,
            text: "DEFB 0,1,2,3,4,5".to_string(),
        });

        let mut out = Vec::new();
        listing.write(&mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        let mut lines = out.lines();
        let first = lines.next().unwrap();
        assert!(first.starts_with("0000\" 00 01 02 03"));
        assert!(first.ends_with("DEFB 0,1,2,3,4,5"));
        assert_eq!("0004\" 04 05", lines.next().unwrap().trim_end());
    }
}
