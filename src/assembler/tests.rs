use std::{
    io::{self, Cursor},
    path::{Path, PathBuf},
};

use fxhash::FxHashMap;

use super::*;

struct StringFileSystem {
    files: FxHashMap<PathBuf, String>,
}

impl StringFileSystem {
    #[inline]
    fn new<P: AsRef<Path>>(files: &[(P, &str)]) -> Self {
        let mut map = FxHashMap::default();
        for (path, s) in files {
            map.insert(path.as_ref().to_path_buf(), s.to_string());
        }
        Self { files: map }
    }
}

impl FileSystem for StringFileSystem {
    type Reader = Cursor<String>;

    #[inline]
    fn is_dir(&self, _: &Path) -> io::Result<bool> {
        Ok(true)
    }

    #[inline]
    fn is_file(&self, path: &Path) -> io::Result<bool> {
        Ok(self.files.contains_key(path))
    }

    #[inline]
    fn open_read(&self, path: &Path) -> io::Result<Self::Reader> {
        Ok(Cursor::new(self.files.get(path).unwrap().clone()))
    }
}

fn assembler<P: AsRef<Path>>(
    files: &[(P, &str)],
) -> Assembler<StringFileSystem, Cursor<String>> {
    Assembler::new(StringFileSystem::new(files))
}

fn assemble(src: &str) -> Output {
    assembler(&[("/test.z80", src)])
        .assemble("/", "test.z80")
        .unwrap()
}

fn code(src: &str) -> Vec<u8> {
    assemble(src).object.code
}

fn errors(src: &str) -> String {
    match assembler(&[("/test.z80", src)]).assemble("/", "test.z80") {
        Ok(_) => panic!("expected errors"),
        Err(e) => format!("{e}"),
    }
}

#[test]
fn ld_immediate_byte() {
    assert_eq!(vec![0x3E, 0x05], code("ld a, 5"));
}

#[test]
fn ld_hl_immediate_vs_memory() {
    assert_eq!(vec![0x21, 0x34, 0x12], code("ld hl, 1234h"));
    assert_eq!(vec![0x2A, 0x34, 0x12], code("ld hl, (1234h)"));
}

#[test]
fn parenthesized_subexpression_is_not_a_memory_load() {
    // The marker only survives when the parens enclose the whole operand.
    assert_eq!(vec![0x21, 0x14, 0x00], code("ld hl, (2+3)*4"));
}

#[test]
fn ld_indexed_immediate() {
    assert_eq!(vec![0xDD, 0x36, 0x02, 0x07], code("ld (ix+2), 7"));
}

#[test]
fn ld_pair_then_add() {
    let src = r#"
            ld bc, 0
            add hl, bc
        "#;
    assert_eq!(vec![0x01, 0x00, 0x00, 0x09], code(src));
}

#[test]
fn ld_family() {
    let src = r#"
            ld a, (bc)
            ld (de), a
            ld a, i
            ld r, a
            ld sp, hl
            ld ix, 1234h
            ld (5678h), iy
            ld b, (ix+1)
            ld (hl), c
            ld e, d
        "#;
    #[rustfmt::skip]
    assert_eq!(vec![
        0x0A,
        0x12,
        0xED, 0x57,
        0xED, 0x4F,
        0xF9,
        0xDD, 0x21, 0x34, 0x12,
        0xFD, 0x22, 0x78, 0x56,
        0xDD, 0x46, 0x01,
        0x71,
        0x5A,
    ], code(src));
}

#[test]
fn ld_pair_memory_loads() {
    let src = r#"
            ld bc, (4000h)
            ld de, (4000h)
            ld sp, (4000h)
            ld (4000h), bc
            ld (4000h), sp
            ld iy, (4000h)
        "#;
    #[rustfmt::skip]
    assert_eq!(vec![
        0xED, 0x4B, 0x00, 0x40,
        0xED, 0x5B, 0x00, 0x40,
        0xED, 0x7B, 0x00, 0x40,
        0xED, 0x43, 0x00, 0x40,
        0xED, 0x73, 0x00, 0x40,
        0xFD, 0x2A, 0x00, 0x40,
    ], code(src));
}

#[test]
fn ld_rejects_wrong_register_through_bc() {
    let err = errors("ld (bc), b");
    assert!(err.contains("Invalid register"), "{err}");
}

#[test]
fn ex_family() {
    let src = r#"
            ex de, hl
            ex af, af'
            ex (sp), hl
            ex (sp), iy
        "#;
    #[rustfmt::skip]
    assert_eq!(vec![
        0xEB,
        0x08,
        0xE3,
        0xFD, 0xE3,
    ], code(src));
}

#[test]
fn push_pop_family() {
    let src = r#"
            push af
            push bc
            pop hl
            pop ix
        "#;
    #[rustfmt::skip]
    assert_eq!(vec![
        0xF5,
        0xC5,
        0xE1,
        0xDD, 0xE1,
    ], code(src));
}

#[test]
fn push_sp_is_invalid() {
    let err = errors("push sp");
    assert!(err.contains("Invalid register"), "{err}");
}

#[test]
fn rotate_family() {
    let src = r#"
            rlc b
            srl (hl)
            rl (ix+3)
            sra a
        "#;
    #[rustfmt::skip]
    assert_eq!(vec![
        0xCB, 0x00,
        0xCB, 0x3E,
        0xDD, 0xCB, 0x03, 0x16,
        0xCB, 0x2F,
    ], code(src));
}

#[test]
fn alu_family() {
    let src = r#"
            sub 5
            and b
            xor (hl)
            or (ix+1)
            cp 'A'
            add a, 1
            adc a, (hl)
            sbc a, c
        "#;
    #[rustfmt::skip]
    assert_eq!(vec![
        0xD6, 0x05,
        0xA0,
        0xAE,
        0xDD, 0xB6, 0x01,
        0xFE, 0x41,
        0xC6, 0x01,
        0x8E,
        0x99,
    ], code(src));
}

#[test]
fn sixteen_bit_arithmetic() {
    let src = r#"
            add hl, sp
            adc hl, bc
            sbc hl, de
            add ix, de
            add iy, iy
        "#;
    #[rustfmt::skip]
    assert_eq!(vec![
        0x39,
        0xED, 0x4A,
        0xED, 0x52,
        0xDD, 0x19,
        0xFD, 0x29,
    ], code(src));
}

#[test]
fn add_ix_rejects_hl() {
    let err = errors("add ix, hl");
    assert!(err.contains("Invalid register"), "{err}");
}

#[test]
fn inc_dec_family() {
    let src = r#"
            inc a
            dec (hl)
            inc ix
            dec sp
            inc (iy+1)
        "#;
    #[rustfmt::skip]
    assert_eq!(vec![
        0x3C,
        0x35,
        0xDD, 0x23,
        0x3B,
        0xFD, 0x34, 0x01,
    ], code(src));
}

#[test]
fn bit_set_res_family() {
    let src = r#"
            bit 7, a
            set 0, (hl)
            res 3, (ix+2)
        "#;
    #[rustfmt::skip]
    assert_eq!(vec![
        0xCB, 0x7F,
        0xCB, 0xC6,
        0xDD, 0xCB, 0x02, 0x9E,
    ], code(src));
}

#[test]
fn bit_eight_is_out_of_range() {
    let err = errors("bit 8, a");
    assert!(err.contains("out of range"), "{err}");
}

#[test]
fn jumps_and_calls() {
    let src = r#"
            jp 1234h
            jp c, 5
            jp (hl)
            jp (ix)
            call nz, 5
            call 5
            ret z
            ret
        "#;
    #[rustfmt::skip]
    assert_eq!(vec![
        0xC3, 0x34, 0x12,
        0xDA, 0x05, 0x00,
        0xE9,
        0xDD, 0xE9,
        0xC4, 0x05, 0x00,
        0xCD, 0x05, 0x00,
        0xC8,
        0xC9,
    ], code(src));
}

#[test]
fn im_and_rst() {
    let src = r#"
            im 0
            im 1
            im 2
            rst 38h
            rst 0
        "#;
    #[rustfmt::skip]
    assert_eq!(vec![
        0xED, 0x46,
        0xED, 0x56,
        0xED, 0x5E,
        0xFF,
        0xC7,
    ], code(src));
}

#[test]
fn rst_39h_is_out_of_range() {
    let err = errors("rst 39h");
    assert!(err.contains("out of range"), "{err}");
}

#[test]
fn im_3_is_out_of_range() {
    let err = errors("im 3");
    assert!(err.contains("out of range"), "{err}");
}

#[test]
fn in_out_family() {
    let src = r#"
            in a, (0feh)
            in b, (c)
            out (c), e
            out (1), a
        "#;
    #[rustfmt::skip]
    assert_eq!(vec![
        0xDB, 0xFE,
        0xED, 0x40,
        0xED, 0x59,
        0xD3, 0x01,
    ], code(src));
}

#[test]
fn no_operand_table() {
    let src = r#"
            ldir
            neg
            rrd
            otir
            outir
            exx
            halt
        "#;
    #[rustfmt::skip]
    assert_eq!(vec![
        0xED, 0xB0,
        0xED, 0x44,
        0xED, 0x67,
        0xED, 0xB3,
        0xED, 0xB3,
        0xD9,
        0x76,
    ], code(src));
}

#[test]
fn expression_precedence() {
    assert_eq!(vec![0x3E, 0x0E], code("ld a, 2+3*4"));
    assert_eq!(vec![0x3E, 0x34], code("ld a, low 1234h"));
    assert_eq!(vec![0x3E, 0x12], code("ld a, high 1234h"));
    assert_eq!(vec![0x3E, 0x01], code("ld a, 10 mod 3"));
    assert_eq!(vec![0x3E, 0x10], code("ld a, 1 shl 4"));
    assert_eq!(vec![0x3E, 0x0F], code("ld a, not 0 and 0fh"));
    assert_eq!(vec![0x3E, 0x06], code("ld a, 2 or 4"));
    assert_eq!(vec![0x3E, 0xFE], code("ld a, -2"));
}

#[test]
fn division_by_zero_is_reported() {
    let err = errors("ld a, 1/0");
    assert!(err.contains("Division by zero"), "{err}");
}

#[test]
fn equ_backward_and_forward() {
    let src = r#"
FIVE    equ 5
        ld a, five
        "#;
    assert_eq!(vec![0x3E, 0x05], code(src));

    let src = r#"
        ld a, later
LATER   equ 7
        "#;
    assert_eq!(vec![0x3E, 0x07], code(src));
}

#[test]
fn forward_label_leaves_a_fixup() {
    let src = r#"
        jp fwd
        nop
FWD:    ret
        "#;
    let output = assemble(src);
    assert_eq!(vec![0xC3, 0x04, 0x00, 0x00, 0xC9], output.object.code);
    assert_eq!(1, output.object.fixups.len());
    let (offset, target) = &output.object.fixups[0];
    assert_eq!(AddrKind::Code, offset.kind);
    assert_eq!(1, offset.value);
    assert_eq!(AddrKind::Code, target.kind);
    assert_eq!(4, target.value);
}

#[test]
fn djnz_backward() {
    assert_eq!(vec![0x10, 0xFE], code("loop: djnz loop"));
}

#[test]
fn djnz_out_of_range_falls_back() {
    let src = r#"
LOOP:   defs 200
        djnz loop
        "#;
    let out = code(src);
    assert_eq!(&[0x05, 0xC2, 0x00, 0x00], &out[200..]);
}

#[test]
fn jr_offset_128_is_still_short() {
    // The inclusive +128 bound lets the short form win here; at the
    // fixpoint the offset settles at +127.
    let src = r#"
        jr fwd
        defs 127
FWD:
        "#;
    let out = code(src);
    assert_eq!(129, out.len());
    assert_eq!(&[0x18, 0x7F], &out[..2]);
}

#[test]
fn jr_offset_129_takes_the_long_form() {
    let src = r#"
        jr fwd
        defs 128
FWD:
        "#;
    let out = code(src);
    assert_eq!(131, out.len());
    assert_eq!(0xC3, out[0]);
}

#[test]
fn jr_backward_at_minus_128() {
    let src = r#"
BACK:   defs 126
        jr back
        "#;
    let out = code(src);
    assert_eq!(&[0x18, 0x80], &out[126..]);
}

#[test]
fn jr_backward_at_minus_129_takes_the_long_form() {
    let src = r#"
BACK:   defs 127
        jr back
        "#;
    let out = code(src);
    assert_eq!(0xC3, out[127]);
}

#[test]
fn jr_condition_must_have_a_short_form() {
    let err = errors("jr po, 5");
    assert!(err.contains("cannot test"), "{err}");
}

#[test]
fn if_else_endif_lowering() {
    let out = code("if nz | inc a | else | dec a | endif");
    assert_eq!(vec![0x28, 0x03, 0x3C, 0x18, 0x01, 0x3D], out);
}

#[test]
fn if_elseif_endif_lowering() {
    let out = code("if z | inc a | elseif c | dec a | endif");
    #[rustfmt::skip]
    assert_eq!(vec![
        0x20, 0x03,
        0x3C,
        0x18, 0x03,
        0x30, 0x01,
        0x3D,
    ], out);
}

#[test]
fn do_while_wend_uses_the_conditional_back_edge() {
    let out = code("do | while nz | inc a | wend");
    assert_eq!(vec![0x3C, 0x20, 0xFD], out);
}

#[test]
fn do_body_while_wend_converges_the_same_way() {
    let out = code("do | inc a | while nz | wend");
    assert_eq!(vec![0x3C, 0x20, 0xFD], out);
}

#[test]
fn while_with_a_following_body_keeps_the_exit_jump() {
    let out = code("do | inc a | while nz | inc b | inc c | wend");
    #[rustfmt::skip]
    assert_eq!(vec![
        0x3C,
        0x28, 0x04,
        0x04,
        0x0C,
        0x18, 0xF9,
    ], out);
}

#[test]
fn dwnz_short_back_edge() {
    assert_eq!(vec![0x3C, 0x10, 0xFD], code("do | inc a | dwnz"));
}

#[test]
fn dwnz_out_of_range_falls_back() {
    let src = "do | defs 200 | dwnz";
    let out = code(src);
    assert_eq!(&[0x05, 0xC2, 0x00, 0x00], &out[200..]);
}

#[test]
fn while_and_dwnz_cannot_mix() {
    let err = errors("do | while nz | dwnz");
    assert!(
        err.contains("cannot be used in the same syntax"),
        "{err}"
    );
}

#[test]
fn multiple_else_is_an_error() {
    let err = errors("if z | else | else | endif");
    assert!(err.contains("Multiple \"ELSE\""), "{err}");
}

#[test]
fn endif_without_if_is_an_error() {
    let err = errors("endif");
    assert!(err.contains("No \"IF\" statement"), "{err}");
}

#[test]
fn wend_without_do_is_an_error() {
    let err = errors("wend");
    assert!(err.contains("No \"WHILE\" statement"), "{err}");
}

#[test]
fn unclosed_if_is_an_error() {
    let err = errors("if z | inc a");
    assert!(err.contains("Missing \"ENDIF\""), "{err}");
}

#[test]
fn public_symbol_reaches_the_object() {
    let output = assemble("public foo | foo: ret");
    assert_eq!(vec![0xC9], output.object.code);
    assert!(output.object.fixups.is_empty());
    assert_eq!(1, output.object.publics.len());
    assert_eq!(1, output.object.ids.len());
    let (id, name) = &output.object.ids[0];
    assert_eq!("FOO", name);
    assert_eq!(*id, output.object.publics[0].0);
    assert_eq!(AddrKind::Code, output.object.publics[0].1.kind);
    assert_eq!(0, output.object.publics[0].1.value);
}

#[test]
fn external_call_leaves_one_fixup() {
    let output = assemble("extrn bar | call bar");
    assert_eq!(vec![0xCD, 0x00, 0x00], output.object.code);
    assert!(output.object.publics.is_empty());
    assert_eq!(1, output.object.ids.len());
    assert_eq!("BAR", output.object.ids[0].1);
    assert_eq!(1, output.object.fixups.len());
    let (offset, target) = &output.object.fixups[0];
    assert_eq!(AddrKind::Code, offset.kind);
    assert_eq!(1, offset.value);
    assert_eq!(AddrKind::External, target.kind);
    assert_eq!(Some(output.object.ids[0].0), target.id);
}

#[test]
fn low_and_high_of_an_external_leave_byte_fixups() {
    let output = assemble("extrn bar | ld a, low bar | ld a, high bar");
    assert_eq!(vec![0x3E, 0x00, 0x3E, 0x00], output.object.code);
    assert_eq!(2, output.object.fixups.len());
    assert_eq!(Part::Low, output.object.fixups[0].1.part);
    assert_eq!(Part::High, output.object.fixups[1].1.part);
}

#[test]
fn external_plus_constant_carries_the_offset() {
    let output = assemble("extrn bar | ld hl, bar+2");
    assert_eq!(vec![0x21, 0x02, 0x00], output.object.code);
    let (_, target) = &output.object.fixups[0];
    assert_eq!(AddrKind::External, target.kind);
    assert_eq!(2, target.value);
}

#[test]
fn data_segment_is_separate() {
    let src = r#"
        cseg
        nop
        dseg
D1:     defw d1
        defb 1, 2
        "#;
    let output = assemble(src);
    assert_eq!(vec![0x00], output.object.code);
    assert_eq!(vec![0x00, 0x00, 0x01, 0x02], output.object.data);
    let (offset, target) = &output.object.fixups[0];
    assert_eq!(AddrKind::Data, offset.kind);
    assert_eq!(0, offset.value);
    assert_eq!(AddrKind::Data, target.kind);
    assert_eq!(0, target.value);
}

#[test]
fn defb_defw_defs() {
    let src = r#"
        defb 'AB', 3
        defw 1, 2
        defs 3, 0ffh
        defs 2
        "#;
    let output = assemble(src);
    #[rustfmt::skip]
    assert_eq!(vec![
        0x41, 0x42, 0x03,
        0x01, 0x00, 0x02, 0x00,
        0xFF, 0xFF, 0xFF,
        0x00, 0x00,
    ], output.object.code);
}

#[test]
fn include_nests_files() {
    let assembler = assembler(&[
        (
            "/test.z80",
            r#"
        nop
        include 'inc.z80'
        rst 0
        "#,
        ),
        ("/inc.z80", "halt"),
    ]);
    let output = assembler.assemble("/", "test.z80").unwrap();
    assert_eq!(vec![0x00, 0x76, 0xC7], output.object.code);
}

#[test]
fn missing_include_is_fatal() {
    let result = assembler(&[("/test.z80", "include 'nope.z80'")]).assemble("/", "test.z80");
    let err = format!("{}", result.unwrap_err());
    assert!(err.contains("File not found"), "{err}");
}

#[test]
fn multiple_definition_is_an_error() {
    let err = errors("a1: nop\na1: nop");
    assert!(err.contains("Multiple definition"), "{err}");
}

#[test]
fn undefined_identifier_is_an_error() {
    let err = errors("jp nowhere");
    assert!(err.contains("Undefined identifier"), "{err}");
    assert!(err.contains("NOWHERE"), "{err}");
}

#[test]
fn reloc_byte_operand_is_an_address_usage_error() {
    let err = errors("a2: nop\nld a, a2");
    assert!(err.contains("Address usage error"), "{err}");
}

#[test]
fn reloc_plus_reloc_is_an_address_usage_error() {
    let err = errors("a3: nop\nld hl, a3+a3");
    assert!(err.contains("Address usage error"), "{err}");
}

#[test]
fn errors_carry_file_and_line() {
    let err = errors("nop\njp nowhere");
    assert!(err.contains("test.z80(2):"), "{err}");
}

#[test]
fn one_error_per_line_is_reported() {
    let err = errors("jp nowhere or nowhere2");
    assert_eq!(1, err.lines().count(), "{err}");
}

#[test]
fn listing_interleaves_bytes_and_source() {
    let output = assemble("ld a, 5");
    let lines = output.listing.lines();
    assert_eq!(1, lines.len());
    assert_eq!(vec![0x3E, 0x05], lines[0].bytes);
    assert!(lines[0].text.contains("ld a, 5"));

    let mut text = Vec::new();
    output.listing.write(&mut text).unwrap();
    let text = String::from_utf8(text).unwrap();
    assert!(text.starts_with("0000' 3E 05"), "{text}");
}

#[test]
fn listing_indents_block_bodies() {
    let src = "if z\ninc a\nendif";
    let output = assemble(src);
    let lines = output.listing.lines();
    assert_eq!(0, lines[0].depth);
    assert_eq!(1, lines[1].depth);
}

#[test]
fn assembly_is_deterministic() {
    let src = r#"
        public entry
        extrn far
ENTRY:  ld hl, table
        call far
        do
        dec a
        while nz
        wend
        ret
TABLE:  defw entry, 0
        "#;

    let run = || {
        let output = assembler(&[("/test.z80", src)])
            .assemble("/", "test.z80")
            .unwrap();
        let mut object = Vec::new();
        output.object.write(&mut object).unwrap();
        let mut listing = Vec::new();
        output.listing.write(&mut listing).unwrap();
        (object, listing)
    };

    assert_eq!(run(), run());
}

#[test]
fn statement_separator_matches_newlines() {
    assert_eq!(code("inc a\ninc b\ninc c"), code("inc a | inc b | inc c"));
}

#[test]
fn keywords_are_case_insensitive_end_to_end() {
    assert_eq!(code("LD A, 5"), code("ld a, 5"));
}
