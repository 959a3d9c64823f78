//! End-to-end assembly: NASM source in, object file bytes out.

use std::io::Cursor;

use yasm_core::{Assembler, ModuleRegistry};

fn registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    yasm_arch_x86::register(&mut registry);
    yasm_parser_nasm::register(&mut registry);
    yasm_objfmt::register(&mut registry);
    registry
}

fn try_assemble(format: &str, source: &str) -> Result<Vec<u8>, Vec<String>> {
    let registry = registry();
    let arch = registry.load_arch("x86").unwrap();
    let parser = registry.load_parser("nasm").unwrap();
    let preproc = registry.load_preproc("raw").unwrap();
    let objfmt = registry.load_objfmt(format).unwrap();

    let mut assembler = Assembler::new(arch, parser, preproc, objfmt).unwrap();
    let source = source.to_owned();

    let mut ok = assembler.assemble(Box::new(Cursor::new(source)), "test.asm", "test.out");

    let mut writer = Cursor::new(Vec::new());
    if ok {
        ok = assembler.output(&mut writer, false);
    }

    if ok {
        Ok(writer.into_inner())
    } else {
        let mut diagnostics = Vec::new();
        assembler.output_diagnostics(&mut |file, line, is_error, message| {
            let kind = if is_error { "error" } else { "warning" };
            diagnostics.push(format!("{file}:{line}: {kind}: {message}"));
        });
        Err(diagnostics)
    }
}

fn assemble(format: &str, source: &str) -> Vec<u8> {
    match try_assemble(format, source) {
        Ok(bytes) => bytes,
        Err(diagnostics) => panic!("assembly failed:\n{}", diagnostics.join("\n")),
    }
}

#[test]
fn test_short_jump_stays_short() {
    let image = assemble("bin", "bits 16\njmp near_end\ntimes 200 nop\nnear_end:\n");

    assert_eq!(image.len(), 202);
    assert_eq!(image[0], 0xeb);
    assert_eq!(image[1], 0xc8); // disp8 = 202 - 2 = 200
    assert!(image[2..].iter().all(|byte| *byte == 0x90));
}

#[test]
fn test_jump_promotes_to_near() {
    let image = assemble("bin", "bits 16\njmp the_end\ntimes 300 nop\nthe_end:\n");

    // E9 imm16 in 16-bit mode: 3 + 300 bytes, disp = 303 - 3 = 300.
    assert_eq!(image.len(), 303);
    assert_eq!(image[0], 0xe9);
    assert_eq!(&image[1..3], &300u16.to_le_bytes());
}

#[test]
fn test_times_data() {
    let image = assemble("bin", "times 3 db 0x55,0xAA\n");
    assert_eq!(image, [0x55, 0xaa, 0x55, 0xaa, 0x55, 0xaa]);
}

#[test]
fn test_equ_forward_reference() {
    let image = assemble("bin", "mov ax, FOO\nFOO equ 0x1234\n");
    assert_eq!(image, [0xb8, 0x34, 0x12]);
}

#[test]
fn test_align_fill_in_data_section() {
    let image = assemble("bin", "section .data\ndb 1\nalign 4\ndb 2\n");
    assert_eq!(image, [0x01, 0x00, 0x00, 0x00, 0x02]);
}

#[test]
fn test_align_fill_in_code_section() {
    // The default bin section is code: alignment pads with no-ops.
    let image = assemble("bin", "db 1\nalign 4\ndb 2\n");
    assert_eq!(image.len(), 5);
    assert_eq!(image[0], 0x01);
    assert_eq!(image[4], 0x02);
    assert!(image[1..4].iter().all(|byte| *byte == 0x90));
}

#[test]
fn test_label_distance() {
    let image = assemble("bin", "a: dw b-a\nb:\n");
    assert_eq!(image, [0x02, 0x00]);
}

#[test]
fn test_org() {
    let image = assemble("bin", "org 0x100\nstart:\nmov ax, start\n");
    // `start` is the VMA, not a file offset skip.
    assert_eq!(image, [0xb8, 0x00, 0x01]);
}

#[test]
fn test_section_start_symbol() {
    let image = assemble(
        "bin",
        "org 0x7c00\ndw section..text.start\n",
    );
    assert_eq!(image, [0x00, 0x7c]);
}

#[test]
fn test_multisection_placement() {
    let image = assemble(
        "bin",
        "section .text\ndb 0x11\nsection .data start=0x10\ndb 0x22\n",
    );

    // .data placed at 0x10; the gap reads back as zeros.
    assert_eq!(image.len(), 0x11);
    assert_eq!(image[0], 0x11);
    assert_eq!(image[0x10], 0x22);
    assert!(image[1..0x10].iter().all(|byte| *byte == 0x00));
}

#[test]
fn test_follows_placement() {
    let image = assemble(
        "bin",
        "section .first\ndb 0xaa\nsection .second follows=.first align=4\ndb 0xbb\n",
    );

    // .text (default, empty), .first at 0, .second at 4.
    assert_eq!(image.len(), 5);
    assert_eq!(image[0], 0xaa);
    assert_eq!(image[4], 0xbb);
}

#[test]
fn test_extern_reference_is_an_error_in_bin() {
    let diagnostics =
        try_assemble("bin", "extern away\ndw away\n").expect_err("bin cannot relocate");
    assert!(
        diagnostics
            .iter()
            .any(|line| line.contains("does not support external references")),
        "{diagnostics:?}"
    );
}

#[test]
fn test_undefined_symbol_reports_first_use_line() {
    let diagnostics = try_assemble("bin", "nop\ndw missing\n").expect_err("undefined symbol");
    assert!(
        diagnostics
            .iter()
            .any(|line| line.starts_with("test.asm:2:") && line.contains("undefined symbol")),
        "{diagnostics:?}"
    );
}

#[test]
fn test_coff_object() {
    let image = assemble(
        "coff",
        "bits 32\nglobal _main\nextern _puts\n_main:\ncall _puts\nret\n",
    );

    // COFF header: machine 0x014c, one section.
    assert_eq!(&image[0..2], &0x014cu16.to_le_bytes());
    assert_eq!(&image[2..4], &1u16.to_le_bytes());

    // Section header: name .text, 6 bytes of data (E8 rel32 + C3), one
    // relocation.
    let section = &image[20..60];
    assert_eq!(&section[0..5], b".text");
    let size = u32::from_le_bytes(section[16..20].try_into().unwrap());
    assert_eq!(size, 6);
    let nreloc = u16::from_le_bytes(section[32..34].try_into().unwrap());
    assert_eq!(nreloc, 1);

    // Raw data: call with a zero addend, then ret.
    let data_ptr = u32::from_le_bytes(section[20..24].try_into().unwrap()) as usize;
    assert_eq!(&image[data_ptr..data_ptr + 6], &[0xe8, 0, 0, 0, 0, 0xc3]);

    // The relocation is an I386 REL32 at offset 1.
    let reloc_ptr = u32::from_le_bytes(section[24..28].try_into().unwrap()) as usize;
    let reloc = &image[reloc_ptr..reloc_ptr + 10];
    assert_eq!(u32::from_le_bytes(reloc[0..4].try_into().unwrap()), 1);
    assert_eq!(u16::from_le_bytes(reloc[8..10].try_into().unwrap()), 0x14);
}

#[test]
fn test_coff_data_reloc_addend() {
    let image = assemble("coff", "bits 32\nsection .data\nlabel:\ndd label+8\n");

    // Find the .data section header (the default .text comes first).
    let nsections = u16::from_le_bytes(image[2..4].try_into().unwrap()) as usize;
    let section = (0..nsections)
        .map(|index| &image[20 + index * 40..60 + index * 40])
        .find(|header| &header[0..5] == b".data")
        .expect(".data header");

    // One ADDR32 relocation against the section symbol, with the label
    // offset folded into the stored addend.
    let data_ptr = u32::from_le_bytes(section[20..24].try_into().unwrap()) as usize;
    assert_eq!(&image[data_ptr..data_ptr + 4], &8u32.to_le_bytes());

    let reloc_ptr = u32::from_le_bytes(section[24..28].try_into().unwrap()) as usize;
    let kind = u16::from_le_bytes(image[reloc_ptr + 8..reloc_ptr + 10].try_into().unwrap());
    assert_eq!(kind, 0x6); // I386_ADDR32
}

#[test]
fn test_win64_defaults() {
    let image = assemble("win64", "global main\nmain:\nmov rax, 1\nret\n");

    // Machine is AMD64 and the default mode is 64-bit (REX.W encoding).
    assert_eq!(&image[0..2], &0x8664u16.to_le_bytes());
    let section = &image[20..60];
    let data_ptr = u32::from_le_bytes(section[20..24].try_into().unwrap()) as usize;
    assert_eq!(&image[data_ptr..data_ptr + 2], &[0x48, 0xb8]);
}

#[test]
fn test_xdf_object() {
    let image = assemble("xdf", "bits 32\nglobal entry\nentry:\nmov eax, 1\nret\n");

    // Magic, one section.
    assert_eq!(&image[0..4], &0x8765_4322u32.to_le_bytes());
    assert_eq!(u32::from_le_bytes(image[4..8].try_into().unwrap()), 1);

    // Section header: 40 bytes starting right after the 16-byte file
    // header. Flags sit after name symbol (4), lma (8), vma (8) and
    // alignment (2); the use32 flag must be set.
    let section = &image[16..56];
    let flags = u16::from_le_bytes(section[22..24].try_into().unwrap());
    assert_ne!(flags & 0x20, 0, "use32 flag");
}

#[test]
fn test_leb128_data() {
    // LEB128 is exercised through the core directly in unit tests; here we
    // just confirm a reserve+data mix lays out as expected.
    let image = assemble("bin", "db 1\nresb 3\ndb 2\n");
    assert_eq!(image, [1, 0, 0, 0, 2]);
}

#[test]
fn test_incbin() {
    let dir = std::env::temp_dir();
    let path = dir.join("yasm-incbin-test.bin");
    std::fs::write(&path, [1u8, 2, 3, 4, 5, 6, 7, 8]).unwrap();

    let source = format!("incbin \"{}\", 2, 4\n", path.display());
    let image = assemble("bin", &source);
    assert_eq!(image, [3, 4, 5, 6]);
}
