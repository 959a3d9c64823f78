//! `yasm-parser-nasm` contains the NASM-syntax parser and the `raw`
//! pass-through preprocessor.
//!
//! The parser consumes preprocessed lines, appends bytecodes to the current
//! section, declares symbols, and dispatches `[directives]` into the
//! registry the object format populated. It follows NASM semantics:
//! case-insensitive keywords, case-sensitive symbols, `$`/`$$` position
//! references, local labels joined to the previous non-local label, and
//! undefined symbols reported as errors at finalize time.

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![deny(rustdoc::invalid_codeblock_attributes)]
#![deny(rustdoc::invalid_rust_codeblocks)]

mod lex;
mod parser;
mod preproc;

pub use lex::{tokenize, Token};
pub use parser::NasmParser;
pub use preproc::RawPreproc;

use yasm_core::ModuleRegistry;

/// Register this crate's modules with the driver's registry.
pub fn register(registry: &mut ModuleRegistry) {
    registry.register_parser("nasm", "NASM-compatible parser", || Box::new(NasmParser::new()));
    registry.register_preproc("raw", "Disable preprocessing", || Box::new(RawPreproc::new()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use yasm_arch_x86::X86Arch;
    use yasm_core::{
        optimize, Arch, Binding, Directives, Errwarns, Linemap, Object, Parser, Preprocessor,
    };

    fn parse(source: &str) -> (Object, Errwarns) {
        let mut object = Object::new("test.asm", "test.out");
        object.append_section(".text");
        object.section_mut(yasm_core::SectionId(0)).set_code(true);

        let mut arch = X86Arch::new();
        arch.set_var("mode_bits", 16).unwrap();

        let mut preproc = RawPreproc::new();
        preproc
            .init(Box::new(std::io::Cursor::new(source.to_owned())), "test.asm")
            .unwrap();

        let mut parser = NasmParser::new();
        let directives = Directives::new();
        let mut linemap = Linemap::new();
        linemap.set("test.asm", 1, 1);
        let mut errwarns = Errwarns::new();

        parser
            .parse(
                &mut object,
                &mut arch,
                &mut preproc,
                &directives,
                &mut linemap,
                &mut errwarns,
            )
            .unwrap();

        (object, errwarns)
    }

    fn parse_ok(source: &str) -> Object {
        let (mut object, mut errwarns) = parse(source);
        assert_eq!(errwarns.num_errors(false), 0, "parse errors");

        object.finalize(&mut errwarns);
        object.symbols_finalize(&mut errwarns, false);
        assert_eq!(errwarns.num_errors(false), 0, "finalize errors");

        optimize(&mut object, &mut errwarns);
        assert_eq!(errwarns.num_errors(false), 0, "optimize errors");

        object
    }

    #[test]
    fn test_labels_and_data() {
        let object = parse_ok("a: dw 1, 2\nb:\n");

        let a = object.symbols().find("a").unwrap();
        let b = object.symbols().find("b").unwrap();
        assert!(matches!(object.symbols().get(a).binding(), Binding::Label(_)));

        let b_loc = object.symbols().get(b).label().unwrap();
        assert_eq!(object.loc_offset(b_loc), Some(4));
    }

    #[test]
    fn test_equ_and_local_labels() {
        let object = parse_ok("width equ 0x10\nouter:\n.inner: db 1\n");

        let equ = object.symbols().find("width").unwrap();
        assert!(object.symbols().get(equ).equ().is_some());

        // `.inner` resolved against `outer`.
        assert!(object.symbols().find("outer.inner").is_some());
    }

    #[test]
    fn test_times_expands() {
        let object = parse_ok("times 3 db 0x55, 0xaa\n");
        assert_eq!(object.sections()[0].size(), 6);
    }

    #[test]
    fn test_reserve_and_align() {
        let object = parse_ok("db 1\nalign 4\ndb 2\nresb 10\n");
        // 1 + 3 pad + 1 + 10.
        assert_eq!(object.sections()[0].size(), 15);
    }

    #[test]
    fn test_insn_sizes() {
        let object = parse_ok("start:\nmov ax, 0x1234\nnop\njmp start\n");
        // mov = 3, nop = 1, short jmp = 2.
        assert_eq!(object.sections()[0].size(), 6);
    }

    #[test]
    fn test_short_jump_promotion() {
        let object = parse_ok("jmp near_end\ntimes 200 nop\nnear_end:\n");
        // The jump stays short: 200 bytes is within the byte displacement.
        assert_eq!(object.sections()[0].size(), 202);

        let object = parse_ok("jmp far_end\ntimes 300 nop\nfar_end:\n");
        // 300 is out of short range: near form, 3 bytes in 16-bit mode.
        assert_eq!(object.sections()[0].size(), 303);
    }

    #[test]
    fn test_dollar_distance() {
        let object = parse_ok("times 16-($-$$) db 0\n");
        assert_eq!(object.sections()[0].size(), 16);
    }

    #[test]
    fn test_undefined_symbol_is_reported() {
        let (mut object, mut errwarns) = parse("dw missing\n");
        object.finalize(&mut errwarns);
        object.symbols_finalize(&mut errwarns, false);
        assert_eq!(errwarns.num_errors(false), 1);
    }

    #[test]
    fn test_orphan_label_warns() {
        let (_, errwarns) = parse("lonely\n");
        assert_eq!(errwarns.num_errors(false), 0);
        assert_eq!(errwarns.num_errors(true), 1);
    }

    #[test]
    fn test_line_marker_is_strict() {
        let (_, errwarns) = parse("%line 5 \"inner.inc\"\ndb 1\n");
        assert_eq!(errwarns.num_errors(false), 0);

        let (_, errwarns) = parse("%line bogus\n");
        assert_eq!(errwarns.num_errors(false), 1);
    }

    #[test]
    fn test_bits_switch() {
        // `bits 32` changes encoding of subsequent instructions.
        let object = parse_ok("bits 32\nmov eax, 1\n");
        // B8 imm32, no operand-size prefix.
        assert_eq!(object.sections()[0].size(), 5);
    }

    #[test]
    fn test_global_extern() {
        let object = parse_ok("global entry\nextern printf\nentry: call printf\n");

        use yasm_core::Visibility;
        let entry = object.symbols().find("entry").unwrap();
        let printf = object.symbols().find("printf").unwrap();
        assert!(object.symbols().get(entry).visibility().contains(Visibility::Global));
        assert!(object.symbols().get(printf).visibility().contains(Visibility::Extern));
    }
}
