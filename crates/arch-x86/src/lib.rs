//! `yasm-arch-x86` is the x86/x86-64 architecture module: register files,
//! ModRM/SIB effective-address encoding, a representative instruction set
//! with span-dependent short/near branches, and the no-op fill sequences
//! used to pad code sections.

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![deny(rustdoc::invalid_codeblock_attributes)]
#![deny(rustdoc::invalid_rust_codeblocks)]

mod encode;
mod insn;
mod jmp;
mod registers;

pub use insn::{classify, prefix_byte, Kind, X86Insn};
pub use jmp::{JmpState, X86Jump};
pub use registers::{reg, reg_class, reg_num, reg_size, RegClass};

use yasm_core::{
    Arch, Contents, Error, FloatNum, IntNum, Line, ModuleRegistry, Operand, Register,
    Signedness,
};

/// The machines the x86 architecture exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Machine {
    X86,
    Amd64,
}

/// The x86/x86-64 architecture.
#[derive(Debug)]
pub struct X86Arch {
    machine: Machine,
    mode_bits: u32,
    force_strict: bool,
}

impl Default for X86Arch {
    fn default() -> Self {
        Self::new()
    }
}

impl X86Arch {
    /// Creates the architecture with the `x86` machine in 16-bit mode; the
    /// object format adjusts both before parsing starts.
    pub fn new() -> Self {
        Self { machine: Machine::X86, mode_bits: 16, force_strict: false }
    }

    /// The active mode bits (16, 32 or 64).
    pub fn mode_bits(&self) -> u32 {
        self.mode_bits
    }
}

const MACHINES: &[(&str, &str)] = &[
    ("x86", "IA-32 and derivatives"),
    ("amd64", "AMD64"),
];

impl Arch for X86Arch {
    fn keyword(&self) -> &'static str {
        "x86"
    }

    fn description(&self) -> &'static str {
        "x86 (IA-32 and derivatives), AMD64"
    }

    fn machines(&self) -> &[(&'static str, &'static str)] {
        MACHINES
    }

    fn machine(&self) -> &'static str {
        match self.machine {
            Machine::X86 => "x86",
            Machine::Amd64 => "amd64",
        }
    }

    fn set_machine(&mut self, keyword: &str) -> Result<(), Error> {
        self.machine = match keyword {
            "x86" => Machine::X86,
            "amd64" => Machine::Amd64,
            _ => {
                return Err(Error::Value(format!(
                    "`{keyword}` is not a valid machine for architecture `x86`"
                )));
            }
        };
        if self.machine == Machine::X86 && self.mode_bits == 64 {
            self.mode_bits = 32;
        }
        Ok(())
    }

    fn wordsize(&self) -> u32 {
        16
    }

    fn set_var(&mut self, var: &str, value: u64) -> Result<(), Error> {
        match var {
            "mode_bits" => {
                match value {
                    16 | 32 => {}
                    64 if self.machine == Machine::Amd64 => {}
                    64 => {
                        return Err(Error::Value(
                            "64-bit mode requires the `amd64` machine".to_owned(),
                        ));
                    }
                    _ => {
                        return Err(Error::Value(format!("invalid mode bits {value}")));
                    }
                }
                self.mode_bits = value as u32;
            }
            "force_strict" => self.force_strict = value != 0,
            _ => {
                return Err(Error::Value(format!("unknown architecture variable `{var}`")));
            }
        }
        Ok(())
    }

    fn parse_check_reg(&self, name: &str) -> Option<Register> {
        let register = registers::lookup(name)?;

        // The 64-bit register files only exist on amd64.
        if self.machine == Machine::X86
            && (reg_size(register) == 64
                || reg_num(register) >= 8
                || reg_class(register) == RegClass::Reg8x)
        {
            return None;
        }

        Some(register)
    }

    fn reg_size(&self, reg: Register) -> u32 {
        registers::reg_size(reg)
    }

    fn parse_check_insn(&self, name: &str) -> bool {
        classify(name).is_some()
    }

    fn parse_check_prefix(&self, name: &str) -> Option<u8> {
        prefix_byte(name)
    }

    fn create_insn(
        &self,
        name: &str,
        prefixes: &[u8],
        operands: Vec<Operand>,
        line: Line,
    ) -> Result<Contents, Error> {
        let kind = classify(name)
            .ok_or_else(|| Error::Syntax(format!("unrecognized instruction `{name}`")))?;

        Ok(Contents::Special(Box::new(X86Insn::new(
            name,
            kind,
            prefixes.to_vec(),
            operands,
            self.mode_bits,
            self.force_strict,
            line,
        ))))
    }

    fn fill_pattern(&self, len: u64) -> Vec<u8> {
        // The multi-byte 0F 1F no-ops are 686+; 16-bit code gets plain 90s.
        const NOPS: [&[u8]; 9] = [
            &[0x90],
            &[0x66, 0x90],
            &[0x0f, 0x1f, 0x00],
            &[0x0f, 0x1f, 0x40, 0x00],
            &[0x0f, 0x1f, 0x44, 0x00, 0x00],
            &[0x66, 0x0f, 0x1f, 0x44, 0x00, 0x00],
            &[0x0f, 0x1f, 0x80, 0x00, 0x00, 0x00, 0x00],
            &[0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
            &[0x66, 0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
        ];

        let mut fill = Vec::with_capacity(len as usize);

        if self.mode_bits == 16 {
            fill.resize(len as usize, 0x90);
            return fill;
        }

        let mut remaining = len as usize;
        while remaining > 0 {
            let chunk = remaining.min(NOPS.len());
            fill.extend_from_slice(NOPS[chunk - 1]);
            remaining -= chunk;
        }

        fill
    }

    fn intnum_tobytes(
        &self,
        value: &IntNum,
        buffer: &mut Vec<u8>,
        size: u32,
        rshift: u32,
        signedness: Signedness,
    ) -> bool {
        value.append_to(buffer, size, rshift, false, signedness)
    }

    fn floatnum_tobytes(
        &self,
        value: &FloatNum,
        buffer: &mut Vec<u8>,
        size: u32,
    ) -> Result<bool, Error> {
        value.append_to(buffer, size, false)
    }
}

/// Register this crate's modules with the driver's registry.
pub fn register(registry: &mut ModuleRegistry) {
    registry.register_arch("x86", "x86 (IA-32 and derivatives), AMD64", || {
        Box::new(X86Arch::new())
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use yasm_core::{
        Bytecode, BytecodeOutput, EffectiveAddr, Errwarns, Expr, ExprCtx, Location, Object,
        OutputContext, SectionId, Value,
    };

    struct TestOut<'a> {
        octx: OutputContext<'a>,
        errwarns: Errwarns,
        bytes: Vec<u8>,
    }

    impl BytecodeOutput for TestOut<'_> {
        fn output_value(
            &mut self,
            value: &mut Value,
            buffer: &mut Vec<u8>,
            _loc: Location,
        ) -> Result<(), Error> {
            let ctx = self.octx.expr_ctx();
            let done =
                value.output_basic(buffer, &ctx, self.octx.arch, &mut self.errwarns)?;
            assert!(done, "test instruction with a symbolic value");
            Ok(())
        }

        fn output_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
            self.bytes.extend_from_slice(bytes);
            Ok(())
        }

        fn output_gap(&mut self, len: u64) -> Result<(), Error> {
            self.bytes.extend(std::iter::repeat(0).take(len as usize));
            Ok(())
        }
    }

    fn arch(mode_bits: u32) -> X86Arch {
        let mut arch = X86Arch::new();
        if mode_bits == 64 {
            arch.set_machine("amd64").unwrap();
        }
        arch.set_var("mode_bits", u64::from(mode_bits)).unwrap();
        arch
    }

    fn encode(mode_bits: u32, name: &str, operands: Vec<Operand>) -> Vec<u8> {
        let arch = arch(mode_bits);
        let contents = arch.create_insn(name, &[], operands, 1).unwrap();

        let mut object = Object::new("t.asm", "t.out");
        object.append_section(".text");

        let mut bytecode = Bytecode::new(contents, 1);
        let ctx = ExprCtx::symbols_only(object.symbols());
        bytecode.finalize(&ctx).unwrap();

        let octx = OutputContext { object: &object, arch: &arch, section: SectionId(0) };
        let mut out = TestOut { octx, errwarns: Errwarns::new(), bytes: Vec::new() };
        bytecode
            .output(Location { section: SectionId(0), bc: 0, off: 0 }, &octx, &mut out)
            .unwrap();

        out.bytes
    }

    fn r(name: &str) -> Operand {
        Operand::Reg(registers::lookup(name).unwrap())
    }

    fn imm(value: i64) -> Operand {
        Operand::Imm {
            expr: Expr::from_int(IntNum::from(value)),
            size: 0,
            strict: false,
            target_mod: None,
        }
    }

    fn mem(regs: &[&str], disp: i64, size: u32) -> Operand {
        let mut expr = Expr::from_int(IntNum::from(disp));
        for name in regs {
            expr = Expr::binary(
                Expr::from_reg(registers::lookup(name).unwrap()),
                yasm_core::Op::Add,
                expr,
            );
        }
        Operand::Mem(Box::new(EffectiveAddr { disp: expr, size, segment: None }))
    }

    #[test]
    fn test_mov_reg_imm() {
        // mov ax, 0x1234 -> B8 34 12.
        assert_eq!(encode(16, "mov", vec![r("ax"), imm(0x1234)]), [0xb8, 0x34, 0x12]);
        // mov al, 5 -> B0 05.
        assert_eq!(encode(16, "mov", vec![r("al"), imm(5)]), [0xb0, 0x05]);
        // mov eax, 1 in 16-bit mode needs the operand-size prefix.
        assert_eq!(
            encode(16, "mov", vec![r("eax"), imm(1)]),
            [0x66, 0xb8, 0x01, 0x00, 0x00, 0x00]
        );
        // mov rax, 1 -> REX.W B8 imm64.
        assert_eq!(
            encode(64, "mov", vec![r("rax"), imm(1)]),
            [0x48, 0xb8, 1, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_mov_reg_reg() {
        // mov ax, bx -> 89 D8.
        assert_eq!(encode(16, "mov", vec![r("ax"), r("bx")]), [0x89, 0xd8]);
        // mov r9, rax -> 49 89 C1.
        assert_eq!(encode(64, "mov", vec![r("r9"), r("rax")]), [0x49, 0x89, 0xc1]);
    }

    #[test]
    fn test_mov_mem() {
        // mov [bx+si], al -> 88 00.
        assert_eq!(encode(16, "mov", vec![mem(&["bx", "si"], 0, 0), r("al")]), [0x88, 0x00]);
        // mov eax, [ebx+8] -> 8B 43 08.
        assert_eq!(
            encode(32, "mov", vec![r("eax"), mem(&["ebx"], 8, 0)]),
            [0x8b, 0x43, 0x08]
        );
        // mov word [0x100], 0xAA55 -> C7 06 00 01 55 AA.
        assert_eq!(
            encode(16, "mov", vec![mem(&[], 0x100, 16), imm(0xaa55_u32 as i64 as i64)]),
            [0xc7, 0x06, 0x00, 0x01, 0x55, 0xaa]
        );
    }

    #[test]
    fn test_alu() {
        // add bx, 4 -> 83 C3 04.
        assert_eq!(encode(16, "add", vec![r("bx"), imm(4)]), [0x83, 0xc3, 0x04]);
        // cmp al, 1 -> 3C 01 (accumulator short form).
        assert_eq!(encode(16, "cmp", vec![r("al"), imm(1)]), [0x3c, 0x01]);
        // xor eax, eax -> 31 C0.
        assert_eq!(encode(32, "xor", vec![r("eax"), r("eax")]), [0x31, 0xc0]);
        // sub ax, 0x1234 -> 2D 34 12 (accumulator full-imm form).
        assert_eq!(encode(16, "sub", vec![r("ax"), imm(0x1234)]), [0x2d, 0x34, 0x12]);
    }

    #[test]
    fn test_incdec_push_pop() {
        assert_eq!(encode(16, "inc", vec![r("ax")]), [0x40]);
        assert_eq!(encode(16, "dec", vec![r("bx")]), [0x4b]);
        assert_eq!(encode(64, "inc", vec![r("rax")]), [0x48, 0xff, 0xc0]);
        assert_eq!(encode(16, "push", vec![r("ax")]), [0x50]);
        assert_eq!(encode(64, "push", vec![r("r12")]), [0x41, 0x54]);
        assert_eq!(encode(16, "pop", vec![r("di")]), [0x5f]);
        assert_eq!(encode(16, "push", vec![imm(0x1234)]), [0x68, 0x34, 0x12]);
        assert_eq!(encode(32, "push", vec![imm(1)]), [0x6a, 0x01]);
    }

    #[test]
    fn test_misc() {
        assert_eq!(encode(16, "nop", vec![]), [0x90]);
        assert_eq!(encode(16, "int", vec![imm(0x10)]), [0xcd, 0x10]);
        assert_eq!(encode(16, "ret", vec![]), [0xc3]);
        assert_eq!(encode(16, "ret", vec![imm(2)]), [0xc2, 0x02, 0x00]);
        assert_eq!(encode(32, "lea", vec![r("eax"), mem(&["ebx"], 4, 0)]), [0x8d, 0x43, 0x04]);
        assert_eq!(encode(16, "xchg", vec![r("ax"), r("bx")]), [0x93]);
        assert_eq!(encode(16, "shl", vec![r("ax"), imm(3)]), [0xc1, 0xe0, 0x03]);
        assert_eq!(encode(16, "shl", vec![r("ax"), imm(1)]), [0xd1, 0xe0]);
        assert_eq!(
            encode(32, "movzx", vec![r("eax"), r("bl")]),
            [0x0f, 0xb6, 0xc3]
        );
    }

    #[test]
    fn test_machine_gates_registers() {
        let ia32 = arch(32);
        assert!(ia32.parse_check_reg("rax").is_none());
        assert!(ia32.parse_check_reg("r9d").is_none());
        assert!(ia32.parse_check_reg("eax").is_some());

        let amd64 = arch(64);
        assert!(amd64.parse_check_reg("rax").is_some());
        assert!(amd64.parse_check_reg("r9d").is_some());
    }

    #[test]
    fn test_fill_pattern() {
        let a = arch(16);
        assert_eq!(a.fill_pattern(3), vec![0x90, 0x90, 0x90]);

        let a = arch(32);
        assert_eq!(a.fill_pattern(3), vec![0x0f, 0x1f, 0x00]);
        assert_eq!(a.fill_pattern(12).len(), 12);
    }
}
