//! Instruction encoding.
//!
//! An [`X86Insn`] holds the parsed mnemonic and operands until finalize,
//! then encodes itself into the owning bytecode's fixed part, with fixups
//! for displacements and immediates. Relative branches are the exception:
//! they turn into an [`X86Jump`] tail and stay span-dependent through
//! optimization.

use yasm_core::{
    BytecodeOutput, Contents, EffectiveAddr, Error, Expansion, Expr, ExprCtx, Fixup, Line,
    Location, Operand, OutputContext, Register, SpanReq, SpecialContents, TargetMod, Value,
};

use crate::encode::{analyze, segment_prefix, EaParts};
use crate::jmp::{JmpState, X86Jump};
use crate::registers::{reg_class, reg_num, reg_size, RegClass};

/// What a mnemonic encodes as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// `mov` in all its register/memory/immediate/segment forms.
    Mov,
    /// The two-operand ALU group; the payload is the opcode row (add=0,
    /// or=1, adc=2, sbb=3, and=4, sub=5, xor=6, cmp=7).
    Alu(u8),
    /// `test`.
    Test,
    /// `inc` (false) / `dec` (true).
    IncDec(bool),
    /// The `F6/F7` group (not=2, neg=3, mul=4, div=6, idiv=7).
    F6(u8),
    /// Shifts and rotates; the payload is the `/r` extension (rol=0,
    /// ror=1, rcl=2, rcr=3, shl=4, shr=5, sar=7).
    Shift(u8),
    /// `imul`, in its one-, two- and three-operand forms.
    Imul,
    /// `push`.
    Push,
    /// `pop`.
    Pop,
    /// `lea`.
    Lea,
    /// `xchg`.
    Xchg,
    /// `movzx` (false) / `movsx` (true).
    Movx(bool),
    /// `int imm8`.
    Int,
    /// `ret`/`retn` (false) / `retf` (true).
    Ret(bool),
    /// A fixed byte sequence; `(opcode bytes, operand size, valid in
    /// 64-bit mode)`. Operand size 0 means "no size personality".
    Simple(&'static [u8], u32, bool),
    /// `jmp`.
    Jmp,
    /// `call`.
    Call,
    /// A conditional jump; the payload is the condition code.
    Jcc(u8),
    /// The short-only `loop`/`jcxz` family; `(opcode, address size it
    /// implies, 0 for any)`.
    JcxLoop(u8, u32),
}

/// Classify a mnemonic. `None` means "not an instruction we know".
pub fn classify(name: &str) -> Option<Kind> {
    // Conditional jump names are dense enough to handle as a family.
    if let Some(cc_name) = name.strip_prefix('j') {
        if let Some(cc) = condition_code(cc_name) {
            return Some(Kind::Jcc(cc));
        }
    }

    Some(match name {
        "mov" => Kind::Mov,
        "add" => Kind::Alu(0),
        "or" => Kind::Alu(1),
        "adc" => Kind::Alu(2),
        "sbb" => Kind::Alu(3),
        "and" => Kind::Alu(4),
        "sub" => Kind::Alu(5),
        "xor" => Kind::Alu(6),
        "cmp" => Kind::Alu(7),
        "test" => Kind::Test,
        "inc" => Kind::IncDec(false),
        "dec" => Kind::IncDec(true),
        "not" => Kind::F6(2),
        "neg" => Kind::F6(3),
        "mul" => Kind::F6(4),
        "div" => Kind::F6(6),
        "idiv" => Kind::F6(7),
        "imul" => Kind::Imul,
        "rol" => Kind::Shift(0),
        "ror" => Kind::Shift(1),
        "rcl" => Kind::Shift(2),
        "rcr" => Kind::Shift(3),
        "shl" | "sal" => Kind::Shift(4),
        "shr" => Kind::Shift(5),
        "sar" => Kind::Shift(7),
        "push" => Kind::Push,
        "pop" => Kind::Pop,
        "lea" => Kind::Lea,
        "xchg" => Kind::Xchg,
        "movzx" => Kind::Movx(false),
        "movsx" => Kind::Movx(true),
        "int" => Kind::Int,
        "ret" | "retn" => Kind::Ret(false),
        "retf" => Kind::Ret(true),
        "jmp" => Kind::Jmp,
        "call" => Kind::Call,
        "loop" => Kind::JcxLoop(0xe2, 0),
        "loope" | "loopz" => Kind::JcxLoop(0xe1, 0),
        "loopne" | "loopnz" => Kind::JcxLoop(0xe0, 0),
        "jcxz" => Kind::JcxLoop(0xe3, 16),
        "jecxz" => Kind::JcxLoop(0xe3, 32),
        "jrcxz" => Kind::JcxLoop(0xe3, 64),

        "nop" => Kind::Simple(&[0x90], 0, true),
        "hlt" => Kind::Simple(&[0xf4], 0, true),
        "cli" => Kind::Simple(&[0xfa], 0, true),
        "sti" => Kind::Simple(&[0xfb], 0, true),
        "cld" => Kind::Simple(&[0xfc], 0, true),
        "std" => Kind::Simple(&[0xfd], 0, true),
        "clc" => Kind::Simple(&[0xf8], 0, true),
        "stc" => Kind::Simple(&[0xf9], 0, true),
        "cmc" => Kind::Simple(&[0xf5], 0, true),
        "leave" => Kind::Simple(&[0xc9], 0, true),
        "pushf" => Kind::Simple(&[0x9c], 0, true),
        "popf" => Kind::Simple(&[0x9d], 0, true),
        "pusha" | "pushad" => Kind::Simple(&[0x60], 0, false),
        "popa" | "popad" => Kind::Simple(&[0x61], 0, false),
        "sahf" => Kind::Simple(&[0x9e], 0, true),
        "lahf" => Kind::Simple(&[0x9f], 0, true),
        "wait" | "fwait" => Kind::Simple(&[0x9b], 0, true),
        "xlatb" => Kind::Simple(&[0xd7], 0, true),
        "int3" => Kind::Simple(&[0xcc], 0, true),
        "into" => Kind::Simple(&[0xce], 0, false),
        "iret" => Kind::Simple(&[0xcf], 0, true),
        "ud2" => Kind::Simple(&[0x0f, 0x0b], 0, true),
        "cpuid" => Kind::Simple(&[0x0f, 0xa2], 0, true),
        "rdtsc" => Kind::Simple(&[0x0f, 0x31], 0, true),
        "syscall" => Kind::Simple(&[0x0f, 0x05], 0, true),
        "sysret" => Kind::Simple(&[0x0f, 0x07], 0, true),

        "cbw" => Kind::Simple(&[0x98], 16, true),
        "cwde" => Kind::Simple(&[0x98], 32, true),
        "cdqe" => Kind::Simple(&[0x98], 64, true),
        "cwd" => Kind::Simple(&[0x99], 16, true),
        "cdq" => Kind::Simple(&[0x99], 32, true),
        "cqo" => Kind::Simple(&[0x99], 64, true),

        "movsb" => Kind::Simple(&[0xa4], 0, true),
        "movsw" => Kind::Simple(&[0xa5], 16, true),
        "movsd" => Kind::Simple(&[0xa5], 32, true),
        "movsq" => Kind::Simple(&[0xa5], 64, true),
        "cmpsb" => Kind::Simple(&[0xa6], 0, true),
        "cmpsw" => Kind::Simple(&[0xa7], 16, true),
        "cmpsd" => Kind::Simple(&[0xa7], 32, true),
        "cmpsq" => Kind::Simple(&[0xa7], 64, true),
        "stosb" => Kind::Simple(&[0xaa], 0, true),
        "stosw" => Kind::Simple(&[0xab], 16, true),
        "stosd" => Kind::Simple(&[0xab], 32, true),
        "stosq" => Kind::Simple(&[0xab], 64, true),
        "lodsb" => Kind::Simple(&[0xac], 0, true),
        "lodsw" => Kind::Simple(&[0xad], 16, true),
        "lodsd" => Kind::Simple(&[0xad], 32, true),
        "lodsq" => Kind::Simple(&[0xad], 64, true),
        "scasb" => Kind::Simple(&[0xae], 0, true),
        "scasw" => Kind::Simple(&[0xaf], 16, true),
        "scasd" => Kind::Simple(&[0xaf], 32, true),
        "scasq" => Kind::Simple(&[0xaf], 64, true),

        _ => return None,
    })
}

fn condition_code(name: &str) -> Option<u8> {
    Some(match name {
        "o" => 0x0,
        "no" => 0x1,
        "b" | "c" | "nae" => 0x2,
        "ae" | "nb" | "nc" => 0x3,
        "e" | "z" => 0x4,
        "ne" | "nz" => 0x5,
        "be" | "na" => 0x6,
        "a" | "nbe" => 0x7,
        "s" => 0x8,
        "ns" => 0x9,
        "p" | "pe" => 0xa,
        "np" | "po" => 0xb,
        "l" | "nge" => 0xc,
        "ge" | "nl" => 0xd,
        "le" | "ng" => 0xe,
        "g" | "nle" => 0xf,
        _ => return None,
    })
}

/// An instruction prefix mnemonic and its byte.
pub fn prefix_byte(name: &str) -> Option<u8> {
    Some(match name {
        "lock" => 0xf0,
        "rep" | "repe" | "repz" => 0xf3,
        "repne" | "repnz" => 0xf2,
        _ => return None,
    })
}

/// A parsed instruction awaiting finalize-time encoding.
#[derive(Debug, Clone)]
pub struct X86Insn {
    name: String,
    kind: Kind,
    prefixes: Vec<u8>,
    operands: Vec<Operand>,
    mode_bits: u32,
    force_strict: bool,
    line: Line,
}

impl X86Insn {
    /// Build an instruction tail; `name` must have classified successfully.
    pub fn new(
        name: &str,
        kind: Kind,
        prefixes: Vec<u8>,
        operands: Vec<Operand>,
        mode_bits: u32,
        force_strict: bool,
        line: Line,
    ) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            prefixes,
            operands,
            mode_bits,
            force_strict,
            line,
        }
    }

    fn bad_operands(&self) -> Error {
        Error::Type(format!(
            "invalid combination of opcode and operands for `{}`",
            self.name
        ))
    }
}

/// Register or memory, the `r/m` side of a ModRM instruction.
enum Rm<'a> {
    R(Register),
    M(&'a EffectiveAddr),
}

struct Enc<'a, 'b> {
    mode_bits: u32,
    ctx: &'a ExprCtx<'b>,
    line: Line,
    prefixes: Vec<u8>,
    rex_w: bool,
    rex_r: bool,
    rex_x: bool,
    rex_b: bool,
    need_rex: bool,
    used_high8: bool,
    opcode: Vec<u8>,
    modrm: Option<u8>,
    sib: Option<u8>,
    values: Vec<Value>,
}

impl<'a, 'b> Enc<'a, 'b> {
    fn new(mode_bits: u32, prefixes: Vec<u8>, ctx: &'a ExprCtx<'b>, line: Line) -> Self {
        Self {
            mode_bits,
            ctx,
            line,
            prefixes,
            rex_w: false,
            rex_r: false,
            rex_x: false,
            rex_b: false,
            need_rex: false,
            used_high8: false,
            opcode: Vec::new(),
            modrm: None,
            sib: None,
            values: Vec::new(),
        }
    }

    fn note_reg(&mut self, register: Register) {
        match reg_class(register) {
            RegClass::Reg8 if reg_num(register) >= 4 => self.used_high8 = true,
            RegClass::Reg8x => self.need_rex = true,
            _ => {}
        }
    }

    /// Operand-size prefix / REX.W for an operand size of `size` bits.
    fn set_opsize(&mut self, size: u32) -> Result<(), Error> {
        match (size, self.mode_bits) {
            (8, _) => {}
            (16, 16) | (32, 32) | (32, 64) => {}
            (16, 32) | (16, 64) | (32, 16) => self.prefixes.push(0x66),
            (64, 64) => self.rex_w = true,
            (64, _) => {
                return Err(Error::Value(
                    "64-bit operand size requires 64-bit mode".to_owned(),
                ));
            }
            _ => return Err(Error::Value(format!("invalid operand size {size}"))),
        }
        Ok(())
    }

    fn set_modrm_reg(&mut self, register: Register) {
        self.note_reg(register);
        self.rex_r = reg_num(register) >= 8;
        let modrm = self.modrm.unwrap_or(0);
        self.modrm = Some(modrm | (((reg_num(register) & 7) as u8) << 3));
    }

    fn set_modrm_ext(&mut self, ext: u8) {
        let modrm = self.modrm.unwrap_or(0);
        self.modrm = Some(modrm | (ext << 3));
    }

    fn set_rm(&mut self, rm: &Rm<'_>) -> Result<(), Error> {
        match rm {
            Rm::R(register) => {
                self.note_reg(*register);
                self.rex_b = reg_num(*register) >= 8;
                let modrm = self.modrm.unwrap_or(0);
                self.modrm = Some(modrm | 0xc0 | ((reg_num(*register) & 7) as u8));
            }
            Rm::M(ea) => {
                if let Some(segment) = ea.segment {
                    self.prefixes.push(segment_prefix(segment)?);
                }

                let parts: EaParts = analyze(&ea.disp, self.mode_bits, self.ctx)?;
                if parts.addr_size != self.mode_bits {
                    self.prefixes.push(0x67);
                }

                self.rex_b = parts.rex_b;
                self.rex_x = parts.rex_x;
                let modrm = self.modrm.unwrap_or(0);
                self.modrm = Some(modrm | (parts.modrm_mod << 6) | parts.rm);
                self.sib = parts.sib;

                if let Some(disp) = parts.disp {
                    let mut value = Value::from_expr(disp.expr, disp.size, self.line);
                    if disp.size == 8 {
                        value.set_signed();
                    }
                    self.values.push(value);
                }
            }
        }
        Ok(())
    }

    fn push_imm(&mut self, expr: Expr, size: u32, signed: bool) {
        let mut value = Value::from_expr(expr, size, self.line);
        if signed {
            value.set_signed();
        }
        self.values.push(value);
    }

    /// A constant immediate, when it is known this early.
    fn imm_const(&self, expr: &Expr) -> Option<i128> {
        let mut expr = expr.clone();
        expr.simplify(self.ctx, false).ok()?;
        expr.get_intnum().map(|value| value.as_i128())
    }

    fn finish(self, fixed: &mut Vec<u8>, fixups: &mut Vec<Fixup>) -> Result<(), Error> {
        fixed.extend_from_slice(&self.prefixes);

        let rex_bits = (u8::from(self.rex_w) << 3)
            | (u8::from(self.rex_r) << 2)
            | (u8::from(self.rex_x) << 1)
            | u8::from(self.rex_b);

        if rex_bits != 0 || self.need_rex {
            if self.mode_bits != 64 {
                return Err(Error::Value(
                    "instruction form requires 64-bit mode".to_owned(),
                ));
            }
            if self.used_high8 {
                return Err(Error::Value(
                    "cannot mix high 8-bit registers with extended registers".to_owned(),
                ));
            }
            fixed.push(0x40 | rex_bits);
        }

        fixed.extend_from_slice(&self.opcode);
        if let Some(modrm) = self.modrm {
            fixed.push(modrm);
        }
        if let Some(sib) = self.sib {
            fixed.push(sib);
        }

        for value in self.values {
            let off = fixed.len() as u32;
            fixed.resize(fixed.len() + (value.size() / 8) as usize, 0);
            fixups.push(Fixup { off, value });
        }

        Ok(())
    }
}

fn is_sreg(register: Register) -> bool {
    reg_class(register) == RegClass::Sreg
}

fn is_acc(register: Register) -> bool {
    reg_num(register) == 0 && !is_sreg(register)
}

/// The common operand size of a register/memory pair plus overrides; 0 when
/// nothing determines it.
fn operand_size(sizes: &[u32]) -> Result<u32, Error> {
    let mut size = 0;
    for &candidate in sizes {
        if candidate == 0 {
            continue;
        }
        if size == 0 {
            size = candidate;
        } else if size != candidate {
            return Err(Error::Type("mismatch in operand sizes".to_owned()));
        }
    }
    Ok(size)
}

fn imm_parts(operand: &Operand) -> Option<(&Expr, u32, bool, Option<TargetMod>)> {
    match operand {
        Operand::Imm { expr, size, strict, target_mod } => {
            Some((expr, *size, *strict, *target_mod))
        }
        _ => None,
    }
}

impl X86Insn {
    fn encode(
        &self,
        enc: &mut Enc<'_, '_>,
    ) -> Result<Option<X86Jump>, Error> {
        let ops = &self.operands;

        match self.kind {
            Kind::Simple(bytes, opsize, valid64) => {
                if !ops.is_empty() {
                    return Err(self.bad_operands());
                }
                if !valid64 && self.mode_bits == 64 {
                    return Err(Error::Value(format!(
                        "`{}` is not valid in 64-bit mode",
                        self.name
                    )));
                }
                if opsize != 0 {
                    enc.set_opsize(opsize)?;
                }
                enc.opcode.extend_from_slice(bytes);
                Ok(None)
            }

            Kind::Mov => self.encode_mov(enc),
            Kind::Alu(row) => self.encode_alu(enc, row),
            Kind::Test => self.encode_test(enc),
            Kind::IncDec(dec) => self.encode_incdec(enc, dec),
            Kind::F6(ext) => self.encode_f6(enc, ext),
            Kind::Shift(ext) => self.encode_shift(enc, ext),
            Kind::Imul => self.encode_imul(enc),
            Kind::Push => self.encode_push(enc),
            Kind::Pop => self.encode_pop(enc),
            Kind::Lea => self.encode_lea(enc),
            Kind::Xchg => self.encode_xchg(enc),
            Kind::Movx(sign) => self.encode_movx(enc, sign),

            Kind::Int => match ops.as_slice() {
                [operand] => {
                    let (expr, _, _, _) = imm_parts(operand).ok_or_else(|| self.bad_operands())?;
                    enc.opcode.push(0xcd);
                    enc.push_imm(expr.clone(), 8, false);
                    Ok(None)
                }
                _ => Err(self.bad_operands()),
            },

            Kind::Ret(far) => {
                let near_opcode: u8 = if far { 0xcb } else { 0xc3 };
                let imm_opcode: u8 = if far { 0xca } else { 0xc2 };
                match ops.as_slice() {
                    [] => {
                        enc.opcode.push(near_opcode);
                        Ok(None)
                    }
                    [operand] => {
                        let (expr, _, _, _) =
                            imm_parts(operand).ok_or_else(|| self.bad_operands())?;
                        enc.opcode.push(imm_opcode);
                        enc.push_imm(expr.clone(), 16, false);
                        Ok(None)
                    }
                    _ => Err(self.bad_operands()),
                }
            }

            Kind::Jmp | Kind::Call | Kind::Jcc(_) | Kind::JcxLoop(..) => self.encode_branch(enc),
        }
    }

    fn encode_mov(&self, enc: &mut Enc<'_, '_>) -> Result<Option<X86Jump>, Error> {
        match self.operands.as_slice() {
            // mov sreg, r/m16 and mov r/m16, sreg.
            [Operand::Reg(dst), Operand::Reg(src)] if is_sreg(*dst) => {
                enc.opcode.push(0x8e);
                enc.set_rm(&Rm::R(*src))?;
                enc.set_modrm_reg(*dst);
                Ok(None)
            }
            [Operand::Reg(dst), Operand::Reg(src)] if is_sreg(*src) => {
                enc.opcode.push(0x8c);
                enc.set_rm(&Rm::R(*dst))?;
                enc.set_modrm_reg(*src);
                Ok(None)
            }
            [Operand::Reg(dst), Operand::Reg(src)] => {
                let size = operand_size(&[reg_size(*dst), reg_size(*src)])?;
                if reg_size(*dst) != reg_size(*src) {
                    return Err(Error::Type("mismatch in operand sizes".to_owned()));
                }
                enc.set_opsize(size)?;
                enc.opcode.push(if size == 8 { 0x88 } else { 0x89 });
                enc.set_rm(&Rm::R(*dst))?;
                enc.set_modrm_reg(*src);
                Ok(None)
            }
            [Operand::Mem(mem), Operand::Reg(src)] if !is_sreg(*src) => {
                let size = operand_size(&[mem.size, reg_size(*src)])?;
                enc.set_opsize(size)?;
                enc.opcode.push(if size == 8 { 0x88 } else { 0x89 });
                enc.set_rm(&Rm::M(mem))?;
                enc.set_modrm_reg(*src);
                Ok(None)
            }
            [Operand::Reg(dst), Operand::Mem(mem)] if !is_sreg(*dst) => {
                let size = operand_size(&[mem.size, reg_size(*dst)])?;
                enc.set_opsize(size)?;
                enc.opcode.push(if size == 8 { 0x8a } else { 0x8b });
                enc.set_rm(&Rm::M(mem))?;
                enc.set_modrm_reg(*dst);
                Ok(None)
            }
            [Operand::Mem(mem), Operand::Reg(src)] => {
                // mov m16, sreg.
                enc.opcode.push(0x8c);
                enc.set_rm(&Rm::M(mem))?;
                enc.set_modrm_reg(*src);
                Ok(None)
            }
            [Operand::Reg(dst), operand] if is_sreg(*dst) => match operand {
                Operand::Mem(mem) => {
                    enc.opcode.push(0x8e);
                    enc.set_rm(&Rm::M(mem))?;
                    enc.set_modrm_reg(*dst);
                    Ok(None)
                }
                _ => Err(self.bad_operands()),
            },
            [Operand::Reg(dst), Operand::Imm { expr, size, .. }] => {
                let size = operand_size(&[reg_size(*dst), *size])?;
                if size != reg_size(*dst) {
                    return Err(Error::Type("mismatch in operand sizes".to_owned()));
                }
                enc.set_opsize(size)?;
                enc.note_reg(*dst);
                enc.rex_b = reg_num(*dst) >= 8;
                let base: u8 = if size == 8 { 0xb0 } else { 0xb8 };
                enc.opcode.push(base + (reg_num(*dst) & 7) as u8);
                enc.push_imm(expr.clone(), size, false);
                Ok(None)
            }
            [Operand::Mem(mem), Operand::Imm { expr, size, .. }] => {
                let size = operand_size(&[mem.size, *size])?;
                if size == 0 {
                    return Err(Error::Value("operation size not specified".to_owned()));
                }
                enc.set_opsize(size)?;
                enc.opcode.push(if size == 8 { 0xc6 } else { 0xc7 });
                enc.set_rm(&Rm::M(mem))?;
                enc.set_modrm_ext(0);
                // `mov r/m64, imm` sign-extends a 32-bit immediate.
                enc.push_imm(expr.clone(), size.min(32), size == 64);
                Ok(None)
            }
            _ => Err(self.bad_operands()),
        }
    }

    fn encode_alu(&self, enc: &mut Enc<'_, '_>, row: u8) -> Result<Option<X86Jump>, Error> {
        let base = row * 8;
        match self.operands.as_slice() {
            [Operand::Reg(dst), Operand::Reg(src)] => {
                let size = operand_size(&[reg_size(*dst), reg_size(*src)])?;
                if reg_size(*dst) != reg_size(*src) {
                    return Err(Error::Type("mismatch in operand sizes".to_owned()));
                }
                enc.set_opsize(size)?;
                enc.opcode.push(base + u8::from(size != 8));
                enc.set_rm(&Rm::R(*dst))?;
                enc.set_modrm_reg(*src);
                Ok(None)
            }
            [Operand::Mem(mem), Operand::Reg(src)] => {
                let size = operand_size(&[mem.size, reg_size(*src)])?;
                enc.set_opsize(size)?;
                enc.opcode.push(base + u8::from(size != 8));
                enc.set_rm(&Rm::M(mem))?;
                enc.set_modrm_reg(*src);
                Ok(None)
            }
            [Operand::Reg(dst), Operand::Mem(mem)] => {
                let size = operand_size(&[mem.size, reg_size(*dst)])?;
                enc.set_opsize(size)?;
                enc.opcode.push(base + 2 + u8::from(size != 8));
                enc.set_rm(&Rm::M(mem))?;
                enc.set_modrm_reg(*dst);
                Ok(None)
            }
            [dst, Operand::Imm { expr, size: imm_size, strict, .. }] => {
                let (rm, dst_size) = match dst {
                    Operand::Reg(register) => (Rm::R(*register), reg_size(*register)),
                    Operand::Mem(mem) => (Rm::M(mem), mem.size),
                    _ => return Err(self.bad_operands()),
                };
                let size = operand_size(&[dst_size, *imm_size])?;
                if size == 0 {
                    return Err(Error::Value("operation size not specified".to_owned()));
                }
                enc.set_opsize(size)?;

                let constant = enc.imm_const(expr);
                let fits_i8 = constant.is_some_and(|value| (-128..=127).contains(&value));
                let sign_extended =
                    size != 8 && fits_i8 && !*strict && !self.force_strict && *imm_size == 0;

                if size == 8 {
                    match dst {
                        Operand::Reg(register) if is_acc(*register) => {
                            enc.opcode.push(base + 4);
                        }
                        _ => {
                            enc.opcode.push(0x80);
                            enc.set_rm(&rm)?;
                            enc.set_modrm_ext(row);
                        }
                    }
                    enc.push_imm(expr.clone(), 8, false);
                } else if sign_extended {
                    enc.opcode.push(0x83);
                    enc.set_rm(&rm)?;
                    enc.set_modrm_ext(row);
                    enc.push_imm(expr.clone(), 8, true);
                } else {
                    match dst {
                        Operand::Reg(register) if is_acc(*register) => {
                            enc.opcode.push(base + 5);
                        }
                        _ => {
                            enc.opcode.push(0x81);
                            enc.set_rm(&rm)?;
                            enc.set_modrm_ext(row);
                        }
                    }
                    enc.push_imm(expr.clone(), size.min(32), size == 64);
                }
                Ok(None)
            }
            _ => Err(self.bad_operands()),
        }
    }

    fn encode_test(&self, enc: &mut Enc<'_, '_>) -> Result<Option<X86Jump>, Error> {
        match self.operands.as_slice() {
            [Operand::Reg(dst), Operand::Reg(src)] => {
                let size = operand_size(&[reg_size(*dst), reg_size(*src)])?;
                enc.set_opsize(size)?;
                enc.opcode.push(if size == 8 { 0x84 } else { 0x85 });
                enc.set_rm(&Rm::R(*dst))?;
                enc.set_modrm_reg(*src);
                Ok(None)
            }
            [Operand::Mem(mem), Operand::Reg(src)] | [Operand::Reg(src), Operand::Mem(mem)] => {
                let size = operand_size(&[mem.size, reg_size(*src)])?;
                enc.set_opsize(size)?;
                enc.opcode.push(if size == 8 { 0x84 } else { 0x85 });
                enc.set_rm(&Rm::M(mem))?;
                enc.set_modrm_reg(*src);
                Ok(None)
            }
            [dst, Operand::Imm { expr, size: imm_size, .. }] => {
                let (rm, dst_size, acc) = match dst {
                    Operand::Reg(register) => {
                        (Rm::R(*register), reg_size(*register), is_acc(*register))
                    }
                    Operand::Mem(mem) => (Rm::M(mem), mem.size, false),
                    _ => return Err(self.bad_operands()),
                };
                let size = operand_size(&[dst_size, *imm_size])?;
                if size == 0 {
                    return Err(Error::Value("operation size not specified".to_owned()));
                }
                enc.set_opsize(size)?;
                if acc {
                    enc.opcode.push(if size == 8 { 0xa8 } else { 0xa9 });
                } else {
                    enc.opcode.push(if size == 8 { 0xf6 } else { 0xf7 });
                    enc.set_rm(&rm)?;
                    enc.set_modrm_ext(0);
                }
                enc.push_imm(expr.clone(), size.min(32), size == 64);
                Ok(None)
            }
            _ => Err(self.bad_operands()),
        }
    }

    fn encode_incdec(&self, enc: &mut Enc<'_, '_>, dec: bool) -> Result<Option<X86Jump>, Error> {
        let ext = u8::from(dec);
        match self.operands.as_slice() {
            [Operand::Reg(register)] => {
                let size = reg_size(*register);
                enc.set_opsize(size)?;
                if size != 8 && self.mode_bits != 64 {
                    let base: u8 = if dec { 0x48 } else { 0x40 };
                    enc.opcode.push(base + (reg_num(*register) & 7) as u8);
                } else {
                    enc.opcode.push(if size == 8 { 0xfe } else { 0xff });
                    enc.set_rm(&Rm::R(*register))?;
                    enc.set_modrm_ext(ext);
                }
                Ok(None)
            }
            [Operand::Mem(mem)] => {
                if mem.size == 0 {
                    return Err(Error::Value("operation size not specified".to_owned()));
                }
                enc.set_opsize(mem.size)?;
                enc.opcode.push(if mem.size == 8 { 0xfe } else { 0xff });
                enc.set_rm(&Rm::M(mem))?;
                enc.set_modrm_ext(ext);
                Ok(None)
            }
            _ => Err(self.bad_operands()),
        }
    }

    fn encode_f6(&self, enc: &mut Enc<'_, '_>, ext: u8) -> Result<Option<X86Jump>, Error> {
        let (rm, size) = match self.operands.as_slice() {
            [Operand::Reg(register)] => (Rm::R(*register), reg_size(*register)),
            [Operand::Mem(mem)] => (Rm::M(mem), mem.size),
            _ => return Err(self.bad_operands()),
        };
        if size == 0 {
            return Err(Error::Value("operation size not specified".to_owned()));
        }
        enc.set_opsize(size)?;
        enc.opcode.push(if size == 8 { 0xf6 } else { 0xf7 });
        enc.set_rm(&rm)?;
        enc.set_modrm_ext(ext);
        Ok(None)
    }

    fn encode_shift(&self, enc: &mut Enc<'_, '_>, ext: u8) -> Result<Option<X86Jump>, Error> {
        let (rm, size, count) = match self.operands.as_slice() {
            [dst, count] => {
                let (rm, size) = match dst {
                    Operand::Reg(register) => (Rm::R(*register), reg_size(*register)),
                    Operand::Mem(mem) => (Rm::M(mem), mem.size),
                    _ => return Err(self.bad_operands()),
                };
                (rm, size, count)
            }
            _ => return Err(self.bad_operands()),
        };
        if size == 0 {
            return Err(Error::Value("operation size not specified".to_owned()));
        }
        enc.set_opsize(size)?;

        match count {
            Operand::Reg(register) if reg_class(*register) == RegClass::Reg8
                && reg_num(*register) == 1 =>
            {
                // Shift by cl.
                enc.opcode.push(if size == 8 { 0xd2 } else { 0xd3 });
                enc.set_rm(&rm)?;
                enc.set_modrm_ext(ext);
            }
            Operand::Imm { expr, .. } => {
                if enc.imm_const(expr) == Some(1) {
                    enc.opcode.push(if size == 8 { 0xd0 } else { 0xd1 });
                    enc.set_rm(&rm)?;
                    enc.set_modrm_ext(ext);
                } else {
                    enc.opcode.push(if size == 8 { 0xc0 } else { 0xc1 });
                    enc.set_rm(&rm)?;
                    enc.set_modrm_ext(ext);
                    enc.push_imm(expr.clone(), 8, false);
                }
            }
            _ => return Err(self.bad_operands()),
        }
        Ok(None)
    }

    fn encode_imul(&self, enc: &mut Enc<'_, '_>) -> Result<Option<X86Jump>, Error> {
        match self.operands.as_slice() {
            [_] => self.encode_f6(enc, 5),
            [Operand::Reg(dst), src] => {
                let (rm, src_size) = match src {
                    Operand::Reg(register) => (Rm::R(*register), reg_size(*register)),
                    Operand::Mem(mem) => (Rm::M(mem), mem.size),
                    _ => return Err(self.bad_operands()),
                };
                let size = operand_size(&[reg_size(*dst), src_size])?;
                enc.set_opsize(size)?;
                enc.opcode.extend_from_slice(&[0x0f, 0xaf]);
                enc.set_rm(&rm)?;
                enc.set_modrm_reg(*dst);
                Ok(None)
            }
            [Operand::Reg(dst), src, Operand::Imm { expr, .. }] => {
                let (rm, src_size) = match src {
                    Operand::Reg(register) => (Rm::R(*register), reg_size(*register)),
                    Operand::Mem(mem) => (Rm::M(mem), mem.size),
                    _ => return Err(self.bad_operands()),
                };
                let size = operand_size(&[reg_size(*dst), src_size])?;
                enc.set_opsize(size)?;

                let constant = enc.imm_const(expr);
                if constant.is_some_and(|value| (-128..=127).contains(&value)) {
                    enc.opcode.push(0x6b);
                    enc.set_rm(&rm)?;
                    enc.set_modrm_reg(*dst);
                    enc.push_imm(expr.clone(), 8, true);
                } else {
                    enc.opcode.push(0x69);
                    enc.set_rm(&rm)?;
                    enc.set_modrm_reg(*dst);
                    enc.push_imm(expr.clone(), size.min(32), size == 64);
                }
                Ok(None)
            }
            _ => Err(self.bad_operands()),
        }
    }

    fn encode_push(&self, enc: &mut Enc<'_, '_>) -> Result<Option<X86Jump>, Error> {
        let default_size = if self.mode_bits == 16 { 16 } else { 32 };
        match self.operands.as_slice() {
            [Operand::Reg(register)] if !is_sreg(*register) => {
                let size = reg_size(*register);
                if self.mode_bits == 64 && size == 32 {
                    return Err(Error::Value(
                        "cannot push a 32-bit register in 64-bit mode".to_owned(),
                    ));
                }
                if size == 8 {
                    return Err(self.bad_operands());
                }
                // Stack pushes default to 64-bit in long mode; no REX.W.
                if size == 16 && self.mode_bits != 16 {
                    enc.prefixes.push(0x66);
                } else if size == 32 && self.mode_bits == 16 {
                    enc.prefixes.push(0x66);
                }
                enc.note_reg(*register);
                enc.rex_b = reg_num(*register) >= 8;
                enc.opcode.push(0x50 + (reg_num(*register) & 7) as u8);
                Ok(None)
            }
            [Operand::Mem(mem)] => {
                enc.opcode.push(0xff);
                enc.set_rm(&Rm::M(mem))?;
                enc.set_modrm_ext(6);
                Ok(None)
            }
            [Operand::Imm { expr, size, .. }] => {
                let constant = enc.imm_const(expr);
                if *size == 8 || (*size == 0 && constant.is_some_and(|v| (-128..=127).contains(&v)))
                {
                    enc.opcode.push(0x6a);
                    enc.push_imm(expr.clone(), 8, true);
                } else {
                    let size = if *size == 0 { default_size } else { *size };
                    if size == 16 && self.mode_bits != 16 {
                        enc.prefixes.push(0x66);
                    } else if size == 32 && self.mode_bits == 16 {
                        enc.prefixes.push(0x66);
                    }
                    enc.opcode.push(0x68);
                    enc.push_imm(expr.clone(), size.min(32), false);
                }
                Ok(None)
            }
            _ => Err(self.bad_operands()),
        }
    }

    fn encode_pop(&self, enc: &mut Enc<'_, '_>) -> Result<Option<X86Jump>, Error> {
        match self.operands.as_slice() {
            [Operand::Reg(register)] if !is_sreg(*register) => {
                let size = reg_size(*register);
                if size == 8 || (self.mode_bits == 64 && size == 32) {
                    return Err(self.bad_operands());
                }
                if (size == 16 && self.mode_bits != 16) || (size == 32 && self.mode_bits == 16) {
                    enc.prefixes.push(0x66);
                }
                enc.note_reg(*register);
                enc.rex_b = reg_num(*register) >= 8;
                enc.opcode.push(0x58 + (reg_num(*register) & 7) as u8);
                Ok(None)
            }
            [Operand::Mem(mem)] => {
                enc.opcode.push(0x8f);
                enc.set_rm(&Rm::M(mem))?;
                enc.set_modrm_ext(0);
                Ok(None)
            }
            _ => Err(self.bad_operands()),
        }
    }

    fn encode_lea(&self, enc: &mut Enc<'_, '_>) -> Result<Option<X86Jump>, Error> {
        match self.operands.as_slice() {
            [Operand::Reg(dst), Operand::Mem(mem)] => {
                enc.set_opsize(reg_size(*dst))?;
                enc.opcode.push(0x8d);
                enc.set_rm(&Rm::M(mem))?;
                enc.set_modrm_reg(*dst);
                Ok(None)
            }
            _ => Err(self.bad_operands()),
        }
    }

    fn encode_xchg(&self, enc: &mut Enc<'_, '_>) -> Result<Option<X86Jump>, Error> {
        match self.operands.as_slice() {
            [Operand::Reg(a), Operand::Reg(b)] => {
                let size = operand_size(&[reg_size(*a), reg_size(*b)])?;
                if reg_size(*a) != reg_size(*b) {
                    return Err(Error::Type("mismatch in operand sizes".to_owned()));
                }
                enc.set_opsize(size)?;
                if size != 8 && (is_acc(*a) || is_acc(*b)) {
                    let other = if is_acc(*a) { *b } else { *a };
                    enc.note_reg(other);
                    enc.rex_b = reg_num(other) >= 8;
                    enc.opcode.push(0x90 + (reg_num(other) & 7) as u8);
                } else {
                    enc.opcode.push(if size == 8 { 0x86 } else { 0x87 });
                    enc.set_rm(&Rm::R(*a))?;
                    enc.set_modrm_reg(*b);
                }
                Ok(None)
            }
            [Operand::Mem(mem), Operand::Reg(register)]
            | [Operand::Reg(register), Operand::Mem(mem)] => {
                let size = operand_size(&[mem.size, reg_size(*register)])?;
                enc.set_opsize(size)?;
                enc.opcode.push(if size == 8 { 0x86 } else { 0x87 });
                enc.set_rm(&Rm::M(mem))?;
                enc.set_modrm_reg(*register);
                Ok(None)
            }
            _ => Err(self.bad_operands()),
        }
    }

    fn encode_movx(&self, enc: &mut Enc<'_, '_>, sign: bool) -> Result<Option<X86Jump>, Error> {
        match self.operands.as_slice() {
            [Operand::Reg(dst), src] => {
                let (rm, src_size) = match src {
                    Operand::Reg(register) => (Rm::R(*register), reg_size(*register)),
                    Operand::Mem(mem) => (Rm::M(mem), mem.size),
                    _ => return Err(self.bad_operands()),
                };
                if src_size == 0 {
                    return Err(Error::Value("operation size not specified".to_owned()));
                }
                let dst_size = reg_size(*dst);
                if dst_size <= src_size || src_size > 16 {
                    return Err(self.bad_operands());
                }
                enc.set_opsize(dst_size)?;
                let base: u8 = if sign { 0xbe } else { 0xb6 };
                enc.opcode.extend_from_slice(&[0x0f, base + u8::from(src_size == 16)]);
                enc.set_rm(&rm)?;
                enc.set_modrm_reg(*dst);
                Ok(None)
            }
            _ => Err(self.bad_operands()),
        }
    }

    fn encode_branch(&self, enc: &mut Enc<'_, '_>) -> Result<Option<X86Jump>, Error> {
        // Indirect forms first: jmp/call through a register or memory.
        if let Kind::Jmp | Kind::Call = self.kind {
            let ext = if matches!(self.kind, Kind::Jmp) { 4 } else { 2 };
            match self.operands.as_slice() {
                [Operand::Reg(register)] => {
                    let size = reg_size(*register);
                    if self.mode_bits == 64 {
                        if size != 64 {
                            return Err(self.bad_operands());
                        }
                    } else {
                        enc.set_opsize(size)?;
                    }
                    enc.opcode.push(0xff);
                    enc.set_rm(&Rm::R(*register))?;
                    enc.set_modrm_ext(ext);
                    return Ok(None);
                }
                [Operand::Mem(mem)] => {
                    if self.mode_bits != 64 && mem.size != 0 {
                        enc.set_opsize(mem.size)?;
                    }
                    enc.opcode.push(0xff);
                    enc.set_rm(&Rm::M(mem))?;
                    enc.set_modrm_ext(ext);
                    return Ok(None);
                }
                _ => {}
            }
        }

        let [Operand::Imm { expr, target_mod, .. }] = self.operands.as_slice() else {
            return Err(self.bad_operands());
        };

        let forced = match target_mod {
            Some(TargetMod::Short) => Some(JmpState::Short),
            Some(TargetMod::Near) => Some(JmpState::Near),
            Some(TargetMod::Far) => {
                return Err(Error::Value(format!(
                    "far branches are not supported by `{}`",
                    self.name
                )));
            }
            None => None,
        };

        let (short_opcode, near_opcode, forced) = match self.kind {
            Kind::Jmp => (vec![0xeb], vec![0xe9], forced),
            Kind::Call => {
                if forced == Some(JmpState::Short) {
                    return Err(Error::Value("`call` has no short form".to_owned()));
                }
                (vec![], vec![0xe8], Some(JmpState::Near))
            }
            Kind::Jcc(cc) => (vec![0x70 + cc], vec![0x0f, 0x80 + cc], forced),
            Kind::JcxLoop(opcode, addr_bits) => {
                let mut short = Vec::new();
                if addr_bits != 0 && addr_bits != self.mode_bits {
                    if addr_bits == 64 || (addr_bits == 16 && self.mode_bits == 64) {
                        return Err(Error::Value(format!(
                            "`{}` is not valid in {}-bit mode",
                            self.name, self.mode_bits
                        )));
                    }
                    short.push(0x67);
                }
                short.push(opcode);
                (short, vec![], Some(JmpState::Short))
            }
            _ => unreachable!(),
        };

        Ok(Some(X86Jump::new(
            short_opcode,
            near_opcode,
            expr.clone(),
            self.mode_bits,
            forced,
            self.line,
        )))
    }
}

impl SpecialContents for X86Insn {
    fn type_name(&self) -> &'static str {
        "x86::Insn"
    }

    fn clone_box(&self) -> Box<dyn SpecialContents> {
        Box::new(self.clone())
    }

    fn finalize(
        &mut self,
        fixed: &mut Vec<u8>,
        fixups: &mut Vec<Fixup>,
        ctx: &ExprCtx<'_>,
        _line: Line,
    ) -> Result<Option<Contents>, Error> {
        let mut enc = Enc::new(self.mode_bits, self.prefixes.clone(), ctx, self.line);

        match self.encode(&mut enc)? {
            Some(jump) => {
                // Branch prefixes (there are rarely any) stay in the fixed
                // part, ahead of the span-dependent tail.
                fixed.extend_from_slice(&enc.prefixes);
                Ok(Some(Contents::Special(Box::new(jump))))
            }
            None => {
                enc.finish(fixed, fixups)?;
                Ok(Some(Contents::Empty))
            }
        }
    }

    fn calc_len(
        &mut self,
        _ctx: &ExprCtx<'_>,
        _add_span: &mut dyn FnMut(SpanReq),
    ) -> Result<u64, Error> {
        Err(Error::Internal("instruction length before finalize".to_owned()))
    }

    fn expand(&mut self, _span_id: i32, _old: i128, _new: i128) -> Result<Expansion, Error> {
        Err(Error::Internal("instruction expand before finalize".to_owned()))
    }

    fn output(
        &self,
        _loc: Location,
        _octx: &OutputContext<'_>,
        _out: &mut dyn BytecodeOutput,
    ) -> Result<(), Error> {
        Err(Error::Internal("instruction output before finalize".to_owned()))
    }
}
