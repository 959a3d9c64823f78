//! Effective-address analysis and ModRM/SIB encoding.
//!
//! The parser hands memory operands over as bracketed expressions in which
//! registers are ordinary terms (`[ebx + esi*4 + table + 2]`); this module
//! splits such an expression into base register, scaled index register and
//! displacement, and picks the ModRM/SIB/displacement encoding.

use yasm_core::{Error, Expr, ExprCtx, ExprTerm, IntNum, Op, Register};

use crate::registers::{reg_class, reg_needs_rex_bit, reg_num, reg_size, RegClass};

/// Segment-override prefix byte for a segment register.
pub fn segment_prefix(segment: Register) -> Result<u8, Error> {
    if reg_class(segment) != RegClass::Sreg {
        return Err(Error::Type("segment override is not a segment register".to_owned()));
    }

    Ok(match reg_num(segment) {
        0 => 0x26, // es
        1 => 0x2e, // cs
        2 => 0x36, // ss
        3 => 0x3e, // ds
        4 => 0x64, // fs
        5 => 0x65, // gs
        _ => unreachable!(),
    })
}

/// One displacement field: the expression and its size in bits.
#[derive(Debug, Clone)]
pub struct Disp {
    /// The displacement expression.
    pub expr: Expr,
    /// Field size in bits (8, 16 or 32).
    pub size: u32,
}

/// A fully analyzed memory operand, ready to be assembled into bytes.
#[derive(Debug, Clone)]
pub struct EaParts {
    /// Address size of the operand, in bits.
    pub addr_size: u32,
    /// ModRM `mod` field.
    pub modrm_mod: u8,
    /// ModRM `rm` field.
    pub rm: u8,
    /// SIB byte, when one is required.
    pub sib: Option<u8>,
    /// REX.B extension for the base register.
    pub rex_b: bool,
    /// REX.X extension for the index register.
    pub rex_x: bool,
    /// Displacement field, when one is required.
    pub disp: Option<Disp>,
}

struct Split {
    regs: Vec<(Register, i128)>,
    residual: Vec<ExprTerm>,
    constant: IntNum,
}

impl Split {
    fn push_reg(&mut self, register: Register, mult: i128) -> Result<(), Error> {
        if mult <= 0 {
            return Err(Error::Value("invalid effective address".to_owned()));
        }
        for (existing, existing_mult) in &mut self.regs {
            if *existing == register {
                *existing_mult += mult;
                return Ok(());
            }
        }
        self.regs.push((register, mult));
        Ok(())
    }

    fn term(&mut self, term: ExprTerm, positive: bool) -> Result<(), Error> {
        match term {
            ExprTerm::Reg(register) => {
                if !positive {
                    return Err(Error::Value("invalid effective address".to_owned()));
                }
                self.push_reg(register, 1)?;
            }
            ExprTerm::Int(value) => {
                let value = if positive { value } else { value.calc(Op::Neg, None)? };
                self.constant = self.constant.calc(Op::Add, Some(&value))?;
            }
            ExprTerm::Expr(inner) if inner.op() == Op::Mul => {
                // After simplification a scaled register is `reg * constant`.
                let mut register = None;
                let mut mult = IntNum::new(1);
                let mut plain = true;
                for term in inner.terms() {
                    match term {
                        ExprTerm::Reg(reg) if register.is_none() => register = Some(*reg),
                        ExprTerm::Int(value) => mult = mult.calc(Op::Mul, Some(value))?,
                        _ => plain = false,
                    }
                }
                match (register, plain, positive) {
                    (Some(register), true, true) => self.push_reg(register, mult.as_i128())?,
                    (None, _, _) => self.keep(ExprTerm::Expr(inner), positive)?,
                    _ => return Err(Error::Value("invalid effective address".to_owned())),
                }
            }
            ExprTerm::Expr(inner) => match inner.op() {
                Op::Add | Op::Ident => {
                    for term in inner.terms().to_vec() {
                        self.term(term, positive)?;
                    }
                }
                Op::Neg => {
                    for term in inner.terms().to_vec() {
                        self.term(term, !positive)?;
                    }
                }
                Op::Sub => {
                    let mut terms = inner.terms().to_vec().into_iter();
                    if let Some(lhs) = terms.next() {
                        self.term(lhs, positive)?;
                    }
                    for rhs in terms {
                        self.term(rhs, !positive)?;
                    }
                }
                _ => self.keep(ExprTerm::Expr(inner), positive)?,
            },
            ExprTerm::Float(_) => {
                return Err(Error::Type(
                    "floating point value in effective address".to_owned(),
                ));
            }
            term => self.keep(term, positive)?,
        }

        Ok(())
    }

    fn keep(&mut self, term: ExprTerm, positive: bool) -> Result<(), Error> {
        if let ExprTerm::Expr(inner) = &term {
            if expr_contains_reg(inner) {
                return Err(Error::Value("invalid effective address".to_owned()));
            }
        }
        if positive {
            self.residual.push(term);
        } else {
            self.residual
                .push(ExprTerm::Expr(Box::new(Expr::new(Op::Neg, vec![term]))));
        }
        Ok(())
    }

    fn residual_expr(mut self) -> Option<Expr> {
        if !self.constant.is_zero() || self.residual.is_empty() {
            self.residual.push(ExprTerm::Int(self.constant));
        }

        match self.residual.len() {
            1 if matches!(self.residual[0], ExprTerm::Int(value) if value.is_zero()) => None,
            1 => Some(Expr::new(Op::Ident, self.residual)),
            _ => Some(Expr::new(Op::Add, self.residual)),
        }
    }
}

fn expr_contains_reg(expr: &Expr) -> bool {
    expr.terms().iter().any(|term| match term {
        ExprTerm::Reg(_) => true,
        ExprTerm::Expr(inner) => expr_contains_reg(inner),
        _ => false,
    })
}

/// Analyze a bracketed memory expression into [`EaParts`].
pub fn analyze(
    disp_expr: &Expr,
    mode_bits: u32,
    ctx: &ExprCtx<'_>,
) -> Result<EaParts, Error> {
    let mut expr = disp_expr.clone();
    expr.simplify(ctx, false)?;

    let mut split = Split {
        regs: Vec::new(),
        residual: Vec::new(),
        constant: IntNum::zero(),
    };
    split.term(ExprTerm::Expr(Box::new(expr)), true)?;

    let regs = std::mem::take(&mut split.regs);
    let residual = split.residual_expr();

    // Address size follows the registers used; pure displacements use the
    // mode's own size.
    let addr_size = match regs.first() {
        None => mode_bits,
        Some((register, _)) => reg_size(*register),
    };
    if regs.iter().any(|(register, _)| reg_size(*register) != addr_size) {
        return Err(Error::Value(
            "effective address mixes register sizes".to_owned(),
        ));
    }
    if addr_size == 8 || (addr_size == 16 && mode_bits == 64) || (addr_size == 64 && mode_bits != 64)
    {
        return Err(Error::Value(format!(
            "{addr_size}-bit effective address is not valid in {mode_bits}-bit mode"
        )));
    }

    let disp_const = residual.as_ref().and_then(Expr::get_intnum).copied();
    let has_disp_expr = residual.is_some() && disp_const.is_none();

    if addr_size == 16 {
        return analyze_16(regs, residual, disp_const, has_disp_expr);
    }

    analyze_32_64(regs, residual, disp_const, has_disp_expr, addr_size)
}

fn analyze_16(
    regs: Vec<(Register, i128)>,
    residual: Option<Expr>,
    disp_const: Option<IntNum>,
    has_disp_expr: bool,
) -> Result<EaParts, Error> {
    if regs.iter().any(|(_, mult)| *mult != 1) {
        return Err(Error::Value(
            "scaled registers are not valid in 16-bit addressing".to_owned(),
        ));
    }

    let name_of = |register: Register| (reg_class(register), reg_num(register));
    let mut names: Vec<(RegClass, u32)> = regs.iter().map(|(register, _)| name_of(*register)).collect();
    names.sort_by_key(|(_, num)| *num);

    // bx=3, bp=5, si=6, di=7.
    let rm = match names.as_slice() {
        [(RegClass::Reg16, 3), (RegClass::Reg16, 6)] => 0, // bx+si
        [(RegClass::Reg16, 3), (RegClass::Reg16, 7)] => 1, // bx+di
        [(RegClass::Reg16, 5), (RegClass::Reg16, 6)] => 2, // bp+si
        [(RegClass::Reg16, 5), (RegClass::Reg16, 7)] => 3, // bp+di
        [(RegClass::Reg16, 6)] => 4,                       // si
        [(RegClass::Reg16, 7)] => 5,                       // di
        [(RegClass::Reg16, 5)] => 6,                       // bp
        [(RegClass::Reg16, 3)] => 7,                       // bx
        [] => 6,                                           // pure disp16
        _ => {
            return Err(Error::Value(
                "invalid register combination in 16-bit effective address".to_owned(),
            ));
        }
    };

    // `[bp]` has no mod=00 form; `[disp16]` reuses rm=6 with mod=00.
    let (modrm_mod, disp) = if names.is_empty() {
        let expr = residual.unwrap_or_else(|| Expr::from_int(IntNum::zero()));
        (0, Some(Disp { expr, size: 16 }))
    } else if has_disp_expr {
        (2, Some(Disp { expr: residual.unwrap(), size: 16 }))
    } else {
        match disp_const {
            None if rm == 6 => (1, Some(Disp { expr: Expr::from_int(IntNum::zero()), size: 8 })),
            None => (0, None),
            Some(value) if value.ok_size(8, 0, yasm_core::Signedness::Signed) => {
                (1, Some(Disp { expr: Expr::from_int(value), size: 8 }))
            }
            Some(value) => (2, Some(Disp { expr: Expr::from_int(value), size: 16 })),
        }
    };

    Ok(EaParts {
        addr_size: 16,
        modrm_mod,
        rm,
        sib: None,
        rex_b: false,
        rex_x: false,
        disp,
    })
}

fn analyze_32_64(
    mut regs: Vec<(Register, i128)>,
    residual: Option<Expr>,
    disp_const: Option<IntNum>,
    has_disp_expr: bool,
    addr_size: u32,
) -> Result<EaParts, Error> {
    // `reg*n` with n in {2,3,5,9} re-expresses as base + index*(n-1).
    if regs.len() == 1 && matches!(regs[0].1, 2 | 3 | 5 | 9) {
        let (register, mult) = regs[0];
        regs = vec![(register, 1), (register, mult - 1)];
    }

    let (base, index, scale) = match regs.as_slice() {
        [] => (None, None, 1),
        [(register, 1)] => (Some(*register), None, 1),
        [(register, scale)] => (None, Some(*register), *scale),
        [(a, 1), (b, 1)] => {
            // Prefer esp/rsp as the base; it cannot be an index.
            if reg_num(*b) == 4 && !reg_needs_rex_bit(*b) {
                (Some(*b), Some(*a), 1)
            } else {
                (Some(*a), Some(*b), 1)
            }
        }
        [(a, 1), (b, scale)] => (Some(*a), Some(*b), *scale),
        [(a, scale), (b, 1)] => (Some(*b), Some(*a), *scale),
        _ => return Err(Error::Value("too many registers in effective address".to_owned())),
    };

    if !matches!(scale, 1 | 2 | 4 | 8) {
        return Err(Error::Value(format!("invalid effective address scale {scale}")));
    }
    if let Some(index) = index {
        // (e/r)sp cannot be scaled.
        if reg_num(index) == 4 && !reg_needs_rex_bit(index) {
            return Err(Error::Value("esp/rsp cannot be used as an index register".to_owned()));
        }
    }

    let scale_bits: u8 = match scale {
        1 => 0,
        2 => 1,
        4 => 2,
        _ => 3,
    };

    let rex_b = base.is_some_and(reg_needs_rex_bit);
    let rex_x = index.is_some_and(reg_needs_rex_bit);

    // Pick mod and the displacement size.
    let base_num = base.map(reg_num);
    let base_is_bp = matches!(base_num, Some(5) | Some(13));

    let (modrm_mod, disp) = if base.is_none() {
        // Absolute: disp32, mod=00.
        let expr = residual.unwrap_or_else(|| Expr::from_int(IntNum::zero()));
        (0u8, Some(Disp { expr, size: 32 }))
    } else if has_disp_expr {
        (2, Some(Disp { expr: residual.unwrap(), size: 32 }))
    } else {
        match disp_const {
            None if base_is_bp => {
                (1, Some(Disp { expr: Expr::from_int(IntNum::zero()), size: 8 }))
            }
            None => (0, None),
            Some(value) if value.is_zero() && !base_is_bp => (0, None),
            Some(value) if value.ok_size(8, 0, yasm_core::Signedness::Signed) => {
                (1, Some(Disp { expr: Expr::from_int(value), size: 8 }))
            }
            Some(value) => (2, Some(Disp { expr: Expr::from_int(value), size: 32 })),
        }
    };

    // Decide whether a SIB byte is needed.
    let base_is_sp = matches!(base_num, Some(4) | Some(12));
    let needs_sib = index.is_some() || base.is_none() || base_is_sp;

    let (rm, sib) = if needs_sib {
        let sib_base: u8 = match base {
            Some(base) => (reg_num(base) & 7) as u8,
            // No base: SIB base=101 with mod=00 means disp32 only.
            None => 5,
        };
        let sib_index: u8 = match index {
            Some(index) => (reg_num(index) & 7) as u8,
            None => 4,
        };
        (4u8, Some((scale_bits << 6) | (sib_index << 3) | sib_base))
    } else {
        ((reg_num(base.unwrap()) & 7) as u8, None)
    };

    Ok(EaParts { addr_size, modrm_mod, rm, sib, rex_b, rex_x, disp })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::lookup;
    use yasm_core::SymbolTable;

    fn analyze_str(parts: &[&str], mode_bits: u32) -> Result<EaParts, Error> {
        // Build `a + b + …` from register names and decimal constants.
        let mut expr: Option<Expr> = None;
        for part in parts {
            let term = match lookup(part) {
                Some(register) => Expr::from_reg(register),
                None if part.contains('*') => {
                    let (name, mult) = part.split_once('*').unwrap();
                    Expr::binary(
                        Expr::from_reg(lookup(name).unwrap()),
                        Op::Mul,
                        Expr::from_int(IntNum::from_radix_str(mult, 10).unwrap()),
                    )
                }
                None => Expr::from_int(IntNum::from_radix_str(part, 10).unwrap()),
            };
            expr = Some(match expr {
                None => term,
                Some(sum) => Expr::binary(sum, Op::Add, term),
            });
        }

        let symbols = SymbolTable::new();
        let ctx = ExprCtx::symbols_only(&symbols);
        analyze(&expr.unwrap(), mode_bits, &ctx)
    }

    #[test]
    fn test_16_bit_combinations() {
        let parts = analyze_str(&["bx", "si"], 16).unwrap();
        assert_eq!((parts.modrm_mod, parts.rm), (0, 0));
        assert!(parts.disp.is_none());

        let parts = analyze_str(&["bp", "di", "4"], 16).unwrap();
        assert_eq!((parts.modrm_mod, parts.rm), (1, 3));
        assert_eq!(parts.disp.unwrap().size, 8);

        // [bp] requires an empty disp8.
        let parts = analyze_str(&["bp"], 16).unwrap();
        assert_eq!((parts.modrm_mod, parts.rm), (1, 6));

        // Pure displacement.
        let parts = analyze_str(&["1000"], 16).unwrap();
        assert_eq!((parts.modrm_mod, parts.rm), (0, 6));
        assert_eq!(parts.disp.unwrap().size, 16);

        assert!(analyze_str(&["ax", "si"], 16).is_err());
    }

    #[test]
    fn test_32_bit_sib() {
        // [ebx]: no SIB.
        let parts = analyze_str(&["ebx"], 32).unwrap();
        assert_eq!((parts.modrm_mod, parts.rm), (0, 3));
        assert!(parts.sib.is_none());

        // [esp] forces SIB.
        let parts = analyze_str(&["esp"], 32).unwrap();
        assert_eq!(parts.rm, 4);
        assert_eq!(parts.sib, Some(0x24));

        // [ebx + esi*4 + 8].
        let parts = analyze_str(&["ebx", "esi*4", "8"], 32).unwrap();
        assert_eq!((parts.modrm_mod, parts.rm), (1, 4));
        assert_eq!(parts.sib, Some((2 << 6) | (6 << 3) | 3));
        assert_eq!(parts.disp.unwrap().size, 8);

        // [ebp] has no disp-less form.
        let parts = analyze_str(&["ebp"], 32).unwrap();
        assert_eq!((parts.modrm_mod, parts.rm), (1, 5));

        // [eax*2] becomes eax + eax*1.
        let parts = analyze_str(&["eax*2"], 32).unwrap();
        assert_eq!(parts.rm, 4);
        assert_eq!(parts.sib, Some(0));
    }

    #[test]
    fn test_64_bit() {
        let parts = analyze_str(&["r12"], 64).unwrap();
        assert!(parts.rex_b);
        // r12 shares esp's number: SIB required.
        assert_eq!(parts.rm, 4);

        let parts = analyze_str(&["rbx", "r9*8"], 64).unwrap();
        assert!(parts.rex_x);
        assert!(!parts.rex_b);
        assert_eq!(parts.sib, Some((3 << 6) | (1 << 3) | 3));

        assert!(analyze_str(&["bx"], 64).is_err());
    }

    #[test]
    fn test_esp_cannot_be_index() {
        assert!(analyze_str(&["esp*2"], 32).is_err());
        // But [eax+esp] can swap esp into the base slot.
        let parts = analyze_str(&["eax", "esp"], 32).unwrap();
        assert_eq!(parts.sib, Some((0 << 6) | (0 << 3) | 4));
    }
}
