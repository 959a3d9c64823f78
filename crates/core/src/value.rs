//! Emission values.
//!
//! A [`Value`] describes one scalar to be written into the output stream:
//! an absolute expression, plus at most one relative symbol, one `WRT`
//! symbol and one subtracted symbol/location, plus size and modifier flags.
//! Object formats receive values during output and decide for each whether
//! it resolves to plain bytes or needs a relocation.

use crate::{
    Arch, Error, Errwarns, Expr, ExprCtx, ExprTerm, IntNum, Line, Location, Op, Signedness,
    SymbolId, WarnClass,
};

/// The subtracted part of a value, for PC-relative style references.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SubValue {
    /// Subtract a symbol.
    Sym(SymbolId),
    /// Subtract a plain location.
    Loc(Location),
}

/// A scalar to be emitted, of a fixed bit size.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    /// The absolute portion; `None` stands for zero.
    abs: Option<Expr>,
    /// The relative symbol, target of a relocation if it survives to
    /// output.
    rel: Option<SymbolId>,
    /// The `WRT` symbol.
    wrt: Option<SymbolId>,
    /// The subtracted symbol or location.
    sub: Option<SubValue>,
    /// Emit the segment of `rel` rather than its offset.
    seg_of: bool,
    /// Right shift applied before truncating to `size`.
    rshift: u32,
    /// The value is relative to the current position at the end of its
    /// instruction (RIP-relative addressing).
    ip_rel: bool,
    /// The value is a branch target.
    jump_target: bool,
    /// The value is relative to the start of its section.
    section_rel: bool,
    /// Suppress truncation warnings for this value.
    no_warn: bool,
    /// Warn against the signed range rather than either range.
    sign: bool,
    /// Bit width of the destination field.
    size: u32,
    /// Source line for diagnostics.
    line: Line,
}

impl Value {
    /// A zero value of the given bit size.
    pub fn new(size: u32, line: Line) -> Self {
        Self {
            abs: None,
            rel: None,
            wrt: None,
            sub: None,
            seg_of: false,
            rshift: 0,
            ip_rel: false,
            jump_target: false,
            section_rel: false,
            no_warn: false,
            sign: false,
            size,
            line,
        }
    }

    /// Wrap an expression into a value of the given bit size. The
    /// relocatable parts are split out by [`Value::finalize`].
    pub fn from_expr(expr: Expr, size: u32, line: Line) -> Self {
        let mut value = Self::new(size, line);
        value.abs = Some(expr);
        value
    }

    /// Bit width of the destination field.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Source line of the value.
    pub fn line(&self) -> Line {
        self.line
    }

    /// The absolute portion, if any.
    pub fn abs(&self) -> Option<&Expr> {
        self.abs.as_ref()
    }

    /// The relative symbol, if any.
    pub fn rel(&self) -> Option<SymbolId> {
        self.rel
    }

    /// The `WRT` symbol, if any.
    pub fn wrt(&self) -> Option<SymbolId> {
        self.wrt
    }

    /// The subtracted part, if any.
    pub fn sub(&self) -> Option<SubValue> {
        self.sub
    }

    /// True when the segment of `rel` is wanted instead of its offset.
    pub fn is_seg_of(&self) -> bool {
        self.seg_of
    }

    /// The right shift applied before truncation.
    pub fn rshift(&self) -> u32 {
        self.rshift
    }

    /// Set the right shift applied before truncation.
    pub fn set_rshift(&mut self, rshift: u32) {
        self.rshift = rshift;
    }

    /// True for branch-target values.
    pub fn is_jump_target(&self) -> bool {
        self.jump_target
    }

    /// Mark the value as a branch target.
    pub fn set_jump_target(&mut self) {
        self.jump_target = true;
    }

    /// True for RIP-relative values.
    pub fn is_ip_rel(&self) -> bool {
        self.ip_rel
    }

    /// Mark the value as RIP-relative.
    pub fn set_ip_rel(&mut self) {
        self.ip_rel = true;
    }

    /// True for section-relative values.
    pub fn is_section_rel(&self) -> bool {
        self.section_rel
    }

    /// Mark the value as section-relative.
    pub fn set_section_rel(&mut self) {
        self.section_rel = true;
    }

    /// Treat the destination field as signed when range checking.
    pub fn set_signed(&mut self) {
        self.sign = true;
    }

    /// True when the destination field is signed.
    pub fn is_signed(&self) -> bool {
        self.sign
    }

    /// Suppress truncation warnings.
    pub fn set_no_warn(&mut self) {
        self.no_warn = true;
    }

    /// Subtract a location from the value (PC-relative construction).
    pub fn set_sub_loc(&mut self, loc: Location) -> Result<(), Error> {
        if self.sub.is_some() {
            return Err(Error::TooComplex(
                "value already has a subtracted term".to_owned(),
            ));
        }
        self.sub = Some(SubValue::Loc(loc));
        Ok(())
    }

    /// The subtraction partner when it is a plain location.
    pub fn get_sub_location(&self) -> Option<Location> {
        match self.sub {
            Some(SubValue::Loc(loc)) => Some(loc),
            _ => None,
        }
    }

    /// Take the relative symbol out, leaving none. Object formats use this
    /// while resolving a value into an address or a relocation.
    pub fn take_rel(&mut self) -> Option<SymbolId> {
        self.rel.take()
    }

    /// Take the subtracted part out, leaving none.
    pub fn take_sub(&mut self) -> Option<SubValue> {
        self.sub.take()
    }

    /// Take the `WRT` symbol out, leaving none.
    pub fn take_wrt(&mut self) -> Option<SymbolId> {
        self.wrt.take()
    }

    /// Add a constant into the absolute portion.
    pub fn add_abs(&mut self, delta: IntNum) {
        self.abs = Some(match self.abs.take() {
            None => Expr::from_int(delta),
            Some(abs) => Expr::binary(abs, Op::Add, Expr::from_int(delta)),
        });
    }

    /// If the absolute portion is (or reduces to) a plain location plus an
    /// optional constant, take the location out and leave the constant.
    ///
    /// Formats use this to redirect a location to its section.
    pub fn take_abs_location(&mut self) -> Option<Location> {
        let abs = self.abs.as_mut()?;

        match (abs.op, abs.terms.as_slice()) {
            (Op::Ident, [ExprTerm::Loc(loc)]) => {
                let loc = *loc;
                self.abs = None;
                Some(loc)
            }
            (Op::Add, terms) => {
                let position = terms.iter().position(|term| matches!(term, ExprTerm::Loc(_)));
                let count = terms.iter().filter(|term| matches!(term, ExprTerm::Loc(_))).count();
                if count != 1 {
                    return None;
                }
                let position = position.unwrap();
                let ExprTerm::Loc(loc) = abs.terms.remove(position) else { unreachable!() };
                if abs.terms.len() == 1 {
                    abs.op = Op::Ident;
                }
                Some(loc)
            }
            _ => None,
        }
    }

    /// Simplify the absolute portion and split out the relocatable parts.
    ///
    /// After a successful finalize the value holds at most one relative
    /// symbol, one `WRT` symbol and one subtracted term; `seg_of` implies a
    /// relative symbol. A relative/subtracted pair living in one section
    /// collapses into a plain distance once `calc_dist` offsets are valid.
    pub fn finalize(&mut self, ctx: &ExprCtx<'_>, calc_dist: bool) -> Result<(), Error> {
        let Some(mut abs) = self.abs.take() else {
            self.resolve_equ_rel(ctx, calc_dist)?;
            self.collapse_distance(ctx, calc_dist);
            return Ok(());
        };

        abs.simplify(ctx, calc_dist)?;

        // A `WRT` at the root peels off into the wrt symbol.
        if abs.op == Op::Wrt {
            if self.wrt.is_some() {
                return Err(Error::TooComplex("multiple WRT in one value".to_owned()));
            }
            let rhs = abs.terms.pop().ok_or_else(|| {
                Error::Internal("WRT with no operands".to_owned())
            })?;
            match rhs {
                ExprTerm::Sym(symbol) => self.wrt = Some(symbol),
                _ => {
                    return Err(Error::TooComplex(
                        "WRT target is not a symbol".to_owned(),
                    ));
                }
            }
            let lhs = abs.terms.pop().ok_or_else(|| {
                Error::Internal("WRT with one operand".to_owned())
            })?;
            abs = match lhs {
                ExprTerm::Expr(inner) => *inner,
                term => Expr::new(Op::Ident, vec![term]),
            };
            abs.simplify(ctx, calc_dist)?;
        }

        // A right shift of a relocatable term becomes the value's `rshift`
        // (formats that support shifted relocations carry it through).
        if abs.op == Op::Shr && abs.terms.len() == 2 {
            let shift = match &abs.terms[1] {
                ExprTerm::Int(shift) => shift.to_u64(),
                _ => None,
            };
            let relocatable = match &abs.terms[0] {
                ExprTerm::Sym(_) | ExprTerm::Loc(_) => true,
                ExprTerm::Expr(inner) => inner.contains_relocatable(),
                _ => false,
            };
            if let (Some(shift), true) = (shift, relocatable) {
                if self.rshift != 0 {
                    return Err(Error::TooComplex(
                        "multiple right shifts in one value".to_owned(),
                    ));
                }
                self.rshift = shift as u32;
                abs.terms.pop();
                let lhs = abs.terms.pop().expect("shift has two terms");
                abs = match lhs {
                    ExprTerm::Expr(inner) => *inner,
                    term => Expr::new(Op::Ident, vec![term]),
                };
                abs.simplify(ctx, calc_dist)?;
            }
        }

        // A `SEG` at the root asks for the segment of its symbol.
        if abs.op == Op::Seg {
            match abs.terms.as_slice() {
                [ExprTerm::Sym(symbol)] => {
                    if self.rel.is_some() {
                        return Err(Error::TooComplex(
                            "multiple relative portions in one value".to_owned(),
                        ));
                    }
                    self.rel = Some(*symbol);
                    self.seg_of = true;
                    self.collapse_distance(ctx, calc_dist);
                    return Ok(());
                }
                _ => {
                    return Err(Error::TooComplex(
                        "SEG of a non-symbol".to_owned(),
                    ));
                }
            }
        }

        // Walk the additive structure, splitting terms by sign.
        let mut walk = AdditiveWalk::default();
        walk.expr(abs, true)?;

        for (symbol, positive) in walk.symbols {
            if positive {
                if self.rel.is_some() {
                    return Err(Error::TooComplex(
                        "multiple relative portions in one value".to_owned(),
                    ));
                }
                self.rel = Some(symbol);
            } else {
                if self.sub.is_some() {
                    return Err(Error::TooComplex(
                        "multiple subtracted portions in one value".to_owned(),
                    ));
                }
                self.sub = Some(SubValue::Sym(symbol));
            }
        }

        let mut residual: Vec<ExprTerm> = Vec::new();

        for (loc, positive) in walk.locations {
            if positive {
                // A positive location stays in the absolute portion; a
                // format that needs a symbol redirects it to its section.
                residual.push(ExprTerm::Loc(loc));
            } else {
                if self.sub.is_some() {
                    return Err(Error::TooComplex(
                        "multiple subtracted portions in one value".to_owned(),
                    ));
                }
                self.sub = Some(SubValue::Loc(loc));
            }
        }

        residual.extend(walk.residual);
        if !walk.constant.is_zero() || residual.is_empty() {
            residual.push(ExprTerm::Int(walk.constant));
        }

        let mut abs = if residual.len() == 1 {
            Expr::new(Op::Ident, residual)
        } else {
            Expr::new(Op::Add, residual)
        };
        abs.simplify(ctx, calc_dist)?;

        // A lone zero is dropped entirely.
        self.abs = match abs.get_intnum() {
            Some(value) if value.is_zero() => None,
            _ => Some(abs),
        };

        self.resolve_equ_rel(ctx, calc_dist)?;
        self.collapse_distance(ctx, calc_dist);

        Ok(())
    }

    /// A relative symbol that turns out to be EQU-bound (it may have been
    /// extracted before the EQU was defined) folds back: constants join the
    /// absolute portion, a pure label reference re-targets the relative
    /// symbol.
    fn resolve_equ_rel(&mut self, ctx: &ExprCtx<'_>, calc_dist: bool) -> Result<(), Error> {
        // Alias chains are short; the bound breaks `a equ b` / `b equ a`
        // reference cycles.
        for _ in 0..64 {
            let Some(rel) = self.rel else { return Ok(()) };
            if self.seg_of {
                return Ok(());
            }
            let Some(equ) = ctx.symbols.get(rel).equ() else { return Ok(()) };

            let mut equ = equ.clone();
            equ.simplify(ctx, calc_dist)?;

            if let Some(value) = equ.get_intnum().copied() {
                self.rel = None;
                self.add_abs(value);
                if let Some(abs) = &mut self.abs {
                    abs.simplify(ctx, calc_dist)?;
                }
                return Ok(());
            }

            match equ.get_symbol() {
                // An EQU alias for another symbol; keep unwrapping.
                Some(alias) if alias != rel => self.rel = Some(alias),
                _ => return Ok(()),
            }
        }

        Ok(())
    }

    /// Fold `rel - sub` into the absolute portion when both ends live in
    /// the same section and offsets are valid.
    fn collapse_distance(&mut self, ctx: &ExprCtx<'_>, calc_dist: bool) {
        let Some(rel) = self.rel else { return };
        if self.seg_of || self.wrt.is_some() {
            return;
        }

        let Some(rel_loc) = ctx.symbols.get(rel).label() else { return };

        let sub_loc = match self.sub {
            Some(SubValue::Loc(loc)) => loc,
            Some(SubValue::Sym(symbol)) => match ctx.symbols.get(symbol).label() {
                Some(loc) => loc,
                None => return,
            },
            None => return,
        };

        if rel_loc.section != sub_loc.section {
            return;
        }

        let distance = if rel_loc.bc == sub_loc.bc {
            rel_loc.off as i128 - sub_loc.off as i128
        } else if calc_dist {
            let (Some(rel_off), Some(sub_off)) =
                (ctx.loc_offset(rel_loc), ctx.loc_offset(sub_loc))
            else {
                return;
            };
            rel_off as i128 - sub_off as i128
        } else {
            return;
        };

        self.rel = None;
        self.sub = None;
        self.add_abs(IntNum::new(distance));
        if let Some(abs) = &mut self.abs {
            // At most two constants to fold; this cannot fail.
            let _ = abs.simplify(ctx, calc_dist);
        }
    }

    /// True when no relocatable part is left.
    pub fn is_relocatable(&self) -> bool {
        self.rel.is_some() || self.sub.is_some() || self.wrt.is_some() || self.seg_of
    }

    /// Finalize and reduce to a plain constant, when possible.
    pub fn get_intnum(
        &mut self,
        ctx: &ExprCtx<'_>,
        calc_dist: bool,
    ) -> Result<Option<IntNum>, Error> {
        self.finalize(ctx, calc_dist)?;

        if self.is_relocatable() {
            return Ok(None);
        }

        match &self.abs {
            None => Ok(Some(IntNum::zero())),
            Some(abs) => Ok(abs.get_intnum().copied()),
        }
    }

    /// Emit the value when it is fully constant.
    ///
    /// Returns true and appends `size / 8` bytes to `buffer` when no
    /// symbolic part is left; returns false otherwise, leaving relocation
    /// emission to the object format.
    pub fn output_basic(
        &mut self,
        buffer: &mut Vec<u8>,
        ctx: &ExprCtx<'_>,
        arch: &dyn Arch,
        errwarns: &mut Errwarns,
    ) -> Result<bool, Error> {
        self.finalize(ctx, true)?;

        if self.is_relocatable() {
            return Ok(false);
        }

        let abs = match &self.abs {
            None => {
                let fits = arch.intnum_tobytes(
                    &IntNum::zero(),
                    buffer,
                    self.size,
                    self.rshift,
                    Signedness::Any,
                );
                debug_assert!(fits);
                return Ok(true);
            }
            Some(abs) => abs,
        };

        if let Some(float) = abs.get_float() {
            let fits = float.append_to(buffer, self.size, false)?;
            if !fits && !self.no_warn {
                errwarns.warn_set(
                    WarnClass::General,
                    format!("floating point constant does not fit in {} bits", self.size),
                );
            }
            return Ok(true);
        }

        let Some(value) = abs.get_intnum() else {
            return Ok(false);
        };

        let signedness = if self.sign { Signedness::Signed } else { Signedness::Any };
        let fits = arch.intnum_tobytes(value, buffer, self.size, self.rshift, signedness);
        if !fits && !self.no_warn {
            errwarns.warn_set(
                WarnClass::General,
                format!("value does not fit in {} bit field", self.size),
            );
        }

        Ok(true)
    }

    /// Rebuild an expression equivalent to the whole value.
    pub fn to_expr(&self) -> Expr {
        let mut expr = match (&self.abs, self.rel) {
            (Some(abs), None) => abs.clone(),
            (None, Some(rel)) => Expr::from_sym(rel),
            (Some(abs), Some(rel)) => Expr::binary(abs.clone(), Op::Add, Expr::from_sym(rel)),
            (None, None) => Expr::from_int(IntNum::zero()),
        };

        if self.seg_of {
            expr = Expr::unary(Op::Seg, expr);
        }

        if let Some(sub) = self.sub {
            let sub = match sub {
                SubValue::Sym(symbol) => Expr::from_sym(symbol),
                SubValue::Loc(loc) => Expr::from_loc(loc),
            };
            expr = Expr::binary(expr, Op::Sub, sub);
        }

        if let Some(wrt) = self.wrt {
            expr = Expr::binary(expr, Op::Wrt, Expr::from_sym(wrt));
        }

        expr
    }
}

/// Splits an additive expression into signed relocatable terms plus a
/// residual.
#[derive(Default)]
struct AdditiveWalk {
    symbols: Vec<(SymbolId, bool)>,
    locations: Vec<(Location, bool)>,
    residual: Vec<ExprTerm>,
    constant: IntNum,
}

impl AdditiveWalk {
    fn expr(&mut self, expr: Expr, positive: bool) -> Result<(), Error> {
        match expr.op {
            Op::Ident | Op::Add => {
                for term in expr.terms {
                    self.term(term, positive)?;
                }
            }
            Op::Sub => {
                let mut terms = expr.terms.into_iter();
                let lhs = terms.next();
                if let Some(lhs) = lhs {
                    self.term(lhs, positive)?;
                }
                for rhs in terms {
                    self.term(rhs, !positive)?;
                }
            }
            Op::Neg => {
                for term in expr.terms {
                    self.term(term, !positive)?;
                }
            }
            _ => {
                if expr.contains_relocatable() {
                    return Err(Error::TooComplex(
                        "relocatable term under a non-additive operator".to_owned(),
                    ));
                }
                self.keep(ExprTerm::Expr(Box::new(expr)), positive);
            }
        }

        Ok(())
    }

    fn term(&mut self, term: ExprTerm, positive: bool) -> Result<(), Error> {
        match term {
            ExprTerm::Int(value) => {
                let value = if positive { value } else { value.calc(Op::Neg, None)? };
                self.constant = self.constant.calc(Op::Add, Some(&value))?;
            }
            ExprTerm::Sym(symbol) => self.symbols.push((symbol, positive)),
            ExprTerm::Loc(loc) => self.locations.push((loc, positive)),
            ExprTerm::Float(float) => {
                if !positive {
                    return Err(Error::TooComplex(
                        "cannot negate a floating point constant here".to_owned(),
                    ));
                }
                self.residual.push(ExprTerm::Float(float));
            }
            ExprTerm::Reg(_) => {
                return Err(Error::Type("register used outside an operand".to_owned()));
            }
            ExprTerm::Expr(inner) => self.expr(*inner, positive)?,
        }

        Ok(())
    }

    fn keep(&mut self, term: ExprTerm, positive: bool) {
        if positive {
            self.residual.push(term);
        } else {
            self.residual.push(ExprTerm::Expr(Box::new(Expr::new(
                Op::Neg,
                vec![term],
            ))));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SectionId, SymbolTable};

    fn int(value: i64) -> Expr {
        Expr::from_int(IntNum::from(value))
    }

    #[test]
    fn test_plain_constant() {
        let symbols = SymbolTable::new();
        let ctx = ExprCtx::symbols_only(&symbols);

        let mut value = Value::from_expr(int(42), 16, 1);
        assert_eq!(value.get_intnum(&ctx, false).unwrap(), Some(IntNum::new(42)));
    }

    #[test]
    fn test_extracts_relative_symbol() {
        let mut symbols = SymbolTable::new();
        let sym = symbols.get_or_create("target");
        let ctx = ExprCtx::symbols_only(&symbols);

        let mut value = Value::from_expr(
            Expr::binary(Expr::from_sym(sym), Op::Add, int(4)),
            32,
            1,
        );
        value.finalize(&ctx, false).unwrap();

        assert_eq!(value.rel(), Some(sym));
        assert_eq!(value.abs().and_then(Expr::get_intnum), Some(&IntNum::new(4)));
    }

    #[test]
    fn test_extracts_wrt() {
        let mut symbols = SymbolTable::new();
        let sym = symbols.get_or_create("data");
        let seg = symbols.get_or_create("segment");
        let ctx = ExprCtx::symbols_only(&symbols);

        let mut value = Value::from_expr(
            Expr::binary(Expr::from_sym(sym), Op::Wrt, Expr::from_sym(seg)),
            16,
            1,
        );
        value.finalize(&ctx, false).unwrap();

        assert_eq!(value.rel(), Some(sym));
        assert_eq!(value.wrt(), Some(seg));
    }

    #[test]
    fn test_extracts_seg_of() {
        let mut symbols = SymbolTable::new();
        let sym = symbols.get_or_create("var");
        let ctx = ExprCtx::symbols_only(&symbols);

        let mut value = Value::from_expr(Expr::unary(Op::Seg, Expr::from_sym(sym)), 16, 1);
        value.finalize(&ctx, false).unwrap();

        assert!(value.is_seg_of());
        assert_eq!(value.rel(), Some(sym));
    }

    #[test]
    fn test_right_shift_extraction() {
        let mut symbols = SymbolTable::new();
        let sym = symbols.get_or_create("page");
        let ctx = ExprCtx::symbols_only(&symbols);

        let mut value = Value::from_expr(
            Expr::binary(Expr::from_sym(sym), Op::Shr, int(4)),
            16,
            1,
        );
        value.finalize(&ctx, false).unwrap();

        assert_eq!(value.rel(), Some(sym));
        assert_eq!(value.rshift(), 4);
        assert!(value.abs().is_none());
    }

    #[test]
    fn test_two_positive_symbols_is_too_complex() {
        let mut symbols = SymbolTable::new();
        let a = symbols.get_or_create("a");
        let b = symbols.get_or_create("b");
        let ctx = ExprCtx::symbols_only(&symbols);

        let mut value = Value::from_expr(
            Expr::binary(Expr::from_sym(a), Op::Add, Expr::from_sym(b)),
            16,
            1,
        );
        assert!(matches!(value.finalize(&ctx, false), Err(Error::TooComplex(_))));
    }

    #[test]
    fn test_same_bytecode_distance_collapses() {
        let mut symbols = SymbolTable::new();
        let a = symbols.get_or_create("a");
        let b = symbols.get_or_create("b");
        let section = SectionId(0);
        symbols
            .get_mut(a)
            .define_label(Location { section, bc: 2, off: 0 }, 1)
            .unwrap();
        symbols
            .get_mut(b)
            .define_label(Location { section, bc: 2, off: 2 }, 2)
            .unwrap();
        let ctx = ExprCtx::symbols_only(&symbols);

        // b - a within one bytecode resolves without layout.
        let mut value = Value::from_expr(
            Expr::binary(Expr::from_sym(b), Op::Sub, Expr::from_sym(a)),
            16,
            1,
        );
        assert_eq!(value.get_intnum(&ctx, false).unwrap(), Some(IntNum::new(2)));
    }

    #[test]
    fn test_round_trip_to_expr() {
        let mut symbols = SymbolTable::new();
        let sym = symbols.get_or_create("target");
        let ctx = ExprCtx::symbols_only(&symbols);

        let mut value = Value::from_expr(
            Expr::binary(Expr::from_sym(sym), Op::Add, int(8)),
            32,
            1,
        );
        value.finalize(&ctx, false).unwrap();

        let mut rebuilt = value.to_expr();
        rebuilt.simplify(&ctx, false).unwrap();

        // Same structure modulo canonical ordering: symbol plus constant.
        assert_eq!(rebuilt.op(), Op::Add);
        assert!(rebuilt.terms().contains(&ExprTerm::Sym(sym)));
        assert!(rebuilt.terms().contains(&ExprTerm::Int(IntNum::new(8))));
    }
}
