//! Span-dependent jumps.
//!
//! Everything except relative branches encodes to its final bytes at
//! finalize time. Branches keep a tail: the short form is assumed first, a
//! span watches the branch distance, and the optimizer calls back into
//! [`X86Jump::expand`] to promote short to near when the distance outgrows
//! a byte.

use yasm_core::{
    BytecodeOutput, Contents, Error, Expansion, Expr, ExprCtx, Fixup, Line, Location,
    OutputContext, SpanReq, SpecialContents, Value,
};

/// Which encoding the jump currently uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JmpState {
    /// Byte displacement.
    Short,
    /// Full (16/32-bit) displacement.
    Near,
}

/// A relative branch with a layout-dependent encoding.
#[derive(Debug, Clone)]
pub struct X86Jump {
    /// Opcode bytes of the short form.
    pub short_opcode: Vec<u8>,
    /// Opcode bytes of the near form; empty for short-only branches
    /// (`loop`, `jcxz`).
    pub near_opcode: Vec<u8>,
    /// The branch target expression.
    pub target: Expr,
    /// Mode bits captured at parse time.
    pub mode_bits: u32,
    /// Current encoding; `None` until decided.
    pub state: Option<JmpState>,
    /// A source-level `short`/`near` override pins the state.
    pub forced: Option<JmpState>,
    /// Source line.
    pub line: Line,
    own: Option<Location>,
}

impl X86Jump {
    /// Build a branch tail.
    pub fn new(
        short_opcode: Vec<u8>,
        near_opcode: Vec<u8>,
        target: Expr,
        mode_bits: u32,
        forced: Option<JmpState>,
        line: Line,
    ) -> Self {
        Self {
            short_opcode,
            near_opcode,
            target,
            mode_bits,
            state: None,
            forced,
            line,
            own: None,
        }
    }

    fn short_len(&self) -> u64 {
        self.short_opcode.len() as u64 + 1
    }

    fn near_disp_size(&self) -> u32 {
        if self.mode_bits == 16 {
            16
        } else {
            32
        }
    }

    fn near_len(&self) -> u64 {
        self.near_opcode.len() as u64 + u64::from(self.near_disp_size() / 8)
    }
}

impl SpecialContents for X86Jump {
    fn type_name(&self) -> &'static str {
        "x86::Jump"
    }

    fn clone_box(&self) -> Box<dyn SpecialContents> {
        Box::new(self.clone())
    }

    fn finalize(
        &mut self,
        _fixed: &mut Vec<u8>,
        _fixups: &mut Vec<Fixup>,
        _ctx: &ExprCtx<'_>,
        _line: Line,
    ) -> Result<Option<Contents>, Error> {
        if self.forced == Some(JmpState::Near) && self.near_opcode.is_empty() {
            return Err(Error::Value("this branch has no near form".to_owned()));
        }

        Ok(None)
    }

    fn calc_len(
        &mut self,
        ctx: &ExprCtx<'_>,
        add_span: &mut dyn FnMut(SpanReq),
    ) -> Result<u64, Error> {
        let cur = ctx
            .cur
            .as_ref()
            .ok_or_else(|| Error::Internal("jump length without position".to_owned()))?;
        self.own = Some(Location { section: cur.section, bc: cur.index, off: 0 });

        if self.forced == Some(JmpState::Near) {
            self.state = Some(JmpState::Near);
            return Ok(self.near_len());
        }

        // Assume short; the span tells us when the distance (measured from
        // the branch start) leaves the byte-displacement window. The window
        // accepts both signed and unsigned byte interpretations, the same
        // 8-bit leniency data fields get.
        self.state = Some(JmpState::Short);
        let short_len = self.short_len();

        let distance = Expr::binary(
            self.target.clone(),
            yasm_core::Op::Sub,
            Expr::from_loc(self.own.unwrap()),
        );

        add_span(SpanReq {
            id: 1,
            value: Value::from_expr(distance, 8, self.line),
            neg_thres: -128 + short_len as i64,
            pos_thres: 255 + short_len as i64,
        });

        Ok(short_len)
    }

    fn expand(&mut self, span_id: i32, _old_val: i128, _new_val: i128) -> Result<Expansion, Error> {
        debug_assert_eq!(span_id, 1);

        if self.forced == Some(JmpState::Short) || self.near_opcode.is_empty() {
            return Err(Error::Value("short jump out of range".to_owned()));
        }

        self.state = Some(JmpState::Near);

        Ok(Expansion {
            len: self.near_len(),
            done: true,
            neg_thres: 0,
            pos_thres: 0,
        })
    }

    fn output(
        &self,
        _loc: Location,
        _octx: &OutputContext<'_>,
        out: &mut dyn BytecodeOutput,
    ) -> Result<(), Error> {
        let own = self
            .own
            .ok_or_else(|| Error::Internal("jump output before optimize".to_owned()))?;

        let (opcode, disp_size, total_len) = match self.state {
            Some(JmpState::Short) | None => (&self.short_opcode, 8, self.short_len()),
            Some(JmpState::Near) => (&self.near_opcode, self.near_disp_size(), self.near_len()),
        };

        out.output_bytes(opcode)?;

        // Displacement is relative to the end of the instruction; either
        // signedness is acceptable in the field.
        let mut disp = Value::from_expr(self.target.clone(), disp_size, self.line);
        disp.set_sub_loc(own.with_offset(total_len))?;
        disp.set_jump_target();
        disp.set_ip_rel();

        let mut buffer = Vec::with_capacity((disp_size / 8) as usize);
        out.output_value(&mut disp, &mut buffer, own.with_offset(opcode.len() as u64))?;
        out.output_bytes(&buffer)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lengths() {
        let jump = X86Jump::new(vec![0xeb], vec![0xe9], Expr::from_int(0i64.into()), 16, None, 1);
        assert_eq!(jump.short_len(), 2);
        assert_eq!(jump.near_len(), 3);

        let jump = X86Jump::new(
            vec![0x70],
            vec![0x0f, 0x80],
            Expr::from_int(0i64.into()),
            32,
            None,
            1,
        );
        assert_eq!(jump.short_len(), 2);
        assert_eq!(jump.near_len(), 6);
    }

    #[test]
    fn test_short_only_branch_cannot_expand() {
        let mut jump =
            X86Jump::new(vec![0xe2], vec![], Expr::from_int(0i64.into()), 16, None, 1);
        assert!(jump.expand(1, 0, 500).is_err());
    }
}
