//! The bytecode output interface.
//!
//! During output, each bytecode is handed a [`BytecodeOutput`] sink. The
//! sink is provided by the object format: its `output_value` decides whether
//! a value becomes plain bytes or a relocation, and its `output_bytes` /
//! `output_gap` move the bytes (or just the position, for BSS) towards the
//! output stream.

use crate::{Arch, Errwarns, Error, ExprCtx, Location, Object, Section, SectionId, Value, WarnClass};

/// Everything a bytecode needs to look at while emitting itself.
#[derive(Clone, Copy)]
pub struct OutputContext<'a> {
    /// The finished, laid-out object.
    pub object: &'a Object,
    /// The active architecture.
    pub arch: &'a dyn Arch,
    /// The section being emitted.
    pub section: SectionId,
}

impl<'a> OutputContext<'a> {
    /// The section being emitted.
    pub fn section(&self) -> &'a Section {
        self.object.section(self.section)
    }

    /// An expression context with valid offsets everywhere.
    pub fn expr_ctx(&self) -> ExprCtx<'a> {
        ExprCtx::full(self.object.symbols(), self.object.sections())
    }
}

/// The sink a bytecode emits itself into.
pub trait BytecodeOutput {
    /// Resolve `value` and append its `size / 8` bytes to `buffer`,
    /// recording a relocation with the owning section when the value does
    /// not reduce to a constant. `loc` identifies the value's position for
    /// diagnostics.
    fn output_value(
        &mut self,
        value: &mut Value,
        buffer: &mut Vec<u8>,
        loc: Location,
    ) -> Result<(), Error>;

    /// Write literal bytes to the stream.
    fn output_bytes(&mut self, bytes: &[u8]) -> Result<(), Error>;

    /// Advance over `len` bytes of uninitialized space.
    fn output_gap(&mut self, len: u64) -> Result<(), Error>;
}

/// Sink for BSS-style sections: tracks the position, emits nothing.
pub struct NullOutput<'a> {
    /// Warning channel for data dropped on the floor.
    pub errwarns: &'a mut Errwarns,
    /// Bytes "emitted" so far.
    pub offset: u64,
}

impl<'a> NullOutput<'a> {
    /// Creates a sink at position zero.
    pub fn new(errwarns: &'a mut Errwarns) -> Self {
        Self { errwarns, offset: 0 }
    }
}

impl BytecodeOutput for NullOutput<'_> {
    fn output_value(
        &mut self,
        value: &mut Value,
        buffer: &mut Vec<u8>,
        _loc: Location,
    ) -> Result<(), Error> {
        self.errwarns.warn_set(
            WarnClass::UninitContents,
            "initialized space declared in nobits section: ignoring",
        );
        buffer.extend(std::iter::repeat(0).take((value.size() / 8) as usize));
        Ok(())
    }

    fn output_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.offset += bytes.len() as u64;
        Ok(())
    }

    fn output_gap(&mut self, len: u64) -> Result<(), Error> {
        self.offset += len;
        Ok(())
    }
}
