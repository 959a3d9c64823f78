//! `yasm-objfmt` contains the built-in object formats: flat `bin`, COFF in
//! its `coff`/`win32`/`win64` flavors, and the extended dynamic object
//! format `xdf`.
//!
//! Each format implements [`yasm_core::ObjectFormat`]: it owns the default
//! section policy and the `section` directive attributes of its world, and
//! its writer walks the laid-out object, resolving every value into either
//! plain bytes or a format-specific relocation.

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![deny(rustdoc::invalid_codeblock_attributes)]
#![deny(rustdoc::invalid_rust_codeblocks)]

mod bin;
mod coff;
mod xdf;

pub use bin::BinObject;
pub use coff::{CoffFlavor, CoffObject};
pub use xdf::XdfObject;

use yasm_core::{Error, Expr, ExprCtx, ModuleRegistry, Object};

/// Register this crate's modules with the driver's registry.
pub fn register(registry: &mut ModuleRegistry) {
    registry.register_objfmt("bin", "Flat format binary", || Box::new(BinObject::new()));
    registry.register_objfmt("coff", "COFF (DJGPP) object format", || {
        Box::new(CoffObject::new(CoffFlavor::Coff))
    });
    registry.register_objfmt("win32", "Win32 object format", || {
        Box::new(CoffObject::new(CoffFlavor::Win32))
    });
    registry.register_objfmt("win64", "Win64 object format", || {
        Box::new(CoffObject::new(CoffFlavor::Win64))
    });
    registry.register_objfmt("xdf", "Extended Dynamic Object format", || {
        Box::new(XdfObject::new())
    });
}

// Little-endian scratch writers shared by the on-disk writers.

pub(crate) fn w16(buffer: &mut Vec<u8>, value: u16) {
    buffer.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn w32(buffer: &mut Vec<u8>, value: u32) {
    buffer.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn w64(buffer: &mut Vec<u8>, value: u64) {
    buffer.extend_from_slice(&value.to_le_bytes());
}

/// Walk a section's bytecodes into a sink, binding diagnostics to source
/// lines so one bad value does not hide the rest. `errwarns` projects the
/// accumulator back out of the sink between bytecodes.
pub(crate) fn render_section<O>(
    object: &Object,
    arch: &dyn yasm_core::Arch,
    id: yasm_core::SectionId,
    out: &mut O,
    errwarns: impl Fn(&mut O) -> &mut yasm_core::Errwarns,
) where
    O: yasm_core::BytecodeOutput,
{
    let octx = yasm_core::OutputContext { object, arch, section: id };

    for (index, bytecode) in object.section(id).bytecodes().iter().enumerate() {
        let loc = yasm_core::Location { section: id, bc: index as u32, off: 0 };
        match bytecode.output(loc, &octx, out) {
            Ok(()) => errwarns(out).propagate(bytecode.line()),
            Err(error) => errwarns(out).propagate_error(bytecode.line(), error),
        }
    }
}

/// Resolve a directive-time expression to an unsigned constant.
pub(crate) fn resolve_u64(expr: &Expr, object: &Object, what: &str) -> Result<u64, Error> {
    let mut expr = expr.clone();
    let ctx = ExprCtx::symbols_only(object.symbols());
    expr.simplify(&ctx, false)?;

    expr.get_intnum()
        .and_then(yasm_core::IntNum::to_u64)
        .ok_or_else(|| Error::NotConstant(format!("{what} is not a constant")))
}
