//! The object-format interface consumed by the driver and the parser.

use std::io::{Seek, Write};

use crate::{Arch, Directives, Error, Errwarns, Line, Object, SectionId};

/// A seekable output stream; object formats may write sections at sparse
/// file positions.
pub trait WriteSeek: Write + Seek {}

impl<T: Write + Seek> WriteSeek for T {}

/// An object format: default/append section policy, format directives, and
/// the on-disk writer.
pub trait ObjectFormat {
    /// The module keyword (`bin`, `coff`, …).
    fn keyword(&self) -> &'static str;

    /// One-line module description.
    fn description(&self) -> &'static str;

    /// Default file extension of the output, without the dot.
    fn extension(&self) -> &'static str;

    /// The initial x86 BITS setting for this format.
    fn default_x86_mode_bits(&self) -> u32;

    /// Machine keyword this format requires, if it is machine-specific
    /// (`win64` forces `amd64`).
    fn forced_machine(&self) -> Option<&'static str> {
        None
    }

    /// Install format state on a fresh object (special symbols, object
    /// associated data).
    fn init_object(&self, _object: &mut Object) {}

    /// Create the format's default section and make it current.
    fn add_default_section(&self, object: &mut Object) -> SectionId;

    /// Create (or return) a named section with the format's default
    /// attributes for that name, and make it current.
    fn append_section(
        &self,
        object: &mut Object,
        name: &str,
        line: Line,
    ) -> Result<SectionId, Error>;

    /// Register the format's directives (`section` attribute handling,
    /// `org`…).
    fn add_directives(&self, _directives: &mut Directives) {}

    /// Write the laid-out object to `writer`.
    ///
    /// With `all_syms`, local symbols are kept in the output symbol table
    /// too. Diagnostics go to `errwarns`; a format that reports any error
    /// returns `Err` so the driver can delete the partial file.
    fn output(
        &self,
        object: &mut Object,
        arch: &dyn Arch,
        writer: &mut dyn WriteSeek,
        all_syms: bool,
        errwarns: &mut Errwarns,
    ) -> Result<(), Error>;
}
