//! Sections: ordered containers of bytecodes.

use crate::{AssocMap, Bytecode, SymbolId};

/// Stable index of a section within its object, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionId(pub u32);

/// A relocation to be emitted by the object format.
///
/// The core keeps the format-independent part (where, against what); the
/// format-specific type code, size and shift travel along as plain fields
/// filled in by the format that created the relocation.
#[derive(Debug, Clone)]
pub struct Reloc {
    /// Offset of the relocated field within the section.
    pub addr: u64,
    /// The target symbol.
    pub sym: SymbolId,
    /// Format-specific relocation type code.
    pub kind: u32,
    /// Size of the relocated field, in bits.
    pub size: u32,
    /// Right shift baked into the relocation, where the format supports it.
    pub shift: u32,
    /// True for PC-relative relocations.
    pub rel: bool,
    /// Base symbol for `WRT`-style relocations, where the format supports
    /// it.
    pub base: Option<SymbolId>,
}

/// An ordered, non-empty list of bytecodes plus per-section bookkeeping.
///
/// The first bytecode is always a zero-length anchor, so that offset 0 of
/// every section is a valid [`crate::Location`].
#[derive(Debug)]
pub struct Section {
    name: String,
    code: bool,
    bss: bool,
    default: bool,
    align: u64,
    lma: u64,
    has_lma: bool,
    vma: u64,
    has_vma: bool,
    filepos: u64,
    bytecodes: Vec<Bytecode>,
    relocs: Vec<Reloc>,
    assoc: AssocMap,
}

impl Section {
    /// Creates a section with the sentinel anchor bytecode in place.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: false,
            bss: false,
            default: false,
            align: 1,
            lma: 0,
            has_lma: false,
            vma: 0,
            has_vma: false,
            filepos: 0,
            bytecodes: vec![Bytecode::empty(0)],
            relocs: Vec::new(),
            assoc: AssocMap::new(),
        }
    }

    /// The section's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True for sections holding code.
    pub fn is_code(&self) -> bool {
        self.code
    }

    /// Mark the section as holding code.
    pub fn set_code(&mut self, code: bool) {
        self.code = code;
    }

    /// True for BSS-style sections: length is tracked, bytes are not
    /// emitted.
    pub fn is_bss(&self) -> bool {
        self.bss
    }

    /// Mark the section as BSS.
    pub fn set_bss(&mut self, bss: bool) {
        self.bss = bss;
    }

    /// True for the object's default section.
    pub fn is_default(&self) -> bool {
        self.default
    }

    pub(crate) fn set_default(&mut self, default: bool) {
        self.default = default;
    }

    /// The section's alignment in bytes.
    pub fn align(&self) -> u64 {
        self.align
    }

    /// Set the section's alignment in bytes.
    pub fn set_align(&mut self, align: u64) {
        self.align = align;
    }

    /// The load memory address.
    pub fn lma(&self) -> u64 {
        self.lma
    }

    /// True when the LMA was set explicitly rather than assigned by
    /// placement.
    pub fn has_lma(&self) -> bool {
        self.has_lma
    }

    /// Set the LMA explicitly.
    pub fn set_lma(&mut self, lma: u64) {
        self.lma = lma;
        self.has_lma = true;
    }

    /// Assign the LMA without marking it user-chosen; placement algorithms
    /// (the optimizer's defaulting pass, the bin format) use this.
    pub fn place_lma(&mut self, lma: u64) {
        self.lma = lma;
    }

    /// The virtual memory address.
    pub fn vma(&self) -> u64 {
        self.vma
    }

    /// True when the VMA was set explicitly.
    pub fn has_vma(&self) -> bool {
        self.has_vma
    }

    /// Set the VMA explicitly.
    pub fn set_vma(&mut self, vma: u64) {
        self.vma = vma;
        self.has_vma = true;
    }

    /// Assign the VMA without marking it user-chosen.
    pub fn place_vma(&mut self, vma: u64) {
        self.vma = vma;
    }

    /// Position of the section's data in the output file; assigned by the
    /// object format.
    pub fn filepos(&self) -> u64 {
        self.filepos
    }

    /// Set the file position of the section's data.
    pub fn set_filepos(&mut self, filepos: u64) {
        self.filepos = filepos;
    }

    /// The bytecodes, in append order; index 0 is the anchor.
    pub fn bytecodes(&self) -> &[Bytecode] {
        &self.bytecodes
    }

    /// The bytecodes, mutably.
    pub fn bytecodes_mut(&mut self) -> &mut [Bytecode] {
        &mut self.bytecodes
    }

    pub(crate) fn bytecodes_vec_mut(&mut self) -> &mut Vec<Bytecode> {
        &mut self.bytecodes
    }

    /// Append a bytecode, returning its index.
    pub fn append_bytecode(&mut self, bytecode: Bytecode) -> u32 {
        let index = self.bytecodes.len() as u32;
        self.bytecodes.push(bytecode);
        index
    }

    /// Total size of the section in bytes. Only valid after optimization.
    pub fn size(&self) -> u64 {
        self.bytecodes
            .last()
            .map(|bytecode| bytecode.offset() + bytecode.total_len())
            .unwrap_or(0)
    }

    /// The section's relocations, in emission order.
    pub fn relocs(&self) -> &[Reloc] {
        &self.relocs
    }

    /// Append a relocation.
    pub fn add_reloc(&mut self, reloc: Reloc) {
        self.relocs.push(reloc);
    }

    pub fn set_relocs(&mut self, relocs: Vec<Reloc>) {
        self.relocs = relocs;
    }

    /// The attached per-format data.
    pub fn assoc(&self) -> &AssocMap {
        &self.assoc
    }

    /// The attached per-format data, mutably.
    pub fn assoc_mut(&mut self) -> &mut AssocMap {
        &mut self.assoc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_anchor() {
        let section = Section::new(".text");
        assert_eq!(section.bytecodes().len(), 1);
        assert_eq!(section.bytecodes()[0].total_len(), 0);
        assert_eq!(section.size(), 0);
    }

    #[test]
    fn test_append_returns_indices() {
        let mut section = Section::new(".data");
        assert_eq!(section.append_bytecode(Bytecode::empty(1)), 1);
        assert_eq!(section.append_bytecode(Bytecode::empty(2)), 2);
    }
}
