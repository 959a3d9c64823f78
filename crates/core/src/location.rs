//! Assembly locations.

use crate::SectionId;

/// An assembly location: the finest granularity a label can address.
///
/// A location names a byte *within* a bytecode of a section, by arena index.
/// It stays valid across optimization passes; only the absolute offset the
/// bytecode lands on moves, so callers must re-query offsets after a pass
/// rather than cache them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    /// The owning section.
    pub section: SectionId,
    /// Index of the bytecode within the section.
    pub bc: u32,
    /// Byte offset within that bytecode.
    pub off: u64,
}

impl Location {
    /// A location `delta` bytes further into the same bytecode.
    pub fn with_offset(self, delta: u64) -> Self {
        Self { off: self.off + delta, ..self }
    }
}
