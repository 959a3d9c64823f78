//! The object: the root of everything a single assembly run builds.

use std::collections::HashMap;

use crate::{
    AssocMap, Bytecode, Errwarns, ExprCtx, Line, Location, Section, SectionId, SymbolId,
    SymbolTable,
};

/// An object under construction: sections (in declaration order), the
/// symbol table, the parser's current-section pointer, and the special
/// symbols registered by the active object format.
#[derive(Debug)]
pub struct Object {
    src_filename: String,
    obj_filename: String,
    sections: Vec<Section>,
    section_names: HashMap<String, SectionId>,
    symbols: SymbolTable,
    cur_section: Option<SectionId>,
    special_symbols: HashMap<String, SymbolId>,
    assoc: AssocMap,
}

impl Object {
    /// Creates an empty object.
    pub fn new(src_filename: impl Into<String>, obj_filename: impl Into<String>) -> Self {
        Self {
            src_filename: src_filename.into(),
            obj_filename: obj_filename.into(),
            sections: Vec::new(),
            section_names: HashMap::new(),
            symbols: SymbolTable::new(),
            cur_section: None,
            special_symbols: HashMap::new(),
            assoc: AssocMap::new(),
        }
    }

    /// The source file name.
    pub fn src_filename(&self) -> &str {
        &self.src_filename
    }

    /// The output file name.
    pub fn obj_filename(&self) -> &str {
        &self.obj_filename
    }

    /// All sections, in declaration order.
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// All sections, mutably.
    pub fn sections_mut(&mut self) -> &mut [Section] {
        &mut self.sections
    }

    /// Borrow one section.
    pub fn section(&self, id: SectionId) -> &Section {
        &self.sections[id.0 as usize]
    }

    /// Mutably borrow one section.
    pub fn section_mut(&mut self, id: SectionId) -> &mut Section {
        &mut self.sections[id.0 as usize]
    }

    /// The section named `name`, if it exists.
    pub fn find_section(&self, name: &str) -> Option<SectionId> {
        self.section_names.get(name).copied()
    }

    /// The section named `name`, created if absent. The first section ever
    /// appended becomes the object's default section and the parser's
    /// current section.
    pub fn append_section(&mut self, name: &str) -> SectionId {
        if let Some(id) = self.section_names.get(name) {
            return *id;
        }

        let id = SectionId(self.sections.len() as u32);
        let mut section = Section::new(name);
        if self.sections.is_empty() {
            section.set_default(true);
            self.cur_section = Some(id);
        }
        self.sections.push(section);
        self.section_names.insert(name.to_owned(), id);

        id
    }

    /// The section the parser is appending to.
    pub fn cur_section(&self) -> Option<SectionId> {
        self.cur_section
    }

    /// Pivot the parser's append target.
    pub fn set_cur_section(&mut self, id: SectionId) {
        self.cur_section = Some(id);
    }

    /// Append a bytecode to the current section, returning the location of
    /// its first byte.
    ///
    /// # Panics
    ///
    /// Panics when no section exists yet; object formats install a default
    /// section before parsing starts.
    pub fn append_bytecode(&mut self, bytecode: Bytecode) -> Location {
        let section = self.cur_section.expect("no current section");
        let bc = self.sections[section.0 as usize].append_bytecode(bytecode);

        Location { section, bc, off: 0 }
    }

    /// The current assembly position: a zero-length anchor bytecode is
    /// appended and its location returned. Labels and `$` bind here.
    pub fn here(&mut self, line: Line) -> Location {
        self.append_bytecode(Bytecode::empty(line))
    }

    /// The symbol table.
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// The symbol table, mutably.
    pub fn symbols_mut(&mut self) -> &mut SymbolTable {
        &mut self.symbols
    }

    /// The symbol named `name`, created undefined if absent.
    pub fn get_symbol(&mut self, name: &str) -> SymbolId {
        self.symbols.get_or_create(name)
    }

    /// Register a special symbol understood by the active object format.
    pub fn add_special_symbol(&mut self, name: &str) -> SymbolId {
        let id = self.symbols.get_or_create(name);
        self.symbols.get_mut(id).make_special();
        self.special_symbols.insert(name.to_owned(), id);
        id
    }

    /// Look up a special symbol by name.
    pub fn find_special_symbol(&self, name: &str) -> Option<SymbolId> {
        self.special_symbols.get(name).copied()
    }

    /// The attached per-format data.
    pub fn assoc(&self) -> &AssocMap {
        &self.assoc
    }

    /// The attached per-format data, mutably.
    pub fn assoc_mut(&mut self) -> &mut AssocMap {
        &mut self.assoc
    }

    /// The section-absolute offset of a location. Only valid during and
    /// after optimization.
    pub fn loc_offset(&self, loc: Location) -> Option<u64> {
        let section = self.sections.get(loc.section.0 as usize)?;
        let bytecode = section.bytecodes().get(loc.bc as usize)?;

        Some(bytecode.offset() + loc.off)
    }

    /// Finalize every bytecode, collecting diagnostics per source line.
    pub fn finalize(&mut self, errwarns: &mut Errwarns) {
        for index in 0..self.sections.len() {
            let mut bytecodes = std::mem::take(self.sections[index].bytecodes_vec_mut());

            {
                let ctx = ExprCtx::symbols_only(&self.symbols);
                for bytecode in &mut bytecodes {
                    match bytecode.finalize(&ctx) {
                        Ok(()) => errwarns.propagate(bytecode.line()),
                        Err(error) => errwarns.propagate_error(bytecode.line(), error),
                    }
                }
            }

            *self.sections[index].bytecodes_vec_mut() = bytecodes;
        }
    }

    /// Final check of the symbol table once the input is consumed; see
    /// [`SymbolTable::finalize`].
    pub fn symbols_finalize(&mut self, errwarns: &mut Errwarns, undef_extern: bool) {
        self.symbols.finalize(errwarns, undef_extern);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_section_is_default() {
        let mut object = Object::new("in.asm", "out.bin");
        let text = object.append_section(".text");
        let data = object.append_section(".data");

        assert!(object.section(text).is_default());
        assert!(!object.section(data).is_default());
        assert_eq!(object.cur_section(), Some(text));
        assert_eq!(object.append_section(".text"), text);
    }

    #[test]
    fn test_here_is_a_valid_location() {
        let mut object = Object::new("in.asm", "out.bin");
        object.append_section(".text");

        let loc = object.here(1);
        assert_eq!(loc.bc, 1);
        assert_eq!(object.loc_offset(loc), Some(0));
    }
}
