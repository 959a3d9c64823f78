//! Symbols and the symbol table.

use std::any::Any;
use std::collections::HashMap;

use enumflags2::{bitflags, BitFlags};

use crate::{Error, Errwarns, Expr, Line, Location};

/// Per-format extension state attached to a symbol, section or object.
///
/// Implementations are type-erased behind this trait and recovered by the
/// owning format through [`AssocData::as_any`]; the registry key is the
/// format's own choice (by convention `"objfmt::<keyword>::<Type>"`).
pub trait AssocData: std::fmt::Debug + 'static {
    /// Borrow as [`Any`] for downcasting.
    fn as_any(&self) -> &dyn Any;
    /// Mutably borrow as [`Any`] for downcasting.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A key-indexed store of [`AssocData`].
#[derive(Debug, Default)]
pub struct AssocMap(HashMap<&'static str, Box<dyn AssocData>>);

impl AssocMap {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach (or replace) the data stored under `key`.
    pub fn insert(&mut self, key: &'static str, data: Box<dyn AssocData>) {
        self.0.insert(key, data);
    }

    /// The data stored under `key`, downcast to `T`.
    pub fn get<T: AssocData>(&self, key: &str) -> Option<&T> {
        self.0.get(key).and_then(|data| data.as_any().downcast_ref())
    }

    /// The data stored under `key`, downcast mutably to `T`.
    pub fn get_mut<T: AssocData>(&mut self, key: &str) -> Option<&mut T> {
        self.0.get_mut(key).and_then(|data| data.as_any_mut().downcast_mut())
    }
}

/// Symbol visibility flags. A symbol with no flags set is local.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Visible to other objects when linking.
    Global = 1 << 0,
    /// Common storage, merged by the linker.
    Common = 1 << 1,
    /// Defined in another object.
    Extern = 1 << 2,
    /// Local, but specially named (`..`-prefixed).
    Dlocal = 1 << 3,
}

/// What a symbol is bound to.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    /// Not defined (yet).
    Undefined,
    /// A label at an assembly location.
    Label(Location),
    /// An EQU: the symbol stands for an expression.
    Equ(Expr),
    /// A synthetic absolute symbol.
    Absolute,
}

/// Stable index of a symbol in its [`SymbolTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(pub u32);

/// A named entity of the object: label, EQU, external, common…
#[derive(Debug)]
pub struct Symbol {
    name: String,
    visibility: BitFlags<Visibility>,
    binding: Binding,
    common_size: Option<Expr>,
    assoc: AssocMap,
    decl_line: Line,
    def_line: Line,
    use_line: Line,
    used: bool,
    special: bool,
}

impl Symbol {
    fn new(name: String) -> Self {
        Self {
            name,
            visibility: BitFlags::empty(),
            binding: Binding::Undefined,
            common_size: None,
            assoc: AssocMap::new(),
            decl_line: 0,
            def_line: 0,
            use_line: 0,
            used: false,
            special: false,
        }
    }

    /// The symbol's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The visibility flags; empty means local.
    pub fn visibility(&self) -> BitFlags<Visibility> {
        self.visibility
    }

    /// The binding.
    pub fn binding(&self) -> &Binding {
        &self.binding
    }

    /// True when the symbol is bound to something.
    pub fn is_defined(&self) -> bool {
        !matches!(self.binding, Binding::Undefined)
    }

    /// True when the symbol was registered by an object format as a special
    /// symbol; those bypass the undefined-symbol check.
    pub fn is_special(&self) -> bool {
        self.special
    }

    pub(crate) fn make_special(&mut self) {
        self.special = true;
    }

    /// The label location, when the symbol is a label.
    pub fn label(&self) -> Option<Location> {
        match self.binding {
            Binding::Label(loc) => Some(loc),
            _ => None,
        }
    }

    /// The EQU expression, when the symbol is an EQU.
    pub fn equ(&self) -> Option<&Expr> {
        match &self.binding {
            Binding::Equ(expr) => Some(expr),
            _ => None,
        }
    }

    /// The declared common size, for common symbols.
    pub fn common_size(&self) -> Option<&Expr> {
        self.common_size.as_ref()
    }

    /// The line of first use, for diagnostics.
    pub fn use_line(&self) -> Line {
        self.use_line
    }

    /// The line of the last visibility declaration, for diagnostics.
    pub fn decl_line(&self) -> Line {
        self.decl_line
    }

    /// The line of definition, for diagnostics.
    pub fn def_line(&self) -> Line {
        self.def_line
    }

    /// The attached per-format data.
    pub fn assoc(&self) -> &AssocMap {
        &self.assoc
    }

    /// The attached per-format data, mutably.
    pub fn assoc_mut(&mut self) -> &mut AssocMap {
        &mut self.assoc
    }

    /// Record a use of the symbol; only the first use line is kept.
    pub fn use_at(&mut self, line: Line) {
        if !self.used {
            self.used = true;
            self.use_line = line;
        }
    }

    /// True when the symbol has been used at least once.
    pub fn is_used(&self) -> bool {
        self.used
    }

    /// Merge `visibility` into the symbol's declaration.
    ///
    /// Local merges with anything; declaring a defined symbol `extern` or
    /// `common`, or mixing `extern` with `common`, is an error.
    pub fn declare(&mut self, visibility: BitFlags<Visibility>, line: Line) -> Result<(), Error> {
        let conflicting = (visibility.contains(Visibility::Extern)
            && (self.is_defined() || self.visibility.contains(Visibility::Common)))
            || (visibility.contains(Visibility::Common)
                && (self.is_defined() || self.visibility.contains(Visibility::Extern)));

        if conflicting {
            return Err(Error::Value(format!(
                "duplicate definition of `{}`; visibility already declared",
                self.name
            )));
        }

        self.visibility |= visibility;
        self.decl_line = line;

        Ok(())
    }

    fn check_redefinition(&self) -> Result<(), Error> {
        if self.is_defined() {
            Err(Error::Value(format!(
                "redefinition of `{}` (previously defined at line {})",
                self.name, self.def_line
            )))
        } else {
            Ok(())
        }
    }

    /// Bind the symbol to a label location.
    pub fn define_label(&mut self, loc: Location, line: Line) -> Result<(), Error> {
        self.check_redefinition()?;
        self.binding = Binding::Label(loc);
        self.def_line = line;
        Ok(())
    }

    /// Bind the symbol to an EQU expression.
    pub fn define_equ(&mut self, expr: Expr, line: Line) -> Result<(), Error> {
        self.check_redefinition()?;
        if self.visibility.intersects(Visibility::Extern | Visibility::Common) {
            return Err(Error::Value(format!(
                "`{}` cannot be both an EQU and extern or common",
                self.name
            )));
        }
        self.binding = Binding::Equ(expr);
        self.def_line = line;
        Ok(())
    }

    /// Declare the symbol common with the given size expression.
    pub fn define_common(&mut self, size: Expr, line: Line) -> Result<(), Error> {
        self.declare(Visibility::Common.into(), line)?;
        self.common_size = Some(size);
        Ok(())
    }

    /// Bind the symbol as a synthetic absolute.
    pub fn define_absolute(&mut self, line: Line) -> Result<(), Error> {
        self.check_redefinition()?;
        self.binding = Binding::Absolute;
        self.def_line = line;
        Ok(())
    }
}

/// The symbol arena of an object. Symbols are created on first mention and
/// referenced everywhere else by [`SymbolId`].
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    names: HashMap<String, SymbolId>,
}

impl SymbolTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The symbol named `name`, created undefined if absent.
    pub fn get_or_create(&mut self, name: &str) -> SymbolId {
        if let Some(id) = self.names.get(name) {
            return *id;
        }

        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(Symbol::new(name.to_owned()));
        self.names.insert(name.to_owned(), id);

        id
    }

    /// The symbol named `name`, if it exists.
    pub fn find(&self, name: &str) -> Option<SymbolId> {
        self.names.get(name).copied()
    }

    /// Borrow a symbol.
    pub fn get(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0 as usize]
    }

    /// Mutably borrow a symbol.
    pub fn get_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.0 as usize]
    }

    /// Number of symbols.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// True when the table holds no symbols.
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Iterate over all symbols in creation order.
    pub fn iter(&self) -> impl Iterator<Item = (SymbolId, &Symbol)> {
        self.symbols.iter().enumerate().map(|(index, symbol)| (SymbolId(index as u32), symbol))
    }

    /// Final check of every symbol once the input is consumed.
    ///
    /// Undefined but used symbols either become extern (`undef_extern`, the
    /// GAS default) or are reported as errors (the NASM default).
    pub fn finalize(&mut self, errwarns: &mut Errwarns, undef_extern: bool) {
        for symbol in &mut self.symbols {
            if symbol.is_defined() || symbol.special || !symbol.used {
                continue;
            }

            if undef_extern {
                symbol.visibility |= Visibility::Extern;
            } else if !symbol.visibility.intersects(Visibility::Extern | Visibility::Common) {
                errwarns.propagate_error(
                    symbol.use_line,
                    Error::Value(format!("undefined symbol `{}` (first use)", symbol.name)),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{IntNum, SectionId};

    fn loc() -> Location {
        Location { section: SectionId(0), bc: 1, off: 0 }
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let mut table = SymbolTable::new();
        let a = table.get_or_create("a");
        let b = table.get_or_create("b");
        assert_ne!(a, b);
        assert_eq!(table.get_or_create("a"), a);
        assert_eq!(table.find("b"), Some(b));
        assert_eq!(table.find("c"), None);
    }

    #[test]
    fn test_redefinition_is_an_error() {
        let mut table = SymbolTable::new();
        let id = table.get_or_create("twice");
        table.get_mut(id).define_label(loc(), 1).unwrap();
        assert!(table.get_mut(id).define_label(loc(), 2).is_err());
        assert!(table
            .get_mut(id)
            .define_equ(Expr::from_int(IntNum::zero()), 3)
            .is_err());
    }

    #[test]
    fn test_visibility_merge() {
        let mut table = SymbolTable::new();
        let id = table.get_or_create("sym");

        // Local + global = global.
        table.get_mut(id).declare(Visibility::Global.into(), 1).unwrap();
        assert!(table.get(id).visibility().contains(Visibility::Global));

        // Extern after definition is a conflict.
        table.get_mut(id).define_label(loc(), 2).unwrap();
        assert!(table.get_mut(id).declare(Visibility::Extern.into(), 3).is_err());
    }

    #[test]
    fn test_finalize_reports_undefined() {
        let mut table = SymbolTable::new();
        let id = table.get_or_create("missing");
        table.get_mut(id).use_at(12);

        let mut errwarns = Errwarns::new();
        table.finalize(&mut errwarns, false);
        assert_eq!(errwarns.num_errors(false), 1);
    }

    #[test]
    fn test_finalize_undef_extern() {
        let mut table = SymbolTable::new();
        let id = table.get_or_create("imported");
        table.get_mut(id).use_at(3);

        let mut errwarns = Errwarns::new();
        table.finalize(&mut errwarns, true);
        assert_eq!(errwarns.num_errors(false), 0);
        assert!(table.get(id).visibility().contains(Visibility::Extern));
    }

    #[test]
    fn test_unused_undefined_is_silent() {
        let mut table = SymbolTable::new();
        table.get_or_create("never-used");

        let mut errwarns = Errwarns::new();
        table.finalize(&mut errwarns, false);
        assert_eq!(errwarns.num_errors(false), 0);
    }
}
