//! Module interfaces and the explicit module registry.
//!
//! There is no static registration magic: the driver calls the registration
//! function of every built-in module crate at startup, filling a
//! [`ModuleRegistry`] it owns, and selects modules by keyword from there.

use std::collections::HashMap;
use std::io::BufRead;

use crate::{Arch, Directives, Error, Errwarns, Linemap, Object, ObjectFormat};

/// A line-oriented token source between the raw input and the parser.
pub trait Preprocessor {
    /// The module keyword (`raw`).
    fn keyword(&self) -> &'static str;

    /// One-line module description.
    fn description(&self) -> &'static str;

    /// Start preprocessing `input`.
    fn init(&mut self, input: Box<dyn BufRead>, src_filename: &str) -> Result<(), Error>;

    /// The next logical source line, or `None` at end of input.
    fn get_line(&mut self) -> Result<Option<String>, Error>;

    /// Add a directory to the include search path.
    fn add_include_path(&mut self, path: &str);

    /// Queue a file to be processed before the main input.
    fn pre_include_file(&mut self, path: &str);

    /// Pre-define a macro (`-D`).
    fn predefine_macro(&mut self, name: &str, value: Option<&str>);

    /// Undefine a macro (`-U`).
    fn undefine_macro(&mut self, name: &str);

    /// Define a builtin macro ahead of any pre-included files.
    fn define_builtin(&mut self, name: &str, value: Option<&str>);
}

/// A parser: consumes the preprocessed input and builds the object.
pub trait Parser {
    /// The module keyword (`nasm`, `gas`).
    fn keyword(&self) -> &'static str;

    /// One-line module description.
    fn description(&self) -> &'static str;

    /// Preprocessor keywords this parser works with, most preferred first.
    fn preproc_keywords(&self) -> &[&'static str];

    /// Whether undefined symbols become extern (GAS) or errors (NASM) at
    /// finalize time.
    fn undef_extern(&self) -> bool {
        false
    }

    /// Consume the whole input, appending bytecodes and declaring symbols.
    #[allow(clippy::too_many_arguments)]
    fn parse(
        &mut self,
        object: &mut Object,
        arch: &mut dyn Arch,
        preproc: &mut dyn Preprocessor,
        directives: &Directives,
        linemap: &mut Linemap,
        errwarns: &mut Errwarns,
    ) -> Result<(), Error>;
}

/// Factory functions for each module class.
pub type ArchFactory = fn() -> Box<dyn Arch>;
/// Factory for parsers.
pub type ParserFactory = fn() -> Box<dyn Parser>;
/// Factory for preprocessors.
pub type PreprocFactory = fn() -> Box<dyn Preprocessor>;
/// Factory for object formats.
pub type ObjectFormatFactory = fn() -> Box<dyn ObjectFormat>;

/// The driver-owned registry of built-in modules.
#[derive(Default)]
pub struct ModuleRegistry {
    arches: HashMap<&'static str, (ArchFactory, &'static str)>,
    parsers: HashMap<&'static str, (ParserFactory, &'static str)>,
    preprocs: HashMap<&'static str, (PreprocFactory, &'static str)>,
    objfmts: HashMap<&'static str, (ObjectFormatFactory, &'static str)>,
}

impl ModuleRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an architecture module.
    pub fn register_arch(&mut self, keyword: &'static str, description: &'static str, factory: ArchFactory) {
        self.arches.insert(keyword, (factory, description));
    }

    /// Register a parser module.
    pub fn register_parser(&mut self, keyword: &'static str, description: &'static str, factory: ParserFactory) {
        self.parsers.insert(keyword, (factory, description));
    }

    /// Register a preprocessor module.
    pub fn register_preproc(&mut self, keyword: &'static str, description: &'static str, factory: PreprocFactory) {
        self.preprocs.insert(keyword, (factory, description));
    }

    /// Register an object-format module.
    pub fn register_objfmt(&mut self, keyword: &'static str, description: &'static str, factory: ObjectFormatFactory) {
        self.objfmts.insert(keyword, (factory, description));
    }

    /// Instantiate an architecture by keyword.
    pub fn load_arch(&self, keyword: &str) -> Option<Box<dyn Arch>> {
        self.arches.get(keyword).map(|(factory, _)| factory())
    }

    /// Instantiate a parser by keyword.
    pub fn load_parser(&self, keyword: &str) -> Option<Box<dyn Parser>> {
        self.parsers.get(keyword).map(|(factory, _)| factory())
    }

    /// Instantiate a preprocessor by keyword.
    pub fn load_preproc(&self, keyword: &str) -> Option<Box<dyn Preprocessor>> {
        self.preprocs.get(keyword).map(|(factory, _)| factory())
    }

    /// Instantiate an object format by keyword.
    pub fn load_objfmt(&self, keyword: &str) -> Option<Box<dyn ObjectFormat>> {
        self.objfmts.get(keyword).map(|(factory, _)| factory())
    }

    /// List a module class as sorted `(keyword, description)` pairs, for
    /// the `help` listings.
    pub fn list(&self, class: ModuleClass) -> Vec<(&'static str, &'static str)> {
        let mut list: Vec<_> = match class {
            ModuleClass::Arch => {
                self.arches.iter().map(|(keyword, (_, descr))| (*keyword, *descr)).collect()
            }
            ModuleClass::Parser => {
                self.parsers.iter().map(|(keyword, (_, descr))| (*keyword, *descr)).collect()
            }
            ModuleClass::Preproc => {
                self.preprocs.iter().map(|(keyword, (_, descr))| (*keyword, *descr)).collect()
            }
            ModuleClass::ObjectFormat => {
                self.objfmts.iter().map(|(keyword, (_, descr))| (*keyword, *descr)).collect()
            }
        };
        list.sort_by_key(|(keyword, _)| *keyword);
        list
    }
}

/// The module classes the registry knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleClass {
    /// Architectures.
    Arch,
    /// Parsers.
    Parser,
    /// Preprocessors.
    Preproc,
    /// Object formats.
    ObjectFormat,
}
