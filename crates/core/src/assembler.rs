//! The assembler: the phase sequencer tying the modules together.

use std::io::BufRead;

use crate::{
    optimize, Arch, Directives, Error, Errwarns, Linemap, Object, ObjectFormat, Parser,
    Preprocessor, WriteSeek,
};

/// Drives one assembly run: parse → finalize → optimize → output, with the
/// diagnostics accumulator flushed by the caller between phases.
pub struct Assembler {
    arch: Box<dyn Arch>,
    parser: Box<dyn Parser>,
    preproc: Box<dyn Preprocessor>,
    objfmt: Box<dyn ObjectFormat>,
    object: Option<Object>,
    linemap: Linemap,
    errwarns: Errwarns,
    warning_error: bool,
}

impl Assembler {
    /// Wire the selected modules together.
    ///
    /// The object format may force a machine (`win64` → `amd64`); the x86
    /// initial mode bits always come from the object format.
    pub fn new(
        mut arch: Box<dyn Arch>,
        parser: Box<dyn Parser>,
        preproc: Box<dyn Preprocessor>,
        objfmt: Box<dyn ObjectFormat>,
    ) -> Result<Self, Error> {
        if let Some(machine) = objfmt.forced_machine() {
            arch.set_machine(machine)?;
        }

        if arch.keyword() == "x86" {
            arch.set_var("mode_bits", u64::from(objfmt.default_x86_mode_bits()))?;
        }

        Ok(Self {
            arch,
            parser,
            preproc,
            objfmt,
            object: None,
            linemap: Linemap::new(),
            errwarns: Errwarns::new(),
            warning_error: false,
        })
    }

    /// Promote warnings to errors (`-Werror`).
    pub fn set_warning_error(&mut self, warning_error: bool) {
        self.warning_error = warning_error;
    }

    /// The active architecture.
    pub fn arch(&self) -> &dyn Arch {
        self.arch.as_ref()
    }

    /// The active architecture, mutably (for `-m`, `--force-strict`…).
    pub fn arch_mut(&mut self) -> &mut dyn Arch {
        self.arch.as_mut()
    }

    /// The active preprocessor (for `-I`, `-D`, `-U`, `-P`).
    pub fn preproc_mut(&mut self) -> &mut dyn Preprocessor {
        self.preproc.as_mut()
    }

    /// The active object format.
    pub fn objfmt(&self) -> &dyn ObjectFormat {
        self.objfmt.as_ref()
    }

    /// The diagnostics accumulator.
    pub fn errwarns_mut(&mut self) -> &mut Errwarns {
        &mut self.errwarns
    }

    /// The line map.
    pub fn linemap(&self) -> &Linemap {
        &self.linemap
    }

    /// The built object, once [`Assembler::assemble`] succeeded.
    pub fn object(&self) -> Option<&Object> {
        self.object.as_ref()
    }

    fn pass_failed(&self) -> bool {
        self.errwarns.num_errors(self.warning_error) > 0
    }

    /// Run the in-memory phases: parse the whole input, finalize symbols
    /// and bytecodes, and lay the object out.
    ///
    /// Returns false as soon as one phase records an error; the diagnostics
    /// stay in the accumulator for the driver to render.
    pub fn assemble(
        &mut self,
        input: Box<dyn BufRead>,
        src_filename: &str,
        obj_filename: &str,
    ) -> bool {
        let mut object = Object::new(src_filename, obj_filename);

        self.objfmt.init_object(&mut object);
        self.objfmt.add_default_section(&mut object);

        let mut directives = Directives::new();
        self.objfmt.add_directives(&mut directives);

        self.linemap.set(src_filename, 1, 1);

        if let Err(error) = self.preproc.init(input, src_filename) {
            self.errwarns.propagate_error(self.linemap.current(), error);
            return false;
        }

        // Parse.
        if let Err(error) = self.parser.parse(
            &mut object,
            self.arch.as_mut(),
            self.preproc.as_mut(),
            &directives,
            &mut self.linemap,
            &mut self.errwarns,
        ) {
            self.errwarns.propagate_error(self.linemap.current(), error);
        }
        if self.pass_failed() {
            self.object = Some(object);
            return false;
        }

        // Finalize.
        object.finalize(&mut self.errwarns);
        object.symbols_finalize(&mut self.errwarns, self.parser.undef_extern());
        if self.pass_failed() {
            self.object = Some(object);
            return false;
        }

        // Optimize.
        optimize(&mut object, &mut self.errwarns);
        let ok = !self.pass_failed();

        self.object = Some(object);
        ok
    }

    /// Write the laid-out object through the object format.
    pub fn output(&mut self, writer: &mut dyn WriteSeek, all_syms: bool) -> bool {
        let Some(object) = &mut self.object else {
            self.errwarns.propagate_error(
                0,
                Error::Internal("output requested before assembly".to_owned()),
            );
            return false;
        };

        if let Err(error) = self.objfmt.output(
            object,
            self.arch.as_ref(),
            writer,
            all_syms,
            &mut self.errwarns,
        ) {
            self.errwarns.propagate_error(self.linemap.current(), error);
        }

        !self.pass_failed()
    }

    /// Render all accumulated diagnostics through `handler` in source-line
    /// order; see [`Errwarns::output_all`].
    pub fn output_diagnostics(&mut self, handler: &mut dyn FnMut(&str, u64, bool, &str)) {
        let Self { errwarns, linemap, warning_error, .. } = self;
        errwarns.output_all(linemap, *warning_error, handler);
    }
}
