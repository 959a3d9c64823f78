//! Error and warning reporting.
//!
//! Every pass of the assembler (parse, finalize, optimize, output) collects
//! its diagnostics into an [`Errwarns`] accumulator instead of aborting on
//! the first problem, so a single run surfaces as many independent problems
//! as possible. The driver flushes the accumulator at phase boundaries.

use enumflags2::{bitflags, BitFlags};
use thiserror::Error;

use crate::{Line, Linemap};

/// An assembly-time error.
///
/// The variants follow the error taxonomy of the assembler: the *kind* says
/// which contract was broken, the payload carries the human message for the
/// offending site.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Bad token or unexpected structure in the source.
    #[error("{0}")]
    Syntax(String),
    /// An argument is semantically invalid (negative size, non-power-of-two
    /// alignment, out-of-range displacement…).
    #[error("{0}")]
    Value(String),
    /// An expression cannot be reduced to the form required by its consumer.
    #[error("expression too complex: {0}")]
    TooComplex(String),
    /// An expression demanded to be a constant isn't.
    #[error("{0}")]
    NotConstant(String),
    /// Operation on a value of the wrong kind.
    #[error("{0}")]
    Type(String),
    /// Division or modulus by zero inside an expression.
    #[error("divide by zero")]
    ZeroDivision,
    /// Cannot open, read, seek or write a file.
    #[error("{0}")]
    Io(String),
    /// Unrecoverable situation that is not a bug (e.g. unplaceable output).
    #[error("{0}")]
    Fatal(String),
    /// A bug in the assembler itself.
    #[error("INTERNAL ERROR: {0}")]
    Internal(String),
}

impl Error {
    /// True when this error is an internal (bug) error.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

/// Warning classes. Each class can be enabled or disabled independently
/// (`-W<name>` / `-Wno-<name>` on the command line).
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarnClass {
    /// Warnings not covered by any other class.
    General = 1 << 0,
    /// Unrecognized characters in the input.
    UnrecChar = 1 << 1,
    /// A label alone on its line, without a trailing colon.
    OrphanLabel = 1 << 2,
    /// Uninitialized space inside a section that emits data.
    UninitContents = 1 << 3,
    /// A size override that has no effect.
    SizeOverride = 1 << 4,
}

impl WarnClass {
    /// The command-line name of the class (`-W<name>`).
    pub fn name(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::UnrecChar => "unrecognized-char",
            Self::OrphanLabel => "orphan-labels",
            Self::UninitContents => "uninit-contents",
            Self::SizeOverride => "size-override",
        }
    }

    /// Look a class up by its command-line name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "general" => Some(Self::General),
            "unrecognized-char" => Some(Self::UnrecChar),
            "orphan-labels" => Some(Self::OrphanLabel),
            "uninit-contents" => Some(Self::UninitContents),
            "size-override" => Some(Self::SizeOverride),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
enum EwData {
    Error(Error),
    Warning(WarnClass, String),
}

#[derive(Debug, Clone)]
struct Entry {
    line: Line,
    data: EwData,
}

/// The per-object accumulator of errors and warnings.
///
/// It also owns the "current warning" slot: code deep inside a pass calls
/// [`Errwarns::warn_set`] without knowing which source line it is working
/// for; the pass loop then calls [`Errwarns::propagate`] with the line at
/// hand, which captures and clears the slot.
#[derive(Debug)]
pub struct Errwarns {
    entries: Vec<Entry>,
    current_warn: Option<(WarnClass, String)>,
    enabled: BitFlags<WarnClass>,
    error_count: usize,
    warning_count: usize,
}

impl Default for Errwarns {
    fn default() -> Self {
        Self::new()
    }
}

impl Errwarns {
    /// Creates an empty accumulator with all warning classes enabled.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            current_warn: None,
            enabled: BitFlags::all(),
            error_count: 0,
            warning_count: 0,
        }
    }

    /// Enable a warning class.
    pub fn enable_warning(&mut self, class: WarnClass) {
        self.enabled |= class;
    }

    /// Disable a warning class.
    pub fn disable_warning(&mut self, class: WarnClass) {
        self.enabled.remove(class);
    }

    /// Disable every warning class (`-w`).
    pub fn disable_all_warnings(&mut self) {
        self.enabled = BitFlags::empty();
    }

    /// Set the current warning. Any previously set, not yet propagated
    /// warning is overwritten; disabled classes are dropped on the floor.
    pub fn warn_set(&mut self, class: WarnClass, message: impl Into<String>) {
        if self.enabled.contains(class) {
            self.current_warn = Some((class, message.into()));
        }
    }

    /// Clear the current warning without recording it.
    pub fn warn_clear(&mut self) {
        self.current_warn = None;
    }

    /// Capture the current warning (if any) and bind it to `line`.
    pub fn propagate(&mut self, line: Line) {
        if let Some((class, message)) = self.current_warn.take() {
            self.entries.push(Entry { line, data: EwData::Warning(class, message) });
            self.warning_count += 1;
        }
    }

    /// Record an error bound to `line`, then capture the current warning as
    /// [`Errwarns::propagate`] does.
    pub fn propagate_error(&mut self, line: Line, error: Error) {
        self.entries.push(Entry { line, data: EwData::Error(error) });
        self.error_count += 1;
        self.propagate(line);
    }

    /// Number of errors recorded so far. With `warning_as_error`, warnings
    /// count as errors too.
    pub fn num_errors(&self, warning_as_error: bool) -> usize {
        if warning_as_error {
            self.error_count + self.warning_count
        } else {
            self.error_count
        }
    }

    /// True when at least one diagnostic has been recorded.
    pub fn has_diagnostics(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Emit all accumulated diagnostics in source-line order.
    ///
    /// The handler receives `(source file, physical line, is_error,
    /// message)` for each diagnostic. With `warning_as_error`, warnings are
    /// reported through the error path.
    pub fn output_all(
        &mut self,
        linemap: &Linemap,
        warning_as_error: bool,
        handler: &mut dyn FnMut(&str, u64, bool, &str),
    ) {
        // Sort is stable, so diagnostics on the same line keep their
        // recording order.
        self.entries.sort_by_key(|entry| entry.line);

        for entry in &self.entries {
            let (file, file_line) = linemap.lookup(entry.line);
            match &entry.data {
                EwData::Error(error) => handler(file, file_line, true, &error.to_string()),
                EwData::Warning(_, message) => {
                    handler(file, file_line, warning_as_error, message)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_slot_overwrite() {
        let mut ew = Errwarns::new();
        ew.warn_set(WarnClass::General, "first");
        ew.warn_set(WarnClass::General, "second");
        ew.propagate(4);

        assert_eq!(ew.num_errors(false), 0);
        assert_eq!(ew.num_errors(true), 1);
    }

    #[test]
    fn test_disabled_class_is_dropped() {
        let mut ew = Errwarns::new();
        ew.disable_warning(WarnClass::OrphanLabel);
        ew.warn_set(WarnClass::OrphanLabel, "label alone on a line");
        ew.propagate(1);

        assert_eq!(ew.num_errors(true), 0);
        assert!(!ew.has_diagnostics());
    }

    #[test]
    fn test_output_all_is_line_ordered() {
        let mut linemap = Linemap::new();
        linemap.set("test.asm", 1, 1);
        for _ in 0..10 {
            linemap.goto_next();
        }

        let mut ew = Errwarns::new();
        ew.propagate_error(7, Error::Syntax("late".into()));
        ew.propagate_error(2, Error::Syntax("early".into()));

        let mut seen = Vec::new();
        ew.output_all(&linemap, false, &mut |_file, line, is_error, message| {
            seen.push((line, is_error, message.to_string()));
        });

        assert_eq!(
            seen,
            vec![(2, true, "early".to_string()), (7, true, "late".to_string())]
        );
    }
}
