#[cfg(feature = "fancy-errors")]
use miette::{set_hook, MietteHandlerOpts};
use miette::{Diagnostic, InstallError, Result};
use thiserror::Error;
use yasm_errors::Error as YasmError;

#[derive(Error, Diagnostic, Debug)]
pub(crate) enum Error {
    #[error("The argument `{0}` contains invalid Unicode data.")]
    InvalidArgumentEncoding(String),

    #[error("The program name is missing from the command-line.")]
    ProgramNameIsMissing,

    #[error("I was not able to read the command-line properly:\n{0}")]
    #[diagnostic(help("See the command-line usage with `yasm --help`."))]
    CommandLine(String),

    #[error("`{keyword}` is not a known {class} module.")]
    #[diagnostic(
        code(E001),
        help("Pass `help` as the module keyword to list the available modules.")
    )]
    UnknownModule { class: &'static str, keyword: String },

    #[error("No input file was given.")]
    #[diagnostic(code(E002), help("Pass exactly one assembly source file."))]
    NoInputFile,

    #[error("I can only assemble one input file, {0} were given.")]
    #[diagnostic(code(E002), help("Pass exactly one assembly source file."))]
    TooManyInputFiles(usize),

    #[error("I was not able to open `{path}`: {source}.")]
    #[diagnostic(code(E003))]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Assembly failed.")]
    #[diagnostic(
        code(E004),
        help("The errors above name the source lines that need fixing.")
    )]
    AssemblyFailed,

    #[error("`{machine}` is not a valid machine for architecture `{arch}`.")]
    #[diagnostic(code(E005), help("List the machines with `yasm -m help`."))]
    BadMachine { arch: &'static str, machine: String },

    #[error("{0} is not supported by this build.")]
    Unsupported(&'static str),

    #[error(transparent)]
    Explain(#[from] YasmError),
}

impl Error {
    pub(crate) fn install_and_configure() -> Result<(), InstallError> {
        #[cfg(feature = "fancy-errors")]
        set_hook(Box::new(|_| {
            Box::new(
                MietteHandlerOpts::new()
                    .with_cause_chain()
                    .footer(
                        "For more information about an error, try \
                        `yasm --explain <error>` where `<error>` \
                        has the `E[0-9]{{3}}` pattern."
                            .to_string(),
                    )
                    .width(85)
                    .terminal_links(false)
                    .build(),
            )
        }))?;

        Ok(())
    }

    pub(crate) fn explain(error_code: &str) -> Result<&'static str, YasmError> {
        YasmError::explain(error_code)
    }
}
