//! `yasm_errors` hosts the driver-level error codes of the assembler, along
//! with their long-form diagnostics.
//!
//! Errors across the workspace are ordinary enums deriving
//! [`thiserror::Error`] and [`miette::Diagnostic`]; when a variant carries a
//! `#[diagnostic(code(E...))]` attribute, that code can be expanded into a
//! full explanation with `yasm --explain E...`, à la `rustc`. The
//! explanations live as Markdown files under `src/error_codes/` and are
//! compiled into the [`DIAGNOSTICS`] table; they also surface in the API
//! documentation through the [`Diagnostics`] type.
//!
//! Note that this registry covers the *driver* errors only. Diagnostics for
//! the assembly source itself (syntax errors, value errors, warnings…) are
//! accumulated per line by the core's `Errwarns` collector and rendered in
//! either GNU or Microsoft style; they are deliberately code-less, matching
//! what other assemblers print.

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![deny(rustdoc::invalid_codeblock_attributes)]
#![deny(rustdoc::invalid_rust_codeblocks)]

mod error_codes;

#[cfg(doc)]
pub use error_codes::Diagnostics;
#[cfg(feature = "diagnostics")]
pub use error_codes::DIAGNOSTICS;
pub use miette::Result;

use miette::Diagnostic;
use thiserror::Error;

/// Error type for this crate.
///
/// The major interest of this type is its [`Error::explain`] method that can
/// be used to fetch the diagnostic of a particular error code.
#[derive(Debug, Diagnostic, Error)]
pub enum Error {
    /// The given error code is invalid.
    #[error("`{0}` is not a valid error code")]
    #[diagnostic(
        code(E000),
        help(
            "Did you mistype the error code? The pattern is `E[0-9]{{3}}`, \
             i.e. an `E` followed by 3 digits, such as `E000`."
        )
    )]
    InvalidCode(String),
}

impl Error {
    /// Given a specific error code, this method returns the associated
    /// diagnostic, if the error exists.
    ///
    /// ```
    /// use yasm_errors::Error;
    ///
    /// # fn main() {
    /// // Explain a valid error.
    /// assert!(Error::explain("E000").is_ok());
    ///
    /// // Explain an invalid error.
    /// assert!(Error::explain("oops").is_err());
    /// # }
    /// ```
    #[cfg(feature = "diagnostics")]
    pub fn explain(error_code: &str) -> Result<&'static str, Self> {
        DIAGNOSTICS
            .iter()
            .find_map(
                |(current_error_code, diagnostic)| {
                    if *current_error_code == error_code {
                        Some(*diagnostic)
                    } else {
                        None
                    }
                },
            )
            .ok_or(Self::InvalidCode(error_code.to_owned()))
    }
}
