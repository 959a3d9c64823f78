//! The `raw` preprocessor: a pass-through line source.
//!
//! It performs no macro expansion at all; its only jobs are feeding lines
//! to the parser and splicing pre-include files (`-P`) ahead of the main
//! input, with strict `%line` markers so diagnostics stay attributed to the
//! right file.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};

use yasm_core::{Error, Preprocessor};

enum Source {
    /// A synthetic line to hand out verbatim (`%line` markers).
    Synthetic(String),
    /// An open file or stream to drain.
    Stream(Box<dyn BufRead>),
}

/// The pass-through preprocessor.
#[derive(Default)]
pub struct RawPreproc {
    sources: VecDeque<Source>,
    include_paths: Vec<String>,
    pre_includes: Vec<String>,
}

impl RawPreproc {
    /// Creates the preprocessor.
    pub fn new() -> Self {
        Self::default()
    }

    fn open(&self, path: &str) -> Result<Box<dyn BufRead>, Error> {
        // Try the bare path first, then each include directory in order.
        let mut candidates = vec![path.to_owned()];
        for dir in &self.include_paths {
            let mut full = dir.clone();
            if !full.ends_with('/') {
                full.push('/');
            }
            full.push_str(path);
            candidates.push(full);
        }

        for candidate in &candidates {
            if let Ok(file) = File::open(candidate) {
                return Ok(Box::new(BufReader::new(file)));
            }
        }

        Err(Error::Io(format!("unable to open include file `{path}`")))
    }
}

impl std::fmt::Debug for RawPreproc {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RawPreproc")
            .field("include_paths", &self.include_paths)
            .field("pre_includes", &self.pre_includes)
            .finish()
    }
}

impl Preprocessor for RawPreproc {
    fn keyword(&self) -> &'static str {
        "raw"
    }

    fn description(&self) -> &'static str {
        "Disable preprocessing"
    }

    fn init(&mut self, input: Box<dyn BufRead>, src_filename: &str) -> Result<(), Error> {
        self.sources.clear();

        for path in self.pre_includes.clone() {
            let stream = self.open(&path)?;
            self.sources.push_back(Source::Synthetic(format!("%line 1 \"{path}\"")));
            self.sources.push_back(Source::Stream(stream));
        }

        if !self.pre_includes.is_empty() {
            self.sources.push_back(Source::Synthetic(format!("%line 1 \"{src_filename}\"")));
        }
        self.sources.push_back(Source::Stream(input));

        Ok(())
    }

    fn get_line(&mut self) -> Result<Option<String>, Error> {
        loop {
            match self.sources.front_mut() {
                None => return Ok(None),
                Some(Source::Synthetic(_)) => {
                    let Some(Source::Synthetic(line)) = self.sources.pop_front() else {
                        unreachable!()
                    };
                    return Ok(Some(line));
                }
                Some(Source::Stream(stream)) => {
                    let mut line = String::new();
                    let read = stream
                        .read_line(&mut line)
                        .map_err(|error| Error::Io(format!("read error: {error}")))?;
                    if read == 0 {
                        self.sources.pop_front();
                        continue;
                    }
                    while line.ends_with('\n') || line.ends_with('\r') {
                        line.pop();
                    }
                    return Ok(Some(line));
                }
            }
        }
    }

    fn add_include_path(&mut self, path: &str) {
        self.include_paths.push(path.to_owned());
    }

    fn pre_include_file(&mut self, path: &str) {
        self.pre_includes.push(path.to_owned());
    }

    fn predefine_macro(&mut self, _name: &str, _value: Option<&str>) {
        // No macro engine to define into.
    }

    fn undefine_macro(&mut self, _name: &str) {}

    fn define_builtin(&mut self, _name: &str, _value: Option<&str>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_pass_through() {
        let mut preproc = RawPreproc::new();
        preproc.init(Box::new(&b"one\r\ntwo\nthree"[..]), "t.asm").unwrap();

        assert_eq!(preproc.get_line().unwrap().as_deref(), Some("one"));
        assert_eq!(preproc.get_line().unwrap().as_deref(), Some("two"));
        assert_eq!(preproc.get_line().unwrap().as_deref(), Some("three"));
        assert_eq!(preproc.get_line().unwrap(), None);
    }
}
