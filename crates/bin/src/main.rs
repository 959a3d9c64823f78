//! `yasm-bin` is the executable of the assembler.
//!
//! It owns the command line, the module registry, and the rendering of
//! per-line assembly diagnostics in GNU or Microsoft style; everything else
//! is delegated to the core's [`Assembler`] phase sequencer.

mod error;

use std::{
    env,
    ffi::OsString,
    fs,
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    process,
};

use argh::FromArgs;
use error::Error;
use yasm_core::{Assembler, ModuleClass, ModuleRegistry, WarnClass};
use yasm_errors::Result;

fn registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    yasm_arch_x86::register(&mut registry);
    yasm_parser_nasm::register(&mut registry);
    yasm_objfmt::register(&mut registry);
    registry
}

/// The `yasm` command is a modular assembler: it translates an assembly
/// source file into a relocatable object file (or a flat binary).
#[derive(Debug, FromArgs)]
struct Yasm {
    /// explain a particular error based on its code (of kind `E...`).
    #[argh(option)]
    explain: Option<String>,

    /// select architecture (`help` to list).
    #[argh(option, short = 'a', default = "String::from(\"x86\")")]
    arch: String,

    /// select parser (`help` to list).
    #[argh(option, short = 'p', default = "String::from(\"nasm\")")]
    parser: String,

    /// select preprocessor (`help` to list).
    #[argh(option, short = 'r')]
    preproc: Option<String>,

    /// select object format (`help` to list).
    #[argh(option, short = 'f', default = "String::from(\"bin\")")]
    oformat: String,

    /// select debugging format (`help` to list).
    #[argh(option, short = 'g')]
    dformat: Option<String>,

    /// select the architecture machine, e.g. `x86` or `amd64`.
    #[argh(option, short = 'm')]
    machine: Option<String>,

    /// name of the object output file.
    #[argh(option, short = 'o')]
    objfile: Option<PathBuf>,

    /// name of the listing output file.
    #[argh(option, short = 'l')]
    list: Option<PathBuf>,

    /// add a directory to the include search path.
    #[argh(option, short = 'I')]
    include: Vec<String>,

    /// pre-define a macro, optionally with a value (`MACRO[=VALUE]`).
    #[argh(option, short = 'D')]
    define: Vec<String>,

    /// undefine a macro.
    #[argh(option, short = 'U')]
    undefine: Vec<String>,

    /// pre-include a file.
    #[argh(option, short = 'P')]
    preinclude: Vec<String>,

    /// redirect error output to a file.
    #[argh(option, short = 'E')]
    error_file: Option<PathBuf>,

    /// redirect error output to stdout.
    #[argh(switch, short = 's')]
    error_stdout: bool,

    /// inhibit all warnings.
    #[argh(switch, short = 'w')]
    inhibit_warnings: bool,

    /// enable a warning class (`name`), disable one (`no-name`), or treat
    /// warnings as errors (`error`).
    #[argh(option, short = 'W')]
    warning: Vec<String>,

    /// generate Makefile dependencies instead of an object.
    #[argh(switch, short = 'M')]
    makefile_deps: bool,

    /// preprocess only (writes output to stdout by default).
    #[argh(switch, short = 'e')]
    preproc_only: bool,

    /// error message style: `gnu` or `vc`.
    #[argh(option, short = 'X', default = "String::from(\"gnu\")")]
    error_style: String,

    /// treat all sized operands as if `strict` was specified.
    #[argh(switch)]
    force_strict: bool,

    /// show the version and exit.
    #[argh(switch)]
    version: bool,

    /// show the license and exit.
    #[argh(switch)]
    license: bool,

    /// the assembly source file.
    #[argh(positional)]
    input: Vec<PathBuf>,
}

impl Yasm {
    /// Creates a new `Self` type based on [`std::env::args_os`].
    fn new() -> Result<Self, Error> {
        // Collect all arguments.
        let arguments =
            env::args_os().map(OsString::into_string).collect::<Result<Vec<_>, _>>().map_err(
                |argument| Error::InvalidArgumentEncoding(argument.to_string_lossy().to_string()),
            )?;

        // Check whether `argv` is present.
        if arguments.is_empty() {
            return Err(Error::ProgramNameIsMissing);
        }

        // Extract the base command from a path.
        let command = Path::new(&arguments[0])
            .file_name()
            .and_then(|file_name| file_name.to_str())
            .unwrap_or(&arguments[0]);

        // Split the joined short-option forms (`-felf`, `-Wno-foo`, `-i.`)
        // that assembler users expect but `argh` does not parse.
        let mut split = Vec::new();
        for argument in arguments.iter().skip(1) {
            let bytes = argument.as_bytes();
            let joined = bytes.len() > 2
                && bytes[0] == b'-'
                && b"aprfgmolIiDUPEWX".contains(&bytes[1])
                && bytes[1] != b'-';
            if joined {
                let (flag, value) = argument.split_at(2);
                let flag = if flag == "-i" { "-I" } else { flag };
                split.push(flag.to_string());
                split.push(value.to_string());
            } else {
                split.push(argument.clone());
            }
        }
        let arguments = split.iter().map(String::as_str).collect::<Vec<_>>();

        // Parse and build `Self`.
        match Yasm::from_args(&[command], &arguments) {
            Ok(yasm) => Ok(yasm),
            Err(early_exit) => match early_exit.status {
                // The command was parsed successfully and the early exit is due to a flag like
                // `--help` causing early exit with output.
                Ok(()) => {
                    println!("{}", early_exit.output);

                    process::exit(0);
                }

                // The arguments were not successfully parsed.
                Err(()) => Err(Error::CommandLine(early_exit.output.trim().to_string())),
            },
        }
    }
}

/// Where the per-line assembly diagnostics go (`-s`, `-E`).
enum DiagSink {
    Stderr,
    Stdout,
    File(fs::File),
}

impl DiagSink {
    fn emit(&mut self, line: &str) {
        match self {
            Self::Stderr => eprintln!("{line}"),
            Self::Stdout => println!("{line}"),
            Self::File(file) => {
                let _ = writeln!(file, "{line}");
            }
        }
    }
}

fn list_modules(name: &str, modules: &[(&str, &str)]) -> ! {
    println!("Available {name} modules:");
    for (keyword, description) in modules {
        println!("    {keyword:<12}{description}");
    }
    process::exit(0);
}

fn main() -> Result<()> {
    // Install the error report.
    Error::install_and_configure()?;

    // Build the command-line arguments.
    let yasm = Yasm::new()?;

    // Handle the `--explain` option.
    if let Some(error_code) = yasm.explain {
        println!("{}", Error::explain(&error_code)?);

        return Ok(());
    }

    if yasm.version {
        println!("yasm {}", env!("CARGO_PKG_VERSION"));
        println!("Compiled for {}.", std::env::consts::ARCH);
        return Ok(());
    }
    if yasm.license {
        println!("yasm is licensed under the 2-clause and 3-clause BSD licenses.");
        return Ok(());
    }

    if yasm.list.is_some() {
        return Err(Error::Unsupported("Listing file output (`-l`)").into());
    }
    if yasm.makefile_deps {
        return Err(Error::Unsupported("Makefile dependency output (`-M`)").into());
    }

    let registry = registry();

    // `help` as a module keyword lists the class and exits.
    if yasm.arch == "help" {
        list_modules("architecture", &registry.list(ModuleClass::Arch));
    }
    if yasm.parser == "help" {
        list_modules("parser", &registry.list(ModuleClass::Parser));
    }
    if yasm.oformat == "help" {
        list_modules("object format", &registry.list(ModuleClass::ObjectFormat));
    }
    if yasm.preproc.as_deref() == Some("help") {
        list_modules("preprocessor", &registry.list(ModuleClass::Preproc));
    }
    if yasm.dformat.as_deref() == Some("help") {
        list_modules("debug format", &[("null", "No debugging info")]);
    }

    // Load the modules.
    let mut arch = registry.load_arch(&yasm.arch).ok_or_else(|| Error::UnknownModule {
        class: "architecture",
        keyword: yasm.arch.clone(),
    })?;

    if yasm.machine.as_deref() == Some("help") {
        list_modules("machine", arch.machines());
    }
    if let Some(machine) = &yasm.machine {
        arch.set_machine(machine).map_err(|_| Error::BadMachine {
            arch: arch.keyword(),
            machine: machine.clone(),
        })?;
    }

    let parser = registry.load_parser(&yasm.parser).ok_or_else(|| Error::UnknownModule {
        class: "parser",
        keyword: yasm.parser.clone(),
    })?;

    let preproc_keyword = yasm
        .preproc
        .clone()
        .unwrap_or_else(|| parser.preproc_keywords()[0].to_owned());
    let mut preproc =
        registry.load_preproc(&preproc_keyword).ok_or_else(|| Error::UnknownModule {
            class: "preprocessor",
            keyword: preproc_keyword.clone(),
        })?;

    let objfmt = registry.load_objfmt(&yasm.oformat).ok_or_else(|| Error::UnknownModule {
        class: "object format",
        keyword: yasm.oformat.clone(),
    })?;

    if let Some(dformat) = &yasm.dformat {
        if dformat != "null" {
            return Err(Error::UnknownModule {
                class: "debug format",
                keyword: dformat.clone(),
            }
            .into());
        }
    }

    if let (Some(machine), Some(forced)) = (&yasm.machine, objfmt.forced_machine()) {
        if machine.as_str() != forced {
            return Err(Error::BadMachine { arch: arch.keyword(), machine: machine.clone() }.into());
        }
    }

    // The input file.
    let input = match yasm.input.as_slice() {
        [] => return Err(Error::NoInputFile.into()),
        [input] => input.clone(),
        inputs => return Err(Error::TooManyInputFiles(inputs.len()).into()),
    };
    let src_filename = input.display().to_string();

    // Apply the saved preprocessor options: include paths, pre-defines,
    // un-defines and pre-included files, each list on its own.
    for path in &yasm.include {
        preproc.add_include_path(path);
    }
    for define in &yasm.define {
        match define.split_once('=') {
            Some((name, value)) => preproc.predefine_macro(name, Some(value)),
            None => preproc.predefine_macro(define, None),
        }
    }
    for name in &yasm.undefine {
        preproc.undefine_macro(name);
    }
    for path in &yasm.preinclude {
        preproc.pre_include_file(path);
    }

    if yasm.force_strict {
        arch.set_var("force_strict", 1)
            .expect("every architecture knows force_strict");
    }

    let open_input = || -> Result<Box<dyn BufRead>, Error> {
        let file = fs::File::open(&input).map_err(|source| Error::File {
            path: src_filename.clone(),
            source,
        })?;
        Ok(Box::new(BufReader::new(file)))
    };

    // Preprocess-only mode short-circuits the whole pipeline.
    if yasm.preproc_only {
        preproc
            .init(open_input()?, &src_filename)
            .map_err(|error| Error::CommandLine(error.to_string()))?;
        while let Some(line) = preproc
            .get_line()
            .map_err(|error| Error::CommandLine(error.to_string()))?
        {
            println!("{line}");
        }
        return Ok(());
    }

    // Pick the output file name: explicit, or input stem plus the format's
    // extension.
    let obj_filename = match &yasm.objfile {
        Some(path) => path.clone(),
        None => {
            let stem = input.file_stem().unwrap_or_default();
            let mut path = PathBuf::from(stem);
            if !objfmt.extension().is_empty() {
                path.set_extension(objfmt.extension());
            }
            path
        }
    };
    if obj_filename == input {
        return Err(Error::CommandLine(format!(
            "refusing to overwrite the input file `{src_filename}`"
        ))
        .into());
    }

    let mut assembler = Assembler::new(arch, parser, preproc, objfmt)
        .map_err(|error| Error::CommandLine(error.to_string()))?;

    // Warning options: `-w` first, then the `-W` list in order.
    if yasm.inhibit_warnings {
        assembler.errwarns_mut().disable_all_warnings();
    }
    for warning in &yasm.warning {
        match warning.as_str() {
            "error" => assembler.set_warning_error(true),
            "no-error" => assembler.set_warning_error(false),
            name => match name.strip_prefix("no-") {
                Some(name) => match WarnClass::from_name(name) {
                    Some(class) => assembler.errwarns_mut().disable_warning(class),
                    None => {
                        return Err(
                            Error::CommandLine(format!("unknown warning `{name}`")).into()
                        );
                    }
                },
                None => match WarnClass::from_name(name) {
                    Some(class) => assembler.errwarns_mut().enable_warning(class),
                    None => {
                        return Err(
                            Error::CommandLine(format!("unknown warning `{name}`")).into()
                        );
                    }
                },
            },
        }
    }

    let mut sink = if let Some(path) = &yasm.error_file {
        DiagSink::File(fs::File::create(path).map_err(|source| Error::File {
            path: path.display().to_string(),
            source,
        })?)
    } else if yasm.error_stdout {
        DiagSink::Stdout
    } else {
        DiagSink::Stderr
    };
    let vc_style = match yasm.error_style.as_str() {
        "gnu" => false,
        "vc" => true,
        style => {
            return Err(Error::CommandLine(format!("unknown error style `{style}`")).into());
        }
    };

    // Assemble.
    let obj_filename_str = obj_filename.display().to_string();
    let assembled = assembler.assemble(open_input()?, &src_filename, &obj_filename_str);

    let mut render = |assembler: &mut Assembler| {
        assembler.output_diagnostics(&mut |file, line, is_error, message| {
            let kind = if is_error { "error" } else { "warning" };
            let rendered = if vc_style {
                format!("{file}({line}) : {kind}: {message}")
            } else {
                format!("{file}:{line}: {kind}: {message}")
            };
            sink.emit(&rendered);
        });
    };

    if !assembled {
        render(&mut assembler);
        return Err(Error::AssemblyFailed.into());
    }

    // Write the object file; a failed write never leaves a partial file
    // behind.
    let mut output = fs::File::create(&obj_filename).map_err(|source| Error::File {
        path: obj_filename_str.clone(),
        source,
    })?;

    let written = assembler.output(&mut output, false);
    render(&mut assembler);

    if !written {
        drop(output);
        let _ = fs::remove_file(&obj_filename);
        return Err(Error::AssemblyFailed.into());
    }

    Ok(())
}
