//!
//! # ELIB to Alternate Serialization Conversion CLI
//!
//! Reads an ELIB library, along with any libraries it references,
//! and saves it in any of the supported alternate serialization formats.
//!

use clap::Parser;
use std::error::Error;
use std::path::PathBuf;

use elib21::{Database, ReaderOptions};
use elib21utils::{SerdeFile, SerializationFormat};

// => The doc-comment on `ProgramOptions` here is displayed by the `clap`-generated help docs =>

/// ELIB to Alternate Serializer Converter
#[derive(Parser)]
pub struct ProgramOptions {
    /// ELIB Input File
    #[arg(short = 'i', long, default_value = "")]
    elib: String,
    /// Output Format. One of ("json", "yaml", "toml")
    #[arg(short = 'f', long, default_value = "json")]
    fmt: String,
    /// Output File
    #[arg(short = 'o', long, default_value = "")]
    out: String,
    /// Directories searched for referenced libraries. May be repeated.
    #[arg(short = 's', long = "search")]
    search: Vec<PathBuf>,
    /// Reader-options file, in any of the supported formats
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,
    /// Verbose Output Mode
    #[arg(short, long)]
    verbose: bool,
}

pub fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let options = ProgramOptions::parse();
    _main(&options)
}

pub fn _main(options: &ProgramOptions) -> Result<(), Box<dyn Error>> {
    let fmt: SerializationFormat = options.fmt.parse()?;
    let mut opts = match &options.config {
        Some(path) => ReaderOptions::open_any(path)?,
        None => ReaderOptions::default(),
    };
    opts.search_dirs.extend(options.search.iter().cloned());

    // Load the library, and anything it refers to
    let mut db = Database::default();
    let report = db.read_library(&options.elib, &opts)?;
    let lib = &db.libs[report.lib];

    if options.verbose {
        println!("{:?}", lib.stats());
        if report.clipped > 0 {
            println!("{} values clipped while narrowing", report.clipped);
        }
        for diag in report.diagnostics.iter() {
            println!("{:?}: {}", diag.kind, diag.msg);
        }
    }

    // Save to the target format
    fmt.save(lib, &options.out)?;

    if options.verbose {
        println!("wrote {:?}", &options.out);
    }
    Ok(())
}
