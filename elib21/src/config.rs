//!
//! # Reader Configuration
//!
//! [ReaderOptions] controls where referenced libraries are searched for,
//! what happens when one cannot be found, and which variables are discarded.
//! Options are serializable, and can be loaded from JSON, YAML or TOML via [SerdeFile].
//!
//! Reads also accept two optional collaborators:
//! a [ProgressSink], informed of progress through the stream,
//! and a [LibraryPrompt], asked for the location of libraries which cannot otherwise be found.
//!

// Std-Lib Imports
use std::path::PathBuf;

// Crates.io
use derive_builder::Builder;
use serde::{Deserialize, Serialize};

// Workspace Imports
use elib21utils::SerdeFile;

/// # Missing Library Policy
/// Handling of referenced libraries which cannot be located
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum MissingLibraryPolicy {
    /// Continue, substituting placeholder cells for those of the missing library
    #[default]
    Substitute,
    /// Fail the entire read
    Fail,
}

/// Variable keys dropped while reading, unless configured otherwise
pub const DEPRECATED_KEYS: [&str; 5] = [
    "NET_last_good_ncc",
    "NET_last_good_ncc_facet",
    "SIM_window_signal_order",
    "NODE_proto",
    "EXPORT_name",
];
fn default_deprecated_keys() -> Vec<String> {
    DEPRECATED_KEYS.iter().map(|s| s.to_string()).collect()
}

/// # Reader Options
#[derive(Clone, Builder, Debug, Deserialize, Serialize, PartialEq)]
#[builder(pattern = "owned", setter(into))]
pub struct ReaderOptions {
    /// Secondary directories searched for referenced libraries
    #[serde(default)]
    #[builder(default)]
    pub search_dirs: Vec<PathBuf>,
    /// Built-in library area, searched after every other directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    pub library_area: Option<PathBuf>,
    #[serde(default)]
    #[builder(default)]
    pub missing_library: MissingLibraryPolicy,
    /// Keys of variables which are read, and then dropped
    #[serde(default = "default_deprecated_keys")]
    #[builder(default = "default_deprecated_keys()")]
    pub deprecated_keys: Vec<String>,
}
impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            search_dirs: Vec::new(),
            library_area: None,
            missing_library: MissingLibraryPolicy::default(),
            deprecated_keys: default_deprecated_keys(),
        }
    }
}
impl SerdeFile for ReaderOptions {}

/// # Progress Sink
/// Advisory progress reporting. Percentages run from zero to one hundred.
pub trait ProgressSink {
    fn progress(&mut self, percent: u8);
    /// Set a short note describing the current phase
    fn note(&mut self, _note: &str) {}
}
/// [ProgressSink] which discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;
impl ProgressSink for NoProgress {
    fn progress(&mut self, _percent: u8) {}
}

/// # Library Prompt
/// Last resort for locating a referenced library.
/// Receives the library's name, and returns a path to try, or [None] to give up.
/// Called repeatedly until it returns an existing file or [None].
pub trait LibraryPrompt {
    fn locate(&mut self, libname: &str) -> Option<PathBuf>;
}
