//!
//! # Elib21 Circuit-Design Database Reader & Writer
//!
//! ELIB is the binary library format of the Electric VLSI design system.
//! Each file stores one library: a set of cells, each holding node instances, arc instances,
//! exports, and typed variables attached to all of the above.
//! Twelve revisions of the format have been written over the years,
//! each identified by a magic number, and Elib21 reads all of them.
//! Writing always produces the latest revision.
//!
//! Layout data is represented in three primary forms:
//!
//! * The in-memory database:
//!   * A [Database] holds a [TechRegistry] of technologies, primitives and tools,
//!     plus every loaded [Library], keyed by [LibKey].
//!   * Libraries consist of [Cell]s, keyed by [CellKey].
//!     Cells refer to cells of other libraries via [CellRef]s, which is how inter-library hierarchy is expressed.
//!   * Cells consist of [NodeInst]s, [ArcInst]s connecting them, and [Export]s making node ports visible to parents.
//! * On disk, the database is flattened into dense index tables.
//!   Nodes, arcs, exports, primitives and cells are all referred to by integer position,
//!   often before the referenced object has been read.
//!   Reading therefore proceeds in two passes: a decoding pass into index-addressed arenas,
//!   and a build pass which links them into [Cell]s in dependency order.
//! * Numbers are stored in fixed-width binary form, with widths and byte order recorded in each file's header.
//!   See [DecodeContext] and [Capabilities].
//!
//! Libraries referred to by a file, but not yet loaded, are located and read along with it.
//! Those which cannot be found are replaced by placeholder cells, per [ReaderOptions].
//!
//! ## Alternate Serialization
//!
//! Each [Library] is [serde]-serializable, and can be saved to JSON, YAML, or TOML
//! via [elib21utils::SerdeFile].
//!
//! ## Usage
//!
//! Loading a [Library] from disk:
//!
//! ```skip
//! let mut db = Database::default();
//! let report = db.read_library("mylib.elib", &ReaderOptions::default())?;
//! let lib = &db.libs[report.lib];
//! ```
//!
//! Creating a new [Library], and adding a [Cell]:
//!
//! ```
//! use elib21::{Cell, Database, Library, View};
//! let mut db = Database::default();
//! let mut lib = Library::new("mylib");
//! lib.cells.insert(Cell::new("inv", View::layout()));
//! let key = db.libs.insert(lib);
//! ```
//!
//! Saving a [Library] to disk:
//!
//! ```skip
//! db.save_library(key, "mylib.elib")?;
//! ```
//!

// Internal modules & re-exports
pub mod codec;
pub mod config;
pub mod data;
pub mod header;
pub mod read;
pub mod tech;
pub mod vars;
pub mod write;

mod alloc;
mod build;
mod external;
mod resolve;

pub use codec::ElibReader;
pub use config::*;
pub use data::*;
pub use header::{detect, Capabilities, DecodeContext, ElibVersion, Endian, Magic, VersionFlags};
pub use read::ElibParser;
pub use tech::*;
pub use write::{ElibWriter, WRITE_VERSION};

#[cfg(test)]
mod tests;
