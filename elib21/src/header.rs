//!
//! # Elib File Header
//!
//! Magic numbers, byte order, and the format capabilities implied by each.
//!

// Crates.io
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

// Local Imports
use crate::codec::ElibReader;
use crate::data::{ElibError, ElibResult};

/// # Magic Numbers
/// One per format revision. Each successive revision decrements by two.
#[derive(FromPrimitive, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Magic {
    Magic1 = -1573,
    Magic2 = -1575,
    Magic3 = -1577,
    Magic4 = -1579,
    Magic5 = -1581,
    Magic6 = -1583,
    Magic7 = -1585,
    Magic8 = -1587,
    Magic9 = -1589,
    Magic10 = -1591,
    Magic11 = -1593,
    Magic12 = -1595,
}
impl Magic {
    /// Format revision, from 1 (oldest) to 12 (newest)
    pub fn tier(&self) -> u8 {
        ((-1573 - *self as i32) / 2 + 1) as u8
    }
    /// Get the [Magic] for format revision `tier`
    pub fn from_tier(tier: u8) -> Option<Self> {
        Self::from_i32(-1573 - 2 * (tier as i32 - 1))
    }
    pub fn value(&self) -> i32 {
        *self as i32
    }
}

/// Byte order of the multi-byte integers in a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// Detect the [Magic] and [Endian] of a file from its first four bytes.
/// Little-endian interpretation is attempted first.
pub fn detect_magic(bytes: [u8; 4]) -> ElibResult<(Magic, Endian)> {
    if let Some(m) = Magic::from_i32(i32::from_le_bytes(bytes)) {
        return Ok((m, Endian::Little));
    }
    if let Some(m) = Magic::from_i32(i32::from_be_bytes(bytes)) {
        return Ok((m, Endian::Big));
    }
    Err(ElibError::BadMagic(bytes))
}

/// Detect the [DecodeContext] of the stream beginning with `bytes`,
/// including any explicit integer and character widths.
pub fn detect(bytes: &[u8]) -> ElibResult<DecodeContext> {
    let head = &bytes[..bytes.len().min(7)];
    ElibReader::from_bytes(head.to_vec()).read_header()
}

/// # Decode Context
/// Everything the header says about how the rest of the stream is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeContext {
    pub magic: Magic,
    pub endian: Endian,
    /// Byte-width of "big" integers
    pub big_size: u8,
    /// Byte-width of "small" integers
    pub small_size: u8,
    /// Byte-width of characters
    pub char_size: u8,
    pub caps: Capabilities,
}
impl DecodeContext {
    /// Create a [DecodeContext] with the default (2, 4, 1) widths
    pub fn new(magic: Magic, endian: Endian) -> Self {
        Self {
            magic,
            endian,
            big_size: 4,
            small_size: 2,
            char_size: 1,
            caps: Capabilities::new(magic),
        }
    }
}

/// # Format Capabilities
/// Which optional sections and fields are present in a given format revision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Header includes the byte-widths of small and big integers
    pub int_widths: bool,
    /// Header includes the byte-width of characters
    pub char_width: bool,
    /// Header includes a total cell count
    pub cell_count: bool,
    /// Header includes the writing program's version string
    pub version_string: bool,
    /// Views table, text descriptors, and per-cell view, version and dates
    pub views: bool,
    /// Header includes a separate count of tool-bit words
    pub tool_bit_count: bool,
    /// Per-cell arc, node, and export counts
    pub cell_counts: bool,
    /// "Fake" cell-name records
    pub fake_cells: bool,
    /// Cell-group links on each cell
    pub cell_groups: bool,
    /// Spatial "geom" records and chains
    pub geoms: bool,
    /// Obsolete previous/next cell links, and arc lengths
    pub prev_next: bool,
    /// Obsolete arc signal words
    pub signals: bool,
    /// Node and arc names stored inline, rather than as variables
    pub inst_names: bool,
    /// Obsolete "seen" words on exports, nodes and arcs
    pub seen_bits: bool,
    /// A single user-bits word per object, rather than one per tool
    pub single_user_word: bool,
    /// Network numbers following the user bits of cells, exports and arcs
    pub net_numbers: bool,
}
impl Capabilities {
    pub fn new(magic: Magic) -> Self {
        let tier = magic.tier();
        Self {
            int_widths: tier >= 10,
            char_width: tier >= 11,
            cell_count: (9..=11).contains(&tier),
            version_string: tier >= 8,
            views: tier >= 9,
            tool_bit_count: (3..=6).contains(&tier),
            cell_counts: tier != 1,
            fake_cells: (9..=11).contains(&tier),
            cell_groups: tier >= 12,
            geoms: tier <= 4,
            prev_next: tier <= 5,
            signals: (6..=8).contains(&tier),
            inst_names: tier <= 3,
            seen_bits: tier <= 8,
            single_user_word: tier >= 7,
            net_numbers: (7..=8).contains(&tier),
        }
    }
}

/// # Program Version
/// Parsed from strings such as "6.03q", where the trailing letter is a detail level from 1 to 26
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ElibVersion {
    pub major: u32,
    pub minor: u32,
    pub detail: u32,
}
impl ElibVersion {
    pub const fn new(major: u32, minor: u32, detail: u32) -> Self {
        Self {
            major,
            minor,
            detail,
        }
    }
    /// Parse a version string. Unparseable portions are treated as zero.
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        let (major, rest) = split_digits(s);
        let rest = rest.strip_prefix('.').unwrap_or(rest);
        let (minor, rest) = split_digits(rest);
        let detail = match rest.chars().next() {
            Some(c) if c.is_ascii_lowercase() => c as u32 - 'a' as u32 + 1,
            _ => 0,
        };
        Self::new(major, minor, detail)
    }
}
/// Split a leading decimal number from `s`
fn split_digits(s: &str) -> (u32, &str) {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    (s[..end].parse().unwrap_or(0), &s[end..])
}

/// # Version-Dependent Conversion Flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VersionFlags {
    /// Old MOSIS CMOS technology names require conversion
    pub convert_mosis_cmos: bool,
    /// Text descriptors are stored as a single word
    pub convert_text_descriptors: bool,
    /// Every variable carries a text descriptor, displayable or not
    pub always_text_descriptors: bool,
    /// Lambda values are stored at one-twentieth of their current scale
    pub scale_lambda_by_20: bool,
    /// Node transpose words carry rotation and mirror bits
    pub rotation_mirror_bits: bool,
    /// Old view names require conversion
    pub convert_old_views: bool,
}
impl VersionFlags {
    pub fn new(v: &ElibVersion) -> Self {
        Self {
            convert_mosis_cmos: *v < ElibVersion::new(6, 3, 17),
            convert_text_descriptors: *v < ElibVersion::new(6, 4, 3),
            always_text_descriptors: *v >= ElibVersion::new(6, 5, 24),
            scale_lambda_by_20: v.major < 5,
            rotation_mirror_bits: *v >= ElibVersion::new(7, 1, 0),
            convert_old_views: v.major < 8,
        }
    }
}
