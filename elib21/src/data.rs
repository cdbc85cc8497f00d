//!
//! # Elib21 Data Model
//!

// Std-Lib Imports
use std::collections::{BTreeMap, HashSet};
use std::error::Error;
use std::io::Write;
use std::path::{Path, PathBuf};

// Crates.io
use chrono::{DateTime, TimeZone, Utc};
use derive_more::{Add, Sub};
use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, SlotMap};

// Workspace Imports
use elib21utils::SerdeFile;

// Local Imports
use crate::config::ReaderOptions;
use crate::read::ElibParser;
use crate::tech::{ArcProtoId, PrimNodeId, PrimPortId, TechId, TechRegistry};
use crate::write::ElibWriter;

new_key_type! {
    /// Keys for [Library] entries in a [Database]
    pub struct LibKey;
    /// Keys for [Cell] entries in a [Library]
    pub struct CellKey;
}

/// # Cell Reference
/// Globally identifies a [Cell] within a [Database], across libraries.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct CellRef {
    pub lib: LibKey,
    pub cell: CellKey,
}

/// # Point
/// Two-dimensional location, in database (lambda) units
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Add, Sub)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}
impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
    /// Apply an orientation: mirror first, then rotate by `rotation` tenths of a degree.
    pub fn orient(&self, rotation: i32, flip_x: bool, flip_y: bool) -> Self {
        let x = if flip_x { -self.x } else { self.x };
        let y = if flip_y { -self.y } else { self.y };
        match rotation.rem_euclid(3600) {
            0 => Self::new(x, y),
            900 => Self::new(-y, x),
            1800 => Self::new(-x, -y),
            2700 => Self::new(y, -x),
            r => {
                let (sin, cos) = (r as f64 / 10.0).to_radians().sin_cos();
                Self::new(x * cos - y * sin, x * sin + y * cos)
            }
        }
    }
}

/// # Rectangular Bounding Box
/// Points `p0` and `p1` represent opposite corners, `p0` generally the lower-left.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
pub struct BoundBox {
    pub p0: Point,
    pub p1: Point,
}
impl BoundBox {
    /// Create a [BoundBox] from two corners, in any order
    pub fn from_points(a: &Point, b: &Point) -> Self {
        Self {
            p0: Point::new(a.x.min(b.x), a.y.min(b.y)),
            p1: Point::new(a.x.max(b.x), a.y.max(b.y)),
        }
    }
    /// Create a [BoundBox] centered at `center`, of (absolute) size `width` by `height`
    pub fn centered(center: &Point, width: f64, height: f64) -> Self {
        let (dx, dy) = (width.abs() / 2.0, height.abs() / 2.0);
        Self::from_points(
            &Point::new(center.x - dx, center.y - dy),
            &Point::new(center.x + dx, center.y + dy),
        )
    }
    pub fn width(&self) -> f64 {
        self.p1.x - self.p0.x
    }
    pub fn height(&self) -> f64 {
        self.p1.y - self.p0.y
    }
    pub fn center(&self) -> Point {
        Point::new((self.p0.x + self.p1.x) / 2.0, (self.p0.y + self.p1.y) / 2.0)
    }
    /// Union with another [BoundBox]
    pub fn union(&self, other: &BoundBox) -> Self {
        Self {
            p0: Point::new(self.p0.x.min(other.p0.x), self.p0.y.min(other.p0.y)),
            p1: Point::new(self.p1.x.max(other.p1.x), self.p1.y.max(other.p1.y)),
        }
    }
    /// Bounding box of our four corners after [Point::orient], shifted by `offset`
    pub fn orient(&self, rotation: i32, flip_x: bool, flip_y: bool, offset: &Point) -> Self {
        let corners = [
            self.p0,
            self.p1,
            Point::new(self.p0.x, self.p1.y),
            Point::new(self.p1.x, self.p0.y),
        ];
        let mut pts = corners
            .iter()
            .map(|p| p.orient(rotation, flip_x, flip_y) + *offset);
        // Four corners are always present
        let first = pts.next().unwrap_or(*offset);
        pts.fold(Self::from_points(&first, &first), |bbox, p| {
            bbox.union(&Self::from_points(&p, &p))
        })
    }
}

/// # Text Descriptor
/// The two raw words describing how a piece of text is displayed.
/// Stored verbatim; interpretation belongs to editors.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct TextDescriptor(pub i32, pub i32);
impl TextDescriptor {
    /// Create from the two on-disk words. All-zero words mean "no descriptor".
    pub fn from_words(w0: i32, w1: i32) -> Option<Self> {
        match (w0, w1) {
            (0, 0) => None,
            _ => Some(Self(w0, w1)),
        }
    }
}

/// # View
/// The representation a [Cell] holds: layout, schematic, icon, and so on.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct View {
    /// Full name, e.g. "schematic"
    pub name: String,
    /// Abbreviation, as used in qualified cell names, e.g. "sch"
    pub abbreviation: String,
}
/// Built-in views, in the order of their fixed on-disk indices (-1, -2, ...)
const BUILTIN_VIEWS: [(&str, &str); 16] = [
    ("unknown", ""),
    ("layout", "lay"),
    ("schematic", "sch"),
    ("icon", "ic"),
    ("waveform", "wav"),
    ("layout.skeleton", "lay.sk"),
    ("VHDL", "vhdl"),
    ("netlist", "net"),
    ("documentation", "doc"),
    ("netlist.netlisp", "net.netlisp"),
    ("netlist.als", "net.als"),
    ("netlist.quisc", "net.quisc"),
    ("netlist.rsim", "net.rsim"),
    ("netlist.silos", "net.silos"),
    ("Verilog", "ver"),
    ("layout.compensated", "lay.comp"),
];
impl View {
    pub fn new(name: impl Into<String>, abbreviation: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            abbreviation: abbreviation.into(),
        }
    }
    /// Get the built-in view at on-disk index `index`, one of -1 through -16
    pub fn builtin(index: i32) -> Option<Self> {
        let idx = usize::try_from(-1 - index).ok()?;
        BUILTIN_VIEWS.get(idx).map(|(n, a)| Self::new(*n, *a))
    }
    /// Get the on-disk index of a built-in view, if `self` is one
    pub fn builtin_index(&self) -> Option<i32> {
        BUILTIN_VIEWS
            .iter()
            .position(|(n, _)| *n == self.name)
            .map(|i| -1 - i as i32)
    }
    /// Find a built-in view by full name
    pub fn from_name(name: &str) -> Option<Self> {
        BUILTIN_VIEWS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(n, a)| Self::new(*n, *a))
    }
    /// Find a built-in view by abbreviation
    pub fn from_abbreviation(abbr: &str) -> Option<Self> {
        BUILTIN_VIEWS
            .iter()
            .find(|(_, a)| *a == abbr)
            .map(|(n, a)| Self::new(*n, *a))
    }
    /// Convert the view names written by program versions before 8
    pub fn from_old_name(name: &str) -> Option<Self> {
        let new = match name {
            "compensated" => "layout.compensated",
            "skeleton" => "layout.skeleton",
            "simulation-snapshot" => "waveform",
            "netlist-netlisp-format" => "netlist.netlisp",
            "netlist-rsim-format" => "netlist.rsim",
            "netlist-silos-format" => "netlist.silos",
            "netlist-quisc-format" => "netlist.quisc",
            "netlist-als-format" => "netlist.als",
            _ => return None,
        };
        Self::from_name(new)
    }
    pub fn unknown() -> Self {
        Self::new("unknown", "")
    }
    pub fn layout() -> Self {
        Self::new("layout", "lay")
    }
    pub fn schematic() -> Self {
        Self::new("schematic", "sch")
    }
    pub fn icon() -> Self {
        Self::new("icon", "ic")
    }
}

/// # Qualified Cell Name
/// Parsed form of `name;version{view}`, where the version and view are optional.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellName {
    pub name: String,
    pub version: Option<i32>,
    pub view: Option<String>,
}
impl CellName {
    pub fn parse(s: &str) -> Self {
        let (rest, view) = match (s.rfind('{'), s.ends_with('}')) {
            (Some(open), true) => (&s[..open], Some(s[open + 1..s.len() - 1].to_string())),
            _ => (s, None),
        };
        let (name, version) = match rest.rfind(';') {
            Some(semi) => match rest[semi + 1..].parse::<i32>() {
                Ok(v) => (&rest[..semi], Some(v)),
                Err(_) => (rest, None),
            },
            None => (rest, None),
        };
        Self {
            name: name.to_string(),
            version,
            view,
        }
    }
}

/// Convert a number of seconds since the epoch, as stored on disk, to a date.
/// Zero means "unset".
pub(crate) fn date_from_secs(secs: i32) -> Option<DateTime<Utc>> {
    match secs {
        0 => None,
        s => Utc.timestamp_opt(s as i64, 0).single(),
    }
}
/// Inverse of [date_from_secs]
pub(crate) fn secs_from_date(date: &Option<DateTime<Utc>>) -> i32 {
    date.map(|d| d.timestamp() as i32).unwrap_or(0)
}

/// # Node Prototype
/// Either a technology primitive, or an instance of another [Cell]
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum NodeProto {
    Primitive(PrimNodeId),
    Cell(CellRef),
}

/// # Port-Instance Reference
/// A port on a node within the same [Cell], by local node index and port name
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct PortInstRef {
    pub node: usize,
    pub port: String,
}

/// # Node Instance
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct NodeInst {
    pub proto: NodeProto,
    pub name: Option<String>,
    pub name_descriptor: Option<TextDescriptor>,
    pub proto_descriptor: Option<TextDescriptor>,
    /// Anchor location. The center for primitives; the subcell origin for cell instances.
    pub anchor: Point,
    /// Width. Negative values indicate mirroring in x.
    pub width: f64,
    /// Height. Negative values indicate mirroring in y.
    pub height: f64,
    /// Rotation, in tenths of a degree
    pub rotation: i32,
    pub user_bits: i32,
    pub vars: Vec<Variable>,
    /// Variables on each port-instance, keyed by port name
    pub port_vars: BTreeMap<String, Vec<Variable>>,
}
impl NodeInst {
    /// Create a new [NodeInst] of prototype `proto`, with no mirroring or rotation
    pub fn new(proto: NodeProto, anchor: Point, width: f64, height: f64) -> Self {
        Self {
            proto,
            name: None,
            name_descriptor: None,
            proto_descriptor: None,
            anchor,
            width,
            height,
            rotation: 0,
            user_bits: 0,
            vars: Vec::new(),
            port_vars: BTreeMap::new(),
        }
    }
    pub fn flip_x(&self) -> bool {
        self.width < 0.0
    }
    pub fn flip_y(&self) -> bool {
        self.height < 0.0
    }
}

/// # Arc End
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ArcEnd {
    /// Local index of the connected [NodeInst]
    pub node: usize,
    /// Name of the connected port on that node
    pub port: String,
    pub location: Point,
}

/// # Arc Instance
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ArcInst {
    pub proto: ArcProtoId,
    pub name: Option<String>,
    pub name_descriptor: Option<TextDescriptor>,
    pub width: f64,
    pub tail: ArcEnd,
    pub head: ArcEnd,
    pub user_bits: i32,
    pub vars: Vec<Variable>,
}

/// # Export
/// A port of a [Cell], delegating to a port on one of its nodes
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Export {
    pub name: String,
    /// Delegate port. [None] when it could not be resolved.
    pub target: Option<PortInstRef>,
    pub descriptor: Option<TextDescriptor>,
    pub user_bits: i32,
    pub vars: Vec<Variable>,
}

/// # Cell
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Cell {
    pub name: String,
    pub view: View,
    pub version: i32,
    pub creation: Option<DateTime<Utc>>,
    pub revision: Option<DateTime<Utc>>,
    /// Cell-group number, unique within the [Library]
    pub group: usize,
    pub bounds: BoundBox,
    pub nodes: Vec<NodeInst>,
    pub arcs: Vec<ArcInst>,
    pub exports: Vec<Export>,
    pub user_bits: i32,
    pub vars: Vec<Variable>,
}
impl Cell {
    /// Create a new and empty [Cell]
    pub fn new(name: impl Into<String>, view: View) -> Self {
        Self {
            name: name.into(),
            view,
            version: 1,
            creation: None,
            revision: None,
            group: 0,
            bounds: BoundBox::default(),
            nodes: Vec::new(),
            arcs: Vec::new(),
            exports: Vec::new(),
            user_bits: 0,
            vars: Vec::new(),
        }
    }
    /// Qualified name, `name;version{view}`. Versions of one or less are omitted.
    pub fn qualified_name(&self) -> String {
        match self.version {
            v if v > 1 => format!("{};{}{{{}}}", self.name, v, self.view.abbreviation),
            _ => format!("{}{{{}}}", self.name, self.view.abbreviation),
        }
    }
    /// Find an [Export] by name
    pub fn export(&self, name: &str) -> Option<&Export> {
        self.exports.iter().find(|e| e.name == name)
    }
    /// Get a [Variable] by key
    pub fn var(&self, key: &str) -> Option<&Variable> {
        self.vars.iter().find(|v| v.key == key)
    }
}

/// # Instance Reference
/// Identifies a [NodeInst] or [ArcInst] by its cell and local index
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct InstRef {
    pub cell: CellRef,
    pub index: usize,
}

/// # Port-Prototype Reference
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub enum PortRef {
    Primitive(PrimPortId),
    Export { cell: CellRef, name: String },
}

/// # Variable Value
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub enum VarValue {
    /// Unresolvable reference, only present within arrays
    Null,
    Int(i32),
    Fract(f32),
    Float(f32),
    Double(f64),
    Short(i16),
    Byte(i8),
    Str(String),
    NodeInst(InstRef),
    ArcInst(InstRef),
    NodeProto(NodeProto),
    ArcProto(ArcProtoId),
    PortProto(PortRef),
    Technology(TechId),
    Tool(String),
    Library(String),
    Array(Vec<VarValue>),
}

/// # Variable
/// Typed, keyed attribute on a database object
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Variable {
    pub key: String,
    /// Type and flag bits, as stored on disk. See [crate::vars::vtype].
    pub flags: i32,
    pub descriptor: Option<TextDescriptor>,
    pub value: VarValue,
}
impl Variable {
    /// Create a new, non-displayed [Variable]
    pub fn new(key: impl Into<String>, value: VarValue) -> Self {
        let flags = crate::vars::type_bits(&value, 0);
        Self {
            key: key.into(),
            flags,
            descriptor: None,
            value,
        }
    }
    pub fn is_display(&self) -> bool {
        self.flags & crate::vars::vtype::VDISPLAY != 0
    }
}

/// # Library
/// A set of [Cell]s, and the settings they were stored with
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Library {
    pub name: String,
    /// Path of the file the library was read from, if any
    pub path: Option<PathBuf>,
    /// Version string of the program which wrote it
    pub version: String,
    pub user_bits: i32,
    pub cur_cell: Option<CellKey>,
    /// Lambda scale per technology name, in file units
    pub tech_scale: BTreeMap<String, f64>,
    pub cells: SlotMap<CellKey, Cell>,
    pub vars: Vec<Variable>,
    /// Variables stored on registry objects, keyed by `kind:name`, e.g. "tool:user"
    pub settings: BTreeMap<String, Vec<Variable>>,
    /// Set when the file's tool order did not match the registry's
    pub tool_bits_messed: bool,
}
// [SlotMap] has no equality of its own. Cells compare by key and content, in slot order.
impl PartialEq for Library {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.path == other.path
            && self.version == other.version
            && self.user_bits == other.user_bits
            && self.cur_cell == other.cur_cell
            && self.tech_scale == other.tech_scale
            && self.cells.iter().eq(other.cells.iter())
            && self.vars == other.vars
            && self.settings == other.settings
            && self.tool_bits_messed == other.tool_bits_messed
    }
}
impl Library {
    /// Create a new and empty [Library]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
    /// Find a [Cell] by qualified name, `name;version{view}`.
    /// With no version given, the highest version of `name{view}` is returned.
    pub fn find_cell(&self, qualified_name: &str) -> Option<CellKey> {
        let want = CellName::parse(qualified_name);
        self.cells
            .iter()
            .filter(|(_, c)| c.name == want.name)
            .filter(|(_, c)| match &want.view {
                Some(abbr) => c.view.abbreviation == *abbr,
                None => true,
            })
            .filter(|(_, c)| match want.version {
                Some(v) => c.version == v,
                None => true,
            })
            .max_by_key(|(_, c)| c.version)
            .map(|(k, _)| k)
    }
    /// Lambda scale of technology `tech`. Defaults to one.
    pub fn lambda(&self, tech: &str) -> f64 {
        self.tech_scale.get(tech).copied().unwrap_or(1.0)
    }
    /// Collect statistics
    pub fn stats(&self) -> ElibStats {
        let mut stats = ElibStats {
            libvars: self.vars.len(),
            ..Default::default()
        };
        for cell in self.cells.values() {
            stats.cells += 1;
            stats.nodes += cell.nodes.len();
            stats.arcs += cell.arcs.len();
            stats.exports += cell.exports.len();
            stats.vars += cell.vars.len();
            stats.vars += cell.nodes.iter().map(|n| n.vars.len()).sum::<usize>();
            stats.vars += cell.arcs.iter().map(|a| a.vars.len()).sum::<usize>();
            stats.vars += cell.exports.iter().map(|e| e.vars.len()).sum::<usize>();
        }
        stats
    }
}
impl SerdeFile for Library {}

/// # Elib Library Statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ElibStats {
    pub libvars: usize,
    pub cells: usize,
    pub nodes: usize,
    pub arcs: usize,
    pub exports: usize,
    pub vars: usize,
}

/// # Database
/// The technology registry, plus every loaded [Library]
#[derive(Debug, Default)]
pub struct Database {
    pub registry: TechRegistry,
    pub libs: SlotMap<LibKey, Library>,
    /// Libraries currently being read, for cycle avoidance
    loading: HashSet<LibKey>,
}
impl Database {
    /// Create a new and empty [Database] around technology registry `registry`
    pub fn new(registry: TechRegistry) -> Self {
        Self {
            registry,
            libs: SlotMap::with_key(),
            loading: HashSet::new(),
        }
    }
    /// Read an ELIB file at path `fname`
    pub fn read_library(
        &mut self,
        fname: impl AsRef<Path>,
        opts: &ReaderOptions,
    ) -> ElibResult<ReadReport> {
        ElibParser::open(fname, self, opts)?.parse()
    }
    /// Read ELIB `bytes` into a new [Library] named `name`
    pub fn read_bytes(
        &mut self,
        name: impl Into<String>,
        bytes: &[u8],
        opts: &ReaderOptions,
    ) -> ElibResult<ReadReport> {
        ElibParser::from_bytes(bytes.to_vec(), name, self, opts)?.parse()
    }
    /// Write [Library] `lib` to `dest`
    pub fn write_library(&self, lib: LibKey, dest: impl Write) -> ElibResult<()> {
        let mut wr = ElibWriter::new(dest);
        wr.write_lib(self, lib)
    }
    /// Save [Library] `lib` to file `fname`
    pub fn save_library(&self, lib: LibKey, fname: impl AsRef<Path>) -> ElibResult<()> {
        let mut wr = ElibWriter::open(fname)?;
        wr.write_lib(self, lib)
    }
    /// Find a loaded [Library] by name
    pub fn find_library(&self, name: &str) -> Option<LibKey> {
        self.libs
            .iter()
            .find(|(_, lib)| lib.name == name)
            .map(|(k, _)| k)
    }
    /// Get a [Cell] by reference
    pub fn cell(&self, cref: &CellRef) -> Option<&Cell> {
        self.libs.get(cref.lib)?.cells.get(cref.cell)
    }
    /// Boolean indication of whether `lib` is mid-read
    pub fn is_loading(&self, lib: LibKey) -> bool {
        self.loading.contains(&lib)
    }
    pub(crate) fn begin_load(&mut self, lib: Library) -> LibKey {
        let key = self.libs.insert(lib);
        self.loading.insert(key);
        key
    }
    /// Finish loading `lib`. Failed loads are removed entirely.
    pub(crate) fn end_load(&mut self, lib: LibKey, success: bool) {
        self.loading.remove(&lib);
        if !success {
            self.libs.remove(lib);
        }
    }
}

/// # Diagnostic Kinds
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// Unresolved index or name, substituted or dropped
    Reference,
    /// Declared and actual object counts disagree
    Count,
    /// Informational, e.g. a changed external cell
    Warning,
}
/// # Read Diagnostic
/// Non-fatal problem found while reading
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub msg: String,
}

/// # Read Report
/// Results of a successful read
#[derive(Debug, Clone)]
pub struct ReadReport {
    /// The newly loaded [Library]
    pub lib: LibKey,
    pub diagnostics: Vec<Diagnostic>,
    /// Number of values clipped while narrowing from wider on-disk integers
    pub clipped: usize,
    /// Number of bytes read
    pub bytes: u64,
}

/// # Elib Context
/// Enumeration of each context in which data can be decoded, primarily for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElibContext {
    Library,
    Header,
    Technology,
    Tool,
    NameSpace,
    Variable,
    Cell,
    ExternalCell,
    Export,
    Geometry,
    NodeInst,
    ArcInst,
    Build,
}

/// # ElibResult Type-Alias
pub type ElibResult<T> = Result<T, ElibError>;

/// # Elib Error Enumeration
#[derive(Debug)]
pub enum ElibError {
    /// Stream does not begin with any known magic number
    BadMagic([u8; 4]),
    /// Structurally invalid content
    Format {
        msg: String,
        bytepos: u64,
        ctx: Vec<ElibContext>,
    },
    /// Stream ended mid-record
    Truncated { bytepos: u64, ctx: Vec<ElibContext> },
    /// Unsupported feature
    Unsupported(String),
    /// Boxed (External) Errors
    Boxed(Box<dyn Error + Send + Sync>),
    /// Other errors
    Str(String),
}
impl ElibError {
    /// Boolean indication of a format-level failure, including bad magic numbers
    pub fn is_format(&self) -> bool {
        matches!(self, ElibError::BadMagic(_) | ElibError::Format { .. })
    }
    /// Attach context-stack `ctx` to positional errors which do not yet have one
    pub(crate) fn with_ctx(self, stack: &[ElibContext]) -> Self {
        match self {
            ElibError::Format { msg, bytepos, ctx } if ctx.is_empty() => ElibError::Format {
                msg,
                bytepos,
                ctx: stack.to_vec(),
            },
            ElibError::Truncated { bytepos, ctx } if ctx.is_empty() => ElibError::Truncated {
                bytepos,
                ctx: stack.to_vec(),
            },
            e => e,
        }
    }
}
impl std::fmt::Display for ElibError {
    /// Display an [ElibError].
    /// This functionally delegates to the (derived) [std::fmt::Debug] implementation.
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
impl std::error::Error for ElibError {}
impl From<std::io::Error> for ElibError {
    fn from(e: std::io::Error) -> Self {
        Self::Boxed(Box::new(e))
    }
}
impl From<String> for ElibError {
    fn from(e: String) -> Self {
        ElibError::Str(e)
    }
}
impl From<&str> for ElibError {
    fn from(e: &str) -> Self {
        ElibError::Str(e.to_string())
    }
}
impl From<elib21utils::ser::Error> for ElibError {
    fn from(e: elib21utils::ser::Error) -> Self {
        Self::Boxed(Box::new(e))
    }
}
impl From<crate::config::ReaderOptionsBuilderError> for ElibError {
    fn from(e: crate::config::ReaderOptionsBuilderError) -> Self {
        Self::Boxed(Box::new(e))
    }
}

/// Write [Library] `lib` of `db` to bytes, read them back into a fresh [Database],
/// and check that the two versions of each [Cell] line up.
/// Returns the new [Database].
#[cfg(any(test, feature = "selftest"))]
pub fn roundtrip(db: &Database, lib: LibKey) -> ElibResult<Database> {
    use std::io::{Read, Seek, SeekFrom};
    use tempfile::tempfile;

    // Write to a temporary file
    let mut file = tempfile()?;
    db.write_library(lib, &mut file)?;

    // Rewind to the file-start, and read it back
    file.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    let orig = &db.libs[lib];
    let mut db2 = Database::new(db.registry.clone());
    let report = db2.read_bytes(orig.name.clone(), &bytes, &ReaderOptions::default())?;

    // And check the two line up
    let lib2 = &db2.libs[report.lib];
    let cells: Vec<&Cell> = orig.cells.values().collect();
    let cells2: Vec<&Cell> = lib2.cells.values().collect();
    assert_eq!(cells, cells2);
    assert_eq!(orig.vars, lib2.vars);
    assert_eq!(orig.tech_scale, lib2.tech_scale);
    Ok(db2)
}
