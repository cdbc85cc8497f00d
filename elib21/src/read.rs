//!
//! # Elib Parser
//!
//! Reading happens in two passes.
//! The first, here, decodes every record into per-kind arenas of raw records,
//! indexed by their global on-disk indices, and resolves references to other libraries.
//! The second, in [crate::build], converts the raw records into [Cell] contents.
//!

// Std-Lib Imports
use std::collections::HashMap;
use std::path::{Path, PathBuf};

// Crates.io
use log::{debug, error, info, trace, warn};

// Workspace Imports
use elib21utils::ErrorHelper;

// Local Imports
use crate::alloc::{arena, CellCounts, HeaderCounts, ObjectTables};
use crate::codec::ElibReader;
use crate::config::{LibraryPrompt, NoProgress, ProgressSink, ReaderOptions};
use crate::data::*;
use crate::header::{Capabilities, DecodeContext, ElibVersion, Endian, Magic, VersionFlags};
use crate::resolve::{soft_error, ProtoResolver};
use crate::tech::ArcProtoId;
use crate::vars::{read_vars, vtype, RawVariable};

/// Version string implied by files which predate stored version strings
const PRE_VERSION: &str = "3.35";

/// Cell header fields not held by [Cell] itself
#[derive(Debug, Clone, Default)]
pub(crate) struct RawCell {
    /// Stored bounds, in file units: lx, hx, ly, hy
    pub bbox: [i32; 4],
    /// File index of the next cell in our group
    pub group_next: Option<usize>,
    pub vars: Vec<RawVariable>,
}
/// Cell defined in another library
#[derive(Debug, Clone, Default)]
pub(crate) struct RawExternal {
    pub name: String,
    pub view: View,
    pub version: i32,
    pub creation: i32,
    pub revision: i32,
    /// Stored bounds, in the referencing file's units: lx, hx, ly, hy
    pub bbox: [i32; 4],
    /// Library path, as stored
    pub path: String,
    pub export_names: Vec<String>,
}
impl RawExternal {
    pub fn qualified_name(&self) -> String {
        match self.version {
            v if v > 1 => format!("{};{}{{{}}}", self.name, v, self.view.abbreviation),
            _ => format!("{}{{{}}}", self.name, self.view.abbreviation),
        }
    }
}
#[derive(Debug, Clone)]
pub(crate) struct RawExport {
    /// Global index of the node it resides on, if valid
    pub node: Option<usize>,
    pub port: i32,
    pub name: String,
    pub descriptor: Option<TextDescriptor>,
    pub user_bits: i32,
    pub vars: Vec<RawVariable>,
}
#[derive(Debug, Clone)]
pub(crate) struct RawNode {
    pub proto: NodeProto,
    /// Stored box, in file units: lx, ly, hx, hy
    pub bbox: [i32; 4],
    pub transpose: i32,
    pub rotation: i32,
    pub proto_descriptor: Option<TextDescriptor>,
    pub name: Option<String>,
    pub name_descriptor: Option<TextDescriptor>,
    pub user_bits: i32,
    pub vars: Vec<RawVariable>,
}
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawEnd {
    pub x: i32,
    pub y: i32,
    /// Global node index, if valid
    pub node: Option<usize>,
}
#[derive(Debug, Clone)]
pub(crate) struct RawArc {
    pub proto: ArcProtoId,
    pub width: i32,
    pub name: Option<String>,
    pub name_descriptor: Option<TextDescriptor>,
    /// Tail, then head
    pub ends: [RawEnd; 2],
    pub user_bits: i32,
    pub vars: Vec<RawVariable>,
}

/// # Elib Parser
/// Reads one library into a [Database], loading any libraries it references along the way.
pub struct ElibParser<'db> {
    /// File being read
    pub(crate) rdr: ElibReader,
    pub(crate) db: &'db mut Database,
    pub(crate) opts: ReaderOptions,
    /// Context Stack
    pub(crate) ctx_stack: Vec<ElibContext>,
    pub(crate) diagnostics: Vec<Diagnostic>,
    pub(crate) prompt: Option<Box<dyn LibraryPrompt>>,
    progress: Box<dyn ProgressSink>,
    last_percent: u8,
    lib_name: String,
    pub(crate) path: Option<PathBuf>,
    /// Key of the library being read. Set once reading begins.
    pub(crate) lib: LibKey,
    pub(crate) dctx: DecodeContext,
    pub(crate) flags: VersionFlags,
    pub(crate) tables: ObjectTables,
    pub(crate) protos: ProtoResolver,
    /// Variable-name table
    pub(crate) names: Vec<String>,
    /// Views declared by the file, by on-disk index
    views: HashMap<i32, View>,
    /// Number of user-bit words per object, in files which store one per tool
    tool_bits: usize,
    fake_names: Vec<String>,
    /// Raw record arenas, by global index
    pub(crate) cells: Vec<Option<RawCell>>,
    pub(crate) externals: Vec<Option<RawExternal>>,
    pub(crate) nodes: Vec<Option<RawNode>>,
    pub(crate) arcs: Vec<Option<RawArc>>,
    pub(crate) exports: Vec<Option<RawExport>>,
    /// Export names by global index, for local and external cells alike
    pub(crate) export_names: Vec<Option<String>>,
    /// Port index at each arc's tail and head, as listed by their nodes
    pub(crate) arc_ports: Vec<[Option<i32>; 2]>,
    /// Database cell of each file cell index
    pub(crate) cell_refs: Vec<Option<CellRef>>,
    /// Referenced libraries already searched for, by name
    pub(crate) ext_libs: HashMap<String, Option<LibKey>>,
}
impl<'db> ElibParser<'db> {
    /// Create a parser for the file at path `fname`
    pub fn open(
        fname: impl AsRef<Path>,
        db: &'db mut Database,
        opts: &ReaderOptions,
    ) -> ElibResult<Self> {
        let path = fname.as_ref();
        let rdr = ElibReader::open(path)?;
        let name = library_name(path);
        let mut me = Self::new(rdr, name, db, opts);
        me.path = Some(path.to_path_buf());
        Ok(me)
    }
    /// Create a parser for in-memory `bytes`, which will be named `name`
    pub fn from_bytes(
        bytes: Vec<u8>,
        name: impl Into<String>,
        db: &'db mut Database,
        opts: &ReaderOptions,
    ) -> ElibResult<Self> {
        Ok(Self::new(ElibReader::from_bytes(bytes), name.into(), db, opts))
    }
    fn new(rdr: ElibReader, lib_name: String, db: &'db mut Database, opts: &ReaderOptions) -> Self {
        Self {
            rdr,
            db,
            opts: opts.clone(),
            ctx_stack: Vec::new(),
            diagnostics: Vec::new(),
            prompt: None,
            progress: Box::new(NoProgress),
            last_percent: 0,
            lib_name,
            path: None,
            lib: LibKey::default(),
            dctx: DecodeContext::new(Magic::Magic12, Endian::Big),
            flags: VersionFlags::default(),
            tables: ObjectTables::default(),
            protos: ProtoResolver::new(),
            names: Vec::new(),
            views: HashMap::new(),
            tool_bits: 0,
            fake_names: Vec::new(),
            cells: Vec::new(),
            externals: Vec::new(),
            nodes: Vec::new(),
            arcs: Vec::new(),
            exports: Vec::new(),
            export_names: Vec::new(),
            arc_ports: Vec::new(),
            cell_refs: Vec::new(),
            ext_libs: HashMap::new(),
        }
    }
    /// Report progress to `sink`
    pub fn with_progress(mut self, sink: Box<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }
    /// Ask `prompt` for referenced libraries which cannot otherwise be found
    pub fn with_prompt(mut self, prompt: Box<dyn LibraryPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }
    /// Parse the library. On failure the partially-read library is removed from the [Database].
    pub fn parse(mut self) -> ElibResult<ReadReport> {
        self.run()
    }
    /// Parse, leaving `self` available for its prompt to be reclaimed
    pub(crate) fn run(&mut self) -> ElibResult<ReadReport> {
        let mut lib = Library::new(self.lib_name.clone());
        lib.path = self.path.clone();
        self.lib = self.db.begin_load(lib);
        info!("Reading library {}", self.lib_name);
        match self.parse_lib() {
            Ok(()) => {
                self.db.end_load(self.lib, true);
                self.progress.progress(100);
                debug!(
                    "Read library {}: {} bytes, {} diagnostics",
                    self.lib_name,
                    self.rdr.pos(),
                    self.diagnostics.len()
                );
                Ok(ReadReport {
                    lib: self.lib,
                    diagnostics: std::mem::take(&mut self.diagnostics),
                    clipped: self.rdr.clipped,
                    bytes: self.rdr.pos(),
                })
            }
            Err(e) => {
                let e = e.with_ctx(&self.ctx_stack);
                error!("Failed reading library {}: {}", self.lib_name, e);
                self.db.end_load(self.lib, false);
                Err(e)
            }
        }
    }
    /// Parse the entire stream
    fn parse_lib(&mut self) -> ElibResult<()> {
        self.ctx_stack.push(ElibContext::Library);
        self.ctx_stack.push(ElibContext::Header);
        self.dctx = self.rdr.read_header()?;
        debug!(
            "Format revision {} ({:?}), integer widths {}/{}",
            self.dctx.magic.tier(),
            self.dctx.endian,
            self.dctx.small_size,
            self.dctx.big_size
        );
        let (counts, fake_count, cur_cell) = self.read_counts()?;
        self.read_cell_table(counts)?;
        self.ctx_stack.pop();

        self.read_techs()?;
        self.read_tools()?;
        let user_bits = self.read_user_bits(false)?;
        let scales = self.read_lambdas()?;
        {
            let lib = &mut self.db.libs[self.lib];
            lib.user_bits = user_bits;
            lib.tech_scale = scales;
            lib.tool_bits_messed = self.protos.tool_bits_messed;
        }
        self.read_names()?;
        let settings = self.read_object_vars()?;
        self.read_fake_cells(fake_count)?;

        self.progress.note("cells");
        for cell in 0..self.tables.num_cells() {
            if !self.tables.is_external(cell) {
                self.read_cell(cell)?;
            }
        }
        self.assign_groups();
        for cell in 0..self.tables.num_cells() {
            if self.tables.is_external(cell) {
                self.read_external(cell)?;
            }
        }
        let cur = usize::try_from(cur_cell)
            .ok()
            .filter(|c| !self.tables.is_external(*c))
            .and_then(|c| self.cell_refs.get(c).copied().flatten());
        self.db.libs[self.lib].cur_cell = cur.map(|c| c.cell);

        // Library-level variables can now refer to any cell
        let (lib_vars, settings) = settings;
        let lib_vars = self.fix_vars(lib_vars);
        let mut fixed = Vec::new();
        for (key, raw) in settings {
            let vars = self.fix_vars(raw);
            if !vars.is_empty() {
                fixed.push((key, vars));
            }
        }
        let lib = &mut self.db.libs[self.lib];
        lib.vars = lib_vars;
        lib.settings.extend(fixed);

        self.progress.note("contents");
        self.read_contents()?;
        self.ctx_stack.pop();
        self.build()
    }
    /// Read the object counts, the current cell, the version, and any extra views.
    /// Returns the header counts, the number of "fake" cells, and the current-cell index.
    fn read_counts(&mut self) -> ElibResult<(HeaderCounts, usize, i32)> {
        let caps = self.dctx.caps;
        let mut counts = HeaderCounts::default();
        for (what, dest) in [
            ("tool", &mut counts.tools),
            ("technology", &mut counts.techs),
            ("primitive node", &mut counts.prim_nodes),
            ("primitive port", &mut counts.prim_ports),
            ("arc prototype", &mut counts.arc_protos),
            ("cell", &mut counts.cells),
            ("node", &mut counts.nodes),
            ("export", &mut counts.exports),
            ("arc", &mut counts.arcs),
            ("geometry", &mut counts.geoms),
        ] {
            *dest = read_count(&mut self.rdr, what)?;
        }
        let fake_count = match caps.cell_count {
            true => read_count(&mut self.rdr, "cell")?,
            false => 0,
        };
        let cur_cell = self.rdr.read_big()?;
        let version = match caps.version_string {
            true => self.rdr.read_string()?,
            false => PRE_VERSION.to_string(),
        };
        self.flags = VersionFlags::new(&ElibVersion::parse(&version));
        debug!("Written by version {}: {:?}", version, counts);
        self.db.libs[self.lib].version = version;

        if caps.views {
            let num = self.rdr.read_big()?;
            for i in 0..num.max(0) {
                let name = self.rdr.read_string()?;
                let abbr = self.rdr.read_string()?;
                let view = match View::from_name(&name) {
                    Some(v) => v,
                    None if self.flags.convert_old_views => {
                        View::from_old_name(&name).unwrap_or_else(|| View::new(name, abbr))
                    }
                    None => View::new(name, abbr),
                };
                self.views.insert(i + 1, view);
            }
        }
        self.tool_bits = match caps.tool_bit_count {
            true => self.rdr.read_big()?.max(0) as usize,
            false => counts.tools,
        };
        Ok((counts, fake_count, cur_cell))
    }
    /// Read the per-cell object counts, and size our arenas from them
    fn read_cell_table(&mut self, counts: HeaderCounts) -> ElibResult<()> {
        let tables = match self.dctx.caps.cell_counts {
            true => {
                let mut per_cell = Vec::with_capacity(counts.cells);
                for _ in 0..counts.cells {
                    let arcs = self.rdr.read_big()?;
                    let nodes = self.rdr.read_big()?;
                    let exports = self.rdr.read_big()?;
                    per_cell.push(CellCounts {
                        arcs,
                        nodes,
                        exports,
                    });
                }
                ObjectTables::new(counts, &per_cell)
            }
            false => ObjectTables::single_cell(counts),
        };
        self.tables = match tables {
            Ok(t) => t,
            Err(e) => return self.fail(e),
        };
        self.cells = arena(counts.cells);
        self.externals = arena(counts.cells);
        self.cell_refs = vec![None; counts.cells];
        self.nodes = arena(counts.nodes);
        self.arcs = arena(counts.arcs);
        self.exports = arena(counts.exports);
        self.export_names = arena(counts.exports);
        self.arc_ports = vec![[None, None]; counts.arcs];
        Ok(())
    }
    /// Read the technology table, and its primitives, ports and arcs
    fn read_techs(&mut self) -> ElibResult<()> {
        self.ctx_stack.push(ElibContext::Technology);
        let counts = self.tables.counts;
        for _ in 0..counts.techs {
            let name = self.rdr.read_string()?;
            let tech = self
                .protos
                .add_tech(&self.db.registry, &name, self.flags.convert_mosis_cmos);
            let tech = match tech {
                Ok(t) => t,
                Err(e) => return self.fail(e),
            };
            let num_nodes = self.rdr.read_big()?;
            for _ in 0..num_nodes.max(0) {
                let name = self.rdr.read_string()?;
                let node = match self.protos.add_node(&self.db.registry, tech, &name) {
                    Ok(n) => n,
                    Err(e) => return self.fail(e),
                };
                let num_ports = self.rdr.read_big()?;
                for _ in 0..num_ports.max(0) {
                    let name = self.rdr.read_string()?;
                    if let Err(e) = self.protos.add_port(&self.db.registry, node, &name) {
                        return self.fail(e);
                    }
                }
            }
            let num_arcs = self.rdr.read_big()?;
            for _ in 0..num_arcs.max(0) {
                let name = self.rdr.read_string()?;
                if let Err(e) = self.protos.add_arc(&self.db.registry, tech, &name) {
                    return self.fail(e);
                }
            }
        }
        for (what, declared, actual) in [
            ("primitive nodes", counts.prim_nodes, self.protos.num_nodes()),
            ("primitive ports", counts.prim_ports, self.protos.num_ports()),
            ("arc prototypes", counts.arc_protos, self.protos.num_arcs()),
        ] {
            if declared != actual {
                self.count_mismatch(format!(
                    "Header declares {} {}, technologies list {}",
                    declared, what, actual
                ));
            }
        }
        self.ctx_stack.pop();
        Ok(())
    }
    /// Read the tool table
    fn read_tools(&mut self) -> ElibResult<()> {
        self.ctx_stack.push(ElibContext::Tool);
        for _ in 0..self.tables.counts.tools {
            let name = self.rdr.read_string()?;
            self.protos.add_tool(&self.db.registry, &name);
        }
        if self.dctx.caps.tool_bit_count {
            // Names of the tools owning each user-bit word. Positional; ignored.
            for _ in 0..self.tool_bits {
                self.rdr.read_string()?;
            }
        }
        self.ctx_stack.pop();
        Ok(())
    }
    /// Read the per-technology lambda values, keyed by registry technology name
    fn read_lambdas(&mut self) -> ElibResult<std::collections::BTreeMap<String, f64>> {
        let mut scales = std::collections::BTreeMap::new();
        for i in 0..self.protos.num_techs() {
            let mut lambda = self.rdr.read_big()?;
            if !self.protos.tech_ok(i) {
                continue;
            }
            if self.flags.scale_lambda_by_20 {
                lambda = lambda.saturating_mul(20);
            }
            if lambda <= 0 {
                continue;
            }
            if let Some(t) = self.protos.tech(i, &mut self.diagnostics) {
                let name = self.db.registry.tech(t).name.clone();
                scales.insert(name, lambda as f64);
            }
        }
        Ok(scales)
    }
    /// Read the variable-name table
    fn read_names(&mut self) -> ElibResult<()> {
        self.ctx_stack.push(ElibContext::NameSpace);
        let num = read_count(&mut self.rdr, "variable name")?;
        self.names = Vec::with_capacity(num);
        for _ in 0..num {
            let name = self.rdr.read_string()?;
            self.names.push(name);
        }
        trace!("{} variable names", num);
        self.ctx_stack.pop();
        Ok(())
    }
    /// Read the variables of the library, tools, technologies, primitives, and views.
    /// Returns the (raw) library variables, and those kept as settings.
    #[allow(clippy::type_complexity)]
    fn read_object_vars(
        &mut self,
    ) -> ElibResult<(Vec<RawVariable>, Vec<(String, Vec<RawVariable>)>)> {
        let lib_vars = self.read_vars()?;
        let mut settings = Vec::new();
        for i in 0..self.protos.num_tools() {
            let vars = self.read_vars()?;
            let tool = self.protos.tool(i, &mut self.diagnostics);
            if let Some(t) = tool.and_then(|t| self.db.registry.tools.get(t)) {
                if !vars.is_empty() {
                    settings.push((format!("tool:{}", t.name), vars));
                }
            }
        }
        for i in 0..self.protos.num_techs() {
            let vars = self.read_vars()?;
            if !self.protos.tech_ok(i) || vars.is_empty() {
                continue;
            }
            if let Some(t) = self.protos.tech(i, &mut self.diagnostics) {
                let name = &self.db.registry.tech(t).name;
                settings.push((format!("tech:{}", name), vars));
            }
        }
        // Arc-prototype, primitive-node and primitive-port variables are parsed and dropped
        let skip = self.protos.num_arcs() + self.protos.num_nodes() + self.protos.num_ports();
        for _ in 0..skip {
            self.read_vars()?;
        }
        if self.dctx.caps.views {
            let num = self.rdr.read_big()?;
            for _ in 0..num.max(0) {
                let idx = self.rdr.read_big()?;
                if !self.views.contains_key(&idx) && View::builtin(idx).is_none() {
                    warn!("Variables on unknown view {}", idx);
                }
                self.read_vars()?;
            }
        }
        Ok((lib_vars, settings))
    }
    /// Read the names of "fake" cells, which hold shared names in revisions 9 through 11
    fn read_fake_cells(&mut self, num: usize) -> ElibResult<()> {
        if !self.dctx.caps.fake_cells {
            return Ok(());
        }
        for _ in 0..num {
            let name = self.rdr.read_string()?;
            let name = self.cell_name(name);
            self.read_vars()?;
            self.fake_names.push(name);
        }
        Ok(())
    }
    /// Get the cell name at fake-cell index `idx`
    pub(crate) fn fake_name(&self, idx: i32) -> ElibResult<String> {
        let i = self.index(idx, self.fake_names.len(), "cell name")?;
        Ok(self.fake_names[i].clone())
    }
    /// Read the local cell at file index `idx`.
    /// The [Cell] is inserted into our library immediately, so that it can be referred to,
    /// but its contents are not filled in until [ElibParser::build].
    fn read_cell(&mut self, idx: usize) -> ElibResult<()> {
        self.ctx_stack.push(ElibContext::Cell);
        let caps = self.dctx.caps;
        let mut raw = RawCell::default();
        let mut cell = match caps.views {
            true => {
                let name = match caps.fake_cells {
                    true => {
                        let k = self.rdr.read_big()?;
                        self.fake_name(k)?
                    }
                    false => {
                        let name = self.rdr.read_string()?;
                        let next = self.rdr.read_big()?;
                        let _next_cont = self.rdr.read_big()?;
                        raw.group_next = match next {
                            -1 => Some(idx),
                            n => usize::try_from(n).ok(),
                        };
                        self.cell_name(name)
                    }
                };
                let view = self.rdr.read_big()?;
                let view = self.view(view);
                let mut cell = Cell::new(name, view);
                cell.version = self.rdr.read_big()?;
                cell.creation = date_from_secs(self.rdr.read_big()?);
                cell.revision = date_from_secs(self.rdr.read_big()?);
                cell
            }
            false => {
                let s = self.rdr.read_string()?;
                let parsed = CellName::parse(&s);
                let view = parsed
                    .view
                    .as_deref()
                    .and_then(View::from_abbreviation)
                    .unwrap_or_else(View::unknown);
                let mut cell = Cell::new(self.cell_name(parsed.name), view);
                cell.version = parsed.version.unwrap_or(1);
                cell
            }
        };
        trace!("Cell {} ({})", cell.qualified_name(), idx);
        raw.bbox = self.read_ints::<4>()?;
        if caps.prev_next {
            self.read_ints::<2>()?;
        }

        let range = self.tables.exports(idx);
        let num = self.rdr.read_big()?;
        if num as i64 != range.len() as i64 {
            self.count_mismatch(format!(
                "Cell {} lists {} exports, table declares {}",
                cell.qualified_name(),
                num,
                range.len()
            ));
        }
        for j in 0..num.max(0) as usize {
            let export = self.read_export()?;
            let global = range.start + j;
            if global < range.end {
                self.export_names[global] = Some(export.name.clone());
                self.exports[global] = Some(export);
            }
        }
        if caps.geoms {
            self.read_ints::<5>()?;
        }
        let _dirty = self.rdr.read_big()?;
        cell.user_bits = self.read_user_bits(true)?;
        raw.vars = self.read_vars()?;

        let key = self.db.libs[self.lib].cells.insert(cell);
        self.cell_refs[idx] = Some(CellRef {
            lib: self.lib,
            cell: key,
        });
        self.cells[idx] = Some(raw);
        self.tick();
        self.ctx_stack.pop();
        Ok(())
    }
    /// Read an export record
    fn read_export(&mut self) -> ElibResult<RawExport> {
        self.ctx_stack.push(ElibContext::Export);
        let stored = self.rdr.read_big()?;
        let node = usize::try_from(stored)
            .ok()
            .filter(|n| *n < self.tables.counts.nodes);
        let port = self.rdr.read_big()?;
        let name = self.rdr.read_string()?;
        // Exports stored without a node are dangling, and not an error
        if node.is_none() && stored != -1 {
            let msg = format!("Cannot find the node on which export {} resides", name);
            soft_error(&mut self.diagnostics, msg);
        }
        let descriptor = self.read_descriptor()?;
        if self.dctx.caps.seen_bits {
            self.rdr.read_big()?;
        }
        let user_bits = self.read_user_bits(true)?;
        let vars = self.read_vars()?;
        self.ctx_stack.pop();
        Ok(RawExport {
            node,
            port,
            name,
            descriptor,
            user_bits,
            vars,
        })
    }
    /// Assign group numbers to our local cells.
    /// Files with group links are grouped by those links, older files by cell name.
    /// Numbers are assigned in order of each group's first cell.
    fn assign_groups(&mut self) {
        let n = self.cells.len();
        let mut parent: Vec<usize> = (0..n).collect();
        fn find(parent: &mut [usize], mut i: usize) -> usize {
            while parent[i] != i {
                parent[i] = parent[parent[i]];
                i = parent[i];
            }
            i
        }
        let locals: Vec<usize> = (0..n).filter(|i| self.cells[*i].is_some()).collect();
        if self.dctx.caps.cell_groups {
            for &i in locals.iter() {
                let next = self.cells[i].as_ref().and_then(|c| c.group_next);
                if let Some(j) = next.filter(|j| *j < n && self.cells[*j].is_some()) {
                    let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                    parent[a.max(b)] = a.min(b);
                }
            }
        } else {
            let mut by_name: HashMap<String, usize> = HashMap::new();
            for &i in locals.iter() {
                let cref = match self.cell_refs[i] {
                    Some(c) => c,
                    None => continue,
                };
                let name = self.db.libs[self.lib].cells[cref.cell].name.clone();
                match by_name.get(&name) {
                    Some(&first) => parent[i] = first,
                    None => {
                        by_name.insert(name, i);
                    }
                }
            }
        }
        let mut numbers: HashMap<usize, usize> = HashMap::new();
        for &i in locals.iter() {
            let root = find(&mut parent, i);
            let next = numbers.len();
            let group = *numbers.entry(root).or_insert(next);
            if let Some(cref) = self.cell_refs[i] {
                self.db.libs[self.lib].cells[cref.cell].group = group;
            }
        }
    }
    /// Read the node and arc records of every cell
    fn read_contents(&mut self) -> ElibResult<()> {
        if self.dctx.caps.geoms {
            return self.read_geom_chains();
        }
        for cell in 0..self.tables.num_cells() {
            if self.tables.is_external(cell) {
                continue;
            }
            for arc in self.tables.arcs(cell) {
                let a = self.read_arc()?;
                self.arcs[arc] = Some(a);
            }
            for node in self.tables.nodes(cell) {
                let n = self.read_node()?;
                self.nodes[node] = Some(n);
            }
            self.tick();
        }
        Ok(())
    }
    /// Read the geometry chains of the oldest revisions,
    /// in which each cell's nodes and arcs are interleaved in spatial-index order.
    fn read_geom_chains(&mut self) -> ElibResult<()> {
        self.ctx_stack.push(ElibContext::Geometry);
        let total = self.tables.counts.geoms;
        let mut is_node = vec![false; total];
        let mut more_up = vec![-1i32; total];
        let mut next = 0usize;
        for cell in 0..self.tables.num_cells() {
            let first = next;
            // Two leading entries, then the top and bottom sentinels, then at least one more
            let mut top = None;
            let mut bottom = None;
            loop {
                if next >= total {
                    return self.fail("Geometry chain overruns its declared count");
                }
                let (node, up) = self.read_geom()?;
                is_node[next] = node;
                more_up[next] = up;
                match next - first {
                    2 => top = Some(next),
                    3 => bottom = Some(next),
                    _ => (),
                }
                next += 1;
                if next - first > 4 && Some(up as usize) == top.filter(|_| up >= 0) {
                    break;
                }
            }
            let (top, bottom) = match (top, bottom) {
                (Some(t), Some(b)) => (t, b),
                _ => return self.fail("Geometry chain is missing its sentinels"),
            };
            let nodes = self.tables.nodes(cell);
            let arcs = self.tables.arcs(cell);
            let (mut node_idx, mut arc_idx) = (nodes.start, arcs.start);
            let mut look = bottom;
            let mut steps = 0;
            while look != top {
                steps += 1;
                if steps > total {
                    return self.fail("Geometry chain does not terminate");
                }
                if look >= total {
                    return self.fail("Invalid geometry index");
                }
                if is_node[look] {
                    if node_idx >= nodes.end {
                        return self.fail("Geometry chain holds more nodes than declared");
                    }
                    let n = self.read_node()?;
                    self.nodes[node_idx] = Some(n);
                    node_idx += 1;
                } else {
                    if arc_idx >= arcs.end {
                        return self.fail("Geometry chain holds more arcs than declared");
                    }
                    let a = self.read_arc()?;
                    self.arcs[arc_idx] = Some(a);
                    arc_idx += 1;
                }
                look = match usize::try_from(more_up[look]) {
                    Ok(l) => l,
                    Err(_) => return self.fail("Invalid geometry index"),
                };
            }
            self.tick();
        }
        self.ctx_stack.pop();
        Ok(())
    }
    /// Read a geometry record. Returns whether it is a node, and its "more up" link.
    fn read_geom(&mut self) -> ElibResult<(bool, i32)> {
        let kind = self.rdr.read_big()?;
        if kind != 0 {
            self.rdr.read_big()?;
        }
        // Bounds, then left and right links
        self.read_ints::<8>()?;
        let more_up = self.rdr.read_big()?;
        self.read_ints::<3>()?;
        self.read_vars()?;
        Ok((kind != 0, more_up))
    }
    /// Read a node-instance record
    fn read_node(&mut self) -> ElibResult<RawNode> {
        self.ctx_stack.push(ElibContext::NodeInst);
        let caps = self.dctx.caps;
        let proto = self.rdr.read_big()?;
        let proto = match self.node_proto(proto) {
            Some(p) => p,
            None => return self.fail(format!("Invalid node prototype index {}", proto)),
        };
        let bbox = self.read_ints::<4>()?;
        let transpose = self.rdr.read_big()?;
        let rotation = self.rdr.read_big()?;
        let proto_descriptor = self.read_descriptor()?;
        let mut name = None;
        if caps.inst_names {
            name = Some(self.rdr.read_string()?).filter(|s| !s.is_empty());
        }
        if caps.geoms {
            self.rdr.read_big()?;
        }
        let num_ports = self.rdr.read_big()?;
        for _ in 0..num_ports.max(0) {
            let k = self.rdr.read_big()?;
            let arc = match k {
                k if k < 0 => None,
                k => Some((k >> 1) as usize).filter(|a| *a < self.tables.counts.arcs),
            };
            let arc = match arc {
                Some(a) => a,
                None => return self.fail(format!("Invalid arc index {} on node port", k)),
            };
            let port = self.rdr.read_big()?;
            self.arc_ports[arc][(k & 1) as usize] = Some(port);
            // Port-instance variables are not kept
            self.read_vars()?;
        }
        let num_exports = self.rdr.read_big()?;
        for _ in 0..num_exports.max(0) {
            self.read_ints::<2>()?;
            self.read_vars()?;
        }
        if caps.seen_bits {
            self.rdr.read_big()?;
        }
        let user_bits = self.read_user_bits(false)?;
        let mut vars = self.read_vars()?;
        let mut name_descriptor = None;
        if let Some((n, d)) = take_name(&mut vars, "NODE_name") {
            name = Some(n);
            name_descriptor = d;
        }
        self.ctx_stack.pop();
        Ok(RawNode {
            proto,
            bbox,
            transpose,
            rotation,
            proto_descriptor,
            name,
            name_descriptor,
            user_bits,
            vars,
        })
    }
    /// Read an arc-instance record
    fn read_arc(&mut self) -> ElibResult<RawArc> {
        self.ctx_stack.push(ElibContext::ArcInst);
        let caps = self.dctx.caps;
        let proto = self.rdr.read_big()?;
        let idx = match usize::try_from(-(proto as i64) - 2) {
            Ok(i) if i < self.protos.num_arcs() => i,
            _ => {
                let msg = format!("Invalid arc prototype index {}, using the first", proto);
                soft_error(&mut self.diagnostics, msg);
                0
            }
        };
        let proto = match self.protos.arc(idx, &mut self.diagnostics) {
            Some(p) => p,
            None => return self.fail("No arc prototypes available"),
        };
        if caps.prev_next {
            // Length
            self.rdr.read_big()?;
        }
        let width = self.rdr.read_big()?;
        if caps.signals {
            self.rdr.read_big()?;
        }
        let mut name = None;
        if caps.inst_names {
            name = Some(self.rdr.read_string()?).filter(|s| !s.is_empty());
        }
        let mut ends = [RawEnd {
            x: 0,
            y: 0,
            node: None,
        }; 2];
        for end in ends.iter_mut() {
            let [x, y, node] = self.read_ints::<3>()?;
            end.x = x;
            end.y = y;
            end.node = usize::try_from(node)
                .ok()
                .filter(|n| *n < self.tables.counts.nodes);
        }
        if caps.geoms {
            self.rdr.read_big()?;
        }
        if caps.seen_bits {
            self.rdr.read_big()?;
        }
        let user_bits = self.read_user_bits(true)?;
        let mut vars = self.read_vars()?;
        let mut name_descriptor = None;
        if let Some((n, d)) = take_name(&mut vars, "ARC_name") {
            name = Some(n);
            name_descriptor = d;
        }
        self.ctx_stack.pop();
        Ok(RawArc {
            proto,
            width,
            name,
            name_descriptor,
            ends,
            user_bits,
            vars,
        })
    }

    /// Read a block of variables
    pub(crate) fn read_vars(&mut self) -> ElibResult<Vec<RawVariable>> {
        self.ctx_stack.push(ElibContext::Variable);
        let vars = read_vars(
            &mut self.rdr,
            &self.names,
            &self.flags,
            &self.opts.deprecated_keys,
            &mut self.diagnostics,
        )?;
        self.ctx_stack.pop();
        Ok(vars)
    }
    /// Read an object's user bits.
    /// Later revisions store a single word, plus a network number for some objects in 7 and 8;
    /// earlier ones store a word per tool, of which the first is kept.
    fn read_user_bits(&mut self, net_number: bool) -> ElibResult<i32> {
        let caps: Capabilities = self.dctx.caps;
        if caps.single_user_word {
            let bits = self.rdr.read_big()?;
            if net_number && caps.net_numbers {
                self.rdr.read_big()?;
            }
            return Ok(bits);
        }
        let mut bits = 0;
        for i in 0..self.tool_bits {
            let word = self.rdr.read_big()?;
            if i == 0 {
                bits = word;
            }
        }
        Ok(bits)
    }
    /// Read an export or node text descriptor, where present
    fn read_descriptor(&mut self) -> ElibResult<Option<TextDescriptor>> {
        if !self.dctx.caps.views {
            return Ok(None);
        }
        let w0 = self.rdr.read_big()?;
        let w1 = match self.flags.convert_text_descriptors {
            true => 0,
            false => self.rdr.read_big()?,
        };
        Ok(TextDescriptor::from_words(w0, w1))
    }
    /// Read `N` big integers
    pub(crate) fn read_ints<const N: usize>(&mut self) -> ElibResult<[i32; N]> {
        let mut vals = [0; N];
        for v in vals.iter_mut() {
            *v = self.rdr.read_big()?;
        }
        Ok(vals)
    }
    /// Get the view at on-disk index `idx`
    pub(crate) fn view(&self, idx: i32) -> View {
        self.views
            .get(&idx)
            .cloned()
            .or_else(|| View::builtin(idx))
            .unwrap_or_else(View::unknown)
    }
    /// Replace characters which cannot appear in cell names
    pub(crate) fn cell_name(&mut self, name: String) -> String {
        if !name.contains(&['\n', '|', ':'][..]) {
            return name;
        }
        let fixed = name.replace(&['\n', '|', ':'][..], "-");
        self.diagnostics.push(Diagnostic {
            kind: DiagnosticKind::Warning,
            msg: format!("Cell name '{}' renamed to '{}'", name.escape_debug(), fixed),
        });
        fixed
    }
    /// Name of the export at global index `idx`
    pub(crate) fn export_name(&self, idx: usize) -> Option<&str> {
        self.export_names.get(idx)?.as_deref()
    }
    /// Record a [DiagnosticKind::Count] mismatch
    pub(crate) fn count_mismatch(&mut self, msg: String) {
        warn!("{}", msg);
        self.diagnostics.push(Diagnostic {
            kind: DiagnosticKind::Count,
            msg,
        });
    }
    /// Report progress, if it has moved
    pub(crate) fn tick(&mut self) {
        let len = self.rdr.len().max(1);
        let percent = ((self.rdr.pos() * 100) / len).min(99) as u8;
        if percent != self.last_percent {
            self.last_percent = percent;
            self.progress.progress(percent);
        }
    }
}
impl ErrorHelper for ElibParser<'_> {
    type Error = ElibError;
    fn err(&self, msg: impl Into<String>) -> ElibError {
        let msg = msg.into();
        error!("{}", msg);
        ElibError::Format {
            msg,
            bytepos: self.rdr.pos(),
            ctx: self.ctx_stack.clone(),
        }
    }
}

/// Read a non-negative count
fn read_count(rdr: &mut ElibReader, what: &str) -> ElibResult<usize> {
    let pos = rdr.pos();
    let n = rdr.read_big()?;
    let n = usize::try_from(n).map_err(|_| ElibError::Format {
        msg: format!("Invalid {} count {}", what, n),
        bytepos: pos,
        ctx: Vec::new(),
    })?;
    // Every counted object occupies at least one byte further on
    rdr.check_fits(n, 1)
}
/// Library name implied by file path `path`: its stem, less any ".elib" extension
pub(crate) fn library_name(path: &Path) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some("elib") => path.file_stem(),
        _ => path.file_name(),
    }
    .map(|s| s.to_string_lossy().to_string())
    .unwrap_or_default()
}
/// Remove the string variable `key` from `vars`, returning it as an instance name.
/// Displayed names have any '@' replaced; undisplayed names are kept only if they hold one.
fn take_name(
    vars: &mut Vec<RawVariable>,
    key: &str,
) -> Option<(String, Option<TextDescriptor>)> {
    let pos = vars
        .iter()
        .position(|v| v.key == key && v.as_str().is_some())?;
    let var = vars.remove(pos);
    let display = var.flags & vtype::VDISPLAY != 0;
    let name = geom_name(var.as_str()?, display)?;
    Some((name, var.descriptor))
}
/// Convert a stored instance name
pub(crate) fn geom_name(name: &str, display: bool) -> Option<String> {
    match (display, name.contains('@')) {
        (true, _) => Some(name.replace('@', "_")),
        (false, true) => Some(name.to_string()),
        (false, false) => None,
    }
}
