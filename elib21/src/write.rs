//!
//! # Elib Writing
//!
//! Libraries are written in the latest format revision: big-endian,
//! with two-byte small integers, four-byte big integers, and one-byte characters.
//! Every technology and tool of the registry is listed, so that indices into
//! the registry double as on-disk indices.
//!

// Std-Lib Imports
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

// Crates.io
use byteorder::{BigEndian, WriteBytesExt};
use log::{debug, trace};

// Local Imports
use crate::build::{attrp_key, cell_techs, transpose_bits};
use crate::data::*;
use crate::header::Magic;
use crate::tech::{ArcProtoId, PrimNodeId, PrimPortId};
use crate::vars::{type_bits, vtype::*};

/// Version string written into every file
pub const WRITE_VERSION: &str = "8.04";

/// Scale `v` by `lambda`, and round to file units
fn scaled(v: f64, lambda: f64) -> i32 {
    (v * lambda).round() as i32
}

/// Variable-name table, in order of first use
#[derive(Debug, Default)]
struct NameTable {
    names: Vec<String>,
    index: HashMap<String, usize>,
}
impl NameTable {
    fn add(&mut self, key: &str) {
        if !self.index.contains_key(key) {
            self.index.insert(key.to_string(), self.names.len());
            self.names.push(key.to_string());
        }
    }
    fn add_vars(&mut self, vars: &[Variable]) {
        for v in vars.iter() {
            self.add(&v.key);
        }
    }
    fn get(&self, key: &str) -> ElibResult<i16> {
        let idx = self.index.get(key).copied().unwrap_or(usize::MAX);
        i16::try_from(idx).map_err(|_| ElibError::Str(format!("Too many variable names for {}", key)))
    }
}

/// Collect the cells referred to by variable value `v`
fn var_cells(v: &VarValue, out: &mut impl FnMut(CellRef)) {
    match v {
        VarValue::NodeProto(NodeProto::Cell(c)) => out(*c),
        VarValue::PortProto(PortRef::Export { cell, .. }) => out(*cell),
        VarValue::Array(items) => items.iter().for_each(|i| var_cells(i, out)),
        _ => (),
    }
}

/// # Library Layout
/// On-disk indices of everything a library refers to
struct LibPlan<'d> {
    db: &'d Database,
    key: LibKey,
    lib: &'d Library,
    /// Local cells, then cells of other libraries, in file order
    cells: Vec<CellRef>,
    num_local: usize,
    index: HashMap<CellRef, usize>,
    /// First global node, arc, and export index of each cell
    node_start: Vec<usize>,
    arc_start: Vec<usize>,
    export_start: Vec<usize>,
    /// Lambda of each cell, per our library's scale table
    lambda: Vec<f64>,
    /// File index of the next cell in each local cell's group
    group_next: Vec<usize>,
    prim_nodes: HashMap<PrimNodeId, usize>,
    prim_ports: HashMap<PrimPortId, usize>,
    arc_protos: HashMap<ArcProtoId, usize>,
    /// Views without built-in indices
    views: Vec<View>,
    names: NameTable,
}
impl<'d> LibPlan<'d> {
    fn new(db: &'d Database, key: LibKey) -> ElibResult<Self> {
        let lib = db
            .libs
            .get(key)
            .ok_or_else(|| ElibError::Str("No such library".into()))?;
        let mut cells: Vec<CellRef> = lib.cells.keys().map(|cell| CellRef { lib: key, cell }).collect();
        let num_local = cells.len();

        // Cells of other libraries, in order of first reference
        let mut external = Vec::new();
        let mut seen = HashSet::new();
        let mut note = |c: CellRef| {
            if c.lib != key && db.cell(&c).is_some() && seen.insert(c) {
                external.push(c);
            }
        };
        let mut all_vars: Vec<&[Variable]> = vec![lib.vars.as_slice()];
        all_vars.extend(lib.settings.values().map(|v| v.as_slice()));
        for cell in lib.cells.values() {
            all_vars.push(&cell.vars);
            for node in cell.nodes.iter() {
                if let NodeProto::Cell(c) = node.proto {
                    note(c);
                }
                all_vars.push(&node.vars);
                all_vars.extend(node.port_vars.values().map(|v| v.as_slice()));
            }
            all_vars.extend(cell.arcs.iter().map(|a| a.vars.as_slice()));
            all_vars.extend(cell.exports.iter().map(|e| e.vars.as_slice()));
        }
        for vars in all_vars.iter() {
            for v in vars.iter() {
                var_cells(&v.value, &mut note);
            }
        }
        cells.extend(external);
        let index: HashMap<CellRef, usize> = cells.iter().enumerate().map(|(i, c)| (*c, i)).collect();

        let techs = cell_techs(db, &cells)?;
        let mut lambda = Vec::with_capacity(cells.len());
        let (mut node_start, mut arc_start, mut export_start) = (vec![0], vec![0], vec![0]);
        let mut views: Vec<View> = Vec::new();
        for (i, cref) in cells.iter().enumerate() {
            let cell = db
                .cell(cref)
                .ok_or_else(|| ElibError::Str("Dangling cell reference".into()))?;
            let tech = techs.get(cref).copied().flatten();
            lambda.push(match tech {
                Some(t) => lib.lambda(&db.registry.tech(t).name),
                None => 1.0,
            });
            let local = i < num_local;
            let (n, a) = match local {
                true => (cell.nodes.len(), cell.arcs.len()),
                false => (0, 0),
            };
            node_start.push(node_start[i] + n);
            arc_start.push(arc_start[i] + a);
            export_start.push(export_start[i] + cell.exports.len());
            if cell.view.builtin_index().is_none() && !views.contains(&cell.view) {
                views.push(cell.view.clone());
            }
        }

        // Group links: each cell points to the next in its group, the last back to the first
        let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
        for (i, cell) in lib.cells.values().enumerate() {
            groups.entry(cell.group).or_default().push(i);
        }
        let mut group_next = vec![0; num_local];
        for members in groups.values() {
            for (j, &m) in members.iter().enumerate() {
                group_next[m] = members[(j + 1) % members.len()];
            }
        }

        let reg = &db.registry;
        let (mut prim_nodes, mut prim_ports, mut arc_protos) =
            (HashMap::new(), HashMap::new(), HashMap::new());
        for (t, tech) in reg.techs.iter().enumerate() {
            let tech_id = crate::tech::TechId(t);
            for (n, node) in tech.nodes.iter().enumerate() {
                let nid = PrimNodeId { tech: tech_id, node: n };
                prim_nodes.insert(nid, prim_nodes.len());
                for port in 0..node.ports.len() {
                    let pid = PrimPortId { tech: tech_id, node: n, port };
                    prim_ports.insert(pid, prim_ports.len());
                }
            }
            for arc in 0..tech.arcs.len() {
                arc_protos.insert(ArcProtoId { tech: tech_id, arc }, arc_protos.len());
            }
        }

        let mut names = NameTable::default();
        for vars in all_vars.iter() {
            names.add_vars(vars);
        }
        for cell in lib.cells.values() {
            if cell.nodes.iter().any(|n| n.name.is_some()) {
                names.add("NODE_name");
            }
            if cell.arcs.iter().any(|a| a.name.is_some()) {
                names.add("ARC_name");
            }
            for node in cell.nodes.iter() {
                for (port, vars) in node.port_vars.iter() {
                    for v in vars.iter() {
                        names.add(&attrp_key(port, &v.key));
                    }
                }
            }
        }

        Ok(Self {
            db,
            key,
            lib,
            cells,
            num_local,
            index,
            node_start,
            arc_start,
            export_start,
            lambda,
            group_next,
            prim_nodes,
            prim_ports,
            arc_protos,
            views,
            names,
        })
    }
    fn cell(&self, i: usize) -> ElibResult<&'d Cell> {
        self.db
            .cell(&self.cells[i])
            .ok_or_else(|| ElibError::Str("Dangling cell reference".into()))
    }
    fn view_index(&self, view: &View) -> i32 {
        match view.builtin_index() {
            Some(i) => i,
            None => self
                .views
                .iter()
                .position(|v| v == view)
                .map(|i| i as i32 + 1)
                .unwrap_or(-1),
        }
    }
    /// On-disk index of node prototype `proto`
    fn proto_index(&self, proto: &NodeProto) -> i32 {
        match proto {
            NodeProto::Primitive(p) => match self.prim_nodes.get(p) {
                Some(i) => -(*i as i32) - 2,
                None => -1,
            },
            NodeProto::Cell(c) => self.index.get(c).map(|i| *i as i32).unwrap_or(-1),
        }
    }
    fn arc_index(&self, arc: &ArcProtoId) -> i32 {
        match self.arc_protos.get(arc) {
            Some(i) => -(*i as i32) - 2,
            None => -1,
        }
    }
    /// On-disk index of port-prototype `port`, or -1 if it cannot be referred to
    fn port_index(&self, port: &PortRef) -> i32 {
        match port {
            PortRef::Primitive(p) => match self.prim_ports.get(p) {
                Some(i) => -(*i as i32) - 2,
                None => -1,
            },
            PortRef::Export { cell, name } => self.export_index(cell, name).unwrap_or(-1),
        }
    }
    fn export_index(&self, cell: &CellRef, name: &str) -> Option<i32> {
        let ci = *self.index.get(cell)?;
        let pos = self.db.cell(cell)?.exports.iter().position(|e| e.name == name)?;
        Some((self.export_start[ci] + pos) as i32)
    }
    /// On-disk index of the port named `port` on a node of prototype `proto`
    fn port_on(&self, proto: &NodeProto, port: &str) -> ElibResult<i32> {
        let idx = match proto {
            NodeProto::Primitive(p) => self
                .db
                .registry
                .find_port(*p, port)
                .map(|pid| self.port_index(&PortRef::Primitive(pid))),
            NodeProto::Cell(c) => self.export_index(c, port),
        };
        idx.ok_or_else(|| ElibError::Str(format!("No port {} on its node", port)))
    }
    /// Global index of a node or arc instance, or -1 if it is not in this library
    fn inst_index(&self, r: &InstRef, node: bool) -> i32 {
        match self.index.get(&r.cell) {
            Some(&ci) if ci < self.num_local => match node {
                true => (self.node_start[ci] + r.index) as i32,
                false => (self.arc_start[ci] + r.index) as i32,
            },
            _ => -1,
        }
    }
    /// Stored box of `node`, lx, ly, hx, hy, in file units
    fn node_box(&self, node: &NodeInst, lambda: f64) -> [i32; 4] {
        let bbox = match node.proto {
            NodeProto::Cell(c) => match self.db.cell(&c) {
                Some(sub) => {
                    let b = sub.bounds;
                    let shift = b.center().orient(node.rotation, node.flip_x(), node.flip_y());
                    BoundBox::centered(&(node.anchor + shift), b.width(), b.height())
                }
                None => BoundBox::centered(&node.anchor, node.width, node.height),
            },
            NodeProto::Primitive(_) => BoundBox::centered(&node.anchor, node.width, node.height),
        };
        [
            scaled(bbox.p0.x, lambda),
            scaled(bbox.p0.y, lambda),
            scaled(bbox.p1.x, lambda),
            scaled(bbox.p1.y, lambda),
        ]
    }
}

/// # Elib Writer
pub struct ElibWriter<'wr> {
    /// Write Destination
    dest: Box<dyn Write + 'wr>,
}
impl<'wr> ElibWriter<'wr> {
    /// Create new [ElibWriter] with destination file `fname`
    pub fn open(fname: impl AsRef<Path>) -> ElibResult<Self> {
        let file = BufWriter::new(File::create(fname)?);
        Ok(Self::new(file))
    }
    /// Create a new [ElibWriter] to destination `dest`
    pub fn new(dest: impl Write + 'wr) -> Self {
        Self {
            dest: Box::new(dest),
        }
    }
    /// Write [Library] `lib` of `db`
    pub fn write_lib(&mut self, db: &Database, lib: LibKey) -> ElibResult<()> {
        let plan = LibPlan::new(db, lib)?;
        debug!(
            "Writing library {}: {} cells, {} from other libraries",
            plan.lib.name,
            plan.num_local,
            plan.cells.len() - plan.num_local
        );
        self.write_header(&plan)?;
        for i in 0..plan.num_local {
            self.write_cell(&plan, i)?;
        }
        for i in plan.num_local..plan.cells.len() {
            self.write_external(&plan, i)?;
        }
        for i in 0..plan.num_local {
            self.write_contents(&plan, i)?;
        }
        self.dest.flush()?;
        Ok(())
    }
    /// Write everything up to the cells: counts, tables, and library-level variables
    fn write_header(&mut self, plan: &LibPlan) -> ElibResult<()> {
        let reg = &plan.db.registry;
        let lib = plan.lib;
        self.big(Magic::Magic12.value())?;
        for width in [2u8, 4, 1] {
            self.byte(width)?;
        }
        let num_cells = plan.cells.len();
        for n in [
            reg.tools.len(),
            reg.techs.len(),
            plan.prim_nodes.len(),
            plan.prim_ports.len(),
            plan.arc_protos.len(),
            num_cells,
            plan.node_start[num_cells],
            plan.export_start[num_cells],
            plan.arc_start[num_cells],
            0,
        ] {
            self.count(n)?;
        }
        let cur = lib
            .cur_cell
            .and_then(|cell| plan.index.get(&CellRef { lib: plan.key, cell }))
            .map(|i| *i as i32)
            .unwrap_or(-1);
        self.big(cur)?;
        self.string(WRITE_VERSION)?;
        self.count(plan.views.len())?;
        for view in plan.views.iter() {
            self.string(&view.name)?;
            self.string(&view.abbreviation)?;
        }
        for i in 0..num_cells {
            let cell = plan.cell(i)?;
            match i < plan.num_local {
                true => {
                    self.count(cell.arcs.len())?;
                    self.count(cell.nodes.len())?;
                }
                false => {
                    self.big(-1)?;
                    self.big(-1)?;
                }
            }
            self.count(cell.exports.len())?;
        }
        for tech in reg.techs.iter() {
            self.string(&tech.name)?;
            self.count(tech.nodes.len())?;
            for node in tech.nodes.iter() {
                self.string(&node.name)?;
                self.count(node.ports.len())?;
                for port in node.ports.iter() {
                    self.string(&port.name)?;
                }
            }
            self.count(tech.arcs.len())?;
            for arc in tech.arcs.iter() {
                self.string(&arc.name)?;
            }
        }
        for tool in reg.tools.iter() {
            self.string(&tool.name)?;
        }
        self.big(lib.user_bits)?;
        for tech in reg.techs.iter() {
            let lambda = lib.tech_scale.get(&tech.name).copied().unwrap_or(0.0);
            self.big(lambda.round() as i32)?;
        }
        self.count(plan.names.names.len())?;
        for name in plan.names.names.iter() {
            self.string(name)?;
        }

        self.write_vars(plan, &lib.vars)?;
        let no_vars = Vec::new();
        for tool in reg.tools.iter() {
            let vars = lib.settings.get(&format!("tool:{}", tool.name));
            self.write_vars(plan, vars.unwrap_or(&no_vars))?;
        }
        for tech in reg.techs.iter() {
            let vars = lib.settings.get(&format!("tech:{}", tech.name));
            self.write_vars(plan, vars.unwrap_or(&no_vars))?;
        }
        // Arc prototypes, primitive nodes and primitive ports carry none
        for _ in 0..plan.arc_protos.len() + plan.prim_nodes.len() + plan.prim_ports.len() {
            self.big(0)?;
        }
        // Nor do views
        self.big(0)?;
        Ok(())
    }
    /// Write the header record of local cell `i`, including its exports
    fn write_cell(&mut self, plan: &LibPlan, i: usize) -> ElibResult<()> {
        let cell = plan.cell(i)?;
        let lambda = plan.lambda[i];
        trace!("Writing cell {}", cell.qualified_name());
        self.string(&cell.name)?;
        self.count(plan.group_next[i])?;
        self.big(-1)?;
        self.big(plan.view_index(&cell.view))?;
        self.big(cell.version)?;
        self.big(secs_from_date(&cell.creation))?;
        self.big(secs_from_date(&cell.revision))?;
        let b = cell.bounds;
        for v in [b.p0.x, b.p1.x, b.p0.y, b.p1.y] {
            self.big(scaled(v, lambda))?;
        }
        self.count(cell.exports.len())?;
        for export in cell.exports.iter() {
            let (node, port) = match &export.target {
                Some(t) => {
                    let node = cell.nodes.get(t.node).ok_or_else(|| {
                        ElibError::Str(format!(
                            "Export {} of cell {} is on a nonexistent node",
                            export.name,
                            cell.qualified_name()
                        ))
                    })?;
                    let port = plan.port_on(&node.proto, &t.port)?;
                    ((plan.node_start[i] + t.node) as i32, port)
                }
                None => (-1, -1),
            };
            self.big(node)?;
            self.big(port)?;
            self.string(&export.name)?;
            self.descriptor(&export.descriptor)?;
            self.big(export.user_bits)?;
            self.write_vars(plan, &export.vars)?;
        }
        // Dirty flag
        self.big(0)?;
        self.big(cell.user_bits)?;
        self.write_vars(plan, &cell.vars)
    }
    /// Write the reference to cell `i`, of another library
    fn write_external(&mut self, plan: &LibPlan, i: usize) -> ElibResult<()> {
        let cref = plan.cells[i];
        let cell = plan.cell(i)?;
        let lambda = plan.lambda[i];
        self.string(&cell.name)?;
        self.big(-1)?;
        self.big(-1)?;
        self.big(plan.view_index(&cell.view))?;
        self.big(cell.version)?;
        self.big(secs_from_date(&cell.creation))?;
        self.big(secs_from_date(&cell.revision))?;
        let b = cell.bounds;
        for v in [b.p0.x, b.p1.x, b.p0.y, b.p1.y] {
            self.big(scaled(v, lambda))?;
        }
        let lib = &plan.db.libs[cref.lib];
        let path = match &lib.path {
            Some(p) => p.display().to_string(),
            None => format!("{}.elib", lib.name),
        };
        self.string(&path)?;
        self.count(cell.exports.len())?;
        for export in cell.exports.iter() {
            self.string(&export.name)?;
        }
        Ok(())
    }
    /// Write the arcs, and then the nodes, of local cell `i`
    fn write_contents(&mut self, plan: &LibPlan, i: usize) -> ElibResult<()> {
        let cell = plan.cell(i)?;
        let lambda = plan.lambda[i];
        let reg = &plan.db.registry;

        // Coordinates are relative to the cell-center marker, if there is one.
        // Offset exactly as readers will recover it from the marker's stored box.
        let center = cell.nodes.iter().position(|n| match n.proto {
            NodeProto::Primitive(p) => reg.is_cell_center(p),
            _ => false,
        });
        let offset = match center {
            Some(c) => {
                let [lx, ly, hx, hy] = plan.node_box(&cell.nodes[c], lambda).map(i64::from);
                ((lx + hx) / 2, (ly + hy) / 2)
            }
            None => (0, 0),
        };
        let at = |p: &Point| {
            (
                (scaled(p.x, lambda) as i64 + offset.0) as i32,
                (scaled(p.y, lambda) as i64 + offset.1) as i32,
            )
        };

        // Arc ends, as listed by their nodes
        let mut node_ports: Vec<Vec<(i32, i32)>> = vec![Vec::new(); cell.nodes.len()];
        for (a, arc) in cell.arcs.iter().enumerate() {
            let global = (plan.arc_start[i] + a) as i32;
            for (e, end) in [&arc.tail, &arc.head].into_iter().enumerate() {
                let node = cell.nodes.get(end.node).ok_or_else(|| {
                    ElibError::Str(format!(
                        "Arc {} of cell {} ends on a nonexistent node",
                        a,
                        cell.qualified_name()
                    ))
                })?;
                let port = plan.port_on(&node.proto, &end.port)?;
                node_ports[end.node].push(((global << 1) | e as i32, port));
            }
        }

        for arc in cell.arcs.iter() {
            self.big(plan.arc_index(&arc.proto))?;
            self.big(scaled(arc.width, lambda))?;
            for end in [&arc.tail, &arc.head] {
                let (x, y) = at(&end.location);
                self.big(x)?;
                self.big(y)?;
                self.count(plan.node_start[i] + end.node)?;
            }
            self.big(arc.user_bits)?;
            let mut vars = arc.vars.clone();
            if let Some(name) = &arc.name {
                vars.push(name_var("ARC_name", name, arc.name_descriptor));
            }
            self.write_vars(plan, &vars)?;
        }

        for (n, node) in cell.nodes.iter().enumerate() {
            self.big(plan.proto_index(&node.proto))?;
            let mut bbox = plan.node_box(node, lambda);
            if Some(n) != center {
                for (k, v) in bbox.iter_mut().enumerate() {
                    let off = if k % 2 == 0 { offset.0 } else { offset.1 };
                    *v = (*v as i64 + off) as i32;
                }
            }
            for v in bbox {
                self.big(v)?;
            }
            self.big(transpose_bits(node.flip_x(), node.flip_y()))?;
            self.big(node.rotation)?;
            self.descriptor(&node.proto_descriptor)?;
            self.count(node_ports[n].len())?;
            for (k, port) in node_ports[n].iter() {
                self.big(*k)?;
                self.big(*port)?;
                self.big(0)?;
            }
            // No export instances
            self.big(0)?;
            self.big(node.user_bits)?;
            let mut vars = node.vars.clone();
            if let Some(name) = &node.name {
                vars.push(name_var("NODE_name", name, node.name_descriptor));
            }
            for (port, pvars) in node.port_vars.iter() {
                for v in pvars.iter() {
                    let mut v = v.clone();
                    v.key = attrp_key(port, &v.key);
                    vars.push(v);
                }
            }
            self.write_vars(plan, &vars)?;
        }
        Ok(())
    }
    /// Write a block of variables
    fn write_vars(&mut self, plan: &LibPlan, vars: &[Variable]) -> ElibResult<()> {
        self.count(vars.len())?;
        for var in vars.iter() {
            let flags = type_bits(&var.value, var.flags);
            self.small(plan.names.get(&var.key)?)?;
            self.big(flags)?;
            self.descriptor(&var.descriptor)?;
            match &var.value {
                VarValue::Array(items) => {
                    self.count(items.len())?;
                    for item in items.iter() {
                        self.value(plan, item, flags & VTYPE)?;
                    }
                }
                v => self.value(plan, v, flags & VTYPE)?,
            }
        }
        Ok(())
    }
    /// Write a single variable value. Null array entries are written as the empty value of `tag`.
    fn value(&mut self, plan: &LibPlan, v: &VarValue, tag: i32) -> ElibResult<()> {
        match v {
            VarValue::Null => match tag {
                VSTRING | VLIBRARY => self.string(""),
                VFLOAT => self.float(0.0),
                VDOUBLE => self.double(0.0),
                VSHORT => self.small(0),
                VCHAR | VBOOLEAN => self.byte(0),
                VINTEGER | VADDRESS | VFRACT => self.big(0),
                _ => self.big(-1),
            },
            VarValue::Int(i) => self.big(*i),
            VarValue::Fract(f) => self.big((f * 120.0).round() as i32),
            VarValue::Float(f) => self.float(*f),
            VarValue::Double(f) => self.double(*f),
            VarValue::Short(s) => self.small(*s),
            VarValue::Byte(b) => self.byte(*b as u8),
            VarValue::Str(s) | VarValue::Library(s) => self.string(s),
            VarValue::NodeInst(r) => self.big(plan.inst_index(r, true)),
            VarValue::ArcInst(r) => self.big(plan.inst_index(r, false)),
            VarValue::NodeProto(p) => self.big(plan.proto_index(p)),
            VarValue::ArcProto(a) => self.big(plan.arc_index(a)),
            VarValue::PortProto(p) => self.big(plan.port_index(p)),
            VarValue::Technology(t) => self.big(t.0 as i32),
            VarValue::Tool(name) => {
                let idx = plan.db.registry.find_tool(name);
                self.big(idx.map(|i| i as i32).unwrap_or(-1))
            }
            VarValue::Array(_) => Err(ElibError::Unsupported("Nested variable arrays".into())),
        }
    }
    /// Write a text descriptor, always as two words
    fn descriptor(&mut self, d: &Option<TextDescriptor>) -> ElibResult<()> {
        let d = d.unwrap_or_default();
        self.big(d.0)?;
        self.big(d.1)
    }
    fn count(&mut self, n: usize) -> ElibResult<()> {
        let n = i32::try_from(n).map_err(|_| ElibError::Str(format!("Count {} too large", n)))?;
        self.big(n)
    }
    fn big(&mut self, v: i32) -> ElibResult<()> {
        self.dest.write_i32::<BigEndian>(v)?;
        Ok(())
    }
    fn small(&mut self, v: i16) -> ElibResult<()> {
        self.dest.write_i16::<BigEndian>(v)?;
        Ok(())
    }
    fn byte(&mut self, v: u8) -> ElibResult<()> {
        self.dest.write_u8(v)?;
        Ok(())
    }
    fn float(&mut self, v: f32) -> ElibResult<()> {
        self.dest.write_f32::<BigEndian>(v)?;
        Ok(())
    }
    fn double(&mut self, v: f64) -> ElibResult<()> {
        self.dest.write_f64::<BigEndian>(v)?;
        Ok(())
    }
    /// Write a length-prefixed string
    fn string(&mut self, s: &str) -> ElibResult<()> {
        self.count(s.len())?;
        self.dest.write_all(s.as_bytes())?;
        Ok(())
    }
}

/// Create the variable holding an instance name.
/// Names holding an '@' are written undisplayed, which readers take to mean "keep as-is".
fn name_var(key: &str, name: &str, descriptor: Option<TextDescriptor>) -> Variable {
    let mut var = Variable::new(key, VarValue::Str(name.to_string()));
    if !name.contains('@') {
        var.flags |= VDISPLAY;
    }
    var.descriptor = descriptor;
    var
}
