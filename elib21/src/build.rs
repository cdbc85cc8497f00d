//!
//! # Library Construction
//!
//! Second reading pass: converts the raw records decoded by [ElibParser]
//! into the contents of each [Cell], subcells before their parents.
//! File coordinates become database units, relative to any cell-center marker,
//! and scaled by the lambda of each cell's dominant technology.
//!

// Std-Lib Imports
use std::collections::HashMap;

// Crates.io
use log::{debug, trace};

// Workspace Imports
use elib21utils::DepOrder;

// Local Imports
use crate::alloc::ObjectTables;
use crate::data::*;
use crate::read::{ElibParser, RawExport, RawNode};
use crate::resolve::soft_error;
use crate::tech::{ArcProtoId, TechId, TechRegistry};

/// Technology with the most primitive nodes and arcs among `nodes` and `arcs`,
/// ignoring generic ones. Ties go to the lowest [TechId].
/// Cells with no such primitives inherit the technology of their first subcell, per `subs`.
pub(crate) fn dominant_tech<'a>(
    reg: &TechRegistry,
    nodes: impl Iterator<Item = &'a NodeProto>,
    arcs: impl Iterator<Item = ArcProtoId>,
    subs: &HashMap<CellRef, Option<TechId>>,
) -> Option<TechId> {
    let mut counts = vec![0usize; reg.techs.len()];
    let mut inherited = None;
    let mut count = |t: TechId| {
        if !reg.tech(t).generic {
            counts[t.0] += 1;
        }
    };
    for proto in nodes {
        match proto {
            NodeProto::Primitive(p) => count(p.tech),
            NodeProto::Cell(c) => {
                if inherited.is_none() {
                    inherited = subs.get(c).copied().flatten();
                }
            }
        }
    }
    for arc in arcs {
        count(arc.tech);
    }
    counts
        .iter()
        .enumerate()
        .filter(|(_, n)| **n > 0)
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(&a.0)))
        .map(|(t, _)| TechId(t))
        .or(inherited)
}

/// Cells of a [Database], ordered by instantiation
struct Hierarchy<'d>(&'d Database);
impl DepOrder for Hierarchy<'_> {
    type Item = CellRef;
    type Error = ElibError;

    fn deps(&self, item: &CellRef) -> ElibResult<Vec<CellRef>> {
        let cell = match self.0.cell(item) {
            Some(c) => c,
            None => return Ok(Vec::new()),
        };
        Ok(cell
            .nodes
            .iter()
            .filter_map(|n| match n.proto {
                NodeProto::Cell(c) if self.0.cell(&c).is_some() => Some(c),
                _ => None,
            })
            .collect())
    }
    fn fail(&self, item: &CellRef) -> ElibError {
        let name = self.0.cell(item).map(|c| c.qualified_name());
        ElibError::Str(format!("Cell {} instantiates itself", name.unwrap_or_default()))
    }
}

/// Dominant technology of each of `roots` and of everything they instantiate
pub(crate) fn cell_techs(
    db: &Database,
    roots: &[CellRef],
) -> ElibResult<HashMap<CellRef, Option<TechId>>> {
    let mut techs = HashMap::new();
    for cref in Hierarchy(db).order(roots)? {
        if let Some(cell) = db.cell(&cref) {
            let nodes = cell.nodes.iter().map(|n| &n.proto);
            let arcs = cell.arcs.iter().map(|a| a.proto);
            let tech = dominant_tech(&db.registry, nodes, arcs, &techs);
            techs.insert(cref, tech);
        }
    }
    Ok(techs)
}

/// Bounding box of `nodes` and `arcs`. Empty contents produce the default, zero-sized box.
pub(crate) fn compute_bounds(db: &Database, nodes: &[NodeInst], arcs: &[ArcInst]) -> BoundBox {
    let mut bbox: Option<BoundBox> = None;
    let mut add = |b: BoundBox| {
        bbox = Some(match bbox {
            Some(prev) => prev.union(&b),
            None => b,
        })
    };
    for node in nodes.iter() {
        match node.proto {
            NodeProto::Primitive(_) => {
                let b = BoundBox::centered(&Point::default(), node.width, node.height);
                add(b.orient(node.rotation, false, false, &node.anchor));
            }
            NodeProto::Cell(c) => {
                if let Some(sub) = db.cell(&c) {
                    let b = sub.bounds;
                    add(b.orient(node.rotation, node.flip_x(), node.flip_y(), &node.anchor));
                }
            }
        }
    }
    for arc in arcs.iter() {
        let half = arc.width / 2.0;
        for end in [&arc.tail, &arc.head] {
            let p = end.location;
            add(BoundBox::from_points(
                &Point::new(p.x - half, p.y - half),
                &Point::new(p.x + half, p.y + half),
            ));
        }
    }
    bbox.unwrap_or_default()
}

/// Decode a node's stored transpose and rotation into (rotation, flip-x, flip-y).
/// Later versions store mirror bits; earlier ones a single transpose flag.
pub(crate) fn orientation(transpose: i32, rotation: i32, mirror_bits: bool) -> (i32, bool, bool) {
    let (mut rot, mut fx, mut fy) = (rotation, false, false);
    if mirror_bits {
        if transpose & 1 != 0 {
            fy = true;
            rot = (rot + 900) % 3600;
        }
        if transpose & 2 != 0 {
            fx = true;
        }
        if transpose & 4 != 0 {
            fy = !fy;
        }
    } else if transpose != 0 {
        fy = true;
        rot = (rot + 900) % 3600;
    }
    (rot, fx, fy)
}
/// Inverse of [orientation], for files with mirror bits
pub(crate) fn transpose_bits(flip_x: bool, flip_y: bool) -> i32 {
    (if flip_x { 2 } else { 0 }) | (if flip_y { 4 } else { 0 })
}

/// Split a port-variable key `ATTRP_<port>_<name>` into port and variable names.
/// Backslashes escape the character which follows them within `<port>`.
pub(crate) fn parse_attrp(key: &str) -> Option<(String, String)> {
    let rest = key.strip_prefix("ATTRP_")?;
    let mut port = String::new();
    let mut chars = rest.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => port.push(chars.next()?),
            '_' => return Some((port, chars.as_str().to_string())),
            c => port.push(c),
        }
    }
    None
}
/// Inverse of [parse_attrp]
pub(crate) fn attrp_key(port: &str, name: &str) -> String {
    let mut key = String::from("ATTRP_");
    for c in port.chars() {
        if c == '_' || c == '\\' {
            key.push('\\');
        }
        key.push(c);
    }
    key.push('_');
    key.push_str(name);
    key
}

/// Boolean indication of whether `proto` has a port named `port`
fn has_port(db: &Database, proto: &NodeProto, port: &str) -> bool {
    match proto {
        NodeProto::Primitive(p) => db.registry.node(*p).find_port(port).is_some(),
        NodeProto::Cell(c) => db.cell(c).and_then(|c| c.export(port)).is_some(),
    }
}

/// Local cells of a file, ordered by instantiation
struct FileOrder<'p> {
    tables: &'p ObjectTables,
    nodes: &'p [Option<RawNode>],
    /// File index of each local cell
    local: &'p HashMap<CellRef, usize>,
}
impl DepOrder for FileOrder<'_> {
    type Item = usize;
    type Error = ElibError;

    fn deps(&self, item: &usize) -> ElibResult<Vec<usize>> {
        Ok(self
            .tables
            .nodes(*item)
            .filter_map(|n| match self.nodes[n].as_ref()?.proto {
                NodeProto::Cell(c) => self.local.get(&c).copied(),
                _ => None,
            })
            .collect())
    }
    fn fail(&self, item: &usize) -> ElibError {
        ElibError::Str(format!("Cell {} of the file instantiates itself", item))
    }
}

impl ElibParser<'_> {
    /// Fill in the contents of every local cell
    pub(crate) fn build(&mut self) -> ElibResult<()> {
        self.ctx_stack.push(ElibContext::Build);
        let mut local = HashMap::new();
        let mut others = Vec::new();
        for (i, cref) in self.cell_refs.iter().enumerate() {
            match (cref, &self.cells[i]) {
                (Some(c), Some(_)) => {
                    local.insert(*c, i);
                }
                (Some(c), None) => others.push(*c),
                _ => (),
            }
        }
        let mut items: Vec<usize> = local.values().copied().collect();
        items.sort_unstable();
        let order = FileOrder {
            tables: &self.tables,
            nodes: &self.nodes,
            local: &local,
        }
        .order(&items)?;
        let mut techs = cell_techs(self.db, &others)?;
        debug!("Building {} cells", order.len());
        for idx in order {
            self.build_cell(idx, &mut techs)?;
            self.tick();
        }
        self.ctx_stack.pop();
        Ok(())
    }
    /// Fill in the contents of local cell `idx`
    fn build_cell(
        &mut self,
        idx: usize,
        techs: &mut HashMap<CellRef, Option<TechId>>,
    ) -> ElibResult<()> {
        let cref = match self.cell_refs[idx] {
            Some(c) => c,
            None => return Ok(()),
        };
        let raw = self.cells[idx].take().unwrap_or_default();
        let qname = self.db.libs[self.lib].cells[cref.cell].qualified_name();
        trace!("Building cell {}", qname);
        let (node_range, arc_range) = (self.tables.nodes(idx), self.tables.arcs(idx));

        let tech = {
            let nodes = node_range.clone().filter_map(|n| self.nodes[n].as_ref());
            let arcs = arc_range.clone().filter_map(|a| self.arcs[a].as_ref());
            dominant_tech(
                &self.db.registry,
                nodes.map(|n| &n.proto),
                arcs.map(|a| a.proto),
                techs,
            )
        };
        techs.insert(cref, tech);
        let lambda = match tech {
            Some(t) => self.db.libs[self.lib].lambda(&self.db.registry.tech(t).name),
            None => 1.0,
        };

        // Coordinates are relative to the cell-center marker, if there is one
        let reg = &self.db.registry;
        let center = node_range.clone().find(|n| match self.nodes[*n].as_ref() {
            Some(RawNode {
                proto: NodeProto::Primitive(p),
                ..
            }) => reg.is_cell_center(*p),
            _ => false,
        });
        let offset = match center.and_then(|n| self.nodes[n].as_ref()) {
            Some(n) => {
                let [lx, ly, hx, hy] = n.bbox.map(i64::from);
                ((lx + hx) / 2, (ly + hy) / 2)
            }
            None => (0, 0),
        };

        let mut nodes = Vec::with_capacity(node_range.len());
        let mut local_of = HashMap::new();
        for g in node_range.clone() {
            let raw = match self.nodes[g].take() {
                Some(r) => r,
                None => {
                    self.count_mismatch(format!("Cell {}: node {} was never read", qname, g));
                    continue;
                }
            };
            let off = if Some(g) == center { (0, 0) } else { offset };
            let node = self.realize_node(raw, off, lambda);
            local_of.insert(g, nodes.len());
            nodes.push(node);
        }

        let mut exports = Vec::new();
        for g in self.tables.exports(idx) {
            let raw = match self.exports[g].take() {
                Some(r) => r,
                None => continue,
            };
            let target = self.export_target(&qname, &raw, &local_of, &nodes);
            let vars = self.fix_vars(raw.vars);
            exports.push(Export {
                name: raw.name,
                target,
                descriptor: raw.descriptor,
                user_bits: raw.user_bits,
                vars,
            });
        }

        let mut arcs = Vec::with_capacity(arc_range.len());
        let mut dropped = 0;
        let mut first_drop = None;
        for g in arc_range {
            let raw = match self.arcs[g].take() {
                Some(r) => r,
                None => continue,
            };
            let mut ends = Vec::with_capacity(2);
            let mut problem = None;
            for (e, end) in raw.ends.iter().enumerate() {
                let which = if e == 0 { "tail" } else { "head" };
                let local = match end.node.and_then(|n| local_of.get(&n).copied()) {
                    Some(l) => l,
                    None => {
                        problem = Some(format!("{} node", which));
                        break;
                    }
                };
                let port = self.arc_ports[g][e]
                    .and_then(|p| self.resolve_port(p))
                    .map(|p| self.port_name(&p))
                    .filter(|p| has_port(self.db, &nodes[local].proto, p));
                let port = match port {
                    Some(p) => p,
                    None => {
                        problem = Some(format!("{} port", which));
                        break;
                    }
                };
                let location = Point::new(
                    (end.x as i64 - offset.0) as f64 / lambda,
                    (end.y as i64 - offset.1) as f64 / lambda,
                );
                ends.push(ArcEnd {
                    node: local,
                    port,
                    location,
                });
            }
            if let Some(problem) = problem {
                dropped += 1;
                first_drop.get_or_insert(format!("arc {} is missing its {}", g, problem));
                continue;
            }
            let (head, tail) = match (ends.pop(), ends.pop()) {
                (Some(h), Some(t)) => (h, t),
                _ => continue,
            };
            let vars = self.fix_vars(raw.vars);
            arcs.push(ArcInst {
                proto: raw.proto,
                name: raw.name,
                name_descriptor: raw.name_descriptor,
                width: raw.width as f64 / lambda,
                tail,
                head,
                user_bits: raw.user_bits,
                vars,
            });
        }
        if let Some(first) = first_drop {
            let msg = format!("Cell {}: dropped {} arcs, first: {}", qname, dropped, first);
            soft_error(&mut self.diagnostics, msg);
        }

        let vars = self.fix_vars(raw.vars);
        let bounds = compute_bounds(self.db, &nodes, &arcs);
        let cell = &mut self.db.libs[self.lib].cells[cref.cell];
        cell.nodes = nodes;
        cell.arcs = arcs;
        cell.exports = exports;
        cell.vars = vars;
        cell.bounds = bounds;
        Ok(())
    }
    /// Convert a raw node, offset by `off` file units, and scaled by `lambda`
    fn realize_node(&mut self, raw: RawNode, off: (i64, i64), lambda: f64) -> NodeInst {
        let [lx, ly, hx, hy] = raw.bbox.map(i64::from);
        let (lx, hx) = ((lx - off.0) as f64, (hx - off.0) as f64);
        let (ly, hy) = ((ly - off.1) as f64, (hy - off.1) as f64);
        let center = Point::new((lx + hx) / 2.0 / lambda, (ly + hy) / 2.0 / lambda);
        let (mut w, mut h) = ((hx - lx) / lambda, (hy - ly) / lambda);
        let mirror_bits = self.flags.rotation_mirror_bits;
        let (rotation, fx, fy) = orientation(raw.transpose, raw.rotation, mirror_bits);

        // Instances are stored by the box they occupy; their anchor is the subcell's origin
        let mut anchor = center;
        if let NodeProto::Cell(c) = raw.proto {
            if let Some(sub) = self.db.cell(&c) {
                w = sub.bounds.width();
                h = sub.bounds.height();
                let sc = sub.bounds.center();
                anchor = center + Point::new(-sc.x, -sc.y).orient(rotation, fx, fy);
            }
        }
        let mut node = NodeInst::new(
            raw.proto,
            anchor,
            if fx { -w } else { w },
            if fy { -h } else { h },
        );
        node.rotation = rotation;
        node.name = raw.name;
        node.name_descriptor = raw.name_descriptor;
        node.proto_descriptor = raw.proto_descriptor;
        node.user_bits = raw.user_bits;

        let outline = match raw.proto {
            NodeProto::Primitive(p) => self.db.registry.node(p).holds_outline,
            _ => false,
        };
        for mut var in self.fix_vars(raw.vars) {
            if outline && var.key == "trace" {
                if let VarValue::Array(items) = &mut var.value {
                    for item in items.iter_mut() {
                        if let VarValue::Int(i) = item {
                            *item = VarValue::Double(*i as f64 / lambda);
                        }
                    }
                    var.flags = crate::vars::type_bits(&var.value, var.flags & !crate::vars::vtype::VTYPE);
                }
            }
            match parse_attrp(&var.key) {
                Some((port, key)) if has_port(self.db, &node.proto, &port) => {
                    var.key = key;
                    node.port_vars.entry(port).or_default().push(var);
                }
                _ => node.vars.push(var),
            }
        }
        node
    }
    /// Resolve an export's delegate port, reporting any failure
    fn export_target(
        &mut self,
        cell: &str,
        raw: &RawExport,
        local_of: &HashMap<usize, usize>,
        nodes: &[NodeInst],
    ) -> Option<PortInstRef> {
        let global = raw.node?;
        let local = local_of.get(&global).copied();
        let port = self.resolve_port(raw.port);
        let target = match (local, port) {
            (Some(l), Some(port)) => {
                let fits = match (&nodes[l].proto, &port) {
                    (NodeProto::Primitive(n), PortRef::Primitive(p)) => p.node_id() == *n,
                    (NodeProto::Cell(c), PortRef::Export { cell, .. }) => c == cell,
                    _ => false,
                };
                match fits {
                    true => Some(PortInstRef {
                        node: l,
                        port: self.port_name(&port),
                    }),
                    false => None,
                }
            }
            _ => None,
        };
        if target.is_none() {
            let msg = format!("Cell {}: export {} could not be created", cell, raw.name);
            soft_error(&mut self.diagnostics, msg);
        }
        target
    }
    /// Resolve an on-disk port index, substituting the first of its kind for those out of range
    fn resolve_port(&mut self, i: i32) -> Option<PortRef> {
        let i = if i < 0 {
            match usize::try_from(-(i as i64) - 2) {
                Ok(p) if p < self.protos.num_ports() => i,
                _ => {
                    let msg = format!("Invalid primitive port index {}, using the first", i);
                    soft_error(&mut self.diagnostics, msg);
                    -2
                }
            }
        } else if i as usize >= self.tables.counts.exports {
            let msg = format!("Invalid export index {}, using the first", i);
            soft_error(&mut self.diagnostics, msg);
            0
        } else {
            i
        };
        self.port_ref(i)
    }
    fn port_name(&self, port: &PortRef) -> String {
        match port {
            PortRef::Primitive(p) => self.db.registry.port_name(*p).to_string(),
            PortRef::Export { name, .. } => name.clone(),
        }
    }
}

impl Database {
    /// Recompute the bounds of every [Cell] in `lib`, subcells first.
    /// Cells of other libraries are left as they are.
    pub fn update_bounds(&mut self, lib: LibKey) -> ElibResult<()> {
        let roots: Vec<CellRef> = match self.libs.get(lib) {
            Some(l) => l.cells.keys().map(|cell| CellRef { lib, cell }).collect(),
            None => return Err(ElibError::Str("No such library".into())),
        };
        let order = Hierarchy(self).order(&roots)?;
        for cref in order.into_iter().filter(|c| c.lib == lib) {
            let bounds = match self.cell(&cref) {
                Some(c) => compute_bounds(self, &c.nodes, &c.arcs),
                None => continue,
            };
            self.libs[lib].cells[cref.cell].bounds = bounds;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_variable_keys() {
        assert_eq!(parse_attrp("ATTRP_a_width"), Some(("a".into(), "width".into())));
        assert_eq!(
            parse_attrp("ATTRP_in\\_1_cap_x"),
            Some(("in_1".into(), "cap_x".into()))
        );
        assert_eq!(parse_attrp("ATTRP_noname"), None);
        assert_eq!(parse_attrp("ATTR_a_b"), None);
        for port in ["a", "in_1", "back\\slash"] {
            let key = attrp_key(port, "w");
            assert_eq!(parse_attrp(&key), Some((port.to_string(), "w".to_string())));
        }
    }
    #[test]
    fn orientations() {
        assert_eq!(orientation(0, 900, true), (900, false, false));
        assert_eq!(orientation(2, 0, true), (0, true, false));
        assert_eq!(orientation(4, 1800, true), (1800, false, true));
        // Transposition is a flip in y plus a quarter turn
        assert_eq!(orientation(1, 0, true), (900, false, true));
        assert_eq!(orientation(5, 0, true), (900, false, false));
        assert_eq!(orientation(1, 2700, false), (0, false, true));
        for (fx, fy) in [(false, false), (true, false), (false, true), (true, true)] {
            assert_eq!(orientation(transpose_bits(fx, fy), 900, true), (900, fx, fy));
        }
    }
    #[test]
    fn dominant_technologies() {
        let reg = TechRegistry::builtin();
        let pin = reg.find_node("generic", "Universal-Pin").unwrap();
        let m1 = reg.find_node("mocmos", "Metal-1-Pin").unwrap();
        let wire = reg.find_node("schematic", "Wire_Pin").unwrap();
        let bus = reg.find_arc("schematic", "bus").unwrap();
        let none = HashMap::new();

        let protos = [NodeProto::Primitive(pin), NodeProto::Primitive(pin)];
        assert_eq!(dominant_tech(&reg, protos.iter(), std::iter::empty(), &none), None);

        let protos = [NodeProto::Primitive(m1), NodeProto::Primitive(wire)];
        let tech = dominant_tech(&reg, protos.iter(), [bus].into_iter(), &none);
        assert_eq!(tech, reg.find_tech("schematic"));
        // Ties go to the lowest technology
        let tech = dominant_tech(&reg, protos.iter(), std::iter::empty(), &none);
        assert_eq!(tech, reg.find_tech("mocmos"));
    }
    #[test]
    fn bounds_of_contents() {
        let db = Database::default();
        let m1 = db.registry.find_node("mocmos", "Metal-1-Pin").unwrap();
        let arc = db.registry.find_arc("mocmos", "Metal-1").unwrap();
        let mut a = NodeInst::new(NodeProto::Primitive(m1), Point::new(0.0, 0.0), 4.0, 2.0);
        a.rotation = 900;
        let b = NodeInst::new(NodeProto::Primitive(m1), Point::new(10.0, 0.0), 2.0, 2.0);
        let end = |node: usize, x: f64| ArcEnd {
            node,
            port: "metal-1".into(),
            location: Point::new(x, 0.0),
        };
        let wire = ArcInst {
            proto: arc,
            name: None,
            name_descriptor: None,
            width: 6.0,
            tail: end(0, 0.0),
            head: end(1, 10.0),
            user_bits: 0,
            vars: Vec::new(),
        };
        let bounds = compute_bounds(&db, &[a, b], &[wire]);
        assert_eq!(
            bounds,
            BoundBox::from_points(&Point::new(-3.0, -3.0), &Point::new(13.0, 3.0))
        );
        assert_eq!(compute_bounds(&db, &[], &[]), BoundBox::default());
    }
}
