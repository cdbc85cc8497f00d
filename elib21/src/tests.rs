//!
//! # Elib21 Crate-Level Tests
//!
//! Streams in legacy revisions are hand-assembled with [StreamBuilder].
//! Current-revision streams are mostly produced by the writer.
//!

// Std-Lib Imports
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

// Crates.io
use chrono::{TimeZone, Utc};
use tempfile::tempdir;

// Local Imports
use crate::config::*;
use crate::data::*;
use crate::header::Magic;
use crate::read::ElibParser;
use crate::vars::vtype::*;
use elib21utils::SerializationFormat::Json;

/// Hand-assembles ELIB streams
struct StreamBuilder {
    bytes: Vec<u8>,
    little: bool,
    /// Byte-width of big integers
    big_size: usize,
}
impl StreamBuilder {
    /// Start a big-endian stream with magic number `magic`, and the default widths
    fn new(magic: Magic) -> Self {
        Self::with_order(magic, false)
    }
    /// Start a little-endian stream
    fn little(magic: Magic) -> Self {
        Self::with_order(magic, true)
    }
    fn with_order(magic: Magic, little: bool) -> Self {
        let mut me = Self {
            bytes: Vec::new(),
            little,
            big_size: 4,
        };
        me.big(magic.value());
        if magic.tier() >= 10 {
            me.byte(2).byte(4);
        }
        if magic.tier() >= 11 {
            me.byte(1);
        }
        me
    }
    /// Start a big-endian revision-10 stream with `big_size`-byte big integers
    fn wide(big_size: usize) -> Self {
        let mut me = Self {
            bytes: Vec::new(),
            little: false,
            big_size: 4,
        };
        me.big(Magic::Magic10.value());
        me.byte(2).byte(big_size as u8);
        me.big_size = big_size;
        me
    }
    fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(bytes);
        self
    }
    fn byte(&mut self, b: u8) -> &mut Self {
        self.raw(&[b])
    }
    fn small(&mut self, v: i16) -> &mut Self {
        let b = match self.little {
            true => v.to_le_bytes(),
            false => v.to_be_bytes(),
        };
        self.raw(&b)
    }
    /// Write a big integer, sign-extended to our width
    fn big(&mut self, v: i32) -> &mut Self {
        let n = self.big_size;
        match self.little {
            true => {
                let b = (v as i64).to_le_bytes();
                self.raw(&b[..n])
            }
            false => {
                let b = (v as i64).to_be_bytes();
                self.raw(&b[8 - n..])
            }
        }
    }
    fn bigs(&mut self, vs: &[i32]) -> &mut Self {
        for v in vs.iter() {
            self.big(*v);
        }
        self
    }
    fn string(&mut self, s: &str) -> &mut Self {
        self.big(s.len() as i32);
        self.raw(s.as_bytes())
    }
    fn finish(&self) -> Vec<u8> {
        self.bytes.clone()
    }
}

/// Technology table entry: name, primitives and their ports, arcs
type TechRec = (
    &'static str,
    &'static [(&'static str, &'static [&'static str])],
    &'static [&'static str],
);
const GENERIC: TechRec = ("generic", &[("Universal-Pin", &["univ"])], &["Universal"]);

/// Start a revision-12 stream, written by program `version`, through its object variables.
/// `cells` holds each cell's (arcs, nodes, exports), negative for cells of other libraries.
fn magic12(version: &str, cells: &[[i32; 3]], techs: &[TechRec], names: &[&str]) -> StreamBuilder {
    let locals = cells.iter().filter(|c| c[0] >= 0);
    let arcs: i32 = locals.clone().map(|c| c[0]).sum();
    let nodes: i32 = locals.map(|c| c[1]).sum();
    let exports: i32 = cells.iter().map(|c| c[2]).sum();
    let prims: usize = techs.iter().map(|t| t.1.len()).sum();
    let ports: usize = techs.iter().flat_map(|t| t.1.iter()).map(|p| p.1.len()).sum();
    let arc_protos: usize = techs.iter().map(|t| t.2.len()).sum();

    let mut b = StreamBuilder::new(Magic::Magic12);
    b.bigs(&[0, techs.len() as i32, prims as i32, ports as i32, arc_protos as i32]);
    b.bigs(&[cells.len() as i32, nodes, exports, arcs, 0]);
    // Current cell, version, and extra views
    b.big(-1).string(version).big(0);
    for c in cells.iter() {
        b.bigs(c);
    }
    for (name, nodes, arcs) in techs.iter() {
        b.string(name).big(nodes.len() as i32);
        for (node, ports) in nodes.iter() {
            b.string(node).big(ports.len() as i32);
            for p in ports.iter() {
                b.string(p);
            }
        }
        b.big(arcs.len() as i32);
        for a in arcs.iter() {
            b.string(a);
        }
    }
    // Library user bits, then lambdas
    b.big(0);
    for _ in techs.iter() {
        b.big(0);
    }
    b.big(names.len() as i32);
    for n in names.iter() {
        b.string(n);
    }
    // Library, technology and primitive variables, then view variables
    b.big(0);
    for _ in 0..techs.len() + prims + ports + arc_protos {
        b.big(0);
    }
    b.big(0);
    b
}
/// Revision-12 cell header: name, group links, layout view, version, dates, and bounds
fn cell_header(b: &mut StreamBuilder, name: &str) {
    b.string(name).bigs(&[-1, -1, -2, 1, 0, 0, 0, 0, 0, 0]);
}
/// Revision-12 export record, with no descriptor or variables
fn export(b: &mut StreamBuilder, node: i32, port: i32, name: &str) {
    b.big(node).big(port).string(name).bigs(&[0, 0, 0, 0]);
}
/// Revision-12 node record, up to its variables. `ports` are (arc-end, port) pairs.
fn node(b: &mut StreamBuilder, proto: i32, bbox: [i32; 4], transpose: i32, rotation: i32, ports: &[(i32, i32)]) {
    b.big(proto).bigs(&bbox).big(transpose).big(rotation).bigs(&[0, 0]);
    b.big(ports.len() as i32);
    for (k, port) in ports.iter() {
        b.big(*k).big(*port).big(0);
    }
    // No export instances, and no user bits
    b.bigs(&[0, 0]);
}
/// Revision-12 arc record, with no variables
fn arc(b: &mut StreamBuilder, proto: i32, tail: [i32; 3], head: [i32; 3]) {
    b.big(proto).big(0).bigs(&tail).bigs(&head).bigs(&[0, 0]);
}

/// Read `bytes` into a new [Database]
fn read(bytes: Vec<u8>) -> ElibResult<(Database, ReadReport)> {
    read_with(bytes, &ReaderOptions::default())
}
fn read_with(bytes: Vec<u8>, opts: &ReaderOptions) -> ElibResult<(Database, ReadReport)> {
    let mut db = Database::default();
    let report = db.read_bytes("test", &bytes, opts)?;
    Ok((db, report))
}
/// Get the only cell of library `lib`
fn only_cell(db: &Database, lib: LibKey) -> &Cell {
    let cells: Vec<&Cell> = db.libs[lib].cells.values().collect();
    assert_eq!(cells.len(), 1);
    cells[0]
}

/// Empty library, with one technology, valid in revision `magic`
fn empty_library(magic: Magic, little: bool) -> Vec<u8> {
    let mut b = match little {
        true => StreamBuilder::little(magic),
        false => StreamBuilder::new(magic),
    };
    let caps = crate::header::Capabilities::new(magic);
    b.bigs(&[0, 1, 0, 0, 0, 0, 0, 0, 0, 0]);
    if caps.cell_count {
        b.big(0);
    }
    b.big(-1);
    if caps.version_string {
        b.string("8.04");
    }
    if caps.views {
        b.big(0);
    }
    if caps.tool_bit_count {
        b.big(0);
    }
    b.string("generic").bigs(&[0, 0]);
    if caps.single_user_word {
        b.big(0);
    }
    // Lambda, names, library and technology variables
    b.bigs(&[0, 0, 0, 0]);
    if caps.views {
        b.big(0);
    }
    b.finish()
}

#[test]
fn every_revision_and_byte_order() -> ElibResult<()> {
    for tier in 1..=12 {
        let magic = Magic::from_tier(tier).unwrap();
        for little in [false, true] {
            let bytes = empty_library(magic, little);
            let (db, report) = read(bytes.clone())?;
            assert_eq!(report.bytes, bytes.len() as u64);
            assert!(report.diagnostics.is_empty());
            let lib = &db.libs[report.lib];
            assert!(lib.cells.is_empty());
            let version = if tier >= 8 { "8.04" } else { "3.35" };
            assert_eq!(lib.version, version);
        }
    }
    Ok(())
}

#[test]
fn bad_magic() {
    let mut bytes = empty_library(Magic::Magic12, false);
    bytes[3] ^= 0x40;
    let err = read(bytes).unwrap_err();
    assert!(matches!(err, ElibError::BadMagic(_)));
}

#[test]
fn oversized_counts() {
    // A revision-one header claiming two billion nodes, with nothing behind it
    let mut b = StreamBuilder::new(Magic::from_tier(1).unwrap());
    b.bigs(&[0, 1, 0, 0, 0, 1, 0x7fff_ffff, 0, 0, 0]).big(-1);
    let mut db = Database::default();
    let err = db
        .read_bytes("huge", &b.finish(), &ReaderOptions::default())
        .unwrap_err();
    assert!(matches!(err, ElibError::Truncated { .. }));
    assert!(db.libs.is_empty());
}

#[test]
fn one_cell_one_export() -> ElibResult<()> {
    let mut b = magic12("8.04", &[[0, 0, 1]], &[GENERIC], &[]);
    cell_header(&mut b, "pad");
    b.big(1);
    export(&mut b, -1, -1, "io");
    b.bigs(&[0, 0, 0]);

    let (db, report) = read(b.finish())?;
    assert!(report.diagnostics.is_empty(), "{:?}", report.diagnostics);
    let stats = db.libs[report.lib].stats();
    assert_eq!(stats.cells, 1);
    assert_eq!(stats.exports, 1);
    let cell = only_cell(&db, report.lib);
    assert_eq!(cell.qualified_name(), "pad{lay}");
    assert_eq!(cell.exports[0].name, "io");
    assert!(cell.exports[0].target.is_none());
    Ok(())
}

#[test]
fn export_on_later_node() -> ElibResult<()> {
    let mut b = magic12("8.04", &[[0, 2, 1]], &[GENERIC], &[]);
    cell_header(&mut b, "fwd");
    b.big(1);
    export(&mut b, 1, -2, "out");
    b.bigs(&[0, 0, 0]);
    node(&mut b, -2, [-1, -1, 1, 1], 0, 0, &[]);
    b.big(0);
    node(&mut b, -2, [9, -1, 11, 1], 0, 0, &[]);
    b.big(0);

    let (db, report) = read(b.finish())?;
    assert!(report.diagnostics.is_empty(), "{:?}", report.diagnostics);
    let cell = only_cell(&db, report.lib);
    let target = cell.exports[0].target.as_ref().unwrap();
    assert_eq!(target.node, 1);
    assert_eq!(target.port, "univ");
    assert_eq!(cell.nodes[1].anchor, Point::new(10.0, 0.0));
    assert_eq!(cell.nodes[1].width, 2.0);
    Ok(())
}

#[test]
fn unknown_primitive() -> ElibResult<()> {
    const ODD: TechRec = ("mocmos", &[("Quux-Node", &["q"])], &["Metal-1"]);
    let mut b = magic12("8.04", &[[0, 3, 0]], &[ODD], &[]);
    cell_header(&mut b, "odd");
    b.bigs(&[0, 0, 0, 0]);
    for x in 0..3 {
        node(&mut b, -2, [x * 10, 0, x * 10 + 2, 2], 0, 0, &[]);
        b.big(0);
    }

    let (db, report) = read(b.finish())?;
    assert_eq!(report.diagnostics.len(), 1, "{:?}", report.diagnostics);
    assert_eq!(report.diagnostics[0].kind, DiagnosticKind::Reference);
    assert!(report.diagnostics[0].msg.contains("Quux-Node"));
    let fallback = NodeProto::Primitive(db.registry.find_node("mocmos", "Metal-1-Pin").unwrap());
    let cell = only_cell(&db, report.lib);
    assert!(cell.nodes.iter().all(|n| n.proto == fallback));
    Ok(())
}

#[test]
fn partial_primitive_name() -> ElibResult<()> {
    const LONG: TechRec = ("mocmos", &[("Metal-1-Pin-Extra", &["metal-1"])], &["Metal-1"]);
    let mut b = magic12("8.04", &[[0, 2, 0]], &[LONG], &[]);
    cell_header(&mut b, "long");
    b.bigs(&[0, 0, 0, 0]);
    for x in 0..2 {
        node(&mut b, -2, [x * 10, 0, x * 10 + 2, 2], 0, 0, &[]);
        b.big(0);
    }

    let (db, report) = read(b.finish())?;
    assert_eq!(report.diagnostics.len(), 1, "{:?}", report.diagnostics);
    assert_eq!(report.diagnostics[0].kind, DiagnosticKind::Reference);
    assert!(report.diagnostics[0].msg.contains("mocmos:Metal-1-Pin-Extra"));
    let pin = NodeProto::Primitive(db.registry.find_node("mocmos", "Metal-1-Pin").unwrap());
    let cell = only_cell(&db, report.lib);
    assert!(cell.nodes.iter().all(|n| n.proto == pin));
    Ok(())
}

#[test]
fn arcs_and_dropped_arcs() -> ElibResult<()> {
    let mut b = magic12("8.04", &[[2, 2, 0]], &[GENERIC], &[]);
    cell_header(&mut b, "wires");
    b.bigs(&[0, 0, 0, 0]);
    arc(&mut b, -2, [0, 0, 0], [10, 0, 1]);
    // Its head is not listed by any node
    arc(&mut b, -2, [0, 0, 0], [10, 0, 1]);
    node(&mut b, -2, [-1, -1, 1, 1], 0, 0, &[(0, -2), (2, -2)]);
    b.big(0);
    node(&mut b, -2, [9, -1, 11, 1], 0, 0, &[(1, -2)]);
    b.big(0);

    let (db, report) = read(b.finish())?;
    assert_eq!(report.diagnostics.len(), 1, "{:?}", report.diagnostics);
    assert!(report.diagnostics[0].msg.contains("dropped 1 arcs"));
    let cell = only_cell(&db, report.lib);
    assert_eq!(cell.arcs.len(), 1);
    let wire = &cell.arcs[0];
    assert_eq!((wire.tail.node, wire.head.node), (0, 1));
    assert_eq!(wire.head.port, "univ");
    assert_eq!(wire.head.location, Point::new(10.0, 0.0));
    Ok(())
}

#[test]
fn port_variables_migrate() -> ElibResult<()> {
    let mut b = magic12("8.04", &[[0, 1, 0]], &[GENERIC], &["ATTRP_univ_cap", "ATTRP_bogus_x"]);
    cell_header(&mut b, "attrs");
    b.bigs(&[0, 0, 0, 0]);
    node(&mut b, -2, [-1, -1, 1, 1], 0, 0, &[]);
    b.big(2);
    b.small(0).big(VINTEGER).bigs(&[0, 0]).big(5);
    b.small(1).big(VINTEGER).bigs(&[0, 0]).big(6);

    let (db, report) = read(b.finish())?;
    assert!(report.diagnostics.is_empty(), "{:?}", report.diagnostics);
    let pin = &only_cell(&db, report.lib).nodes[0];
    let cap = &pin.port_vars["univ"][0];
    assert_eq!(cap.key, "cap");
    assert_eq!(cap.value, VarValue::Int(5));
    // Variables for ports the node does not have stay on the node
    assert_eq!(pin.vars.len(), 1);
    assert_eq!(pin.vars[0].key, "ATTRP_bogus_x");
    Ok(())
}

/// Read a single 4x2 node, written by `version` with orientation words `transpose` and `rotation`
fn oriented_node(version: &str, transpose: i32, rotation: i32) -> ElibResult<NodeInst> {
    let mut b = magic12(version, &[[0, 1, 0]], &[GENERIC], &[]);
    cell_header(&mut b, "m");
    b.bigs(&[0, 0, 0, 0]);
    node(&mut b, -2, [-2, -1, 2, 1], transpose, rotation, &[]);
    b.big(0);
    let (db, report) = read(b.finish())?;
    Ok(only_cell(&db, report.lib).nodes[0].clone())
}
#[test]
fn mirror_normalization() -> ElibResult<()> {
    // Before 7.01, any transpose is a flip in y plus a quarter turn
    let n = oriented_node("6.08", 1, 0)?;
    assert_eq!((n.rotation, n.width, n.height), (900, 4.0, -2.0));
    let n = oriented_node("6.08", 1, 900)?;
    assert_eq!((n.rotation, n.flip_x(), n.flip_y()), (1800, false, true));

    // Later versions store mirror bits
    let n = oriented_node("8.04", 2, 0)?;
    assert_eq!((n.rotation, n.width, n.height), (0, -4.0, 2.0));
    let n = oriented_node("8.04", 5, 0)?;
    assert_eq!((n.rotation, n.flip_x(), n.flip_y()), (900, false, false));
    let n = oriented_node("8.04", 6, 1800)?;
    assert_eq!((n.rotation, n.flip_x(), n.flip_y()), (1800, true, true));
    Ok(())
}

/// Library with three tools, and user bits `bits`, in revision `magic`.
/// Revisions with a tool-bits count declare two words per object.
fn tool_bits_library(magic: Magic, bits: &[i32]) -> Vec<u8> {
    let caps = crate::header::Capabilities::new(magic);
    let mut b = StreamBuilder::new(magic);
    b.bigs(&[3, 1, 0, 0, 0, 0, 0, 0, 0, 0]).big(-1);
    if caps.tool_bit_count {
        b.big(2);
    }
    b.string("generic").bigs(&[0, 0]);
    for t in ["user", "io", "drc"] {
        b.string(t);
    }
    if caps.tool_bit_count {
        b.string("user").string("io");
    }
    b.bigs(bits);
    // Lambda, names, then library, tool and technology variables
    b.big(10).big(0);
    b.bigs(&[0, 0, 0, 0, 0]);
    b.finish()
}
#[test]
fn tool_bit_counts() -> ElibResult<()> {
    for tier in 3..=6 {
        let magic = Magic::from_tier(tier).unwrap();
        let (db, report) = read(tool_bits_library(magic, &[7, 99]))?;
        let lib = &db.libs[report.lib];
        assert_eq!(lib.user_bits, 7);
        // Versions before 5 store lambda at a twentieth of its scale
        assert_eq!(lib.tech_scale["generic"], 200.0);
    }
    // Revision two stores a word per tool, revision seven a single word
    for (tier, bits) in [(2, &[7, 99, 98][..]), (7, &[7][..])] {
        let magic = Magic::from_tier(tier).unwrap();
        let (db, report) = read(tool_bits_library(magic, bits))?;
        assert_eq!(db.libs[report.lib].user_bits, 7);
        assert_eq!(db.libs[report.lib].tech_scale["generic"], 200.0);
    }
    Ok(())
}

#[test]
fn clipped_integers() -> ElibResult<()> {
    let mut b = StreamBuilder::wide(8);
    b.bigs(&[0, 1, 0, 0, 0, 0, 0, 0, 0, 0]);
    // Fake-cell count, then a current cell whose discarded bytes are not a sign extension
    b.big(0).raw(&[0, 0, 0, 1, 0xFF, 0xFF, 0xFF, 0xFF]);
    b.string("8.04").big(0);
    b.string("generic").bigs(&[0, 0]);
    // User bits, lambda, names, then library, technology and view variables
    b.bigs(&[-1, 0, 0, 0, 0, 0]);

    let (db, report) = read(b.finish())?;
    assert_eq!(report.clipped, 1);
    let lib = &db.libs[report.lib];
    assert_eq!(lib.user_bits, -1);
    assert!(lib.cur_cell.is_none());
    Ok(())
}

/// Unavailable cell "leaf" of library "missing", instantiated by local cell "top"
fn missing_reference() -> Vec<u8> {
    let mut b = magic12("8.04", &[[0, 1, 0], [-1, -1, 2]], &[GENERIC], &[]);
    cell_header(&mut b, "top");
    b.bigs(&[0, 0, 0, 0]);
    b.string("leaf").bigs(&[-1, -1, -2, 1, 0, 0, -10, 10, -5, 5]);
    b.string("nowhere/missing.elib").big(2).string("a").string("b");
    node(&mut b, 1, [-10, -5, 10, 5], 0, 0, &[]);
    b.big(0);
    b.finish()
}
#[test]
fn unavailable_external() -> ElibResult<()> {
    let (db, report) = read(missing_reference())?;
    assert_eq!(report.diagnostics.len(), 2, "{:?}", report.diagnostics);
    assert!(report.diagnostics.iter().all(|d| d.kind == DiagnosticKind::Reference));

    let lib = &db.libs[report.lib];
    let key = lib.find_cell("leafFROMmissing{lay}").unwrap();
    let stub = &lib.cells[key];
    assert_eq!((stub.bounds.width(), stub.bounds.height()), (20.0, 10.0));
    let names: Vec<&str> = stub.exports.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["a", "b"]);
    assert_eq!(
        stub.var("IO_true_library").map(|v| &v.value),
        Some(&VarValue::Str("missing".into()))
    );

    let top = &lib.cells[lib.find_cell("top{lay}").unwrap()];
    let inst = &top.nodes[0];
    assert_eq!(inst.proto, NodeProto::Cell(CellRef { lib: report.lib, cell: key }));
    assert_eq!((inst.width, inst.height), (20.0, 10.0));
    assert_eq!(inst.anchor, Point::new(0.0, 0.0));
    Ok(())
}
#[test]
fn missing_library_policy() -> ElibResult<()> {
    let opts = ReaderOptionsBuilder::default()
        .missing_library(MissingLibraryPolicy::Fail)
        .build()?;
    let mut db = Database::default();
    let err = db.read_bytes("test", &missing_reference(), &opts).unwrap_err();
    assert!(format!("{}", err).contains("missing"));
    assert!(db.libs.is_empty());
    Ok(())
}

/// Two-cell library: a leaf with two exports, and a top cell instantiating it.
/// Bounds are normalized, so that the library survives a write and re-read unchanged.
fn sample_db() -> ElibResult<(Database, LibKey)> {
    let mut db = Database::default();
    let reg = &db.registry;
    let pin = NodeProto::Primitive(reg.find_node("mocmos", "Metal-1-Pin").unwrap());
    let via = NodeProto::Primitive(reg.find_node("mocmos", "Metal-1-Metal-2-Con").unwrap());
    let center = NodeProto::Primitive(reg.find_node("generic", "Cell-Center").unwrap());
    let m1 = reg.find_arc("mocmos", "Metal-1").unwrap();
    let date = Utc.timestamp_opt(1_000_000_000, 0).single();

    let mut lib = Library::new("sample");
    lib.tech_scale.insert("mocmos".into(), 200.0);
    lib.vars.push(Variable::new("LIB_title", VarValue::Str("sample".into())));

    let mut inv = Cell::new("inv", View::layout());
    inv.creation = date;
    inv.revision = date;
    let mut a = NodeInst::new(pin, Point::new(0.0, 0.0), 2.0, 2.0);
    a.name = Some("in".into());
    let mut y = NodeInst::new(via, Point::new(10.0, 0.0), -4.0, 4.0);
    y.rotation = 900;
    inv.nodes = vec![a, y];
    let end = |node: usize, port: &str, x: f64| ArcEnd {
        node,
        port: port.into(),
        location: Point::new(x, 0.0),
    };
    inv.arcs.push(ArcInst {
        proto: m1,
        name: Some("w1".into()),
        name_descriptor: None,
        width: 2.0,
        tail: end(0, "metal-1", 0.0),
        head: end(1, "metal-1-metal-2", 10.0),
        user_bits: 0,
        vars: Vec::new(),
    });
    for (name, node, port) in [("A", 0, "metal-1"), ("Y", 1, "metal-1-metal-2")] {
        inv.exports.push(Export {
            name: name.into(),
            target: Some(PortInstRef {
                node,
                port: port.into(),
            }),
            descriptor: None,
            user_bits: 0,
            vars: Vec::new(),
        });
    }
    inv.vars.push(Variable::new("note", VarValue::Str("leaf".into())));
    let inv = lib.cells.insert(inv);
    let key = db.libs.insert(lib);
    db.update_bounds(key)?;

    let inv_ref = CellRef { lib: key, cell: inv };
    let b = db.libs[key].cells[inv].bounds;
    let mut top = Cell::new("top", View::layout());
    top.group = 1;
    let mut x1 = NodeInst::new(NodeProto::Cell(inv_ref), Point::new(100.0, 50.0), b.width(), b.height());
    x1.name = Some("x1".into());
    x1.port_vars
        .insert("A".into(), vec![Variable::new("cap", VarValue::Int(3))]);
    top.nodes = vec![NodeInst::new(center, Point::new(5.0, 5.0), 0.0, 0.0), x1];
    top.exports.push(Export {
        name: "OUT".into(),
        target: Some(PortInstRef {
            node: 1,
            port: "Y".into(),
        }),
        descriptor: None,
        user_bits: 0,
        vars: Vec::new(),
    });
    db.libs[key].cells.insert(top);
    db.update_bounds(key)?;
    Ok((db, key))
}

#[test]
fn roundtrip_sample() -> ElibResult<()> {
    let (db, key) = sample_db()?;
    let db2 = roundtrip(&db, key)?;
    let lib = db2.find_library("sample").unwrap();
    let top = &db2.libs[lib].cells[db2.libs[lib].find_cell("top").unwrap()];
    assert_eq!(top.nodes[1].name.as_deref(), Some("x1"));
    assert_eq!(top.nodes[1].port_vars["A"][0].value, VarValue::Int(3));
    Ok(())
}

#[test]
fn truncation() -> ElibResult<()> {
    let (db, key) = sample_db()?;
    let mut bytes = Vec::new();
    db.write_library(key, &mut bytes)?;
    for cut in 0..bytes.len() {
        let mut db2 = Database::default();
        let result = db2.read_bytes("cut", &bytes[..cut], &ReaderOptions::default());
        match result {
            Err(ElibError::Truncated { bytepos, .. }) => assert!(bytepos <= cut as u64),
            other => panic!("Expected truncation at {}, got {:?}", cut, other),
        }
        assert!(db2.libs.is_empty());
    }
    let mut db2 = Database::default();
    db2.read_bytes("whole", &bytes, &ReaderOptions::default())?;
    Ok(())
}

#[test]
fn write_errors() -> ElibResult<()> {
    let (mut db, key) = sample_db()?;
    let inv = db.libs[key].find_cell("inv").unwrap();
    db.libs[key].cells[inv].arcs[0].head.port = "nonsense".into();
    let mut bytes = Vec::new();
    assert!(db.write_library(key, &mut bytes).is_err());
    Ok(())
}

/// A cell holding one Metal-1 pin, exported as `export`
fn pin_cell(db: &Database, name: &str, export: &str) -> Cell {
    let pin = db.registry.find_node("mocmos", "Metal-1-Pin").unwrap();
    let mut cell = Cell::new(name, View::layout());
    cell.nodes
        .push(NodeInst::new(NodeProto::Primitive(pin), Point::new(0.0, 0.0), 2.0, 2.0));
    cell.exports.push(Export {
        name: export.into(),
        target: Some(PortInstRef {
            node: 0,
            port: "metal-1".into(),
        }),
        descriptor: None,
        user_bits: 0,
        vars: Vec::new(),
    });
    cell
}
/// Add a cell named `name` to `lib`, instantiating `sub`
fn add_instance(db: &mut Database, lib: LibKey, name: &str, sub: CellRef) -> ElibResult<()> {
    let b = db.cell(&sub).unwrap().bounds;
    let mut cell = Cell::new(name, View::layout());
    cell.nodes.push(NodeInst::new(
        NodeProto::Cell(sub),
        Point::new(20.0, 0.0),
        b.width(),
        b.height(),
    ));
    db.libs[lib].cells.insert(cell);
    db.update_bounds(lib)
}
/// Library "cells" holding a leaf, and library "top" instantiating it
fn two_libraries() -> ElibResult<(Database, LibKey, LibKey)> {
    let mut db = Database::default();
    let mut cells = Library::new("cells");
    let leaf = cells.cells.insert(pin_cell(&db, "leaf", "p"));
    let cells = db.libs.insert(cells);
    db.update_bounds(cells)?;
    let top = db.libs.insert(Library::new("top"));
    add_instance(&mut db, top, "chip", CellRef { lib: cells, cell: leaf })?;
    Ok((db, cells, top))
}
/// Get the library of the cell instantiated by the first node of `lib`'s cell `cell`
fn instance_library(db: &Database, lib: LibKey, cell: &str) -> String {
    let l = &db.libs[lib];
    match l.cells[l.find_cell(cell).unwrap()].nodes[0].proto {
        NodeProto::Cell(c) => db.libs[c.lib].name.clone(),
        _ => panic!("Expected an instance"),
    }
}

#[test]
fn search_directories() -> ElibResult<()> {
    let (db, cells, top) = two_libraries()?;
    let (leafdir, topdir) = (tempdir()?, tempdir()?);
    db.save_library(cells, leafdir.path().join("cells.elib"))?;
    let top_path = topdir.path().join("top.elib");
    db.save_library(top, &top_path)?;

    // Found via the search path
    let opts = ReaderOptionsBuilder::default()
        .search_dirs(vec![leafdir.path().to_path_buf()])
        .build()?;
    let mut db2 = Database::default();
    let report = db2.read_library(&top_path, &opts)?;
    assert!(report.diagnostics.is_empty(), "{:?}", report.diagnostics);
    assert_eq!(instance_library(&db2, report.lib, "chip"), "cells");

    // Not found, and replaced
    let mut db3 = Database::default();
    let report = db3.read_library(&top_path, &ReaderOptions::default())?;
    assert!(!report.diagnostics.is_empty());
    assert_eq!(instance_library(&db3, report.lib, "chip"), "top");
    assert!(db3.libs[report.lib].find_cell("leafFROMcells").is_some());
    Ok(())
}

/// [LibraryPrompt] which answers from a list
struct Answers(Vec<PathBuf>);
impl LibraryPrompt for Answers {
    fn locate(&mut self, _libname: &str) -> Option<PathBuf> {
        self.0.pop()
    }
}
#[test]
fn library_prompt() -> ElibResult<()> {
    let (db, cells, top) = two_libraries()?;
    let (leafdir, topdir) = (tempdir()?, tempdir()?);
    let leaf_path = leafdir.path().join("cells.elib");
    db.save_library(cells, &leaf_path)?;
    let top_path = topdir.path().join("top.elib");
    db.save_library(top, &top_path)?;

    // The first answer, popped from the back, does not exist
    let answers = Answers(vec![leaf_path, leafdir.path().join("nope.elib")]);
    let mut db2 = Database::default();
    let report = ElibParser::open(&top_path, &mut db2, &ReaderOptions::default())?
        .with_prompt(Box::new(answers))
        .parse()?;
    assert!(report.diagnostics.is_empty(), "{:?}", report.diagnostics);
    assert_eq!(instance_library(&db2, report.lib, "chip"), "cells");
    Ok(())
}

#[test]
fn load_cycle() -> ElibResult<()> {
    // Library A instantiates B, which instantiates A
    let mut db = Database::default();
    let mut a = Library::new("A");
    let a2 = a.cells.insert(pin_cell(&db, "a2", "q"));
    let mut b = Library::new("B");
    let b1 = b.cells.insert(pin_cell(&db, "b1", "p"));
    let (a, b) = (db.libs.insert(a), db.libs.insert(b));
    db.update_bounds(a)?;
    db.update_bounds(b)?;
    add_instance(&mut db, a, "a1", CellRef { lib: b, cell: b1 })?;
    add_instance(&mut db, b, "b2", CellRef { lib: a, cell: a2 })?;

    let dir = tempdir()?;
    db.save_library(a, dir.path().join("A.elib"))?;
    db.save_library(b, dir.path().join("B.elib"))?;

    let mut db2 = Database::default();
    let report = db2.read_library(dir.path().join("A.elib"), &ReaderOptions::default())?;
    let (a, b) = (db2.find_library("A").unwrap(), db2.find_library("B").unwrap());
    assert_eq!(report.lib, a);
    assert!(!db2.is_loading(a) && !db2.is_loading(b));
    assert_eq!(instance_library(&db2, a, "a1"), "B");
    // B was read while A was still loading, so its reference to A is a placeholder
    assert_eq!(instance_library(&db2, b, "b2"), "B");
    assert!(db2.libs[b].find_cell("a2FROMA").is_some());
    assert!(report.diagnostics.iter().any(|d| d.msg.contains("still being read")));
    Ok(())
}

/// [ProgressSink] which records everything it is told
struct Recorder(Rc<RefCell<Vec<u8>>>);
impl ProgressSink for Recorder {
    fn progress(&mut self, percent: u8) {
        self.0.borrow_mut().push(percent);
    }
}
#[test]
fn progress_reports() -> ElibResult<()> {
    let (db, key) = sample_db()?;
    let mut bytes = Vec::new();
    db.write_library(key, &mut bytes)?;
    let seen = Rc::new(RefCell::new(Vec::new()));
    let mut db2 = Database::default();
    ElibParser::from_bytes(bytes, "sample", &mut db2, &ReaderOptions::default())?
        .with_progress(Box::new(Recorder(seen.clone())))
        .parse()?;
    let seen = seen.borrow();
    assert_eq!(seen.last(), Some(&100));
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    Ok(())
}

#[test]
fn serialize_library() -> ElibResult<()> {
    let (db, key) = sample_db()?;
    let lib = &db.libs[key];
    let json = Json.to_string(lib)?;
    let back: Library = Json.from_str(&json)?;
    assert_eq!(&back, lib);
    Ok(())
}

#[test]
fn library_equality() -> ElibResult<()> {
    let (db, key) = sample_db()?;
    let lib = db.libs[key].clone();
    assert_eq!(lib, db.libs[key]);
    let mut other = lib.clone();
    let inv = other.find_cell("inv").unwrap();
    other.cells[inv].nodes.pop();
    assert_ne!(other, lib);
    let mut other = lib.clone();
    other.user_bits ^= 1;
    assert_ne!(other, lib);
    Ok(())
}
