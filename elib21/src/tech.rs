//!
//! # Technology & Tool Registry
//!
//! Primitive node prototypes, arc prototypes, and tools,
//! referenced by name in ELIB files and by typed index in memory.
//!

// Std-Lib Imports
use std::collections::BTreeMap;

// Crates.io
use serde::{Deserialize, Serialize};

// Workspace Imports
use elib21utils::SerdeFile;

/// Technology index into a [TechRegistry]
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TechId(pub usize);

/// Primitive node prototype, by technology and index
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct PrimNodeId {
    pub tech: TechId,
    pub node: usize,
}

/// Primitive port prototype, by technology, node, and index
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct PrimPortId {
    pub tech: TechId,
    pub node: usize,
    pub port: usize,
}
impl PrimPortId {
    /// Get the [PrimNodeId] of our parent node
    pub fn node_id(&self) -> PrimNodeId {
        PrimNodeId {
            tech: self.tech,
            node: self.node,
        }
    }
}

/// Arc prototype, by technology and index
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct ArcProtoId {
    pub tech: TechId,
    pub arc: usize,
}

/// # Primitive Port Prototype
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct PrimitivePort {
    pub name: String,
}

/// # Primitive Node Prototype
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct PrimitiveNode {
    pub name: String,
    /// Ports, in declaration order
    pub ports: Vec<PrimitivePort>,
    /// Whether instances carry an outline ("trace") of points
    #[serde(default)]
    pub holds_outline: bool,
}
impl PrimitiveNode {
    /// Find a port by name
    pub fn find_port(&self, name: &str) -> Option<usize> {
        self.ports.iter().position(|p| p.name == name)
    }
}

/// # Arc Prototype
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ArcProto {
    pub name: String,
}

/// # Technology
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Technology {
    pub name: String,
    /// Generic technologies hold process-independent primitives,
    /// and do not count when choosing a cell's dominant technology.
    #[serde(default)]
    pub generic: bool,
    pub nodes: Vec<PrimitiveNode>,
    pub arcs: Vec<ArcProto>,
    /// Renamed primitive nodes, from old name to current name
    #[serde(default)]
    pub old_node_names: BTreeMap<String, String>,
    /// Renamed arc prototypes, from old name to current name
    #[serde(default)]
    pub old_arc_names: BTreeMap<String, String>,
    /// Renamed primitive ports, from old name to current name, on any node
    #[serde(default)]
    pub old_port_names: BTreeMap<String, String>,
}
impl Technology {
    /// Find a primitive node by name
    pub fn find_node(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }
    /// Find an arc prototype by name
    pub fn find_arc(&self, name: &str) -> Option<usize> {
        self.arcs.iter().position(|a| a.name == name)
    }
    /// Convert a node name from an older revision of this technology
    pub fn convert_old_node_name(&self, name: &str) -> Option<usize> {
        self.old_node_names
            .get(name)
            .and_then(|new| self.find_node(new))
    }
    /// Convert an arc name from an older revision of this technology
    pub fn convert_old_arc_name(&self, name: &str) -> Option<usize> {
        self.old_arc_names
            .get(name)
            .and_then(|new| self.find_arc(new))
    }
    /// Convert the name of a port on node `node` from an older revision of this technology
    pub fn convert_old_port_name(&self, node: usize, name: &str) -> Option<usize> {
        let new = self.old_port_names.get(name)?;
        self.nodes.get(node)?.find_port(new)
    }
}

/// # Tool
/// Analysis and synthesis tools, which store settings and per-object bits in libraries
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Tool {
    pub name: String,
}

/// # Technology & Tool Registry
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TechRegistry {
    pub techs: Vec<Technology>,
    pub tools: Vec<Tool>,
}
impl Default for TechRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
impl SerdeFile for TechRegistry {}

impl TechRegistry {
    /// Find a [Technology] by name
    pub fn find_tech(&self, name: &str) -> Option<TechId> {
        self.techs.iter().position(|t| t.name == name).map(TechId)
    }
    /// Get a [Technology] by id. Panics if `id` did not come from this registry.
    pub fn tech(&self, id: TechId) -> &Technology {
        &self.techs[id.0]
    }
    pub fn node(&self, id: PrimNodeId) -> &PrimitiveNode {
        &self.techs[id.tech.0].nodes[id.node]
    }
    pub fn arc(&self, id: ArcProtoId) -> &ArcProto {
        &self.techs[id.tech.0].arcs[id.arc]
    }
    pub fn port_name(&self, id: PrimPortId) -> &str {
        &self.node(id.node_id()).ports[id.port].name
    }
    /// Find a primitive node by technology and node name
    pub fn find_node(&self, tech: &str, node: &str) -> Option<PrimNodeId> {
        let t = self.find_tech(tech)?;
        let node = self.tech(t).find_node(node)?;
        Some(PrimNodeId { tech: t, node })
    }
    /// Find an arc prototype by technology and arc name
    pub fn find_arc(&self, tech: &str, arc: &str) -> Option<ArcProtoId> {
        let t = self.find_tech(tech)?;
        let arc = self.tech(t).find_arc(arc)?;
        Some(ArcProtoId { tech: t, arc })
    }
    /// Find the port named `port` on primitive `node`
    pub fn find_port(&self, node: PrimNodeId, port: &str) -> Option<PrimPortId> {
        self.node(node)
            .find_port(port)
            .map(|port| PrimPortId {
                tech: node.tech,
                node: node.node,
                port,
            })
    }
    /// Find a [Tool] by name
    pub fn find_tool(&self, name: &str) -> Option<usize> {
        self.tools.iter().position(|t| t.name == name)
    }
    /// Qualified name of primitive `id`, `tech:node`
    pub fn node_name(&self, id: PrimNodeId) -> String {
        format!("{}:{}", self.tech(id.tech).name, self.node(id).name)
    }
    /// Qualified name of arc prototype `id`, `tech:arc`
    pub fn arc_name(&self, id: ArcProtoId) -> String {
        format!("{}:{}", self.tech(id.tech).name, self.arc(id).name)
    }
    /// Boolean indication of whether `id` is the generic cell-center marker
    pub fn is_cell_center(&self, id: PrimNodeId) -> bool {
        let tech = self.tech(id.tech);
        tech.generic && tech.nodes[id.node].name == "Cell-Center"
    }

    /// Create the built-in registry
    pub fn builtin() -> Self {
        let techs = vec![generic(), mocmos("mocmos"), mocmos("mocmosold"), schematic(), artwork()];
        let tools = [
            "user",
            "io",
            "drc",
            "erc",
            "network",
            "routing",
            "simulation",
            "compaction",
            "logeffort",
            "project",
            "vhdl",
            "sc",
            "placement",
        ];
        Self {
            techs,
            tools: tools
                .iter()
                .map(|n| Tool {
                    name: n.to_string(),
                })
                .collect(),
        }
    }
}

/// Create a primitive node named `name` with ports `ports`
fn prim(name: &str, ports: &[&str]) -> PrimitiveNode {
    PrimitiveNode {
        name: name.into(),
        ports: ports
            .iter()
            .map(|p| PrimitivePort {
                name: p.to_string(),
            })
            .collect(),
        holds_outline: false,
    }
}
/// Create an outline-holding primitive node
fn outline(name: &str, ports: &[&str]) -> PrimitiveNode {
    PrimitiveNode {
        holds_outline: true,
        ..prim(name, ports)
    }
}
fn arcs(names: &[&str]) -> Vec<ArcProto> {
    names
        .iter()
        .map(|n| ArcProto {
            name: n.to_string(),
        })
        .collect()
}

fn renames(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(old, new)| (old.to_string(), new.to_string()))
        .collect()
}

fn generic() -> Technology {
    Technology {
        name: "generic".into(),
        generic: true,
        nodes: vec![
            prim("Universal-Pin", &["univ"]),
            prim("Invisible-Pin", &["center"]),
            prim("Unrouted-Pin", &["unrouted"]),
            prim("Cell-Center", &["center"]),
            prim("Port", &["center"]),
            prim("DRC-Node", &["center"]),
            prim("Essential-Bounds", &["center"]),
            prim("Simulation-Probe", &["center"]),
        ],
        arcs: arcs(&["Universal", "Invisible", "Unrouted"]),
        ..Default::default()
    }
}

fn mocmos(name: &str) -> Technology {
    Technology {
        name: name.into(),
        generic: false,
        nodes: vec![
            prim("Metal-1-Pin", &["metal-1"]),
            prim("Metal-2-Pin", &["metal-2"]),
            prim("Polysilicon-1-Pin", &["polysilicon-1"]),
            prim("P-Active-Pin", &["p-active"]),
            prim("N-Active-Pin", &["n-active"]),
            prim("Metal-1-Metal-2-Con", &["metal-1-metal-2"]),
            prim("Metal-1-Polysilicon-1-Con", &["metal-1-polysilicon-1"]),
            prim("Metal-1-P-Active-Con", &["metal-1-p-active"]),
            prim("Metal-1-N-Active-Con", &["metal-1-n-active"]),
            prim(
                "P-Transistor",
                &["p-trans-poly-left", "p-trans-diff-top", "p-trans-poly-right", "p-trans-diff-bottom"],
            ),
            prim(
                "N-Transistor",
                &["n-trans-poly-left", "n-trans-diff-top", "n-trans-poly-right", "n-trans-diff-bottom"],
            ),
            outline("Metal-1-Node", &["metal-1"]),
            outline("Metal-2-Node", &["metal-2"]),
            outline("Polysilicon-1-Node", &["polysilicon-1"]),
            outline("P-Active-Node", &["active"]),
            outline("N-Active-Node", &["active"]),
        ],
        arcs: arcs(&["Metal-1", "Metal-2", "Polysilicon-1", "P-Active", "N-Active"]),
        old_node_names: renames(&[
            ("Metal-1-Substrate-Con", "Metal-1-N-Active-Con"),
            ("Metal-1-Well-Con", "Metal-1-P-Active-Con"),
            ("Metal-1-Polysilicon-Con", "Metal-1-Polysilicon-1-Con"),
            ("Polysilicon-Pin", "Polysilicon-1-Pin"),
        ]),
        old_arc_names: renames(&[("Polysilicon", "Polysilicon-1"), ("Active", "P-Active")]),
        old_port_names: renames(&[
            ("metal-1-polysilicon", "metal-1-polysilicon-1"),
            ("polysilicon", "polysilicon-1"),
        ]),
    }
}

fn schematic() -> Technology {
    Technology {
        name: "schematic".into(),
        generic: false,
        nodes: vec![
            prim("Wire_Pin", &["wire"]),
            prim("Bus_Pin", &["bus"]),
            prim("Wire_Con", &["wire"]),
            prim("Off-Page", &["a", "y"]),
            prim("Power", &["vdd"]),
            prim("Ground", &["gnd"]),
            prim("Resistor", &["a", "b"]),
            prim("Capacitor", &["a", "b"]),
            prim("Transistor", &["g", "s", "d"]),
            prim("Buffer", &["a", "y", "c"]),
            prim("And", &["a", "y"]),
            prim("Or", &["a", "y"]),
        ],
        arcs: arcs(&["wire", "bus"]),
        ..Default::default()
    }
}

fn artwork() -> Technology {
    Technology {
        name: "artwork".into(),
        generic: false,
        nodes: vec![
            prim("Pin", &["site"]),
            prim("Box", &["box"]),
            prim("Crossed-Box", &["fbox"]),
            prim("Filled-Box", &["fbox"]),
            outline("Opened-Polygon", &["lines"]),
            outline("Closed-Polygon", &["lines"]),
            prim("Circle", &["center"]),
            prim("Arrow", &["arrow"]),
        ],
        arcs: arcs(&["Solid", "Dotted", "Dashed", "Thicker"]),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_lookups() {
        let reg = TechRegistry::builtin();
        let pin = reg.find_node("generic", "Universal-Pin").unwrap();
        assert_eq!(reg.node_name(pin), "generic:Universal-Pin");
        assert_eq!(reg.find_port(pin, "univ").map(|p| p.port), Some(0));
        assert!(reg.find_node("mocmos", "Universal-Pin").is_none());
        let m1 = reg.find_arc("mocmos", "Metal-1").unwrap();
        assert_eq!(reg.arc_name(m1), "mocmos:Metal-1");
        assert_eq!(reg.find_tool("network"), Some(4));
    }
    #[test]
    fn old_node_names() {
        let reg = TechRegistry::builtin();
        let t = reg.tech(reg.find_tech("mocmos").unwrap());
        let idx = t.convert_old_node_name("Polysilicon-Pin").unwrap();
        assert_eq!(t.nodes[idx].name, "Polysilicon-1-Pin");
        assert!(t.convert_old_node_name("Nonsense").is_none());
        let idx = t.convert_old_arc_name("Polysilicon").unwrap();
        assert_eq!(t.arcs[idx].name, "Polysilicon-1");
        let con = t.find_node("Metal-1-Polysilicon-1-Con").unwrap();
        assert_eq!(t.convert_old_port_name(con, "metal-1-polysilicon"), Some(0));
        assert_eq!(t.convert_old_port_name(con, "polysilicon"), None);
    }
    #[test]
    fn cell_center() {
        let reg = TechRegistry::builtin();
        assert!(reg.is_cell_center(reg.find_node("generic", "Cell-Center").unwrap()));
        assert!(!reg.is_cell_center(reg.find_node("generic", "Port").unwrap()));
    }
}
