//!
//! # Prototype Resolution
//!
//! ELIB files name the technologies, primitives, arcs and tools they use.
//! [ProtoResolver] maps each of these names onto the live [TechRegistry],
//! substituting and recording a soft error where no match exists.
//! Each soft error is reported once, on first use of the entry it is attached to.
//!

// Crates.io
use log::warn;

// Local Imports
use crate::data::{Diagnostic, DiagnosticKind};
use crate::tech::{ArcProtoId, PrimNodeId, PrimPortId, TechId, TechRegistry};

/// Push a [DiagnosticKind::Reference] diagnostic, and log it
pub(crate) fn soft_error(diags: &mut Vec<Diagnostic>, msg: String) {
    warn!("{}", msg);
    diags.push(Diagnostic {
        kind: DiagnosticKind::Reference,
        msg,
    });
}

/// A resolved entry, and its pending soft error, if any
#[derive(Debug, Clone)]
struct Resolved<T> {
    value: T,
    error: Option<String>,
}
impl<T: Copy> Resolved<T> {
    fn ok(value: T) -> Self {
        Self { value, error: None }
    }
    /// Get our value, reporting our soft error on first use
    fn get(&mut self, diags: &mut Vec<Diagnostic>) -> T {
        if let Some(msg) = self.error.take() {
            soft_error(diags, msg);
        }
        self.value
    }
}

/// A technology as named in a file
#[derive(Debug, Clone)]
struct FileTech {
    entry: Resolved<TechId>,
    name: String,
    /// Resolved without substitution
    ok: bool,
    /// Names of this technology's primitives and arcs carry a six-character prefix
    strip_prefix: bool,
}

/// # Prototype Resolver
/// Per-file tables of resolved technologies, primitives, ports, arcs and tools,
/// in on-disk index order.
#[derive(Debug, Clone, Default)]
pub struct ProtoResolver {
    techs: Vec<FileTech>,
    nodes: Vec<Resolved<PrimNodeId>>,
    /// Whether each node resolved without error, gating errors on its ports
    node_ok: Vec<bool>,
    ports: Vec<Option<Resolved<PrimPortId>>>,
    arcs: Vec<Option<Resolved<ArcProtoId>>>,
    tools: Vec<Resolved<Option<usize>>>,
    /// Set when any tool's file index differs from its registry index
    pub tool_bits_messed: bool,
}
impl ProtoResolver {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn num_techs(&self) -> usize {
        self.techs.len()
    }
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }
    pub fn num_ports(&self) -> usize {
        self.ports.len()
    }
    pub fn num_arcs(&self) -> usize {
        self.arcs.len()
    }
    pub fn num_tools(&self) -> usize {
        self.tools.len()
    }
    /// File-name of technology `idx`
    pub fn tech_name(&self, idx: usize) -> Option<&str> {
        self.techs.get(idx).map(|t| t.name.as_str())
    }
    /// Boolean indication of whether technology `idx` resolved without error
    pub fn tech_ok(&self, idx: usize) -> bool {
        self.techs.get(idx).map(|t| t.ok).unwrap_or(false)
    }

    /// Add technology `name`, returning its file index
    pub fn add_tech(
        &mut self,
        reg: &TechRegistry,
        name: &str,
        convert_mosis: bool,
    ) -> Result<usize, String> {
        let mut want = name;
        if convert_mosis {
            want = match name {
                "mocmossub" => "mocmos",
                "mocmos" => "mocmosold",
                n => n,
            };
        }
        let mut strip_prefix = false;
        let found = match reg.find_tech(want) {
            Some(t) => Some(t),
            None => {
                let alias = match want {
                    "imos" => {
                        strip_prefix = true;
                        "mocmos"
                    }
                    "logic" => "schematic",
                    "epic8c" | "epic7c" => "epic7s",
                    n => n,
                };
                reg.find_tech(alias)
            }
        };
        let entry = match found {
            Some(t) => Resolved::ok(t),
            None => {
                let first = reg.techs.first().ok_or("Technology registry is empty")?;
                Resolved {
                    value: TechId(0),
                    error: Some(format!(
                        "technology '{}' does not exist, using '{}'",
                        name, first.name
                    )),
                }
            }
        };
        self.techs.push(FileTech {
            ok: entry.error.is_none(),
            entry,
            name: name.to_string(),
            strip_prefix,
        });
        Ok(self.techs.len() - 1)
    }

    /// Add primitive node `name` of file technology `tech`, returning its file index
    pub fn add_node(&mut self, reg: &TechRegistry, tech: usize, name: &str) -> Result<usize, String> {
        let ft = self.techs.get(tech).ok_or("Invalid technology index")?;
        let t = ft.entry.value;
        let name = strip(name, ft.strip_prefix);
        let tech = reg.tech(t);
        let exact = tech.find_node(name).or_else(|| match name {
            "Active-Node" => tech.find_node("P-Active-Node"),
            _ => None,
        });
        // Name-fragment matches are used, but still reported
        let (found, advise) = match exact {
            Some(node) => (Some(node), false),
            None => match tech
                .nodes
                .iter()
                .position(|n| n.name.starts_with(name) || name.starts_with(n.name.as_str()))
                .or_else(|| {
                    tech.nodes
                        .iter()
                        .position(|n| n.name.ends_with(name) || name.ends_with(n.name.as_str()))
                }) {
                Some(node) => (Some(node), true),
                None => match tech.convert_old_node_name(name) {
                    Some(node) => (Some(node), false),
                    None => (None, true),
                },
            },
        };
        let node = match found {
            Some(node) => node,
            None if tech.nodes.is_empty() => {
                return Err(format!("Technology '{}' has no primitives", tech.name))
            }
            None => 0,
        };
        let entry = Resolved {
            value: PrimNodeId { tech: t, node },
            error: match advise {
                true => Some(format!(
                    "Cannot find primitive '{}:{}', using {}",
                    tech.name, name, tech.nodes[node].name
                )),
                false => None,
            },
        };
        self.node_ok.push(entry.error.is_none());
        self.nodes.push(entry);
        Ok(self.nodes.len() - 1)
    }

    /// Add port `name` of file primitive node `node`, returning its file index
    pub fn add_port(&mut self, reg: &TechRegistry, node: usize, name: &str) -> Result<usize, String> {
        let id = self.nodes.get(node).ok_or("Invalid primitive index")?.value;
        let node_ok = self.node_ok[node];
        let tech = reg.tech(id.tech);
        let prim = reg.node(id);
        let found = prim
            .find_port(name)
            .or_else(|| tech.convert_old_port_name(id.node, name));
        let entry = match (found, prim.ports.first()) {
            (Some(port), _) => Some(Resolved::ok(port)),
            (None, Some(first)) => Some(Resolved {
                value: 0,
                error: match node_ok {
                    true => Some(format!(
                        "port {} on {}:{} not found, using {}",
                        name, tech.name, prim.name, first.name
                    )),
                    false => None,
                },
            }),
            (None, None) => None,
        };
        let entry = entry.map(|e| Resolved {
            value: PrimPortId {
                tech: id.tech,
                node: id.node,
                port: e.value,
            },
            error: e.error,
        });
        self.ports.push(entry);
        Ok(self.ports.len() - 1)
    }

    /// Add arc prototype `name` of file technology `tech`, returning its file index
    pub fn add_arc(&mut self, reg: &TechRegistry, tech: usize, name: &str) -> Result<usize, String> {
        let ft = self.techs.get(tech).ok_or("Invalid technology index")?;
        let t = ft.entry.value;
        let name = strip(name, ft.strip_prefix);
        let tech = reg.tech(t);
        let found = tech
            .find_arc(name)
            .or_else(|| tech.convert_old_arc_name(name));
        let entry = match (found, tech.arcs.first()) {
            (Some(arc), _) => Some(Resolved::ok(ArcProtoId { tech: t, arc })),
            (None, Some(first)) => Some(Resolved {
                value: ArcProtoId { tech: t, arc: 0 },
                error: Some(format!(
                    "Cannot find arc '{}:{}', using {}",
                    tech.name, name, first.name
                )),
            }),
            (None, None) => None,
        };
        self.arcs.push(entry);
        Ok(self.arcs.len() - 1)
    }

    /// Add tool `name`, returning its file index
    pub fn add_tool(&mut self, reg: &TechRegistry, name: &str) -> usize {
        let idx = self.tools.len();
        let found = reg.find_tool(name);
        if found != Some(idx) {
            self.tool_bits_messed = true;
        }
        self.tools.push(Resolved {
            value: found,
            error: match found {
                Some(_) => None,
                None => Some(format!("No tool called '{}'", name)),
            },
        });
        idx
    }

    /// Get technology `idx`. [None] if `idx` is out of range.
    pub fn tech(&mut self, idx: usize, diags: &mut Vec<Diagnostic>) -> Option<TechId> {
        self.techs.get_mut(idx).map(|t| t.entry.get(diags))
    }
    /// Get primitive node `idx`. [None] if `idx` is out of range.
    pub fn node(&mut self, idx: usize, diags: &mut Vec<Diagnostic>) -> Option<PrimNodeId> {
        self.nodes.get_mut(idx).map(|n| n.get(diags))
    }
    /// Get primitive port `idx`. [None] if out of range, or if its node has no ports.
    pub fn port(&mut self, idx: usize, diags: &mut Vec<Diagnostic>) -> Option<PrimPortId> {
        self.ports.get_mut(idx)?.as_mut().map(|p| p.get(diags))
    }
    /// Get arc prototype `idx`. [None] if out of range, or if its technology has no arcs.
    pub fn arc(&mut self, idx: usize, diags: &mut Vec<Diagnostic>) -> Option<ArcProtoId> {
        self.arcs.get_mut(idx)?.as_mut().map(|a| a.get(diags))
    }
    /// Get the registry index of tool `idx`. [None] if out of range or unknown.
    pub fn tool(&mut self, idx: usize, diags: &mut Vec<Diagnostic>) -> Option<usize> {
        self.tools.get_mut(idx).and_then(|t| t.get(diags))
    }
}

/// Strip the six-character technology prefix from `name`, if `enable`d and present
fn strip(name: &str, enable: bool) -> &str {
    match enable {
        true => name.get(6..).unwrap_or(name),
        false => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_primitive_reports_once() {
        let reg = TechRegistry::builtin();
        let mut r = ProtoResolver::new();
        let t = r.add_tech(&reg, "mocmos", false).unwrap();
        let n = r.add_node(&reg, t, "Frobnicator").unwrap();
        let mut diags = Vec::new();
        let first = r.node(n, &mut diags).unwrap();
        let again = r.node(n, &mut diags).unwrap();
        assert_eq!(first, again);
        assert_eq!(reg.node_name(first), "mocmos:Metal-1-Pin");
        assert_eq!(diags.len(), 1);
        assert_eq!(
            diags[0].msg,
            "Cannot find primitive 'mocmos:Frobnicator', using Metal-1-Pin"
        );
    }
    #[test]
    fn technology_renames() {
        let reg = TechRegistry::builtin();
        let mut r = ProtoResolver::new();
        let mut diags = Vec::new();
        let a = r.add_tech(&reg, "mocmos", true).unwrap();
        let b = r.add_tech(&reg, "mocmossub", true).unwrap();
        let c = r.add_tech(&reg, "logic", false).unwrap();
        let d = r.add_tech(&reg, "imos", false).unwrap();
        let e = r.add_tech(&reg, "bipolar", false).unwrap();
        let name = |r: &mut ProtoResolver, i, d: &mut Vec<Diagnostic>| {
            reg.tech(r.tech(i, d).unwrap()).name.clone()
        };
        assert_eq!(name(&mut r, a, &mut diags), "mocmosold");
        assert_eq!(name(&mut r, b, &mut diags), "mocmos");
        assert_eq!(name(&mut r, c, &mut diags), "schematic");
        assert_eq!(name(&mut r, d, &mut diags), "mocmos");
        assert!(diags.is_empty());
        assert_eq!(name(&mut r, e, &mut diags), "generic");
        assert_eq!(diags.len(), 1);
        assert!(r.tech_ok(d) && !r.tech_ok(e));

        // Prefixed primitive names of the "imos" technology
        let n = r.add_node(&reg, d, "mocmosMetal-1-Pin").unwrap();
        assert_eq!(reg.node_name(r.node(n, &mut diags).unwrap()), "mocmos:Metal-1-Pin");
        assert_eq!(diags.len(), 1);
    }
    #[test]
    fn node_heuristics() {
        let reg = TechRegistry::builtin();
        let mut r = ProtoResolver::new();
        let mut diags = Vec::new();
        let t = r.add_tech(&reg, "mocmos", false).unwrap();
        // Known renames are silent
        let cases = [
            ("Active-Node", "P-Active-Node"),
            ("Polysilicon-Pin", "Polysilicon-1-Pin"),
        ];
        for (from, to) in cases {
            let n = r.add_node(&reg, t, from).unwrap();
            assert_eq!(reg.node(r.node(n, &mut diags).unwrap()).name, to);
        }
        assert!(diags.is_empty());

        // Prefix and suffix matches are used, and reported once each
        let cases = [
            ("Metal-2", "Metal-2-Pin"),
            ("Polysilicon-1-Node-Extended", "Polysilicon-1-Node"),
            ("Metal-1-Pin-Extra", "Metal-1-Pin"),
            ("Old-Metal-1-Pin", "Metal-1-Pin"),
        ];
        for (from, to) in cases {
            let n = r.add_node(&reg, t, from).unwrap();
            assert_eq!(reg.node(r.node(n, &mut diags).unwrap()).name, to);
            r.node(n, &mut diags);
        }
        assert_eq!(diags.len(), 4);
        assert!(diags[2].msg.contains("'mocmos:Metal-1-Pin-Extra', using Metal-1-Pin"));

        // Ports on reported nodes are not reported again
        let n = r.add_node(&reg, t, "Metal-1-Pin-Extra").unwrap();
        let p = r.add_port(&reg, n, "nothing").unwrap();
        r.port(p, &mut diags);
        assert_eq!(diags.len(), 4);
    }
    #[test]
    fn ports_and_arcs() {
        let reg = TechRegistry::builtin();
        let mut r = ProtoResolver::new();
        let mut diags = Vec::new();
        let t = r.add_tech(&reg, "mocmos", false).unwrap();
        let n = r.add_node(&reg, t, "Metal-1-Polysilicon-1-Con").unwrap();
        let p0 = r.add_port(&reg, n, "metal-1-polysilicon").unwrap();
        let p1 = r.add_port(&reg, n, "bogus").unwrap();
        assert_eq!(r.port(p0, &mut diags).unwrap().port, 0);
        assert!(diags.is_empty());
        assert_eq!(r.port(p1, &mut diags).unwrap().port, 0);
        assert_eq!(diags.len(), 1);

        // Ports of unresolved nodes report nothing further
        let bad = r.add_node(&reg, t, "Nonsense").unwrap();
        let p2 = r.add_port(&reg, bad, "nothing").unwrap();
        r.port(p2, &mut diags);
        assert_eq!(diags.len(), 1);

        let a0 = r.add_arc(&reg, t, "Polysilicon").unwrap();
        let a1 = r.add_arc(&reg, t, "Metal-9").unwrap();
        assert_eq!(reg.arc_name(r.arc(a0, &mut diags).unwrap()), "mocmos:Polysilicon-1");
        assert_eq!(reg.arc_name(r.arc(a1, &mut diags).unwrap()), "mocmos:Metal-1");
        assert_eq!(diags.len(), 2);
        assert!(r.arc(9, &mut diags).is_none());
    }
    #[test]
    fn tool_order() {
        let reg = TechRegistry::builtin();
        let mut r = ProtoResolver::new();
        r.add_tool(&reg, "user");
        r.add_tool(&reg, "io");
        assert!(!r.tool_bits_messed);
        r.add_tool(&reg, "network");
        assert!(r.tool_bits_messed);
        let mut diags = Vec::new();
        assert_eq!(r.tool(2, &mut diags), Some(4));
        r.add_tool(&reg, "nonesuch");
        assert_eq!(r.tool(3, &mut diags), None);
        assert_eq!(diags.len(), 1);
    }
}
