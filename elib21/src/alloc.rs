//!
//! # Object Table Allocation
//!
//! ELIB records address each other by global, per-kind indices.
//! [ObjectTables] sizes the per-kind arenas from the header counts,
//! and maps global indices to their owning cells.
//!

// Std-Lib Imports
use std::ops::Range;

/// # Header Counts
/// Per-kind object totals, as declared in the file header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderCounts {
    pub tools: usize,
    pub techs: usize,
    pub prim_nodes: usize,
    pub prim_ports: usize,
    pub arc_protos: usize,
    pub cells: usize,
    pub nodes: usize,
    pub exports: usize,
    pub arcs: usize,
    pub geoms: usize,
}

/// Per-cell counts, as stored on disk: arcs, nodes, exports.
/// Negative arc or node counts mark cells defined in other libraries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CellCounts {
    pub arcs: i32,
    pub nodes: i32,
    pub exports: i32,
}
impl CellCounts {
    pub fn is_external(&self) -> bool {
        self.arcs < 0 || self.nodes < 0
    }
}

/// # Object Tables
/// Per-cell slices of the global node, arc and export index spaces
#[derive(Debug, Clone, Default)]
pub struct ObjectTables {
    pub counts: HeaderCounts,
    external: Vec<bool>,
    /// Prefix sums. Entry `i` is the first global index of cell `i`; the last is the total.
    node_start: Vec<usize>,
    arc_start: Vec<usize>,
    export_start: Vec<usize>,
}
impl ObjectTables {
    /// Create from the header totals and per-cell counts.
    /// Fails if the per-cell counts do not sum to the totals.
    pub fn new(counts: HeaderCounts, per_cell: &[CellCounts]) -> Result<Self, String> {
        if per_cell.len() != counts.cells {
            return Err(format!(
                "Cell table has {} entries, header declares {}",
                per_cell.len(),
                counts.cells
            ));
        }
        let mut me = Self {
            counts,
            external: Vec::with_capacity(per_cell.len()),
            node_start: vec![0],
            arc_start: vec![0],
            export_start: vec![0],
        };
        let (mut nodes, mut arcs, mut exports) = (0usize, 0usize, 0usize);
        for c in per_cell.iter() {
            if c.exports < 0 {
                return Err(format!("Invalid export count {}", c.exports));
            }
            let external = c.is_external();
            if !external {
                nodes += c.nodes as usize;
                arcs += c.arcs as usize;
            }
            exports += c.exports as usize;
            me.external.push(external);
            me.node_start.push(nodes);
            me.arc_start.push(arcs);
            me.export_start.push(exports);
        }
        for (what, sum, total) in [
            ("node", nodes, counts.nodes),
            ("arc", arcs, counts.arcs),
            ("export", exports, counts.exports),
        ] {
            if sum != total {
                return Err(format!(
                    "Cell {} counts sum to {}, header declares {}",
                    what, sum, total
                ));
            }
        }
        Ok(me)
    }
    /// Create for the oldest format revision, which has no per-cell table.
    /// Every node, arc, and export belongs to the first cell.
    pub fn single_cell(counts: HeaderCounts) -> Result<Self, String> {
        let mut per_cell = vec![CellCounts::default(); counts.cells];
        match per_cell.first_mut() {
            Some(first) => {
                *first = CellCounts {
                    arcs: counts.arcs as i32,
                    nodes: counts.nodes as i32,
                    exports: counts.exports as i32,
                }
            }
            None if counts.nodes + counts.arcs + counts.exports > 0 => {
                return Err("Objects declared without any cells".into())
            }
            None => (),
        }
        Self::new(counts, &per_cell)
    }
    /// Number of cells
    pub fn num_cells(&self) -> usize {
        self.external.len()
    }
    /// Boolean indication of whether cell `cell` is defined in another library
    pub fn is_external(&self, cell: usize) -> bool {
        self.external.get(cell).copied().unwrap_or(false)
    }
    /// Global node indices of cell `cell`
    pub fn nodes(&self, cell: usize) -> Range<usize> {
        self.node_start[cell]..self.node_start[cell + 1]
    }
    /// Global arc indices of cell `cell`
    pub fn arcs(&self, cell: usize) -> Range<usize> {
        self.arc_start[cell]..self.arc_start[cell + 1]
    }
    /// Global export indices of cell `cell`
    pub fn exports(&self, cell: usize) -> Range<usize> {
        self.export_start[cell]..self.export_start[cell + 1]
    }
    /// Owning (cell, local index) of global node `idx`
    pub fn node_owner(&self, idx: usize) -> Option<(usize, usize)> {
        owner(&self.node_start, idx)
    }
    /// Owning (cell, local index) of global arc `idx`
    pub fn arc_owner(&self, idx: usize) -> Option<(usize, usize)> {
        owner(&self.arc_start, idx)
    }
    /// Owning (cell, local index) of global export `idx`
    pub fn export_owner(&self, idx: usize) -> Option<(usize, usize)> {
        owner(&self.export_start, idx)
    }
}
/// Find the slice of prefix-sums `starts` holding `idx`
fn owner(starts: &[usize], idx: usize) -> Option<(usize, usize)> {
    let total = *starts.last()?;
    if idx >= total {
        return None;
    }
    // The last start at or below `idx`. Empty cells share starts with their successors.
    let cell = starts.partition_point(|s| *s <= idx) - 1;
    Some((cell, idx - starts[cell]))
}

/// Create an arena of `len` empty slots
pub fn arena<T>(len: usize) -> Vec<Option<T>> {
    let mut v = Vec::with_capacity(len);
    v.resize_with(len, || None);
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(cells: usize, nodes: usize, arcs: usize, exports: usize) -> HeaderCounts {
        HeaderCounts {
            cells,
            nodes,
            arcs,
            exports,
            ..Default::default()
        }
    }
    fn cc(arcs: i32, nodes: i32, exports: i32) -> CellCounts {
        CellCounts {
            arcs,
            nodes,
            exports,
        }
    }

    #[test]
    fn prefix_sums_and_owners() {
        let per_cell = [cc(2, 3, 1), cc(0, 0, 0), cc(-1, -1, 2), cc(1, 4, 1)];
        let t = ObjectTables::new(counts(4, 7, 3, 4), &per_cell).unwrap();
        assert_eq!(t.nodes(0), 0..3);
        assert_eq!(t.nodes(1), 3..3);
        assert_eq!(t.nodes(2), 3..3);
        assert_eq!(t.nodes(3), 3..7);
        assert_eq!(t.exports(2), 1..3);
        assert!(t.is_external(2) && !t.is_external(1));

        assert_eq!(t.node_owner(2), Some((0, 2)));
        assert_eq!(t.node_owner(3), Some((3, 0)));
        assert_eq!(t.node_owner(7), None);
        assert_eq!(t.arc_owner(2), Some((3, 0)));
        assert_eq!(t.export_owner(1), Some((2, 0)));
        assert_eq!(t.export_owner(3), Some((3, 0)));
    }
    #[test]
    fn rejects_mismatched_sums() {
        let per_cell = [cc(2, 3, 1)];
        assert!(ObjectTables::new(counts(1, 4, 2, 1), &per_cell).is_err());
        assert!(ObjectTables::new(counts(2, 3, 2, 1), &per_cell).is_err());
        assert!(ObjectTables::new(counts(1, 3, 2, 1), &per_cell).is_ok());
    }
    #[test]
    fn single_cell() {
        let t = ObjectTables::single_cell(counts(3, 5, 2, 1)).unwrap();
        assert_eq!(t.nodes(0), 0..5);
        assert_eq!(t.arcs(2), 2..2);
        assert_eq!(t.node_owner(4), Some((0, 4)));
        assert!(ObjectTables::single_cell(counts(0, 1, 0, 0)).is_err());
        let a: Vec<Option<String>> = arena(3);
        assert_eq!(a.len(), 3);
    }
}
