//!
//! # Dependency-Ordering Trait and Helpers
//!

// Std-lib
use std::collections::HashSet;
use std::hash::Hash;

///
/// # Dependency-Ordering Trait
///
/// Hierarchical design databases are graphs: cells instantiate other cells,
/// which must generally be completed before their parents.
/// Graph nodes are commonly stored unordered, but must occasionally be dependency-ordered
/// to perform processing tasks.
///
/// Implementers provide `deps`, which returns the (direct) dependencies of a single `Item`,
/// and `fail`, which produces the error returned when a cycle is detected.
/// The walk itself is performed by [DepOrderer] on an explicit work-stack,
/// so arbitrarily deep hierarchies do not grow the native call-stack.
///
/// Typical usage:
///
/// ```text
/// struct MyGraphOrder<'g>(&'g MyGraph);
/// impl DepOrder for MyGraphOrder<'_> {
///     type Item = NodeKey;
///     type Error = MyError;
///
///     fn deps(&self, item: &NodeKey) -> Result<Vec<NodeKey>, MyError> {
///         Ok(self.0.children(item))
///     }
///     fn fail(&self, item: &NodeKey) -> MyError {
///         MyError::Cycle(item.clone())
///     }
/// }
/// for key in MyGraphOrder(&graph).order(&graph.keys())? {
///     // Dependencies of `key` have all been visited by here
/// }
/// ```
///
pub trait DepOrder: Sized {
    /// Item Type. Typically keys or indices of the nodes in the dependency graph.
    type Item: Clone + Eq + Hash;
    /// Error Type
    type Error;

    /// Dependency-order all entries in slice `items`
    fn order(&self, items: &[Self::Item]) -> Result<Vec<Self::Item>, Self::Error> {
        DepOrderer::new(self, items.len()).order(items)
    }
    /// Get the direct dependencies of `item`
    fn deps(&self, item: &Self::Item) -> Result<Vec<Self::Item>, Self::Error>;
    /// Failure-handler. Create our `Error` type for a cycle closing at `item`.
    fn fail(&self, item: &Self::Item) -> Self::Error;
}

/// Entries on the [DepOrderer] work-stack
enum Frame<T> {
    /// Visit an item, scheduling its dependencies
    Enter(T),
    /// All dependencies of the item are complete
    Exit(T),
}

/// # Dependency Order Helper
///
/// Performs the depth-first walk for a [DepOrder] implementer.
/// Generally used through [DepOrder::order].
pub struct DepOrderer<'p, P: DepOrder> {
    /// Dependency-provider
    p: &'p P,
    /// Ordered, completed items
    stack: Vec<P::Item>,
    /// Hash-set of completed items, for quick membership tests
    seen: HashSet<P::Item>,
    /// Hash-set of entered but not yet exited items, for cycle detection
    pending: HashSet<P::Item>,
    /// Work-stack of items still to be entered or exited
    work: Vec<Frame<P::Item>>,
}
impl<'p, P: DepOrder> DepOrderer<'p, P> {
    /// Create a new [DepOrderer], with capacity for `len` items
    pub fn new(p: &'p P, len: usize) -> Self {
        Self {
            p,
            stack: Vec::with_capacity(len),
            seen: HashSet::with_capacity(len),
            pending: HashSet::new(),
            work: Vec::new(),
        }
    }
    /// Dependency-order all entries in slice `items`, consuming the orderer
    pub fn order(mut self, items: &[P::Item]) -> Result<Vec<P::Item>, P::Error> {
        for item in items.iter() {
            self.push(item)?;
        }
        Ok(self.stack)
    }
    /// Push `item`'s dependencies, and then itself, onto the ordered stack
    pub fn push(&mut self, item: &P::Item) -> Result<(), P::Error> {
        self.work.push(Frame::Enter(item.clone()));
        while let Some(frame) = self.work.pop() {
            match frame {
                Frame::Enter(item) => {
                    if self.seen.contains(&item) {
                        continue;
                    }
                    // Anything still pending is an ancestor on the current path
                    if self.pending.contains(&item) {
                        return Err(self.p.fail(&item));
                    }
                    self.pending.insert(item.clone());
                    let deps = self.p.deps(&item)?;
                    self.work.push(Frame::Exit(item));
                    // Reversed, so dependencies complete in their listed order
                    for dep in deps.into_iter().rev() {
                        if !self.seen.contains(&dep) {
                            self.work.push(Frame::Enter(dep));
                        }
                    }
                }
                Frame::Exit(item) => {
                    if !self.pending.remove(&item) {
                        return Err(self.p.fail(&item));
                    }
                    self.seen.insert(item.clone());
                    self.stack.push(item);
                }
            }
        }
        Ok(())
    }
}
