use crate::model::FieldId;
use std::collections::{BTreeMap, BTreeSet};

///
/// TriggerTree
///
/// Backward-dependency structure for one changed field: `root` holds the
/// fields to recompute on the modified records themselves, and each edge is
/// labeled by the relation field to traverse backward to find further
/// affected records.
///
/// Built once per schema from the transitive closure of field dependencies;
/// read-only afterwards.
///

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TriggerTree {
    pub root: BTreeSet<FieldId>,
    edges: BTreeMap<FieldId, TriggerTree>,
}

impl TriggerTree {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_empty() && self.edges.is_empty()
    }

    /// Return the subtree for the given edge label, creating it on demand.
    pub(crate) fn increase(&mut self, label: FieldId) -> &mut Self {
        self.edges.entry(label).or_default()
    }

    pub fn edges(&self) -> impl Iterator<Item = (FieldId, &Self)> {
        self.edges.iter().map(|(label, tree)| (*label, tree))
    }

    /// Merge trees into one, keeping only the node fields accepted by
    /// `select`. Subtrees that end up empty are dropped.
    #[must_use]
    pub fn merge<'a>(
        trees: impl IntoIterator<Item = &'a Self>,
        select: &impl Fn(FieldId) -> bool,
    ) -> Self {
        let mut out = Self::default();
        for tree in trees {
            out.absorb(tree, select);
        }
        out.prune();
        out
    }

    fn absorb(&mut self, other: &Self, select: &impl Fn(FieldId) -> bool) {
        self.root.extend(other.root.iter().copied().filter(|f| select(*f)));
        for (label, subtree) in &other.edges {
            self.increase(*label).absorb(subtree, select);
        }
    }

    fn prune(&mut self) {
        for tree in self.edges.values_mut() {
            tree.prune();
        }
        self.edges.retain(|_, tree| !tree.is_empty());
    }

    /// Depth-first traversal over all nodes, the node itself first.
    pub fn depth_first(&self) -> impl Iterator<Item = &Self> {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let node = stack.pop()?;
            stack.extend(node.edges.values());
            Some(node)
        })
    }
}

///
/// TESTS
///
