use crate::common::Region;
use crate::graph::{Node, NodeId};

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// The region of a node needed by one iteration of a loop level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bound {
    pub region_required: Region,
    pub region_computed: Region,
    /// The loops each stage iterates to produce `region_computed`.
    pub loops: Vec<Region>,
}

impl Bound {
    pub fn from_required(node: &Node, region_required: Region) -> Self {
        // Every node can compute exactly the region asked of it.
        let region_computed = region_required.clone();
        let loops = (0..node.stages.len())
            .map(|s| node.stage_loops(s, &region_computed))
            .collect();
        Bound {
            region_required,
            region_computed,
            loops,
        }
    }
}

/// Bounds memoized per loop level.
///
/// A level's own node has an explicitly set bound. Bounds of every other node
/// are derived from it and from the graph alone, so a derived entry stays valid
/// for as long as the explicit one does.
#[derive(Debug, Default)]
pub(crate) struct BoundsCache {
    explicit: Option<(NodeId, Arc<Bound>)>,
    derived: RwLock<HashMap<NodeId, Arc<Bound>>>,
}

impl BoundsCache {
    pub(crate) fn get(&self, f: NodeId) -> Option<Arc<Bound>> {
        match &self.explicit {
            Some((id, b)) if *id == f => Some(Arc::clone(b)),
            _ => self.derived.read().get(&f).cloned(),
        }
    }

    pub(crate) fn set_explicit(&mut self, f: NodeId, bound: Bound) {
        self.explicit = Some((f, Arc::new(bound)));
        self.derived.get_mut().clear();
    }

    /// Inserts a derived bound, returning whichever bound ends up cached.
    pub(crate) fn insert_derived(&self, f: NodeId, bound: Bound) -> Arc<Bound> {
        Arc::clone(
            self.derived
                .write()
                .entry(f)
                .or_insert_with(|| Arc::new(bound)),
        )
    }
}

impl Clone for BoundsCache {
    fn clone(&self) -> Self {
        BoundsCache {
            explicit: self.explicit.clone(),
            derived: RwLock::new(self.derived.read().clone()),
        }
    }
}
