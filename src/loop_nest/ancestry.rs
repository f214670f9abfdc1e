use crate::common::region_volume;
use crate::graph::{Graph, NodeId};
use crate::loop_nest::LoopNest;

use by_address::ByThinAddress;
use std::collections::HashMap;

/// Maps every non-root level of a tree to its parent and its depth.
///
/// Levels are identified by address, so the map is only meaningful for the
/// tree it was built from.
pub struct ParentMap<'a> {
    parents: HashMap<ByThinAddress<&'a LoopNest>, (&'a LoopNest, usize)>,
}

impl<'a> ParentMap<'a> {
    pub fn new(root: &'a LoopNest) -> Self {
        let mut parents = HashMap::new();
        let mut stack = vec![(root, 0)];
        while let Some((level, depth)) = stack.pop() {
            for child in &level.children {
                let child: &'a LoopNest = child;
                parents.insert(ByThinAddress(child), (level, depth + 1));
                stack.push((child, depth + 1));
            }
        }
        ParentMap { parents }
    }

    pub fn parent(&self, level: &'a LoopNest) -> Option<&'a LoopNest> {
        self.parents.get(&ByThinAddress(level)).map(|(p, _)| *p)
    }

    /// Depth of `level`. The root is at depth 0.
    pub fn depth(&self, level: &'a LoopNest) -> usize {
        self.parents
            .get(&ByThinAddress(level))
            .map_or(0, |(_, d)| *d)
    }

    /// `level` followed by its ancestors, ending at the root.
    pub fn ancestors(&self, level: &'a LoopNest) -> Vec<&'a LoopNest> {
        let mut result = vec![level];
        let mut cur = level;
        while let Some(p) = self.parent(cur) {
            result.push(p);
            cur = p;
        }
        result
    }

    pub fn is_ancestor_or_self(&self, ancestor: &'a LoopNest, level: &'a LoopNest) -> bool {
        self.ancestors(level)
            .into_iter()
            .any(|l| std::ptr::eq(l, ancestor))
    }
}

pub fn deepest_common_ancestor<'a>(
    parents: &ParentMap<'a>,
    a: &'a LoopNest,
    b: &'a LoopNest,
) -> &'a LoopNest {
    let (mut a, mut b) = (a, b);
    if a.is_root() {
        return a;
    }
    if b.is_root() {
        return b;
    }
    while parents.depth(a) > parents.depth(b) {
        a = parents.parent(a).unwrap_or(a);
    }
    while parents.depth(b) > parents.depth(a) {
        b = parents.parent(b).unwrap_or(b);
    }
    while !std::ptr::eq(a, b) {
        match (parents.parent(a), parents.parent(b)) {
            (Some(pa), Some(pb)) => {
                a = pa;
                b = pb;
            }
            _ => break,
        }
    }
    a
}

/// Returns the deepest level on the path from `root` to `from` at which `f`
/// could be computed.
///
/// The path is walked from the root inwards. The walk stops before a level
/// that iterates `f` itself, an unrolled level, or a level at which the region
/// of `f` needed per iteration no longer shrinks. Innermost levels are never
/// returned.
pub fn deepest_valid_compute_location<'a>(
    parents: &ParentMap<'a>,
    graph: &Graph,
    f: NodeId,
    from: &'a LoopNest,
    root: &'a LoopNest,
) -> &'a LoopNest {
    let mut path = parents.ancestors(from);
    if from.innermost {
        path.remove(0);
    }
    let Some(&outermost) = path.last() else {
        return root;
    };
    let mut candidate = outermost;
    let mut candidate_volume = region_volume(&candidate.get_bounds(f, graph).region_computed);
    for &level in path.iter().rev().skip(1) {
        if level.node == Some(f) || level.unrolled || level.innermost {
            break;
        }
        let volume = region_volume(&level.get_bounds(f, graph).region_computed);
        if volume >= candidate_volume {
            break;
        }
        candidate = level;
        candidate_volume = volume;
    }
    candidate
}
