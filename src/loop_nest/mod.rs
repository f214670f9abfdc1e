//! The loop nest tree.
//!
//! A [LoopNest] is one loop level. The root has no loops; every other level
//! iterates the loops of one stage of one node. Children are stored in the
//! order they were scheduled, which is consumers first, and execute in the
//! reverse of that order.
//!
//! Trees are immutable once shared. Transformations clone the levels they
//! change and share every untouched subtree through [Arc].

mod ancestry;
mod bounds;

pub use ancestry::{deepest_common_ancestor, deepest_valid_compute_location, ParentMap};
pub use bounds::Bound;

use crate::common::{empty_region, region_extents, region_union_into, region_volume, DimSize, Interval, Shape};
use crate::error::SearchError;
use crate::graph::{Graph, NodeId};
use crate::machine::MachineParams;
use crate::tiling::{Tilings, TilingPolicy};
use crate::utils::{div_ceil, hash_combine, indent};
use bounds::BoundsCache;

use itertools::Itertools;
use log::warn;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use std::sync::Arc;

/// Tiled loops with more candidate tilings than this are reported.
const TILINGS_WARNING_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Default)]
pub struct LoopNest {
    /// Extents of this level's loops, one per loop of `stage`. A vectorized
    /// loop counts vectors rather than points.
    pub size: Shape,
    pub children: Vec<Arc<LoopNest>>,
    /// Nodes inlined into this level, with the number of calls per point.
    pub inlined: BTreeMap<NodeId, u64>,
    /// Nodes whose storage is allocated in the body of this level.
    pub store_at: BTreeSet<NodeId>,
    pub node: Option<NodeId>,
    pub stage: usize,
    pub innermost: bool,
    pub tileable: bool,
    pub parallel: bool,
    pub unrolled: bool,
    /// The storage dimension of `node` that is vectorized.
    pub vector_dim: Option<usize>,
    /// The loop of `stage` that iterates `vector_dim`.
    pub vectorized_loop_index: Option<usize>,
    bounds: BoundsCache,
}

impl LoopNest {
    pub fn root() -> Self {
        LoopNest::default()
    }

    pub fn is_root(&self) -> bool {
        self.node.is_none()
    }

    /// The number of iterations of this level's loops.
    pub fn iterations(&self) -> DimSize {
        self.size.iter().product()
    }

    /// Returns the bounds of `f` needed by one iteration of this level.
    pub fn get_bounds(&self, f: NodeId, graph: &Graph) -> Arc<Bound> {
        if let Some(b) = self.bounds.get(f) {
            return b;
        }
        let node = graph.node(f);
        let required = if node.is_output && self.is_root() {
            graph.estimated_region(f)
        } else {
            let mut required = empty_region(node.dims());
            for e in graph.outgoing(f) {
                // Consumers outside of this loop nest do not count.
                if let Some(here) = self.node {
                    let is_here = here == e.consumer && self.stage == e.consumer_stage;
                    if !is_here && !graph.downstream_of(here, e.consumer) {
                        continue;
                    }
                }
                let consumer_bounds = self.get_bounds(e.consumer, graph);
                let r = graph.required_producer_region(e, &consumer_bounds.loops[e.consumer_stage]);
                region_union_into(&mut required, &r);
            }
            required
        };
        self.bounds
            .insert_derived(f, Bound::from_required(node, required))
    }

    fn set_bounds(&mut self, f: NodeId, bound: Bound) {
        self.bounds.set_explicit(f, bound);
    }

    /// Returns `true` if anything within this level reads `f`.
    pub fn calls(&self, f: NodeId, graph: &Graph) -> bool {
        if self.children.iter().any(|c| c.calls(f, graph)) {
            return true;
        }
        graph.outgoing(f).any(|e| {
            (self.node == Some(e.consumer) && self.stage == e.consumer_stage)
                || self.inlined.contains_key(&e.consumer)
        })
    }

    /// Returns `true` if `f` is computed or inlined within this level.
    pub fn computes(&self, f: NodeId) -> bool {
        self.node == Some(f)
            || self.inlined.contains_key(&f)
            || self.children.iter().any(|c| c.computes(f))
    }

    /// The largest number of inlined calls to any node at any level.
    pub fn max_inlined_calls(&self) -> u64 {
        let here = self.inlined.values().copied().max().unwrap_or(0);
        self.children
            .iter()
            .map(|c| c.max_inlined_calls())
            .fold(here, u64::max)
    }

    /// Returns the level whose body computes `f`, if any.
    pub fn compute_site(&self, f: NodeId) -> Option<&LoopNest> {
        if self.node != Some(f) && self.children.iter().any(|c| c.node == Some(f)) {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.compute_site(f))
    }

    /// Returns the level whose body allocates storage for `f`, if any.
    pub fn store_site(&self, f: NodeId) -> Option<&LoopNest> {
        if self.store_at.contains(&f) {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.store_site(f))
    }

    /// Mixes the structure of this tree into `h`, descending two levels per
    /// unit of `depth`. At `depth == 1` only whether each child loop is
    /// larger than 1 is recorded.
    pub fn structural_hash(&self, h: &mut u64, depth: i64) {
        if depth < 0 {
            return;
        }
        for &f in &self.store_at {
            hash_combine(h, f as u64);
        }
        hash_combine(h, u64::MAX);
        for c in &self.children {
            hash_combine(h, stage_id(c));
        }
        // Separates the last compute from the first inlined node.
        hash_combine(h, u64::MAX);
        for &f in self.inlined.keys() {
            hash_combine(h, f as u64);
        }
        hash_combine(h, u64::MAX);

        if depth > 0 {
            for c in &self.children {
                for &s in &c.size {
                    hash_combine(h, if depth == 1 { u64::from(s > 1) } else { s });
                }
            }
            hash_combine(h, self.vectorized_loop_index.map_or(u64::MAX, |i| i as u64));
        }

        if depth > 1 {
            for c in &self.children {
                c.structural_hash(h, depth - 2);
            }
        }
    }

    /// A hash of the whole tree, including annotations and call counts. Two
    /// trees with equal fingerprints are treated as the same schedule.
    pub fn fingerprint(&self) -> u64 {
        let mut h = 0;
        self.fingerprint_into(&mut h);
        h
    }

    fn fingerprint_into(&self, h: &mut u64) {
        hash_combine(h, self.node.map_or(u64::MAX, |n| n as u64));
        hash_combine(h, self.stage as u64);
        for &s in &self.size {
            hash_combine(h, s);
        }
        let flags = u64::from(self.innermost)
            | u64::from(self.tileable) << 1
            | u64::from(self.parallel) << 2
            | u64::from(self.unrolled) << 3;
        hash_combine(h, flags);
        hash_combine(h, self.vector_dim.map_or(u64::MAX, |v| v as u64));
        hash_combine(h, self.vectorized_loop_index.map_or(u64::MAX, |v| v as u64));
        for &f in &self.store_at {
            hash_combine(h, f as u64);
        }
        hash_combine(h, u64::MAX);
        for (&f, &calls) in &self.inlined {
            hash_combine(h, f as u64);
            hash_combine(h, calls);
        }
        hash_combine(h, u64::MAX);
        for c in &self.children {
            c.fingerprint_into(h);
        }
        hash_combine(h, u64::MAX - 1);
    }

    /// Computes `f` at this level: adds one child per stage of `f`, iterating
    /// the loops needed to produce the region of `f` this level requires.
    pub fn compute_here(&mut self, f: NodeId, tileable: bool, v: usize, graph: &Graph) {
        let bounds = self.get_bounds(f, graph);
        let node = graph.node(f);

        for s in (0..node.stages.len()).rev() {
            let mut level = LoopNest {
                node: Some(f),
                stage: s,
                innermost: true,
                tileable,
                vector_dim: Some(v),
                ..LoopNest::default()
            };
            // Required and computed regions stay whole, but the loops become a
            // single representative iteration.
            let mut single_point = (*bounds).clone();
            let mut vector_size = 1;
            for (i, l) in node.stages[s].loops.iter().enumerate() {
                let span = bounds.loops[s][i];
                debug_assert!(!span.is_empty(), "computing an empty region of {}", node.name);
                let mut extent = span.extent();
                let mut point = Interval::point(span.min);
                if node.dims() > 0 && l.pure_dim == Some(v) {
                    level.vectorized_loop_index = Some(i);
                    vector_size = node.vector_size;
                    point.set_extent(vector_size);
                    extent = div_ceil(extent, vector_size);
                    // The middle-most vector is the most representative.
                    point = point.translate((vector_size * (extent / 2)) as i64);
                } else {
                    point = point.translate((extent / 2) as i64);
                }
                level.size.push(extent);
                single_point.loops[s][i] = point;
            }

            if let Some(vli) = level.vectorized_loop_index {
                // Split the single vector off into an inner level.
                level.innermost = false;
                let mut lane = single_point.clone();
                lane.loops[s][vli].set_extent(1);
                let mut one_vector = LoopNest {
                    node: Some(f),
                    stage: s,
                    innermost: true,
                    tileable: false,
                    vector_dim: Some(v),
                    vectorized_loop_index: Some(vli),
                    size: smallvec::smallvec![1; level.size.len()],
                    ..LoopNest::default()
                };
                one_vector.size[vli] = vector_size;
                one_vector.set_bounds(f, lane);
                level.children.push(Arc::new(one_vector));
            }
            level.set_bounds(f, single_point);
            self.children.push(Arc::new(level));
        }
    }

    /// Splits this level into an outer loop and an inner loop.
    ///
    /// `tiling` holds the outer extent per storage dimension of the node, or
    /// per loop when `is_serial` is set. Reduction loops always move entirely
    /// inward in non-serial splits. The inner loop takes over this level's
    /// children, inlined nodes and storage. A serial split marks the inner
    /// loop unrolled.
    pub fn parallelize_in_tiles(
        &self,
        tiling: &[DimSize],
        parent: &LoopNest,
        is_serial: bool,
        is_parallel: bool,
        graph: &Graph,
    ) -> Arc<LoopNest> {
        let Some(f) = self.node else {
            debug_assert!(false, "the root cannot be tiled");
            return Arc::new(self.clone());
        };
        let node = graph.node(f);

        let mut inner = LoopNest {
            size: smallvec::smallvec![1; self.size.len()],
            children: self.children.clone(),
            inlined: self.inlined.clone(),
            store_at: self.store_at.clone(),
            bounds: self.bounds.clone(),
            innermost: self.innermost,
            tileable: self.tileable && !is_serial,
            unrolled: is_serial,
            ..self.header()
        };
        let mut outer = LoopNest {
            size: self.size.clone(),
            tileable: self.tileable || is_parallel,
            parallel: is_parallel,
            ..self.header()
        };

        let mut b = (*inner.get_bounds(f, graph)).clone();
        let parent_bounds = parent.get_bounds(f, graph);
        for (i, l) in node.stages[self.stage].loops.iter().enumerate() {
            let requested = if is_serial {
                tiling[i]
            } else {
                l.pure_dim.map_or(1, |d| tiling[d])
            };
            inner.size[i] = div_ceil(outer.size[i], requested.max(1));
            // Recompute the outer extent given the chosen inner one.
            let outer_extent = div_ceil(outer.size[i], inner.size[i]);
            outer.size[i] = outer_extent;

            let p = parent_bounds.loops[self.stage][i];
            let extent = div_ceil(p.extent(), outer_extent);
            let min = p.min + ((outer_extent / 2) * extent) as i64;
            b.loops[self.stage][i] = Interval::with_extent(min, extent);
        }
        outer.set_bounds(f, b);
        outer.children.push(Arc::new(inner));
        Arc::new(outer)
    }

    /// Inlines `f` into every innermost level within this one that reads it.
    pub fn inline_func(&mut self, f: NodeId, graph: &Graph) {
        for child in self.children.iter_mut() {
            if child.calls(f, graph) {
                Arc::make_mut(child).inline_func(f, graph);
            }
        }

        if self.innermost {
            let mut calls = 0;
            for e in graph.outgoing(f) {
                if let Some(&c) = self.inlined.get(&e.consumer) {
                    calls += c * u64::from(e.calls);
                }
                if self.node == Some(e.consumer) && self.stage == e.consumer_stage {
                    calls += u64::from(e.calls);
                }
            }
            if calls > 0 {
                self.inlined.insert(f, calls);
            }
        }
    }

    /// Returns every way of computing `f` somewhere within this level.
    ///
    /// `parent` is `None` only at the root. With `in_realization` set, the
    /// storage of `f` has already been placed at an enclosing level and only
    /// the compute location is chosen here.
    pub fn compute_in_tiles(
        &self,
        f: NodeId,
        parent: Option<&LoopNest>,
        v: usize,
        in_realization: bool,
        graph: &Graph,
        params: &MachineParams,
    ) -> Vec<Arc<LoopNest>> {
        let node = graph.node(f);
        let mut result = vec![];

        if let Some(parent) = parent {
            let here = self.get_bounds(f, graph);
            let at_parent = parent.get_bounds(f, graph);

            // Don't descend into loops that break vectorization if we could
            // have vectorized one level up.
            if v < node.dims() {
                let e = here.region_computed[v].extent();
                let ep = at_parent.region_computed[v].extent();
                if ep >= node.vector_size && e < node.vector_size {
                    return result;
                }
            }

            // Don't descend if the bounds required don't shrink.
            if region_volume(&here.region_computed) >= region_volume(&at_parent.region_computed) {
                return result;
            }
        }

        let mut calling = self
            .children
            .iter()
            .enumerate()
            .filter(|(_, c)| c.calls(f, graph))
            .map(|(i, _)| i);
        let child = calling.next();
        let called_by_multiple_children = calling.next().is_some();

        // Place the computation directly inside this loop, unless this is a
        // vector or unrolled loop.
        let lanes_are_scalar = self.size.is_empty()
            || self.vectorized_loop_index.map_or(true, |i| self.size[i] == 1);
        if !self.innermost && !self.unrolled && (!in_realization || lanes_are_scalar) {
            let mut r = self.clone();
            r.compute_here(f, true, v, graph);
            if in_realization {
                r.tileable = false;
            } else {
                r.store_at.insert(f);
            }
            result.push(Arc::new(r));
        }

        // Outputs are always computed at the root.
        if node.is_output {
            return result;
        }

        if self.tileable {
            if let (Some(parent), Some(here)) = (parent, self.node) {
                let tilings = Tilings::new(TilingPolicy::default(), &self.size, 2, !in_realization, &[]);
                let mut count = 0;
                for t in tilings {
                    count += 1;
                    if self.parallel && leaves_cores_idle(&t, graph, here, self.stage, params) {
                        continue;
                    }
                    self.compute_in_tile(&t, f, parent, v, in_realization, graph, params, &mut result);
                }
                if count > TILINGS_WARNING_THRESHOLD {
                    warn!("Lots of tilings of {}: {}", graph.node(here).name, count);
                }
            }
        }

        if let (Some(child), false, false) = (child, called_by_multiple_children, in_realization) {
            // Push the computation further inwards.
            let c = &self.children[child];
            let num_ones = c.size.iter().filter(|&&s| s == 1).count();

            // Sliding over the root would serialize a loop we intend to
            // parallelize.
            let may_slide = (params.parallelism == 1 || !self.is_root())
                && num_ones + 1 == c.size.len()
                && node.stages.len() == 1
                && c.vectorized_loop_index.map_or(true, |i| c.size[i] == 1);

            for store_here in [false, true] {
                if store_here && !may_slide {
                    continue;
                }
                if self.is_root() && num_ones == c.size.len() && params.parallelism > 1 {
                    // A serial root loop could never be parallelized.
                    continue;
                }
                for n in c.compute_in_tiles(f, Some(self), v, store_here, graph, params) {
                    let mut r = self.clone();
                    if store_here {
                        r.store_at.insert(f);
                    }
                    r.children[child] = n;
                    result.push(Arc::new(r));
                }
            }
        }

        result
    }

    /// Tiles this level by the outer extents `t` and computes `f` in the
    /// outer tile. When `f` may slide, additional results store `f` at the
    /// outer tile but compute it further in.
    #[allow(clippy::too_many_arguments)]
    fn compute_in_tile(
        &self,
        t: &[DimSize],
        f: NodeId,
        parent: &LoopNest,
        v: usize,
        in_realization: bool,
        graph: &Graph,
        params: &MachineParams,
        result: &mut Vec<Arc<LoopNest>>,
    ) {
        let Some(here) = self.node else {
            return;
        };
        let inner = LoopNest {
            size: t.iter().zip(&self.size).map(|(&o, &s)| div_ceil(s, o)).collect(),
            children: self.children.clone(),
            inlined: self.inlined.clone(),
            store_at: self.store_at.clone(),
            bounds: self.bounds.clone(),
            innermost: self.innermost,
            tileable: self.tileable,
            ..self.header()
        };
        let mut outer = LoopNest {
            size: Shape::from(t),
            parallel: self.parallel,
            tileable: self.tileable,
            ..self.header()
        };

        let mut b = (*inner.get_bounds(here, graph)).clone();
        let parent_bounds = parent.get_bounds(here, graph);
        for (i, &outer_extent) in t.iter().enumerate() {
            let p = parent_bounds.loops[self.stage][i];
            let inner_extent = div_ceil(p.extent(), outer_extent);
            // Pick a representative iteration from the middle.
            let min = p.min + ((outer_extent / 2) * inner_extent) as i64;
            b.loops[self.stage][i] = Interval::with_extent(min, inner_extent);
        }
        outer.set_bounds(here, b);
        if !in_realization {
            outer.store_at.insert(f);
        }
        outer.children.push(Arc::new(inner));

        let may_slide = !in_realization && graph.node(f).stages.len() == 1;
        if may_slide {
            // Store here, but compute further in.
            let inner = &outer.children[outer.children.len() - 1];
            for n in inner.compute_in_tiles(f, Some(&outer), v, true, graph, params) {
                let mut r = outer.clone();
                r.children.pop();
                r.children.push(n);
                result.push(Arc::new(r));
            }
        }

        outer.compute_here(f, true, v, graph);
        outer.tileable &= !in_realization;
        result.push(Arc::new(outer));
    }

    /// A childless copy carrying only this level's identity and vectorization.
    fn header(&self) -> LoopNest {
        LoopNest {
            node: self.node,
            stage: self.stage,
            vector_dim: self.vector_dim,
            vectorized_loop_index: self.vectorized_loop_index,
            ..LoopNest::default()
        }
    }

    /// Rebuilds the path to every child for which `f` returns a replacement.
    /// Returns `None` if nothing was replaced.
    pub fn replace_children<F>(&self, f: &mut F) -> Option<LoopNest>
    where
        F: FnMut(&LoopNest, &Arc<LoopNest>) -> Option<Arc<LoopNest>>,
    {
        let mut replaced: Option<LoopNest> = None;
        for (i, child) in self.children.iter().enumerate() {
            let new_child = match f(self, child) {
                Some(c) => c,
                None => match child.replace_children(f) {
                    Some(c) => Arc::new(c),
                    None => continue,
                },
            };
            replaced.get_or_insert_with(|| self.clone()).children[i] = new_child;
        }
        replaced
    }

    /// Checks that every level's loops cover the region its parent asks of
    /// it, and that storage levels are large enough for every compute site
    /// of the nodes they store.
    pub fn check_containment(&self, graph: &Graph) -> Result<(), SearchError> {
        self.check_containment_under(None, graph)
    }

    fn check_containment_under(
        &self,
        parent: Option<&LoopNest>,
        graph: &Graph,
    ) -> Result<(), SearchError> {
        if let (Some(f), Some(parent)) = (self.node, parent) {
            let wanted = &parent.get_bounds(f, graph).loops[self.stage];
            let per_iteration = &self.get_bounds(f, graph).loops[self.stage];
            for (i, (w, p)) in wanted.iter().zip(per_iteration).enumerate() {
                if self.size[i] * p.extent() < w.extent() {
                    return Err(self.violation(f, graph));
                }
            }
        }
        for &f in &self.store_at {
            let stored = region_extents(&self.get_bounds(f, graph).region_computed);
            let mut ok = true;
            visit_levels(self, &mut |level, _, _| {
                if level.children.iter().any(|c| c.node == Some(f)) && level.node != Some(f) {
                    let computed = region_extents(&level.get_bounds(f, graph).region_computed);
                    ok &= computed.iter().zip(&stored).all(|(c, s)| c <= s);
                }
                ok
            });
            if !ok {
                return Err(self.violation(f, graph));
            }
        }
        for c in &self.children {
            c.check_containment_under(Some(self), graph)?;
        }
        Ok(())
    }

    fn violation(&self, f: NodeId, graph: &Graph) -> SearchError {
        SearchError::ContainmentViolation {
            node: graph.node(f).name.clone(),
            level: self.label(graph),
        }
    }

    /// A short name for this level, used in messages.
    pub fn label(&self, graph: &Graph) -> String {
        match self.node {
            None => "root".to_string(),
            Some(n) => {
                let sizes = self.size.iter().join(" ");
                format!("{}.s{} [{}]", graph.node(n).name, self.stage, sizes)
            }
        }
    }

    /// Renders the tree with one line per level.
    ///
    /// A level line holds the node name and loop sizes. The vectorized loop of
    /// an innermost level is suffixed `v`, and the level is suffixed `*` when
    /// innermost, `p` when parallel and `u` when unrolled. Storage and inlined
    /// nodes follow on `realize:` and `inlined:` lines.
    pub fn dump(&self, graph: &Graph) -> String {
        let mut out = String::new();
        self.dump_into(&mut out, 0, graph);
        out
    }

    fn dump_into(&self, out: &mut String, depth: usize, graph: &Graph) {
        let mut depth = depth;
        if let Some(n) = self.node {
            let _ = write!(out, "{}{}", indent(depth), graph.node(n).name);
            if self.stage > 0 {
                let _ = write!(out, ".update");
            }
            for (i, s) in self.size.iter().enumerate() {
                let v = if self.innermost && self.vectorized_loop_index == Some(i) {
                    "v"
                } else {
                    ""
                };
                let _ = write!(out, " {}{}", s, v);
            }
            if self.innermost {
                out.push_str(" *");
            } else if self.parallel {
                out.push_str(" p");
            } else if self.unrolled {
                out.push_str(" u");
            }
            out.push('\n');
            depth += 1;
        }
        for &f in &self.store_at {
            let _ = writeln!(out, "{}realize: {}", indent(depth), graph.node(f).name);
        }
        for c in self.children.iter().rev() {
            c.dump_into(out, depth, graph);
        }
        for (&f, &calls) in &self.inlined {
            let _ = writeln!(out, "{}inlined: {} {}", indent(depth), graph.node(f).name, calls);
        }
    }
}

fn stage_id(level: &LoopNest) -> u64 {
    level.node.map_or(u64::MAX, |n| (n as u64) << 1 | level.stage as u64)
}

/// Returns `true` if parallelizing the pure loops of `t` would leave more
/// than 10% of the cores idle.
fn leaves_cores_idle(
    t: &[DimSize],
    graph: &Graph,
    node: NodeId,
    stage: usize,
    params: &MachineParams,
) -> bool {
    let total: DimSize = graph.node(node).stages[stage]
        .loops
        .iter()
        .zip(t)
        .filter(|(l, _)| l.pure_dim.is_some())
        .map(|(_, &s)| s)
        .product();
    let tasks_per_core = total as f64 / f64::from(params.parallelism);
    tasks_per_core.ceil() / tasks_per_core > 1.1
}

/// Calls `f` with every level of the tree, its parent and its depth, parents
/// first. Stops early once `f` returns `false`.
pub fn visit_levels<'a, F>(root: &'a LoopNest, f: &mut F) -> bool
where
    F: FnMut(&'a LoopNest, Option<&'a LoopNest>, usize) -> bool,
{
    fn inner<'a, F>(level: &'a LoopNest, parent: Option<&'a LoopNest>, depth: usize, f: &mut F) -> bool
    where
        F: FnMut(&'a LoopNest, Option<&'a LoopNest>, usize) -> bool,
    {
        if !f(level, parent, depth) {
            return false;
        }
        level
            .children
            .iter()
            .all(|c| inner(c, Some(level), depth + 1, f))
    }
    inner(root, None, 0, f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{pointwise, stencil, PipelineBuilder};
    use proptest::prelude::*;

    fn params() -> MachineParams {
        MachineParams::default()
    }

    /// `in -> blur -> out`, where `blur` is a 3x3 stencil.
    fn blur_graph(w: DimSize, h: DimSize) -> Graph {
        let mut b = PipelineBuilder::new();
        let input = b.input("in", &[w + 2, h + 2], 4);
        let blur = b.func("blur", &[w, h], 4, 9.0);
        let out = b.func("out", &[w, h], 4, 1.0);
        b.read(blur, input, stencil(2, 1), 9)
            .read(out, blur, pointwise(2), 1)
            .output(out);
        b.build(&params()).unwrap()
    }

    fn id(graph: &Graph, name: &str) -> NodeId {
        graph.node_by_name(name).unwrap().id
    }

    fn with_output_at_root(graph: &Graph) -> LoopNest {
        let out = id(graph, "out");
        let mut root = LoopNest::root();
        root.compute_here(out, true, 0, graph);
        root.store_at.insert(out);
        root
    }

    #[test]
    fn test_compute_here_splits_off_one_vector() {
        let graph = blur_graph(100, 50);
        let root = with_output_at_root(&graph);
        assert_eq!(root.children.len(), 1);
        let level = &root.children[0];
        assert_eq!(level.size.as_slice(), &[13, 50]);
        assert!(!level.innermost);
        assert_eq!(level.vectorized_loop_index, Some(0));
        let lanes = &level.children[0];
        assert!(lanes.innermost);
        assert!(!lanes.tileable);
        assert_eq!(lanes.size.as_slice(), &[8, 1]);
        root.check_containment(&graph).unwrap();
    }

    #[test]
    fn test_parallelize_in_tiles_sizes() {
        let graph = blur_graph(1024, 1024);
        let root = with_output_at_root(&graph);
        let tiled = root.children[0].parallelize_in_tiles(&[4, 8], &root, false, true, &graph);
        assert!(tiled.parallel);
        assert_eq!(tiled.size.as_slice(), &[4, 8]);
        let inner = &tiled.children[0];
        assert_eq!(inner.size.as_slice(), &[32, 128]);
        assert!(!inner.parallel);

        let mut new_root = root.clone();
        new_root.children[0] = tiled;
        new_root.check_containment(&graph).unwrap();
    }

    #[test]
    fn test_serial_split_is_unrolled() {
        let graph = blur_graph(64, 64);
        let root = with_output_at_root(&graph);
        let split = root.children[0].parallelize_in_tiles(&[4, 32], &root, true, false, &graph);
        assert!(!split.parallel);
        assert_eq!(split.size.as_slice(), &[4, 32]);
        let inner = &split.children[0];
        assert!(inner.unrolled);
        assert!(!inner.tileable);
        assert_eq!(inner.size.as_slice(), &[2, 2]);
    }

    #[test]
    fn test_inline_func_counts_calls() {
        let graph = blur_graph(64, 64);
        let mut root = with_output_at_root(&graph);
        root.inline_func(id(&graph, "blur"), &graph);
        assert!(root.computes(id(&graph, "blur")));
        assert_eq!(root.max_inlined_calls(), 1);
        assert!(root.calls(id(&graph, "in"), &graph));
    }

    #[test]
    fn test_inline_func_multiplies_through_chains() {
        let mut b = PipelineBuilder::new();
        let input = b.input("in", &[64], 4);
        let f = b.func("f", &[64], 4, 1.0);
        let g = b.func("g", &[64], 4, 1.0);
        let h = b.func("h", &[64], 4, 1.0);
        b.read(f, input, pointwise(1), 1)
            .read(g, f, pointwise(1), 3)
            .read(h, g, pointwise(1), 2)
            .output(h);
        let graph = b.build(&params()).unwrap();
        let mut root = LoopNest::root();
        root.compute_here(id(&graph, "h"), true, 0, &graph);
        root.inline_func(id(&graph, "g"), &graph);
        root.inline_func(id(&graph, "f"), &graph);
        assert_eq!(root.max_inlined_calls(), 6);
    }

    #[test]
    fn test_compute_in_tiles_includes_root_and_tiles() {
        let graph = blur_graph(512, 512);
        let root = with_output_at_root(&graph);
        let blur = id(&graph, "blur");
        let options = root.compute_in_tiles(blur, None, 0, false, &graph, &params());
        assert!(options.len() > 2);
        assert!(options
            .iter()
            .any(|o| o.store_at.contains(&blur) && o.compute_site(blur).map_or(false, |s| s.is_root())));
        assert!(options
            .iter()
            .any(|o| o.compute_site(blur).map_or(false, |s| !s.is_root())));
        for o in &options {
            o.check_containment(&graph).unwrap();
            assert!(o.computes(blur));
            assert!(o.store_site(blur).is_some());
        }
    }

    #[test]
    fn test_outputs_are_only_computed_at_root() {
        let graph = blur_graph(64, 64);
        let options = LoopNest::root().compute_in_tiles(id(&graph, "out"), None, 0, false, &graph, &params());
        assert_eq!(options.len(), 1);
    }

    #[test]
    fn test_structural_hash_coarsens_with_depth() {
        let graph = blur_graph(256, 256);
        let root = with_output_at_root(&graph);
        let a = root.children[0].parallelize_in_tiles(&[4, 4], &root, false, true, &graph);
        let b = root.children[0].parallelize_in_tiles(&[8, 8], &root, false, true, &graph);
        let mut ra = root.clone();
        ra.children[0] = a;
        let mut rb = root.clone();
        rb.children[0] = b;

        let hash = |r: &LoopNest, depth| {
            let mut h = 0;
            r.structural_hash(&mut h, depth);
            h
        };
        assert_eq!(hash(&ra, 1), hash(&rb, 1));
        assert_ne!(hash(&ra, 2), hash(&rb, 2));
        assert_ne!(ra.fingerprint(), rb.fingerprint());
        assert_eq!(ra.fingerprint(), ra.clone().fingerprint());
    }

    #[test]
    fn test_dump_format() {
        let graph = blur_graph(16, 4);
        let mut root = with_output_at_root(&graph);
        root.inline_func(id(&graph, "blur"), &graph);
        assert_eq!(
            root.dump(&graph),
            "realize: out\nout 2 4\n  out 8v 1 *\n    inlined: blur 1\n"
        );
    }

    #[test]
    fn test_replace_children_copies_only_the_path() {
        let graph = blur_graph(64, 64);
        let root = with_output_at_root(&graph);
        let out = id(&graph, "out");
        let lanes = Arc::clone(&root.children[0].children[0]);
        let replaced = root
            .replace_children(&mut |parent, c| {
                (c.node == Some(out) && parent.is_root())
                    .then(|| c.parallelize_in_tiles(&[2, 2], parent, false, true, &graph))
            })
            .unwrap();
        assert!(replaced.children[0].parallel);
        // The vector level is shared, not copied.
        assert!(Arc::ptr_eq(&replaced.children[0].children[0].children[0], &lanes));
    }

    #[test]
    fn test_deepest_valid_compute_location_is_monotonic() {
        let graph = blur_graph(512, 512);
        let blur = id(&graph, "blur");
        let root = with_output_at_root(&graph);
        let mut tiled = root.clone();
        tiled.children[0] = root.children[0].parallelize_in_tiles(&[8, 8], &root, false, true, &graph);

        let parents = ParentMap::new(&tiled);
        let mut levels = vec![];
        visit_levels(&tiled, &mut |l, _, _| {
            levels.push(l);
            true
        });
        for &a in &levels {
            for &b in &levels {
                if !parents.is_ancestor_or_self(b, a) {
                    continue;
                }
                let from_a = deepest_valid_compute_location(&parents, &graph, blur, a, &tiled);
                let from_b = deepest_valid_compute_location(&parents, &graph, blur, b, &tiled);
                assert!(parents.depth(from_a) >= parents.depth(from_b));
                assert!(parents.is_ancestor_or_self(from_b, from_a));
                assert!(!from_a.innermost);
            }
        }
        // From the vector lanes, the deepest location is inside the tile.
        let lanes = &tiled.children[0].children[0].children[0];
        let site = deepest_valid_compute_location(&parents, &graph, blur, lanes, &tiled);
        assert!(!site.is_root());
    }

    #[test]
    fn test_deepest_common_ancestor() {
        let graph = blur_graph(64, 64);
        let root = with_output_at_root(&graph);
        let parents = ParentMap::new(&root);
        let level = &root.children[0];
        let lanes = &level.children[0];
        assert!(std::ptr::eq(deepest_common_ancestor(&parents, lanes, level), &**level));
        assert!(deepest_common_ancestor(&parents, lanes, &root).is_root());
    }

    prop_compose! {
        fn arb_chain()(len in 1usize..4, w in 8u64..96, h in 1u64..40, radii in prop::collection::vec(0i64..2, 4))
            -> Graph
        {
            let mut b = PipelineBuilder::new();
            let mut prev = b.input("in", &[w + 8, h + 8], 4);
            for i in 0..len {
                let f = b.func(&format!("f{}", i), &[w, h], 4, 2.0);
                b.read(f, prev, stencil(2, radii[i]), 1);
                prev = f;
            }
            b.output(prev);
            b.build(&MachineParams::default()).unwrap()
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn test_random_operation_sequences_preserve_containment(
            graph in arb_chain(),
            choices in prop::collection::vec(any::<prop::sample::Index>(), 8),
        ) {
            let params = params();
            let mut root = Arc::new(LoopNest::root());
            let mut choices = choices.into_iter();
            for &f in graph.schedule_order() {
                let mut options = root.compute_in_tiles(f, None, 0, false, &graph, &params);
                if !graph.node(f).is_output && graph.consumers(f).len() == 1 {
                    let mut inlined = (*root).clone();
                    inlined.inline_func(f, &graph);
                    options.push(Arc::new(inlined));
                }
                prop_assert!(!options.is_empty());
                let pick = choices.next().map_or(0, |c| c.index(options.len()));
                root = Arc::clone(&options[pick]);
                prop_assert!(root.computes(f));
                root.check_containment(&graph).unwrap();

                // Parallelize whatever sits at the root.
                if let Some(r) = root.replace_children(&mut |parent, c| {
                    (parent.is_root() && c.node == Some(f) && !c.size.is_empty())
                        .then(|| c.parallelize_in_tiles(&vec![2; c.size.len()], parent, false, true, &graph))
                }) {
                    root = Arc::new(r);
                    root.check_containment(&graph).unwrap();
                }
            }
        }
    }
}
