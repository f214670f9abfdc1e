//! The analytical cost model.
//!
//! Costs are in units of one arithmetic operation on one core. The model
//! charges arithmetic per point computed, loads per producer access, loop and
//! task overheads, and memory traffic for buffers that do not fit in the cache
//! budget of the loop level they are stored at. Nodes not yet placed in a
//! partial schedule are charged the cost of their best placement along the
//! path to their consumers.

use crate::common::{region_volume, DimSize};
use crate::error::SearchError;
use crate::graph::{Edge, Graph, Node, NodeId};
use crate::loop_nest::{
    deepest_common_ancestor, deepest_valid_compute_location, visit_levels, LoopNest, ParentMap,
};
use crate::machine::MachineParams;
use crate::utils::div_ceil;

use auto_impl::auto_impl;
use by_address::ByThinAddress;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{self, AtomicUsize};
use std::sync::{Arc, OnceLock};

/// Tunable constants of [AnalyticalCostModel].
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct CostPolicy {
    /// Cost of one load from a producer.
    pub load_cost: f64,
    /// Cost per point of the pure stage of a reduction.
    pub init_cost_per_point: f64,
    /// Cost of one iteration of a loop which is not unrolled.
    pub loop_overhead: f64,
    /// Cost of launching one parallel task.
    pub task_overhead: f64,
    /// Cost of one allocation.
    pub alloc_overhead: f64,
}

impl Default for CostPolicy {
    fn default() -> Self {
        CostPolicy {
            load_cost: 1.0,
            init_cost_per_point: 1.0,
            loop_overhead: 1.0,
            task_overhead: 10_000.0,
            alloc_overhead: 50.0,
        }
    }
}

/// Cost features of one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeCost {
    /// Points of the final stage computed, counting recomputation.
    pub points: f64,
    /// Points of the final stage the outputs need.
    pub min_points: f64,
    pub realizations: f64,
    /// Calls made to this node where it is inlined.
    pub inlined_calls: f64,
    pub compute: f64,
    pub memory: f64,
    pub parallel_overhead: f64,
    /// Bytes live at this node's storage level.
    pub working_set: f64,
    /// Set when the node is not placed yet and its costs are estimates.
    pub estimated: bool,
}

impl NodeCost {
    pub fn total(&self) -> f64 {
        self.compute + self.memory + self.parallel_overhead
    }

    /// The ratio of points computed to points needed, or `None` if the node
    /// is not computed.
    pub fn recompute_ratio(&self) -> Option<f64> {
        (self.min_points > 0.0 && !self.estimated).then(|| self.points / self.min_points)
    }
}

/// Per-node cost features of a whole loop nest, indexed by [NodeId].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CostBreakdown {
    pub nodes: Vec<NodeCost>,
}

impl CostBreakdown {
    pub fn total(&self) -> f64 {
        self.nodes.iter().map(NodeCost::total).sum()
    }

    pub fn max_recompute_ratio(&self) -> f64 {
        self.nodes
            .iter()
            .filter_map(NodeCost::recompute_ratio)
            .fold(1.0, f64::max)
    }
}

#[auto_impl(&, Box, Arc)]
pub trait CostModel: Send + Sync {
    fn evaluate_breakdown(
        &self,
        root: &LoopNest,
        graph: &Graph,
        params: &MachineParams,
    ) -> Result<CostBreakdown, SearchError>;

    fn evaluate(
        &self,
        root: &LoopNest,
        graph: &Graph,
        params: &MachineParams,
    ) -> Result<f64, SearchError> {
        Ok(self.evaluate_breakdown(root, graph, params)?.total())
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnalyticalCostModel {
    pub policy: CostPolicy,
}

impl AnalyticalCostModel {
    pub fn new(policy: CostPolicy) -> Self {
        AnalyticalCostModel { policy }
    }
}

impl CostModel for AnalyticalCostModel {
    fn evaluate_breakdown(
        &self,
        root: &LoopNest,
        graph: &Graph,
        params: &MachineParams,
    ) -> Result<CostBreakdown, SearchError> {
        let mut ev = Evaluator::new(root, graph, params, &self.policy);
        ev.visit_contexts();
        ev.compute_working_sets();
        ev.charge_innermost();
        ev.estimate_unplaced()?;
        Ok(ev.breakdown)
    }
}

/// Execution counts and cache budget of one loop level.
#[derive(Debug, Clone, Copy)]
struct LevelContext {
    /// Number of times the level's loops start.
    entries: f64,
    /// Number of times the level's body runs.
    body_execs: f64,
    /// Fraction of the work a single core performs.
    scale: f64,
    /// Cache bytes available to one iteration of the body.
    budget: f64,
    in_parallel: bool,
}

struct Evaluator<'a> {
    root: &'a LoopNest,
    graph: &'a Graph,
    params: &'a MachineParams,
    policy: &'a CostPolicy,
    parents: ParentMap<'a>,
    contexts: HashMap<ByThinAddress<&'a LoopNest>, LevelContext>,
    store_sites: HashMap<NodeId, &'a LoopNest>,
    fits: HashMap<NodeId, bool>,
    breakdown: CostBreakdown,
}

impl<'a> Evaluator<'a> {
    fn new(
        root: &'a LoopNest,
        graph: &'a Graph,
        params: &'a MachineParams,
        policy: &'a CostPolicy,
    ) -> Self {
        Evaluator {
            root,
            graph,
            params,
            policy,
            parents: ParentMap::new(root),
            contexts: HashMap::new(),
            store_sites: HashMap::new(),
            fits: HashMap::new(),
            breakdown: CostBreakdown {
                nodes: vec![NodeCost::default(); graph.len()],
            },
        }
    }

    fn ctx(&self, level: &'a LoopNest) -> LevelContext {
        self.contexts[&ByThinAddress(level)]
    }

    fn cost_per_byte(&self) -> f64 {
        self.params.cost_per_byte()
    }

    fn bytes(node: &Node, points: f64) -> f64 {
        points * f64::from(node.bytes_per_point)
    }

    /// Assigns every level its context, charging loop, task and allocation
    /// overheads along the way.
    fn visit_contexts(&mut self) {
        let root_ctx = LevelContext {
            entries: 1.0,
            body_execs: 1.0,
            scale: 1.0,
            budget: self.params.cache_bytes as f64,
            in_parallel: false,
        };
        let mut stack = vec![(self.root, root_ctx)];
        while let Some((level, ctx)) = stack.pop() {
            self.contexts.insert(ByThinAddress(level), ctx);

            for &f in &level.store_at {
                self.store_sites.insert(f, level);
                let nc = &mut self.breakdown.nodes[f];
                nc.realizations += ctx.body_execs;
                nc.memory += self.policy.alloc_overhead * ctx.body_execs * ctx.scale;
            }

            for child in &level.children {
                let child: &'a LoopNest = child;
                let iterations = child.iterations() as f64;
                let mut c = LevelContext {
                    entries: ctx.body_execs,
                    body_execs: ctx.body_execs * iterations,
                    ..ctx
                };
                if child.parallel && !ctx.in_parallel {
                    let tasks = child.iterations().max(1);
                    let waves = div_ceil(tasks, u64::from(self.params.parallelism));
                    c.scale = ctx.scale * waves as f64 / tasks as f64;
                    c.budget = self.params.cache_bytes as f64 / f64::from(self.params.parallelism);
                    c.in_parallel = true;
                    if let Some(n) = child.node {
                        self.breakdown.nodes[n].parallel_overhead +=
                            self.policy.task_overhead * waves as f64 * ctx.body_execs * ctx.scale;
                    }
                }
                let is_vector_lanes = child.innermost && child.vectorized_loop_index.is_some();
                if let (Some(n), false) = (child.node, is_vector_lanes) {
                    let runs = if child.unrolled { c.entries } else { c.body_execs };
                    self.breakdown.nodes[n].compute += self.policy.loop_overhead * runs * c.scale;
                }
                stack.push((child, c));
            }
        }
    }

    /// Decides which stored buffers fit in the cache budget of their storage
    /// level.
    fn compute_working_sets(&mut self) {
        let sites = self
            .store_sites
            .iter()
            .map(|(&f, &s)| (f, s))
            .collect::<Vec<_>>();
        let mut by_site: HashMap<ByThinAddress<&'a LoopNest>, f64> = HashMap::new();
        for (f, site) in sites {
            let working_set = *by_site
                .entry(ByThinAddress(site))
                .or_insert_with(|| self.working_set(site));
            self.fits.insert(f, working_set <= self.ctx(site).budget);
            self.breakdown.nodes[f].working_set = working_set;
        }
    }

    /// Bytes of the buffers stored at `level` plus the footprints of the
    /// buffers stored outside of it that it reads.
    fn working_set(&self, level: &'a LoopNest) -> f64 {
        let mut total = 0.0;
        for &g in &level.store_at {
            let b = level.get_bounds(g, self.graph);
            total += Self::bytes(self.graph.node(g), region_volume(&b.region_computed) as f64);
        }
        for q in self.graph.nodes() {
            let stored_outside = q.is_input()
                || self.store_sites.get(&q.id).map_or(false, |&s| {
                    !std::ptr::eq(s, level) && self.parents.is_ancestor_or_self(s, level)
                });
            if stored_outside && level.calls(q.id, self.graph) {
                let b = level.get_bounds(q.id, self.graph);
                total += Self::bytes(q, region_volume(&b.region_required) as f64);
            }
        }
        total
    }

    fn fits(&self, f: NodeId) -> bool {
        self.fits.get(&f).copied().unwrap_or(false)
    }

    fn charge_innermost(&mut self) {
        let mut innermost = vec![];
        visit_levels(self.root, &mut |level, _, _| {
            if level.innermost && level.node.is_some() {
                innermost.push(level);
            }
            true
        });
        for level in innermost {
            self.charge_compute(level);
        }
    }

    /// Charges the arithmetic, loads and memory traffic of one innermost
    /// level.
    fn charge_compute(&mut self, level: &'a LoopNest) {
        let Some(n) = level.node else {
            return;
        };
        let graph = self.graph;
        let node = graph.node(n);
        let ctx = self.ctx(level);
        let points = ctx.body_execs;
        let is_final_stage = level.stage + 1 == node.stages.len();
        let lanes = if level.vectorized_loop_index.is_some() {
            node.vector_size as f64
        } else {
            1.0
        };

        let stage_cost = if is_final_stage {
            node.cost_per_point
        } else {
            self.policy.init_cost_per_point
        };
        let mut per_point = stage_cost;
        for (&q, &calls) in &level.inlined {
            per_point += calls as f64 * graph.node(q).cost_per_point;
            self.breakdown.nodes[q].inlined_calls += points * calls as f64;
        }
        let nc = &mut self.breakdown.nodes[n];
        nc.compute += points * per_point / lanes * ctx.scale;
        if is_final_stage {
            nc.points += points;
            // Tail lanes of the vectorized loop are unavoidable.
            let bounds = self.root.get_bounds(n, graph);
            let min: DimSize = bounds.loops[level.stage]
                .iter()
                .enumerate()
                .map(|(i, l)| match level.vectorized_loop_index {
                    Some(v) if v == i => div_ceil(l.extent(), node.vector_size) * node.vector_size,
                    _ => l.extent(),
                })
                .product();
            nc.min_points = min as f64;
        }

        // Loads vectorize only along the innermost storage dimension.
        let load_lanes = if level.vector_dim == Some(0) { lanes } else { 1.0 };
        let mut loads: Vec<(&Edge, f64)> = node.stages[level.stage]
            .incoming
            .iter()
            .map(|&e| (graph.edge(e), 1.0))
            .collect();
        for (&q, &calls) in &level.inlined {
            loads.extend(graph.incoming(q).map(|e| (e, calls as f64)));
        }
        for (e, multiplier) in loads {
            if level.inlined.contains_key(&e.producer) {
                continue;
            }
            let count = points * f64::from(e.calls) * multiplier;
            self.breakdown.nodes[n].compute += count * self.policy.load_cost / load_lanes * ctx.scale;
            self.charge_reads(e.producer, level);
        }

        if node.is_output || !self.fits(n) {
            let write = Self::bytes(node, points) * self.cost_per_byte() * ctx.scale;
            self.breakdown.nodes[n].memory += write;
        }
    }

    /// Charges the traffic of reading producer `p` from `level`.
    ///
    /// The reads are charged at the outermost level below the storage of `p`
    /// whose per-iteration footprint fits, once per iteration of that level.
    fn charge_reads(&mut self, p: NodeId, level: &'a LoopNest) {
        let producer = self.graph.node(p);
        let start = if producer.is_input() {
            None
        } else {
            match self.store_sites.get(&p) {
                // Not placed yet.
                None => return,
                Some(_) if self.fits(p) => return,
                Some(&s) => Some(s),
            }
        };

        let mut path = self.parents.ancestors(level);
        path.reverse();
        let first = match start {
            None => 0,
            Some(s) => path
                .iter()
                .position(|&l| std::ptr::eq(l, s))
                .map_or(0, |i| i + 1),
        };
        let Some(&last) = path.last() else {
            return;
        };
        let mut charged_at = last;
        for &l in &path[first.min(path.len() - 1)..] {
            let footprint = self.footprint(p, l);
            if footprint <= self.ctx(l).budget {
                charged_at = l;
                break;
            }
        }
        let ctx = self.ctx(charged_at);
        let traffic = self.footprint(p, charged_at) * ctx.body_execs * self.cost_per_byte() * ctx.scale;
        self.breakdown.nodes[p].memory += traffic;
    }

    fn footprint(&self, p: NodeId, level: &LoopNest) -> f64 {
        let b = level.get_bounds(p, self.graph);
        Self::bytes(self.graph.node(p), region_volume(&b.region_required) as f64)
    }

    /// Charges every node neither computed nor inlined its cheapest placement
    /// between the root and the deepest level its consumers allow.
    fn estimate_unplaced(&mut self) -> Result<(), SearchError> {
        let graph = self.graph;
        let mut sites: HashMap<NodeId, &'a LoopNest> = HashMap::new();
        for &n in graph.schedule_order() {
            if self.root.computes(n) {
                continue;
            }
            let mut consumer_sites = vec![];
            for c in graph.consumers(n) {
                if self.root.computes(c) {
                    visit_levels(self.root, &mut |level, _, _| {
                        if level.innermost && (level.node == Some(c) || level.inlined.contains_key(&c)) {
                            consumer_sites.push(level);
                        }
                        true
                    });
                } else if let Some(&s) = sites.get(&c) {
                    consumer_sites.push(s);
                } else {
                    return Err(SearchError::UnplacedConsumer {
                        node: graph.node(n).name.clone(),
                        consumer: graph.node(c).name.clone(),
                    });
                }
            }
            // Outputs have no consumers and start at the root.
            let first = consumer_sites.first().copied().unwrap_or(self.root);
            let site = consumer_sites
                .iter()
                .fold(first, |acc, &s| deepest_common_ancestor(&self.parents, acc, s));
            let deepest = deepest_valid_compute_location(&self.parents, graph, n, site, self.root);

            let mut best: Option<(f64, f64, f64, &'a LoopNest)> = None;
            for level in self.parents.ancestors(deepest) {
                let (compute, memory, points) = self.placement_estimate(n, level);
                if best.map_or(true, |(c, m, _, _)| compute + memory < c + m) {
                    best = Some((compute, memory, points, level));
                }
            }
            if let Some((compute, memory, points, level)) = best {
                let nc = &mut self.breakdown.nodes[n];
                nc.compute = compute;
                nc.memory = memory;
                nc.points = points;
                nc.estimated = true;
                sites.insert(n, level);
            }
        }
        Ok(())
    }

    /// Compute and memory cost of computing `n` in the body of `level`, along
    /// with the points of its final stage.
    fn placement_estimate(&self, n: NodeId, level: &'a LoopNest) -> (f64, f64, f64) {
        let node = self.graph.node(n);
        let ctx = self.ctx(level);
        let b = level.get_bounds(n, self.graph);
        let lanes = node.vector_size as f64;
        let mut compute = 0.0;
        let mut points = 0.0;
        for (s, loops) in b.loops.iter().enumerate() {
            let stage_points = region_volume(loops) as f64 * ctx.body_execs;
            let cost = if s + 1 == node.stages.len() {
                points = stage_points;
                node.cost_per_point
            } else {
                self.policy.init_cost_per_point
            };
            compute += stage_points * cost / lanes * ctx.scale;
        }
        let bytes = Self::bytes(node, region_volume(&b.region_computed) as f64);
        let memory = if bytes <= ctx.budget {
            0.0
        } else {
            2.0 * bytes * ctx.body_execs * self.cost_per_byte() * ctx.scale
        };
        (compute, memory, points)
    }
}

/// Memoizes a [CostModel] by tree fingerprint.
///
/// Concurrent requests for the same tree evaluate the model once; the other
/// callers block until that result is available. Keys do not include the
/// graph or machine, so a cache must only be used for one search.
pub struct CostCache<M> {
    model: M,
    entries: DashMap<u64, Arc<OnceLock<Result<Arc<CostBreakdown>, SearchError>>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl<M: CostModel> CostCache<M> {
    pub fn new(model: M) -> Self {
        CostCache {
            model,
            entries: DashMap::new(),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    pub fn evaluate(
        &self,
        root: &LoopNest,
        graph: &Graph,
        params: &MachineParams,
    ) -> Result<Arc<CostBreakdown>, SearchError> {
        let cell = Arc::clone(self.entries.entry(root.fingerprint()).or_default().value());
        let mut computed = false;
        let result = cell.get_or_init(|| {
            computed = true;
            self.model
                .evaluate_breakdown(root, graph, params)
                .map(Arc::new)
        });
        let counter = if computed { &self.misses } else { &self.hits };
        counter.fetch_add(1, atomic::Ordering::Relaxed);
        result.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of cache hits and misses so far.
    pub fn stats(&self) -> (usize, usize) {
        (
            self.hits.load(atomic::Ordering::Relaxed),
            self.misses.load(atomic::Ordering::Relaxed),
        )
    }
}
