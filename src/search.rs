//! Beam search over partial schedules.
//!
//! A [State] is a loop nest with some prefix of the decisions made. Each node
//! in [Graph::schedule_order] takes two decisions: where it is realized, then
//! how its outermost loops are parallelized or unrolled. Every round expands
//! the cheapest states of the beam by one decision.
//!
//! Passes after the first reuse the results of the earlier ones: states whose
//! coarse structure was not near the best schedule of the previous pass are
//! penalized, and structurally similar states within a round are penalized
//! increasingly, which keeps the beam diverse.

use crate::common::{DimSize, Shape};
use crate::cost::{AnalyticalCostModel, CostBreakdown, CostCache, CostModel};
use crate::error::{ConfigError, Error, SearchError};
use crate::graph::{Graph, NodeId, NodeKind};
use crate::loop_nest::{visit_levels, LoopNest};
use crate::machine::MachineParams;
use crate::tiling::{generate_serial_tilings, generate_tilings};

use log::{debug, info, trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

/// States within this factor of a pass's best are blessed for later passes.
const BLESS_SLACK: f64 = 1.2;
/// Parallel tilings are kept while cores idle no more than this fraction.
const MAX_IDLE_WASTAGE: f64 = 1.2;
const MAX_TASKS_PER_CORE: DimSize = 16;
/// Added to the penalty of a state a previous pass did not bless.
const UNBLESSED_PENALTY: u32 = 10;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SearchConfig {
    pub beam_size: usize,
    /// Defaults to 1 for greedy search and to 5 otherwise.
    pub num_passes: Option<usize>,
    /// Chance, in percent, that a complete path through the search survives
    /// random dropout.
    pub keep_percent: u32,
    pub seed: u64,
    /// Rounds allowed per pass.
    pub max_rounds: Option<usize>,
    /// Allows inlining nodes with more than one consumer.
    pub relaxed_inline: bool,
    /// States computing any node more than this many times over are pruned.
    pub max_recompute: f64,
    pub max_inlined_calls: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            beam_size: 32,
            num_passes: None,
            keep_percent: 100,
            seed: 0,
            max_rounds: None,
            relaxed_inline: false,
            max_recompute: 8.0,
            max_inlined_calls: 256,
        }
    }
}

impl SearchConfig {
    pub fn passes(&self) -> usize {
        self.num_passes
            .unwrap_or(if self.beam_size == 1 { 1 } else { 5 })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn bad(field: &'static str, value: impl ToString) -> ConfigError {
            ConfigError::BadSearchConfig {
                field,
                value: value.to_string(),
            }
        }

        if self.beam_size == 0 {
            return Err(bad("beam_size", self.beam_size));
        }
        if self.passes() == 0 {
            return Err(bad("num_passes", 0));
        }
        if self.keep_percent == 0 || self.keep_percent > 100 {
            return Err(bad("keep_percent", self.keep_percent));
        }
        if !(self.max_recompute >= 1.0) {
            return Err(bad("max_recompute", self.max_recompute));
        }
        Ok(())
    }
}

/// A partial schedule.
#[derive(Debug, Clone)]
pub struct State {
    pub root: Arc<LoopNest>,
    pub parent: Option<Arc<State>>,
    pub num_decisions: usize,
    pub inlined: BTreeSet<NodeId>,
    pub placed: BTreeSet<NodeId>,
    /// The modeled cost, without any search penalty.
    pub cost: f64,
    penalty: f64,
    penalized: bool,
}

impl State {
    fn initial(cost: f64) -> Self {
        State {
            root: Arc::new(LoopNest::root()),
            parent: None,
            num_decisions: 0,
            inlined: BTreeSet::new(),
            placed: BTreeSet::new(),
            cost,
            penalty: 1.0,
            penalized: false,
        }
    }

    pub fn is_terminal(&self, graph: &Graph) -> bool {
        self.num_decisions == 2 * graph.schedule_order().len()
    }

    /// The node and phase of the next decision, if any remain.
    pub fn next_decision(&self, graph: &Graph) -> Option<(NodeId, u8)> {
        let node = *graph.schedule_order().get(self.num_decisions / 2)?;
        Some((node, (self.num_decisions % 2) as u8))
    }

    pub fn structural_hash(&self, depth: i64) -> u64 {
        let mut h = self.num_decisions as u64;
        self.root.structural_hash(&mut h, depth);
        h
    }

    fn queued_cost(&self) -> f64 {
        self.cost * self.penalty
    }
}

/// Orders states cheapest first in a [BinaryHeap].
struct Queued(Arc<State>);

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.queued_cost().total_cmp(&self.0.queued_cost())
    }
}

#[derive(Debug, Clone, Copy)]
enum Decision {
    Inline(NodeId),
    Place(NodeId),
    Keep,
}

pub struct SearchResult {
    pub state: Arc<State>,
    pub cost: f64,
    pub breakdown: Arc<CostBreakdown>,
    /// The cost of the best schedule of each pass.
    pub pass_costs: Vec<f64>,
    /// Distinct loop nests the cost model evaluated.
    pub evaluated: usize,
}

impl SearchResult {
    pub fn root(&self) -> &LoopNest {
        &self.state.root
    }
}

/// Searches with the default [AnalyticalCostModel].
pub fn search(
    graph: &Graph,
    params: &MachineParams,
    config: &SearchConfig,
) -> Result<SearchResult, Error> {
    search_with_model(graph, params, config, AnalyticalCostModel::default())
}

pub fn search_with_model<M: CostModel>(
    graph: &Graph,
    params: &MachineParams,
    config: &SearchConfig,
    model: M,
) -> Result<SearchResult, Error> {
    params.validate()?;
    config.validate()?;
    let mut beam = BeamSearch {
        expander: Expander {
            graph,
            params,
            config,
            cache: CostCache::new(model),
        },
        permitted: HashSet::new(),
        rng: StdRng::seed_from_u64(config.seed),
    };
    Ok(beam.run()?)
}

/// Generates and scores the children of states.
struct Expander<'a, M> {
    graph: &'a Graph,
    params: &'a MachineParams,
    config: &'a SearchConfig,
    cache: CostCache<M>,
}

impl<'a, M: CostModel> Expander<'a, M> {
    fn initial_state(&self) -> Result<State, SearchError> {
        let root = LoopNest::root();
        let cost = self.cache.evaluate(&root, self.graph, self.params)?.total();
        Ok(State::initial(cost))
    }

    fn generate_children(&self, state: &Arc<State>) -> Result<Vec<State>, SearchError> {
        let Some((n, phase)) = state.next_decision(self.graph) else {
            return Ok(vec![]);
        };
        let candidates = if phase == 0 {
            self.realize(state, n)?
        } else {
            self.parallelize_or_unroll(state, n)
                .into_iter()
                .map(|root| (root, Decision::Keep))
                .collect()
        };
        let children = candidates
            .into_par_iter()
            .map(|(root, decision)| self.make_child(state, root, decision))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(children.into_iter().flatten().collect())
    }

    /// Scores a candidate, returning `None` if it is pruned.
    fn make_child(
        &self,
        parent: &Arc<State>,
        root: Arc<LoopNest>,
        decision: Decision,
    ) -> Result<Option<State>, SearchError> {
        if root.max_inlined_calls() >= self.config.max_inlined_calls {
            return Ok(None);
        }
        if cfg!(debug_assertions) {
            root.check_containment(self.graph)?;
        }
        let breakdown = self.cache.evaluate(&root, self.graph, self.params)?;
        if breakdown.max_recompute_ratio() > self.config.max_recompute {
            return Ok(None);
        }
        let mut child = State {
            root,
            parent: Some(Arc::clone(parent)),
            num_decisions: parent.num_decisions + 1,
            inlined: parent.inlined.clone(),
            placed: parent.placed.clone(),
            cost: breakdown.total(),
            penalty: 1.0,
            penalized: false,
        };
        match decision {
            Decision::Inline(n) => {
                child.inlined.insert(n);
            }
            Decision::Place(n) => {
                child.placed.insert(n);
            }
            Decision::Keep => {}
        }
        trace!("Child at decision {} costs {}", child.num_decisions, child.cost);
        Ok(Some(child))
    }

    /// Candidates for where to realize `n`.
    fn realize(
        &self,
        state: &State,
        n: NodeId,
    ) -> Result<Vec<(Arc<LoopNest>, Decision)>, SearchError> {
        let graph = self.graph;
        for c in graph.consumers(n) {
            if !state.placed.contains(&c) && !state.inlined.contains(&c) {
                return Err(SearchError::UnplacedConsumer {
                    node: graph.node(n).name.clone(),
                    consumer: graph.node(c).name.clone(),
                });
            }
        }

        let mut candidates = vec![];
        if self.may_inline(n) {
            let mut root = (*state.root).clone();
            root.inline_func(n, graph);
            let accepted = root.max_inlined_calls() < self.config.max_inlined_calls;
            candidates.push((Arc::new(root), Decision::Inline(n)));
            if accepted && self.must_inline(n) {
                return Ok(candidates);
            }
        }

        for v in self.vector_dims(state, n) {
            candidates.extend(
                state
                    .root
                    .compute_in_tiles(n, None, v, false, graph, self.params)
                    .into_iter()
                    .map(|root| (root, Decision::Place(n))),
            );
        }
        Ok(candidates)
    }

    fn may_inline(&self, n: NodeId) -> bool {
        let node = self.graph.node(n);
        node.kind == NodeKind::Pure
            && !node.is_output
            && (self.config.relaxed_inline || self.graph.consumers(n).len() == 1)
    }

    /// A pointwise node between pointwise producers and consumers is always
    /// better inlined.
    fn must_inline(&self, n: NodeId) -> bool {
        let graph = self.graph;
        graph.node(n).is_pointwise
            && graph.outgoing(n).count() == 1
            && graph.producers(n).iter().all(|&p| graph.node(p).is_pointwise)
            && graph.consumers(n).iter().all(|&c| graph.node(c).is_pointwise)
    }

    /// Storage dimensions worth vectorizing `n` along.
    fn vector_dims(&self, state: &State, n: NodeId) -> Vec<usize> {
        let node = self.graph.node(n);
        if node.is_output || node.dims() == 0 {
            return vec![0];
        }
        let bounds = state.root.get_bounds(n, self.graph);
        let dims = (0..node.dims())
            .filter(|&d| bounds.region_computed[d].extent() >= node.vector_size)
            .collect::<Vec<_>>();
        if dims.is_empty() {
            (0..node.dims()).collect()
        } else {
            dims
        }
    }

    fn parallelize_or_unroll(&self, state: &State, n: NodeId) -> Vec<Arc<LoopNest>> {
        let root = &state.root;
        let mut options = if state.inlined.contains(&n) {
            vec![]
        } else if root.children.iter().any(|c| c.node == Some(n)) {
            self.parallel_tilings(root, n)
        } else {
            self.unroll_options(root, n)
        };
        if options.is_empty() {
            options.push(Arc::clone(root));
        }
        options
    }

    /// Splits the root loops of `n` into parallel tasks.
    fn parallel_tilings(&self, root: &LoopNest, n: NodeId) -> Vec<Arc<LoopNest>> {
        let graph = self.graph;
        let cores = DimSize::from(self.params.parallelism);
        if cores <= 1 || graph.node(n).dims() == 0 {
            return vec![];
        }
        let Some(pure) = root
            .children
            .iter()
            .find(|c| c.node == Some(n) && c.stage == 0)
        else {
            return vec![];
        };

        let mut tilings = generate_tilings(&pure.size, 2, true, &[])
            .into_iter()
            .map(|t| (t, false))
            .collect::<Vec<_>>();
        // A single task, for loops too small to parallelize.
        tilings.push((smallvec::smallvec![1; pure.size.len()], true));

        let mut scored = tilings
            .into_iter()
            .filter_map(|(t, entire): (Shape, bool)| {
                let tasks: DimSize = t.iter().product();
                if (!entire && tasks < cores) || tasks > MAX_TASKS_PER_CORE * cores {
                    return None;
                }
                let per_core = tasks as f64 / cores as f64;
                Some((t, per_core.ceil() / per_core))
            })
            .collect::<Vec<_>>();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));

        let mut options = vec![];
        for (t, wastage) in scored {
            if !options.is_empty() && wastage > MAX_IDLE_WASTAGE {
                break;
            }
            let replaced = root.replace_children(&mut |parent, c| {
                (parent.is_root() && c.node == Some(n))
                    .then(|| c.parallelize_in_tiles(&t, parent, false, true, graph))
            });
            if let Some(r) = replaced {
                options.push(Arc::new(r));
            }
        }
        options
    }

    /// Splits a small serial loop off the final stage of `n`, which is
    /// computed below the root, and unrolls it.
    fn unroll_options(&self, root: &Arc<LoopNest>, n: NodeId) -> Vec<Arc<LoopNest>> {
        let graph = self.graph;
        let stage = graph.node(n).stages.len() - 1;
        let mut target: Option<&LoopNest> = None;
        visit_levels(root, &mut |level, parent, _| {
            let is_top = level.node == Some(n)
                && level.stage == stage
                && parent.map_or(false, |p| !p.is_root() && p.node != Some(n));
            if is_top {
                target = Some(level);
            }
            target.is_none()
        });

        let mut options = vec![Arc::clone(root)];
        let Some(level) = target.filter(|l| !l.size.is_empty()) else {
            return options;
        };
        let last = level.size.len() - 1;
        let tilings = generate_serial_tilings(
            &level.size,
            last,
            last,
            level.vectorized_loop_index,
            &[],
            false,
            true,
        );
        for t in tilings {
            if t == level.size {
                continue;
            }
            let replaced = root.replace_children(&mut |parent, c| {
                std::ptr::eq(&**c, level)
                    .then(|| c.parallelize_in_tiles(&t, parent, true, false, graph))
            });
            if let Some(r) = replaced {
                options.push(Arc::new(r));
            }
        }
        options
    }
}

struct BeamSearch<'a, M> {
    expander: Expander<'a, M>,
    /// Structural hashes of states near the best schedule of earlier passes.
    permitted: HashSet<u64>,
    rng: StdRng,
}

impl<'a, M: CostModel> BeamSearch<'a, M> {
    fn run(&mut self) -> Result<SearchResult, SearchError> {
        let passes = self.expander.config.passes();
        let mut best: Option<Arc<State>> = None;
        let mut pass_costs = vec![];
        for pass in 0..passes {
            let start = Instant::now();
            let result = self.run_pass(pass, passes)?;
            info!(
                "Pass {} of {}, cost: {}, time (ms): {}",
                pass + 1,
                passes,
                result.cost,
                start.elapsed().as_millis()
            );
            pass_costs.push(result.cost);
            if best.as_ref().map_or(true, |b| result.cost < b.cost) {
                best = Some(result);
            }
        }

        let Some(state) = best else {
            return Err(SearchError::BudgetExhausted { rounds: 0 });
        };
        let graph = self.expander.graph;
        let breakdown = self
            .expander
            .cache
            .evaluate(&state.root, graph, self.expander.params)?;
        let (hits, misses) = self.expander.cache.stats();
        debug!("Cost cache: {} hits, {} misses", hits, misses);
        Ok(SearchResult {
            cost: state.cost,
            state,
            breakdown,
            pass_costs,
            evaluated: self.expander.cache.len(),
        })
    }

    fn run_pass(&mut self, pass: usize, passes: usize) -> Result<Arc<State>, SearchError> {
        let graph = self.expander.graph;
        let config = self.expander.config;
        let beam_size = config.beam_size;
        let total_decisions = 2 * graph.schedule_order().len();

        let mut pending = BinaryHeap::new();
        pending.push(Queued(Arc::new(self.expander.initial_state()?)));
        let mut rounds = 0;
        loop {
            if config.max_rounds.map_or(false, |limit| rounds >= limit) {
                warn!("Pass {} exhausted its budget of {} rounds", pass + 1, rounds);
                return Err(SearchError::BudgetExhausted { rounds });
            }
            rounds += 1;

            let mut hashes: HashMap<u64, u32> = HashMap::new();
            let mut selected: Vec<Arc<State>> = vec![];
            while selected.len() < beam_size {
                let Some(Queued(mut state)) = pending.pop() else {
                    break;
                };

                if beam_size > 1 && passes > 1 && !state.penalized {
                    let count = hashes.entry(state.structural_hash(pass as i64 + 1)).or_default();
                    *count += 1;
                    let mut penalty = *count;
                    if pass > 0 && !self.permitted.contains(&state.structural_hash(pass as i64 - 1)) {
                        penalty += UNBLESSED_PENALTY;
                    }
                    if penalty > 1 {
                        let s = Arc::make_mut(&mut state);
                        s.penalized = true;
                        s.penalty = f64::from(penalty);
                        let beaten = pending
                            .peek()
                            .map_or(false, |top| state.queued_cost() > top.0.queued_cost());
                        if beaten {
                            pending.push(Queued(state));
                            continue;
                        }
                    }
                }

                if !pending.is_empty() && self.drop_out(total_decisions) {
                    continue;
                }

                if state.is_terminal(graph) {
                    self.bless(pass, passes, &state, &mut pending);
                    return Ok(state);
                }
                selected.push(state);
            }

            let Some(first) = selected.first() else {
                return Err(SearchError::NoCandidates {
                    node: "<root>".to_string(),
                    phase: 0,
                });
            };
            let expander = &self.expander;
            let expanded = selected
                .par_iter()
                .map(|s| expander.generate_children(s))
                .collect::<Result<Vec<_>, _>>()?;

            let mut seen = HashSet::new();
            let mut next = BinaryHeap::new();
            let mut generated = 0;
            for child in expanded.into_iter().flatten() {
                generated += 1;
                if seen.insert(child.root.fingerprint()) {
                    next.push(Queued(Arc::new(child)));
                }
            }
            debug!(
                "Pass {} round {}: expanded {} states into {} children, {} unique",
                pass + 1,
                rounds,
                selected.len(),
                generated,
                next.len()
            );
            if next.is_empty() {
                let (node, phase) = first.next_decision(graph).unwrap_or((0, 0));
                return Err(SearchError::NoCandidates {
                    node: graph.node(node).name.clone(),
                    phase,
                });
            }
            pending = next;
        }
    }

    /// Randomly drops states so that a complete path survives with
    /// probability `keep_percent`.
    fn drop_out(&mut self, total_decisions: usize) -> bool {
        let keep_percent = self.expander.config.keep_percent;
        if keep_percent >= 100 {
            return false;
        }
        let keep = f64::from(keep_percent) / 100.0;
        let threshold = keep.powf(1.0 / total_decisions.max(1) as f64) * 100.0;
        f64::from(self.rng.gen_range(0..100u32)) >= threshold
    }

    /// Permits, in the next pass, the coarse structure of the states near
    /// `best` and of all their ancestors.
    fn bless(
        &mut self,
        pass: usize,
        passes: usize,
        best: &Arc<State>,
        pending: &mut BinaryHeap<Queued>,
    ) {
        if pass + 1 >= passes {
            return;
        }
        let limit = best.queued_cost() * BLESS_SLACK;
        let mut blessed = 0;
        let mut candidate = Some(Arc::clone(best));
        while let Some(state) = candidate {
            if state.queued_cost() > limit || blessed >= self.expander.config.beam_size {
                break;
            }
            let mut cur = Some(&state);
            while let Some(s) = cur {
                self.permitted.insert(s.structural_hash(pass as i64));
                cur = s.parent.as_ref();
            }
            blessed += 1;
            candidate = pending.pop().map(|q| q.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::region_extents;
    use crate::graph::{pointwise, stencil, PipelineBuilder};
    use crate::pipelines;
    use proptest::prelude::*;

    fn config(beam_size: usize) -> SearchConfig {
        SearchConfig {
            beam_size,
            num_passes: Some(1),
            ..SearchConfig::default()
        }
    }

    fn id(graph: &Graph, name: &str) -> NodeId {
        graph.node_by_name(name).unwrap().id
    }

    /// Every non-input node is realized exactly once: either inlined, or
    /// computed by exactly one level per stage.
    fn assert_complete(graph: &Graph, result: &SearchResult) {
        let state = &result.state;
        assert!(state.is_terminal(graph));
        assert!(state.inlined.is_disjoint(&state.placed));
        for node in graph.nodes().iter().filter(|n| !n.is_input()) {
            assert!(result.root().computes(node.id), "{} not computed", node.name);
            let mut tops = vec![0; node.stages.len()];
            visit_levels(result.root(), &mut |level, parent, _| {
                if level.node == Some(node.id) && parent.map_or(true, |p| p.node != Some(node.id)) {
                    tops[level.stage] += 1;
                }
                true
            });
            if state.inlined.contains(&node.id) {
                assert!(tops.iter().all(|&t| t == 0));
            } else {
                assert!(state.placed.contains(&node.id));
                assert!(tops.iter().all(|&t| t == 1), "{}: {:?}", node.name, tops);
            }
        }
        assert_eq!(
            state.inlined.len() + state.placed.len(),
            graph.schedule_order().len()
        );
        result.root().check_containment(graph).unwrap();
    }

    #[test]
    fn test_pointwise_chain_fuses_into_one_level() {
        let params = MachineParams::default();
        let graph = pipelines::pointwise_chain(3, 1000, 1000, &params).unwrap();
        let result = search(&graph, &params, &SearchConfig::default()).unwrap();
        assert_complete(&graph, &result);
        let state = &result.state;
        assert_eq!(
            state.inlined,
            BTreeSet::from([id(&graph, "f0"), id(&graph, "f1")])
        );
        assert_eq!(result.root().children.len(), 1);
        assert!(result.root().children[0].parallel);
        assert_eq!(
            result.root().store_at,
            BTreeSet::from([id(&graph, "out")])
        );
    }

    #[test]
    fn test_tiny_narrow_output_is_scheduled() {
        let params = MachineParams::default();
        let mut b = PipelineBuilder::new();
        let input = b.input("input", &[2], 1);
        let out = b.func("out", &[2], 1, 1.0);
        b.read(out, input, pointwise(1), 1).output(out);
        let graph = b.build(&params).unwrap();
        let result = search(&graph, &params, &config(4)).unwrap();
        assert_complete(&graph, &result);
        assert!(result.state.placed.contains(&out));
        assert_eq!(result.breakdown.max_recompute_ratio(), 1.0);
    }

    #[test]
    fn test_stencil_chain_gets_square_tiles() {
        let params = MachineParams::default();
        let graph = pipelines::stencil_chain(3, 2048, 2048, 2, &params).unwrap();
        let result = search(&graph, &params, &config(16)).unwrap();
        assert_complete(&graph, &result);
        for name in ["s1", "s2"] {
            let f = id(&graph, name);
            let full = &graph.node(f).extents;
            let site = result.root().compute_site(f).unwrap();
            assert!(!site.is_root(), "{} computed at the root", name);
            let extents = region_extents(&site.get_bounds(f, &graph).region_computed);
            assert!(extents.iter().all(|&e| e > 1), "{}: {:?}", name, extents);
            assert!(extents.iter().zip(full).any(|(e, f)| e < f));
            let (lo, hi) = (extents[0].min(extents[1]), extents[0].max(extents[1]));
            assert!(hi <= 8 * lo, "{}: {:?}", name, extents);
        }
    }

    #[test]
    fn test_search_is_deterministic() {
        let params = MachineParams::default();
        let graph = pipelines::separable_blur(256, 256, &params).unwrap();
        let cfg = SearchConfig {
            beam_size: 4,
            num_passes: Some(2),
            keep_percent: 70,
            seed: 7,
            ..SearchConfig::default()
        };
        let a = search(&graph, &params, &cfg).unwrap();
        let b = search(&graph, &params, &cfg).unwrap();
        assert_eq!(a.root().fingerprint(), b.root().fingerprint());
        assert_eq!(a.cost, b.cost);
        assert_eq!(a.pass_costs.len(), 2);
        assert_eq!(a.cost, a.pass_costs.iter().copied().fold(f64::INFINITY, f64::min));
        assert_complete(&graph, &a);
    }

    #[test]
    fn test_reduction_is_scheduled() {
        let params = MachineParams::default();
        let graph = pipelines::row_normalize(256, 128, &params).unwrap();
        let result = search(&graph, &params, &config(4)).unwrap();
        assert_complete(&graph, &result);
        assert!(result.state.placed.contains(&id(&graph, "row_sum")));
    }

    #[test]
    fn test_greedy_search_uses_one_pass() {
        let params = MachineParams::default();
        let graph = pipelines::diamond(64, 64, &params).unwrap();
        let cfg = SearchConfig {
            beam_size: 1,
            ..SearchConfig::default()
        };
        let result = search(&graph, &params, &cfg).unwrap();
        assert_eq!(result.pass_costs.len(), 1);
        assert_complete(&graph, &result);
        // Shared by two consumers, so it cannot be inlined.
        assert!(result.state.placed.contains(&id(&graph, "shared")));
    }

    #[test]
    fn test_relaxed_inline_allows_fan_out() {
        let params = MachineParams::default();
        let graph = pipelines::diamond(64, 64, &params).unwrap();
        let cfg = SearchConfig {
            relaxed_inline: true,
            ..config(8)
        };
        let result = search(&graph, &params, &cfg).unwrap();
        assert_complete(&graph, &result);
    }

    #[test]
    fn test_round_budget_is_enforced() {
        let params = MachineParams::default();
        let graph = pipelines::pointwise_chain(3, 64, 64, &params).unwrap();
        let cfg = SearchConfig {
            max_rounds: Some(2),
            ..config(2)
        };
        assert_eq!(
            search(&graph, &params, &cfg).err(),
            Some(Error::Search(SearchError::BudgetExhausted { rounds: 2 }))
        );
    }

    #[test]
    fn test_bad_config_is_rejected() {
        let params = MachineParams::default();
        let graph = pipelines::pointwise_chain(2, 64, 64, &params).unwrap();
        let cfg = SearchConfig {
            beam_size: 0,
            ..SearchConfig::default()
        };
        assert!(matches!(
            search(&graph, &params, &cfg),
            Err(Error::Config(ConfigError::BadSearchConfig {
                field: "beam_size",
                ..
            }))
        ));
    }

    #[test]
    fn test_parallel_tilings_balance_cores() {
        let params = MachineParams::default();
        let graph = pipelines::pointwise_chain(1, 1024, 1024, &params).unwrap();
        let cfg = config(1);
        let expander = Expander {
            graph: &graph,
            params: &params,
            config: &cfg,
            cache: CostCache::new(AnalyticalCostModel::default()),
        };
        let out = id(&graph, "out");
        let mut root = LoopNest::root();
        root.compute_here(out, true, 0, &graph);
        root.store_at.insert(out);
        let options = expander.parallel_tilings(&root, out);
        assert!(!options.is_empty());
        for o in &options {
            let outer = &o.children[0];
            assert!(outer.parallel);
            let tasks: DimSize = outer.size.iter().product();
            assert!(tasks >= 16 && tasks <= 256, "{}", tasks);
            let per_core = tasks as f64 / 16.0;
            assert!(per_core.ceil() / per_core <= MAX_IDLE_WASTAGE);
        }
    }

    prop_compose! {
        fn arb_dag()(
            len in 1usize..5,
            w in 4u64..48,
            h in 1u64..24,
            edges in prop::collection::vec((any::<prop::sample::Index>(), any::<bool>()), 8),
        ) -> Graph {
            let mut b = PipelineBuilder::new();
            let input = b.input("input", &[w + 2 * len as u64, h + 2 * len as u64], 4);
            let mut nodes = vec![input];
            for i in 0..len {
                let f = b.func(&format!("f{}", i), &[w, h], 4, 3.0);
                // Every node reads its predecessor, and maybe one more.
                b.read(f, nodes[i], pointwise(2), 1);
                let (extra, is_stencil) = &edges[i];
                let other = nodes[extra.index(nodes.len())];
                if other != nodes[i] {
                    let access = if *is_stencil { stencil(2, 1) } else { pointwise(2) };
                    b.read(f, other, access, if *is_stencil { 9 } else { 1 });
                }
                nodes.push(f);
            }
            b.output(nodes[len]);
            b.build(&MachineParams::new(4, 1 << 16, 40.0).unwrap()).unwrap()
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn test_search_is_complete(graph in arb_dag(), beam_size in 1usize..4) {
            let params = MachineParams::new(4, 1 << 16, 40.0).unwrap();
            let result = search(&graph, &params, &config(beam_size)).unwrap();
            assert_complete(&graph, &result);
        }
    }
}
