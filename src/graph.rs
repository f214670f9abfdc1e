//! The dependency graph of a pipeline.
//!
//! A [Graph] is built once per scheduling run with a [PipelineBuilder] and is
//! immutable afterwards. Edges carry the bounds relationship between a
//! consumer stage's loops and the region of the producer it reads.

use crate::common::{full_region, shape_string, DimSize, Interval, Region, Shape};
use crate::error::ConfigError;
use crate::machine::MachineParams;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::fmt;

pub type NodeId = usize;
pub type EdgeId = usize;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum NodeKind {
    /// An external buffer. Never scheduled.
    Input,
    /// A pure function of its coordinates.
    Pure,
    /// A pure initialization followed by an update stage which also iterates
    /// the given reduction domain.
    Reduction { extents: Shape },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum StageKind {
    Pure,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoopDim {
    pub extent: DimSize,
    /// The storage dimension this loop indexes, or `None` for a reduction
    /// variable.
    pub pure_dim: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Stage {
    pub kind: StageKind,
    pub loops: SmallVec<[LoopDim; 4]>,
    pub incoming: Vec<EdgeId>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub extents: Shape,
    pub kind: NodeKind,
    pub stages: Vec<Stage>,
    pub bytes_per_point: u32,
    /// Estimated arithmetic cost of computing one point of the final stage.
    pub cost_per_point: f64,
    /// Lanes in a native vector of this node's element type.
    pub vector_size: DimSize,
    pub is_output: bool,
    pub is_pointwise: bool,
    pub outgoing: Vec<EdgeId>,
}

/// How one producer dimension is indexed from a consumer's loops.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum DimAccess {
    Affine(AffineAccess),
    /// The whole extent of the producer dimension.
    All,
}

/// The producer coordinate `floor(Σ stride·loop / divisor) + [lo, hi]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AffineAccess {
    pub terms: SmallVec<[(usize, i64); 2]>,
    pub divisor: i64,
    pub lo: i64,
    pub hi: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Edge {
    pub id: EdgeId,
    pub producer: NodeId,
    pub consumer: NodeId,
    pub consumer_stage: usize,
    pub access: SmallVec<[DimAccess; 4]>,
    /// Number of loads of the producer per point of the consumer stage.
    pub calls: u32,
}

#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    topological_order: Vec<NodeId>,
    schedule_order: Vec<NodeId>,
    /// `upstream[a][b]` is `true` if `a` transitively reads `b`.
    upstream: Vec<Vec<bool>>,
}

impl Node {
    pub fn is_input(&self) -> bool {
        self.kind == NodeKind::Input
    }

    pub fn dims(&self) -> usize {
        self.extents.len()
    }

    /// The loops a stage iterates to compute `computed`, a region of this
    /// node. Reduction loops always cover their whole domain.
    pub fn stage_loops(&self, stage: usize, computed: &[Interval]) -> Region {
        self.stages[stage]
            .loops
            .iter()
            .map(|l| match l.pure_dim {
                Some(d) => computed[d],
                None => Interval::with_extent(0, l.extent),
            })
            .collect()
    }
}

impl AffineAccess {
    pub fn new(terms: &[(usize, i64)], divisor: i64, lo: i64, hi: i64) -> Self {
        AffineAccess {
            terms: SmallVec::from_slice(terms),
            divisor,
            lo,
            hi,
        }
    }

    fn apply(&self, loops: &[Interval]) -> Interval {
        let (mut min, mut max) = (0i64, 0i64);
        for &(l, stride) in &self.terms {
            let i = loops[l];
            if i.is_empty() {
                return Interval::empty();
            }
            if stride >= 0 {
                min += stride * i.min;
                max += stride * i.max;
            } else {
                min += stride * i.max;
                max += stride * i.min;
            }
        }
        Interval::new(
            min.div_euclid(self.divisor) + self.lo,
            max.div_euclid(self.divisor) + self.hi,
        )
    }

    fn is_identity_of(&self, dim: usize) -> bool {
        self.terms.as_slice() == [(dim, 1)] && self.divisor == 1 && self.lo == 0 && self.hi == 0
    }
}

impl DimAccess {
    /// `loop_dim` itself.
    pub fn identity(loop_dim: usize) -> Self {
        DimAccess::Affine(AffineAccess::new(&[(loop_dim, 1)], 1, 0, 0))
    }

    /// Every coordinate in `loop_dim + [lo, hi]`, as read by a stencil.
    pub fn window(loop_dim: usize, lo: i64, hi: i64) -> Self {
        DimAccess::Affine(AffineAccess::new(&[(loop_dim, 1)], 1, lo, hi))
    }

    /// `stride * loop_dim + [lo, hi]`, as read when downsampling.
    pub fn strided(loop_dim: usize, stride: i64, lo: i64, hi: i64) -> Self {
        DimAccess::Affine(AffineAccess::new(&[(loop_dim, stride)], 1, lo, hi))
    }

    /// `floor(loop_dim / divisor) + [lo, hi]`, as read when upsampling.
    pub fn divided(loop_dim: usize, divisor: i64, lo: i64, hi: i64) -> Self {
        DimAccess::Affine(AffineAccess::new(&[(loop_dim, 1)], divisor, lo, hi))
    }

    /// `a + b`, as read by a reduction sliding over its input.
    pub fn sum(a: usize, b: usize) -> Self {
        DimAccess::Affine(AffineAccess::new(&[(a, 1), (b, 1)], 1, 0, 0))
    }
}

/// The identity access into a `rank`-dimensional producer.
pub fn pointwise(rank: usize) -> Vec<DimAccess> {
    (0..rank).map(DimAccess::identity).collect()
}

/// A symmetric `(2r+1)^rank` window around each point.
pub fn stencil(rank: usize, radius: i64) -> Vec<DimAccess> {
    (0..rank)
        .map(|d| DimAccess::window(d, -radius, radius))
        .collect()
}

impl Edge {
    pub fn is_pointwise(&self) -> bool {
        self.access.iter().enumerate().all(|(d, a)| match a {
            DimAccess::Affine(a) => a.is_identity_of(d),
            DimAccess::All => false,
        })
    }
}

impl Graph {
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Node> + '_ {
        self.nodes.iter().filter(|n| n.is_output)
    }

    /// Edges into any stage of `id`.
    pub fn incoming(&self, id: NodeId) -> impl Iterator<Item = &Edge> + '_ {
        self.nodes[id]
            .stages
            .iter()
            .flat_map(|s| s.incoming.iter())
            .map(|&e| &self.edges[e])
    }

    pub fn outgoing(&self, id: NodeId) -> impl Iterator<Item = &Edge> + '_ {
        self.nodes[id].outgoing.iter().map(|&e| &self.edges[e])
    }

    pub fn producers(&self, id: NodeId) -> Vec<NodeId> {
        let mut result = self.incoming(id).map(|e| e.producer).collect::<Vec<_>>();
        result.sort_unstable();
        result.dedup();
        result
    }

    pub fn consumers(&self, id: NodeId) -> Vec<NodeId> {
        let mut result = self.outgoing(id).map(|e| e.consumer).collect::<Vec<_>>();
        result.sort_unstable();
        result.dedup();
        result
    }

    /// Producers before consumers.
    pub fn topological_order(&self) -> &[NodeId] {
        &self.topological_order
    }

    /// The order in which the search makes decisions: consumers before
    /// producers, without inputs.
    pub fn schedule_order(&self) -> &[NodeId] {
        &self.schedule_order
    }

    /// Returns `true` if `a` transitively reads `b`.
    pub fn downstream_of(&self, a: NodeId, b: NodeId) -> bool {
        self.upstream[a][b]
    }

    pub fn estimated_region(&self, id: NodeId) -> Region {
        full_region(&self.nodes[id].extents)
    }

    /// The region of `edge.producer` read by the consumer stage when it
    /// iterates `consumer_loops`.
    pub fn required_producer_region(&self, edge: &Edge, consumer_loops: &[Interval]) -> Region {
        let producer = &self.nodes[edge.producer];
        edge.access
            .iter()
            .zip(&producer.extents)
            .map(|(access, &extent)| match access {
                DimAccess::Affine(a) => a.apply(consumer_loops),
                DimAccess::All => Interval::with_extent(0, extent),
            })
            .collect()
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &id in &self.topological_order {
            let n = &self.nodes[id];
            let tag = match (&n.kind, n.is_output) {
                (NodeKind::Input, _) => "input",
                (_, true) => "output",
                (NodeKind::Reduction { .. }, false) => "reduction",
                (NodeKind::Pure, false) => "func",
            };
            writeln!(
                f,
                "{} {} {} cost={} bytes={} vector={}{}",
                tag,
                n.name,
                shape_string(&n.extents),
                n.cost_per_point,
                n.bytes_per_point,
                n.vector_size,
                if n.is_pointwise { " pointwise" } else { "" }
            )?;
            for e in self.incoming(id) {
                writeln!(
                    f,
                    "  <- {} (stage {}, {} calls)",
                    self.nodes[e.producer].name, e.consumer_stage, e.calls
                )?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct NodeDef {
    name: String,
    extents: Shape,
    kind: NodeKind,
    bytes_per_point: u32,
    cost_per_point: f64,
    is_output: bool,
}

#[derive(Debug, Clone)]
struct EdgeDef {
    producer: NodeId,
    consumer: NodeId,
    consumer_stage: usize,
    access: SmallVec<[DimAccess; 4]>,
    calls: u32,
}

/// Collects the nodes and edges of a pipeline.
///
/// Ids returned by the builder are only meaningful to the builder. The built
/// [Graph] keeps only the nodes reachable from the outputs and renumbers them,
/// so look nodes up by name afterwards.
#[derive(Debug, Clone, Default)]
pub struct PipelineBuilder {
    nodes: Vec<NodeDef>,
    edges: Vec<EdgeDef>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, name: &str, extents: &[DimSize], kind: NodeKind, bytes: u32, cost: f64) -> NodeId {
        self.nodes.push(NodeDef {
            name: name.to_string(),
            extents: Shape::from(extents),
            kind,
            bytes_per_point: bytes,
            cost_per_point: cost,
            is_output: false,
        });
        self.nodes.len() - 1
    }

    pub fn input(&mut self, name: &str, extents: &[DimSize], bytes_per_point: u32) -> NodeId {
        self.add(name, extents, NodeKind::Input, bytes_per_point, 0.0)
    }

    pub fn func(
        &mut self,
        name: &str,
        extents: &[DimSize],
        bytes_per_point: u32,
        cost_per_point: f64,
    ) -> NodeId {
        self.add(name, extents, NodeKind::Pure, bytes_per_point, cost_per_point)
    }

    /// A node whose update stage iterates its own dimensions followed by
    /// `reduction_extents`.
    pub fn reduction(
        &mut self,
        name: &str,
        extents: &[DimSize],
        reduction_extents: &[DimSize],
        bytes_per_point: u32,
        cost_per_point: f64,
    ) -> NodeId {
        let kind = NodeKind::Reduction {
            extents: Shape::from(reduction_extents),
        };
        self.add(name, extents, kind, bytes_per_point, cost_per_point)
    }

    pub fn output(&mut self, id: NodeId) -> &mut Self {
        if let Some(n) = self.nodes.get_mut(id) {
            n.is_output = true;
        }
        self
    }

    /// Records that `consumer` reads `producer`. Reads go to the update stage
    /// of reductions and to the pure stage otherwise.
    pub fn read(
        &mut self,
        consumer: NodeId,
        producer: NodeId,
        access: impl IntoIterator<Item = DimAccess>,
        calls: u32,
    ) -> &mut Self {
        let stage = match self.nodes.get(consumer).map(|n| &n.kind) {
            Some(NodeKind::Reduction { .. }) => 1,
            _ => 0,
        };
        self.read_stage(consumer, stage, producer, access, calls)
    }

    pub fn read_stage(
        &mut self,
        consumer: NodeId,
        consumer_stage: usize,
        producer: NodeId,
        access: impl IntoIterator<Item = DimAccess>,
        calls: u32,
    ) -> &mut Self {
        self.edges.push(EdgeDef {
            producer,
            consumer,
            consumer_stage,
            access: access.into_iter().collect(),
            calls: calls.max(1),
        });
        self
    }

    pub fn build(&self, params: &MachineParams) -> Result<Graph, ConfigError> {
        params.validate()?;
        let n = self.nodes.len();
        for e in &self.edges {
            for id in [e.producer, e.consumer] {
                if id >= n {
                    return Err(ConfigError::UnknownNode(id));
                }
            }
        }
        if let Some(e) = self
            .edges
            .iter()
            .find(|e| self.nodes[e.consumer].kind == NodeKind::Input)
        {
            return Err(ConfigError::InputReads {
                node: self.nodes[e.consumer].name.clone(),
                producer: self.nodes[e.producer].name.clone(),
            });
        }
        if !self.nodes.iter().any(|d| d.is_output) {
            return Err(ConfigError::NoOutputs);
        }

        // Keep only what the outputs (transitively) read.
        let mut reachable = vec![false; n];
        let mut stack = (0..n)
            .filter(|&i| self.nodes[i].is_output)
            .collect::<Vec<_>>();
        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut reachable[id], true) {
                continue;
            }
            stack.extend(
                self.edges
                    .iter()
                    .filter(|e| e.consumer == id && !reachable[e.producer])
                    .map(|e| e.producer),
            );
        }
        let mut renumber = vec![None; n];
        let mut next_id = 0;
        for (old, keep) in reachable.iter().enumerate() {
            if *keep {
                renumber[old] = Some(next_id);
                next_id += 1;
            }
        }

        let mut nodes = Vec::with_capacity(next_id);
        for (old, def) in self.nodes.iter().enumerate() {
            if renumber[old].is_none() {
                continue;
            }
            if let Some(dim) = def.extents.iter().position(|&e| e == 0) {
                return Err(ConfigError::EmptyExtent {
                    node: def.name.clone(),
                    dim,
                });
            }
            let pure_loops = def
                .extents
                .iter()
                .enumerate()
                .map(|(d, &extent)| LoopDim {
                    extent,
                    pure_dim: Some(d),
                })
                .collect::<SmallVec<[LoopDim; 4]>>();
            let mut stages = vec![Stage {
                kind: StageKind::Pure,
                loops: pure_loops.clone(),
                incoming: vec![],
            }];
            if let NodeKind::Reduction { extents } = &def.kind {
                if let Some(dim) = extents.iter().position(|&e| e == 0) {
                    return Err(ConfigError::EmptyExtent {
                        node: def.name.clone(),
                        dim: def.extents.len() + dim,
                    });
                }
                let mut loops = pure_loops;
                loops.extend(extents.iter().map(|&extent| LoopDim {
                    extent,
                    pure_dim: None,
                }));
                stages.push(Stage {
                    kind: StageKind::Update,
                    loops,
                    incoming: vec![],
                });
            }
            let lanes = params.vector_bytes / def.bytes_per_point.max(1);
            nodes.push(Node {
                id: nodes.len(),
                name: def.name.clone(),
                extents: def.extents.clone(),
                kind: def.kind.clone(),
                stages,
                bytes_per_point: def.bytes_per_point,
                cost_per_point: def.cost_per_point,
                vector_size: DimSize::from(lanes.max(1)),
                is_output: def.is_output,
                is_pointwise: false,
                outgoing: vec![],
            });
        }

        let mut edges = Vec::new();
        for def in &self.edges {
            let (Some(producer), Some(consumer)) = (renumber[def.producer], renumber[def.consumer])
            else {
                continue;
            };
            validate_access(&nodes[producer], &nodes[consumer], def)?;
            let id = edges.len();
            nodes[consumer].stages[def.consumer_stage].incoming.push(id);
            nodes[producer].outgoing.push(id);
            edges.push(Edge {
                id,
                producer,
                consumer,
                consumer_stage: def.consumer_stage,
                access: def.access.clone(),
                calls: def.calls,
            });
        }

        if let Some(out) = nodes.iter().find(|n| n.is_output && !n.outgoing.is_empty()) {
            return Err(ConfigError::OutputConsumed {
                node: out.name.clone(),
            });
        }

        let topological_order = topological_sort(&nodes, &edges)?;

        for &id in &topological_order {
            let node = &nodes[id];
            let is_pointwise = match node.kind {
                NodeKind::Input => true,
                NodeKind::Reduction { .. } => false,
                NodeKind::Pure => node.stages[0]
                    .incoming
                    .iter()
                    .all(|&e| edges[e].is_pointwise()),
            };
            nodes[id].is_pointwise = is_pointwise;
        }

        let count = nodes.len();
        let mut upstream = vec![vec![false; count]; count];
        for &id in &topological_order {
            for e in nodes[id].stages.iter().flat_map(|s| &s.incoming) {
                let p = edges[*e].producer;
                upstream[id][p] = true;
                for q in 0..count {
                    if upstream[p][q] {
                        upstream[id][q] = true;
                    }
                }
            }
        }

        let schedule_order = topological_order
            .iter()
            .rev()
            .copied()
            .filter(|&id| !nodes[id].is_input())
            .collect();

        Ok(Graph {
            nodes,
            edges,
            topological_order,
            schedule_order,
            upstream,
        })
    }
}

fn validate_access(producer: &Node, consumer: &Node, def: &EdgeDef) -> Result<(), ConfigError> {
    let loops = consumer
        .stages
        .get(def.consumer_stage)
        .map(|s| s.loops.len())
        .ok_or_else(|| ConfigError::AccessLoopOutOfRange {
            producer: producer.name.clone(),
            consumer: consumer.name.clone(),
            loop_dim: def.consumer_stage,
            loops: consumer.stages.len(),
        })?;
    if def.access.len() != producer.dims() {
        return Err(ConfigError::AccessArity {
            producer: producer.name.clone(),
            consumer: consumer.name.clone(),
            expected: producer.dims(),
            found: def.access.len(),
        });
    }
    for (dim, access) in def.access.iter().enumerate() {
        let DimAccess::Affine(a) = access else {
            continue;
        };
        if let Some(&(loop_dim, _)) = a.terms.iter().find(|(l, _)| *l >= loops) {
            return Err(ConfigError::AccessLoopOutOfRange {
                producer: producer.name.clone(),
                consumer: consumer.name.clone(),
                loop_dim,
                loops,
            });
        }
        if a.divisor < 1 || a.lo > a.hi {
            return Err(ConfigError::NonMonotonicBounds {
                producer: producer.name.clone(),
                consumer: consumer.name.clone(),
                dim,
            });
        }
    }
    Ok(())
}

/// Kahn's algorithm. Ties are broken by node id, so the order is
/// deterministic.
fn topological_sort(nodes: &[Node], edges: &[Edge]) -> Result<Vec<NodeId>, ConfigError> {
    let n = nodes.len();
    let mut in_degree = vec![0u32; n];
    let mut adj: Vec<Vec<NodeId>> = vec![Vec::new(); n];
    for e in edges {
        adj[e.producer].push(e.consumer);
        in_degree[e.consumer] += 1;
    }
    let mut queue: VecDeque<NodeId> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(node) = queue.pop_front() {
        order.push(node);
        for &next in &adj[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }
    if order.len() == n {
        Ok(order)
    } else {
        let stuck = (0..n).find(|&i| in_degree[i] > 0).unwrap_or(0);
        Err(ConfigError::Cycle {
            node: nodes[stuck].name.clone(),
        })
    }
}
