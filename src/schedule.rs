//! The schedule handed to code generation.

use crate::common::{region_extents, DimSize};
use crate::graph::{Graph, NodeId};
use crate::loop_nest::{LoopNest, ParentMap};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Schedule {
    pub cost: f64,
    /// Every computed node, producers first.
    pub nodes: Vec<NodeSchedule>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NodeSchedule {
    pub name: String,
    pub inlined: bool,
    /// Labels of the levels from the root to the level whose body computes
    /// this node. Empty when inlined.
    pub compute_at: Vec<String>,
    /// As `compute_at`, for the level allocating storage.
    pub store_at: Vec<String>,
    pub folding: Option<Folding>,
    /// Loops per stage, outermost first.
    pub stages: Vec<Vec<LoopSchedule>>,
}

/// Storage that slides along `dim`: it holds `factor` times the region
/// computed per iteration.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Folding {
    pub dim: usize,
    pub factor: DimSize,
}

/// One tiling level of a stage.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoopSchedule {
    /// Iterations per loop of the stage.
    pub extents: Vec<DimSize>,
    pub parallel: bool,
    pub unrolled: bool,
    pub vectorize: Option<Vectorize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Vectorize {
    pub loop_index: usize,
    pub width: DimSize,
}

impl Schedule {
    pub fn from_tree(root: &LoopNest, graph: &Graph, cost: f64) -> Self {
        let parents = ParentMap::new(root);
        let path = |level: &LoopNest| -> Vec<String> {
            let mut labels = parents
                .ancestors(level)
                .into_iter()
                .map(|l| l.label(graph))
                .collect::<Vec<_>>();
            labels.reverse();
            labels
        };

        let nodes = graph
            .topological_order()
            .iter()
            .copied()
            .filter(|&f| !graph.node(f).is_input())
            .map(|f| {
                let name = graph.node(f).name.clone();
                let Some(compute_site) = root.compute_site(f) else {
                    return NodeSchedule {
                        name,
                        inlined: true,
                        compute_at: vec![],
                        store_at: vec![],
                        folding: None,
                        stages: vec![],
                    };
                };
                let store_site = root.store_site(f).unwrap_or(compute_site);
                NodeSchedule {
                    name,
                    inlined: false,
                    compute_at: path(compute_site),
                    store_at: path(store_site),
                    folding: folding(f, store_site, compute_site, graph),
                    stages: (0..graph.node(f).stages.len())
                        .map(|s| stage_loops(f, s, compute_site, graph))
                        .collect(),
                }
            })
            .collect();
        Schedule { cost, nodes }
    }

    pub fn node(&self, name: &str) -> Option<&NodeSchedule> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

fn folding(f: NodeId, store: &LoopNest, compute: &LoopNest, graph: &Graph) -> Option<Folding> {
    if std::ptr::eq(store, compute) {
        return None;
    }
    let stored = region_extents(&store.get_bounds(f, graph).region_computed);
    let computed = region_extents(&compute.get_bounds(f, graph).region_computed);
    stored
        .iter()
        .zip(&computed)
        .position(|(s, c)| s > c)
        .map(|dim| Folding {
            dim,
            factor: stored[dim] / computed[dim].max(1),
        })
}

/// Follows the levels of one stage of `f` down from its compute site.
fn stage_loops(f: NodeId, stage: usize, site: &LoopNest, graph: &Graph) -> Vec<LoopSchedule> {
    let width = graph.node(f).vector_size;
    let is_stage = |c: &&std::sync::Arc<LoopNest>| c.node == Some(f) && c.stage == stage;
    let mut loops = vec![];
    let mut level = site.children.iter().find(is_stage);
    while let Some(l) = level {
        loops.push(LoopSchedule {
            extents: l.size.to_vec(),
            parallel: l.parallel,
            unrolled: l.unrolled,
            vectorize: l
                .vectorized_loop_index
                .filter(|_| l.innermost)
                .map(|loop_index| Vectorize { loop_index, width }),
        });
        level = l.children.iter().find(is_stage);
    }
    loops
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "cost: {:.0}", self.cost)?;
        for n in &self.nodes {
            write!(f, "{}", n)?;
        }
        Ok(())
    }
}

impl fmt::Display for NodeSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.inlined {
            return writeln!(f, "{}: inlined", self.name);
        }
        write!(
            f,
            "{}: compute at {}, store at {}",
            self.name,
            self.compute_at.join(" / "),
            self.store_at.join(" / ")
        )?;
        if let Some(fold) = &self.folding {
            write!(f, ", fold d{} x{}", fold.dim, fold.factor)?;
        }
        writeln!(f)?;
        for (s, loops) in self.stages.iter().enumerate() {
            writeln!(f, "  stage {}: {}", s, loops.iter().join(", "))?;
        }
        Ok(())
    }
}

impl fmt::Display for LoopSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.extents.iter().join("x"))?;
        if self.parallel {
            write!(f, " parallel")?;
        }
        if self.unrolled {
            write!(f, " unroll")?;
        }
        if let Some(v) = &self.vectorize {
            write!(f, " vectorize({}, {})", v.loop_index, v.width)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineParams;
    use crate::pipelines;
    use crate::search::{search, SearchConfig};
    use std::io::{BufReader, BufWriter, Seek};

    fn searched(graph: &Graph, params: &MachineParams) -> (Schedule, crate::search::SearchResult) {
        let config = SearchConfig {
            beam_size: 8,
            num_passes: Some(1),
            ..SearchConfig::default()
        };
        let result = search(graph, params, &config).unwrap();
        (Schedule::from_tree(result.root(), graph, result.cost), result)
    }

    #[test]
    fn test_export_matches_tree() {
        let params = MachineParams::default();
        let graph = pipelines::separable_blur(512, 512, &params).unwrap();
        let (schedule, result) = searched(&graph, &params);
        assert_eq!(schedule.nodes.len(), 2);
        assert_eq!(schedule.cost, result.cost);
        for n in &schedule.nodes {
            let id = graph.node_by_name(&n.name).unwrap().id;
            assert_eq!(n.inlined, result.state.inlined.contains(&id));
            if n.inlined {
                continue;
            }
            assert_eq!(n.compute_at.first().map(String::as_str), Some("root"));
            assert_eq!(n.store_at.first().map(String::as_str), Some("root"));
            assert!(n.store_at.len() <= n.compute_at.len());
            assert_eq!(n.stages.len(), graph.node(id).stages.len());

            let loops = &n.stages[0];
            assert!(!loops.is_empty());
            assert!(loops.iter().filter(|l| l.vectorize.is_some()).count() <= 1);
        }
        let out = schedule.node("blur_y").unwrap();
        assert_eq!(out.compute_at, ["root"]);
    }

    #[test]
    fn test_inlined_nodes_have_no_loops() {
        let params = MachineParams::default();
        let graph = pipelines::pointwise_chain(3, 128, 128, &params).unwrap();
        let (schedule, _) = searched(&graph, &params);
        let names = schedule.nodes.iter().map(|n| n.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, ["f0", "f1", "out"]);
        for name in ["f0", "f1"] {
            let n = schedule.node(name).unwrap();
            assert!(n.inlined);
            assert!(n.stages.is_empty() && n.compute_at.is_empty());
        }
        assert!(schedule.to_string().contains("f0: inlined\n"));
    }

    #[test]
    fn test_display() {
        let schedule = Schedule {
            cost: 1234.4,
            nodes: vec![NodeSchedule {
                name: "out".to_string(),
                inlined: false,
                compute_at: vec!["root".to_string()],
                store_at: vec!["root".to_string()],
                folding: Some(Folding { dim: 1, factor: 3 }),
                stages: vec![vec![
                    LoopSchedule {
                        extents: vec![4, 4],
                        parallel: true,
                        unrolled: false,
                        vectorize: None,
                    },
                    LoopSchedule {
                        extents: vec![16, 128],
                        parallel: false,
                        unrolled: false,
                        vectorize: Some(Vectorize {
                            loop_index: 0,
                            width: 8,
                        }),
                    },
                ]],
            }],
        };
        assert_eq!(
            schedule.to_string(),
            "cost: 1234\n\
             out: compute at root, store at root, fold d1 x3\n  \
             stage 0: 4x4 parallel, 16x128 vectorize(0, 8)\n"
        );
    }

    #[test]
    fn test_save_and_load() {
        let params = MachineParams::default();
        let graph = pipelines::row_normalize(64, 32, &params).unwrap();
        let (schedule, _) = searched(&graph, &params);
        let mut file = tempfile::tempfile().unwrap();
        bincode::serialize_into(BufWriter::new(&mut file), &schedule).unwrap();
        file.rewind().unwrap();
        let loaded: Schedule = bincode::deserialize_from(BufReader::new(&mut file)).unwrap();
        assert_eq!(loaded, schedule);
        assert_eq!(loaded.node("row_sum").unwrap().stages.len(), 2);
    }
}
