/// The pipeline or the machine description is invalid. The search does not
/// start.
#[derive(thiserror::Error, Debug, Clone)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum ConfigError {
    #[error("The pipeline has no outputs")]
    NoOutputs,
    #[error("Unknown node id {0}")]
    UnknownNode(usize),
    #[error("Cycle detected through `{node}`")]
    Cycle { node: String },
    #[error("Access from `{consumer}` into `{producer}` is not monotonic in dimension {dim}")]
    NonMonotonicBounds {
        producer: String,
        consumer: String,
        dim: usize,
    },
    #[error(
        "Access from `{consumer}` into `{producer}` has {found} dimensions, but `{producer}` has {expected}"
    )]
    AccessArity {
        producer: String,
        consumer: String,
        expected: usize,
        found: usize,
    },
    #[error("Access from `{consumer}` into `{producer}` uses loop {loop_dim}, but the stage has {loops} loops")]
    AccessLoopOutOfRange {
        producer: String,
        consumer: String,
        loop_dim: usize,
        loops: usize,
    },
    #[error("`{node}` has an empty extent in dimension {dim}")]
    EmptyExtent { node: String, dim: usize },
    #[error("Input `{node}` cannot read `{producer}`")]
    InputReads { node: String, producer: String },
    #[error("Output `{node}` is read by another node")]
    OutputConsumed { node: String },
    #[error("Machine parameter `{field}` must be positive, got {value}")]
    BadMachineParams { field: &'static str, value: String },
    #[error("Search parameter `{field}` is out of range, got {value}")]
    BadSearchConfig { field: &'static str, value: String },
    #[error("Cannot parse machine parameters `{0}`; expected `parallelism,cache_bytes,balance`")]
    MachineParamsSyntax(String),
}

/// The search itself misbehaved. These indicate defects, not bad input.
#[derive(thiserror::Error, Debug, Clone)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum SearchError {
    #[error("No legal way to schedule `{node}` (phase {phase})")]
    NoCandidates { node: String, phase: u8 },
    #[error("`{node}` requires a region which is not available at {level}")]
    ContainmentViolation { node: String, level: String },
    #[error("`{node}` was reached before its consumer `{consumer}` was placed")]
    UnplacedConsumer { node: String, consumer: String },
    #[error("Search budget of {rounds} rounds exhausted before a complete schedule was found")]
    BudgetExhausted { rounds: usize },
}

#[derive(thiserror::Error, Debug, Clone)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum Error {
    #[error("Invalid input: {0}")]
    Config(#[from] ConfigError),
    #[error("Internal search failure: {0}")]
    Search(#[from] SearchError),
}
