pub mod common;
pub mod cost;
pub mod error;
pub mod graph;
pub mod loop_nest;
pub mod machine;
pub mod pipelines;
pub mod pprint;
pub mod schedule;
pub mod search;
pub mod target;
pub mod tiling;
pub mod utils;

pub use error::Error;
