use anyhow::Result;
use clap::Parser;
use log::{debug, info};
use std::fs::File;
use std::io::BufWriter;
use std::path;

use autosched::common::DimSize;
use autosched::graph::Graph;
use autosched::machine::MachineParams;
use autosched::pipelines;
use autosched::pprint::{pprint, PrintMode};
use autosched::schedule::Schedule;
use autosched::search::{search, SearchConfig};
use autosched::target::TargetId;

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Target architecture
    #[arg(long, value_enum, default_value_t = TargetId::X86)]
    target: TargetId,

    /// Overrides the target as `parallelism,cache_bytes,balance`
    #[arg(long)]
    machine_params: Option<MachineParams>,

    #[arg(long, default_value_t = 32)]
    beam_size: usize,

    /// Number of search passes [default: 1 for greedy search, else 5]
    #[arg(long)]
    passes: Option<usize>,

    /// Percent chance that a path through the search survives dropout
    #[arg(long, default_value_t = 100)]
    keep_percent: u32,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Maximum number of rounds per pass
    #[arg(long)]
    max_rounds: Option<usize>,

    /// Allow inlining nodes with more than one consumer
    #[arg(long)]
    relaxed_inline: bool,

    /// Print mode
    #[arg(long, value_enum, default_value_t = PrintMode::Full)]
    print_mode: PrintMode,

    /// Write the schedule to this path in bincode
    #[arg(long)]
    save: Option<path::PathBuf>,

    #[command(subcommand)]
    pipeline: Pipeline,
}

#[derive(clap::Subcommand)]
enum Pipeline {
    #[command(about = "Schedule a chain of pointwise stages")]
    PointwiseChain {
        #[arg(long, default_value = "4")]
        len: usize,
        width: DimSize,
        height: DimSize,
    },
    #[command(about = "Schedule a chain of square stencils")]
    StencilChain {
        #[arg(long, default_value = "3")]
        stages: usize,
        #[arg(long, default_value = "1")]
        radius: u32,
        width: DimSize,
        height: DimSize,
    },
    #[command(about = "Schedule a separable 3x3 blur")]
    SeparableBlur { width: DimSize, height: DimSize },
    #[command(about = "Schedule a row sum followed by a normalization")]
    RowNormalize { width: DimSize, height: DimSize },
    #[command(about = "Schedule two blurs of a shared producer")]
    Diamond { width: DimSize, height: DimSize },
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let target_params = args.target.machine_params();
    let params = match args.machine_params {
        Some(p) => MachineParams {
            parallelism: p.parallelism,
            cache_bytes: p.cache_bytes,
            balance: p.balance,
            ..target_params
        },
        None => target_params,
    };
    info!("Machine parameters: {}", params);

    let graph = build_pipeline(&args.pipeline, &params)?;
    debug!("Pipeline:\n{}", graph);
    let config = SearchConfig {
        beam_size: args.beam_size,
        num_passes: args.passes,
        keep_percent: args.keep_percent,
        seed: args.seed,
        max_rounds: args.max_rounds,
        relaxed_inline: args.relaxed_inline,
        ..SearchConfig::default()
    };

    let start_time = std::time::Instant::now();
    let result = search(&graph, &params, &config)?;
    info!("search took {:?}", start_time.elapsed());
    info!(
        "evaluated {} distinct loop nests; pass costs: {:?}",
        result.evaluated, result.pass_costs
    );

    pprint(result.root(), &graph, &result.breakdown, args.print_mode);
    println!();
    let schedule = Schedule::from_tree(result.root(), &graph, result.cost);
    print!("{}", schedule);

    if let Some(path) = &args.save {
        bincode::serialize_into(BufWriter::new(File::create(path)?), &schedule)?;
        info!("Saved schedule to {}", path.display());
    }
    Ok(())
}

fn build_pipeline(pipeline: &Pipeline, params: &MachineParams) -> Result<Graph> {
    let graph = match *pipeline {
        Pipeline::PointwiseChain { len, width, height } => {
            pipelines::pointwise_chain(len, width, height, params)?
        }
        Pipeline::StencilChain {
            stages,
            radius,
            width,
            height,
        } => pipelines::stencil_chain(stages, width, height, radius, params)?,
        Pipeline::SeparableBlur { width, height } => {
            pipelines::separable_blur(width, height, params)?
        }
        Pipeline::RowNormalize { width, height } => {
            pipelines::row_normalize(width, height, params)?
        }
        Pipeline::Diamond { width, height } => pipelines::diamond(width, height, params)?,
    };
    Ok(graph)
}
