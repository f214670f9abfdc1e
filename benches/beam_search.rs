use iai_callgrind::{black_box, main};

use autosched::machine::MachineParams;
use autosched::pipelines::stencil_chain;
use autosched::search::{search, SearchConfig};

#[inline(never)]
fn search_stencil_chain() {
    let params = MachineParams::default();
    let graph = stencil_chain(3, 256, 256, 1, &params).unwrap();
    let config = SearchConfig {
        beam_size: 4,
        num_passes: Some(1),
        ..SearchConfig::default()
    };
    black_box(search(&graph, &params, &config).unwrap().cost);
}

main!(
    callgrind_args = "--simulate-wb=no", "--simulate-hwpref=yes",
        "--I1=32768,8,64", "--D1=32768,8,64", "--LL=8388608,16,64";
    functions = search_stencil_chain
);
