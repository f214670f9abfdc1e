use iai_callgrind::{black_box, main};

use autosched::tiling::{generate_serial_tilings, generate_tilings};

#[inline(never)]
fn enumerate_tilings_3d() {
    black_box(generate_tilings(
        black_box(&[2048, 1024, 512]),
        2,
        true,
        &[],
    ));
}

#[inline(never)]
fn enumerate_serial_tilings() {
    black_box(generate_serial_tilings(
        black_box(&[64, 32, 16, 8]),
        3,
        3,
        Some(0),
        &[2, 4],
        true,
        false,
    ));
}

main!(
    callgrind_args = "--simulate-wb=no", "--simulate-hwpref=yes",
        "--I1=32768,8,64", "--D1=32768,8,64", "--LL=8388608,16,64";
    functions = enumerate_tilings_3d, enumerate_serial_tilings
);
