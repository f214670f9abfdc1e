//! Small pipelines used by the binary, the benchmarks and the tests.

use crate::common::DimSize;
use crate::error::ConfigError;
use crate::graph::{pointwise, DimAccess, Graph, PipelineBuilder};
use crate::machine::MachineParams;

const BYTES_PER_POINT: u32 = 4;

/// `input -> f0 -> ... -> out`, where every stage reads its predecessor at
/// the same point. `len` counts the computed stages, including `out`.
pub fn pointwise_chain(
    len: usize,
    width: DimSize,
    height: DimSize,
    params: &MachineParams,
) -> Result<Graph, ConfigError> {
    let mut b = PipelineBuilder::new();
    let mut prev = b.input("input", &[width, height], BYTES_PER_POINT);
    for i in 0..len.max(1) {
        let name = if i + 1 >= len {
            "out".to_string()
        } else {
            format!("f{}", i)
        };
        let f = b.func(&name, &[width, height], BYTES_PER_POINT, 1.0);
        b.read(f, prev, pointwise(2), 1);
        prev = f;
    }
    b.output(prev);
    b.build(params)
}

/// A chain of square stencils: `input -> s1 -> ... -> out`. Each stage reads
/// a `(2 * radius + 1)^2` window of its predecessor and costs one operation
/// per tap. Earlier stages are padded by the radius so that `out` is
/// `width x height`.
pub fn stencil_chain(
    stages: usize,
    width: DimSize,
    height: DimSize,
    radius: u32,
    params: &MachineParams,
) -> Result<Graph, ConfigError> {
    let stages = stages.max(1);
    let taps = (2 * radius + 1).pow(2);
    let pad = |i: usize| 2 * DimSize::from(radius) * (stages - i) as DimSize;
    let mut b = PipelineBuilder::new();
    let mut prev = b.input("input", &[width + pad(0), height + pad(0)], BYTES_PER_POINT);
    for i in 1..=stages {
        let name = if i == stages {
            "out".to_string()
        } else {
            format!("s{}", i)
        };
        let extents = [width + pad(i), height + pad(i)];
        let f = b.func(&name, &extents, BYTES_PER_POINT, f64::from(taps));
        // Shift by the radius so reads stay within the padded producer.
        let access = (0..2).map(|d| DimAccess::window(d, 0, 2 * i64::from(radius)));
        b.read(f, prev, access, taps);
        prev = f;
    }
    b.output(prev);
    b.build(params)
}

/// A 3x3 box blur split into a horizontal and a vertical pass.
pub fn separable_blur(
    width: DimSize,
    height: DimSize,
    params: &MachineParams,
) -> Result<Graph, ConfigError> {
    let mut b = PipelineBuilder::new();
    let input = b.input("input", &[width + 2, height + 2], BYTES_PER_POINT);
    let blur_x = b.func("blur_x", &[width, height + 2], BYTES_PER_POINT, 3.0);
    let blur_y = b.func("blur_y", &[width, height], BYTES_PER_POINT, 3.0);
    b.read(
        blur_x,
        input,
        [DimAccess::window(0, 0, 2), DimAccess::identity(1)],
        3,
    )
    .read(
        blur_y,
        blur_x,
        [DimAccess::identity(0), DimAccess::window(1, 0, 2)],
        3,
    )
    .output(blur_y);
    b.build(params)
}

/// Normalizes each row of the input by its sum. `row_sum` is a reduction
/// over the row, and `out` reads it once per point.
pub fn row_normalize(
    width: DimSize,
    height: DimSize,
    params: &MachineParams,
) -> Result<Graph, ConfigError> {
    let mut b = PipelineBuilder::new();
    let input = b.input("input", &[width, height], BYTES_PER_POINT);
    let sum = b.reduction("row_sum", &[height], &[width], BYTES_PER_POINT, 1.0);
    let out = b.func("out", &[width, height], BYTES_PER_POINT, 2.0);
    // The update stage iterates `y` then the reduction variable `x`.
    b.read(
        sum,
        input,
        [DimAccess::identity(1), DimAccess::identity(0)],
        1,
    )
    .read(out, input, pointwise(2), 1)
    .read(out, sum, [DimAccess::identity(1)], 1)
    .output(out);
    b.build(params)
}

/// Two blurs of one input, combined pointwise. Exercises nodes with more
/// than one consumer.
pub fn diamond(width: DimSize, height: DimSize, params: &MachineParams) -> Result<Graph, ConfigError> {
    let mut b = PipelineBuilder::new();
    let input = b.input("input", &[width + 2, height + 2], BYTES_PER_POINT);
    let shared = b.func("shared", &[width + 2, height + 2], BYTES_PER_POINT, 1.0);
    let left = b.func("left", &[width, height], BYTES_PER_POINT, 9.0);
    let right = b.func("right", &[width, height], BYTES_PER_POINT, 9.0);
    let out = b.func("out", &[width, height], BYTES_PER_POINT, 1.0);
    let shifted = || (0..2).map(|d| DimAccess::window(d, 0, 2));
    b.read(shared, input, pointwise(2), 1)
        .read(left, shared, shifted(), 9)
        .read(right, shared, shifted(), 9)
        .read(out, left, pointwise(2), 1)
        .read(out, right, pointwise(2), 1)
        .output(out);
    b.build(params)
}
