//! Enumeration of candidate loop splits.
//!
//! A tiling is written as the tuple of *outer* extents, one per dimension.
//! The matching inner extent of dimension `i` is `ceil(s[i] / outer[i])`.

use crate::common::{DimSize, Shape};
use crate::utils::div_ceil;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Outer extents below this are dropped by `filter_small_outer_extents`.
pub const MIN_OUTER_EXTENT: DimSize = 16;

/// Tunable constants of the tiling enumerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TilingPolicy {
    /// A split is rejected once `inner * outer` exceeds the extent by more than
    /// `waste_num / waste_den`.
    pub waste_num: DimSize,
    pub waste_den: DimSize,
    /// While more than `throttle * factor` partial candidates exist, the factor
    /// used for the remaining dimensions doubles.
    pub throttle: DimSize,
}

impl Default for TilingPolicy {
    fn default() -> Self {
        TilingPolicy {
            waste_num: 8,
            waste_den: 7,
            throttle: 100,
        }
    }
}

impl TilingPolicy {
    fn too_wasteful(&self, inner: DimSize, outer: DimSize, extent: DimSize) -> bool {
        inner * outer * self.waste_den > extent * self.waste_num
    }

    /// Candidate outer extents for one dimension.
    ///
    /// `is_one` and `is_full` describe the already-chosen prefix and are only
    /// `true` when this is the last dimension, where they are used to skip
    /// tilings which would not split anything.
    fn dim_options(
        &self,
        s: DimSize,
        factor: DimSize,
        allow_splits: bool,
        inner_sizes: &[DimSize],
        is_one: bool,
        is_full: bool,
    ) -> Shape {
        let mut out = Shape::new();
        let push = |outer: DimSize, out: &mut Shape| {
            if !out.contains(&outer) {
                out.push(outer);
            }
        };
        let trivial = |outer: DimSize| (is_one && outer == 1) || (is_full && outer == s);

        if !allow_splits {
            if !is_one {
                push(1, &mut out);
            }
            if s != 1 && !is_full {
                push(s, &mut out);
            }
            return out;
        }

        if !inner_sizes.is_empty() {
            for &inner in inner_sizes {
                let outer = div_ceil(s, inner);
                if !trivial(outer) {
                    push(outer, &mut out);
                }
            }
            return out;
        }

        // Powers of `factor` for the inner loop.
        let mut max_inner = 0;
        let mut inner = 1;
        while inner < s {
            let outer = div_ceil(s, inner);
            if !trivial(outer) {
                if inner > 1 && self.too_wasteful(inner, outer, s) {
                    break;
                }
                max_inner = inner;
                push(outer, &mut out);
            }
            inner = inner.saturating_mul(factor);
        }

        // Powers of `factor` for the outer loop, until the regime above is
        // reached.
        let mut outer = 1;
        while outer <= s {
            let inner = div_ceil(s, outer);
            if !trivial(outer) {
                if outer > 1 && inner < max_inner * 2 {
                    break;
                }
                if self.too_wasteful(inner, outer, s) {
                    break;
                }
                push(outer, &mut out);
            }
            outer = outer.saturating_mul(factor);
        }

        if factor == 2 {
            let inner = 3;
            let outer = div_ceil(s, inner);
            if inner < s && outer < s && outer > 1 && !self.too_wasteful(inner, outer, s) {
                push(outer, &mut out);
            }
        }
        out
    }
}

/// A lazily-produced sequence of tilings. See [generate_tilings].
///
/// Tilings are produced in lexicographic order of the per-dimension option
/// lists, with dimension 0 varying slowest.
pub struct Tilings {
    prefix_options: Vec<Shape>,
    /// Options for the last dimension, indexed by [Tilings::class_of].
    last_options: [Shape; 4],
    odometer: SmallVec<[usize; 4]>,
    last_idx: usize,
    extents: Shape,
    done: bool,
}

impl Tilings {
    pub fn new(
        policy: TilingPolicy,
        extents: &[DimSize],
        factor: DimSize,
        allow_splits: bool,
        inner_sizes: &[DimSize],
    ) -> Self {
        debug_assert!(factor >= 2, "factor must be at least 2");
        debug_assert!(extents.iter().all(|&e| e > 0));
        let rank = extents.len();
        let mut prefix_options = Vec::with_capacity(rank.saturating_sub(1));
        let mut last_options: [Shape; 4] = Default::default();

        let mut partial_count: DimSize = 1;
        for (d, &s) in extents.iter().enumerate() {
            // Coarsen the search for outer dimensions once the inner ones
            // already produce too many candidates.
            let mut f = factor;
            while partial_count > f.saturating_mul(policy.throttle) {
                f = f.saturating_mul(2);
            }
            if d + 1 < rank {
                let opts = policy.dim_options(s, f, allow_splits, inner_sizes, false, false);
                partial_count = partial_count.saturating_mul(opts.len() as DimSize);
                prefix_options.push(opts);
            } else {
                for (class, slot) in last_options.iter_mut().enumerate() {
                    let is_one = class & 1 != 0;
                    let is_full = class & 2 != 0;
                    *slot = policy.dim_options(s, f, allow_splits, inner_sizes, is_one, is_full);
                }
            }
        }

        let done = prefix_options.iter().any(|o| o.is_empty());
        Tilings {
            odometer: smallvec::smallvec![0; prefix_options.len()],
            prefix_options,
            last_options,
            last_idx: 0,
            extents: Shape::from(extents),
            done,
        }
    }

    fn class_of(&self, prefix: &[DimSize]) -> usize {
        let is_one = prefix.iter().all(|&t| t == 1);
        let is_full = prefix.iter().zip(&self.extents).all(|(t, s)| t == s);
        usize::from(is_one) | (usize::from(is_full) << 1)
    }

    fn advance_odometer(&mut self) -> bool {
        for pos in (0..self.odometer.len()).rev() {
            self.odometer[pos] += 1;
            if self.odometer[pos] < self.prefix_options[pos].len() {
                return true;
            }
            self.odometer[pos] = 0;
        }
        false
    }
}

impl Iterator for Tilings {
    type Item = Shape;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if self.extents.is_empty() {
                self.done = true;
                return Some(Shape::new());
            }
            let prefix = self
                .odometer
                .iter()
                .zip(&self.prefix_options)
                .map(|(&i, opts)| opts[i])
                .collect::<Shape>();
            let opts = &self.last_options[self.class_of(&prefix)];
            if self.last_idx < opts.len() {
                let mut tiling = prefix;
                tiling.push(opts[self.last_idx]);
                self.last_idx += 1;
                return Some(tiling);
            }
            self.last_idx = 0;
            if !self.advance_odometer() {
                self.done = true;
            }
        }
    }
}

/// Returns candidate tilings of `extents` under the default [TilingPolicy].
///
/// With `allow_splits` unset, every dimension is either left whole (outer
/// extent 1) or split completely (outer extent equal to the extent). A
/// non-empty `inner_sizes` fixes the candidate inner sizes instead of
/// enumerating powers of `factor`.
pub fn generate_tilings(
    extents: &[DimSize],
    factor: DimSize,
    allow_splits: bool,
    inner_sizes: &[DimSize],
) -> Vec<Shape> {
    Tilings::new(
        TilingPolicy::default(),
        extents,
        factor,
        allow_splits,
        inner_sizes,
    )
    .collect()
}

/// Returns candidate splits of a loop into an outer loop and a small serial
/// inner loop of at most 8 iterations.
///
/// Dimensions `0..=d` are enumerated. `vec_dim_serial_sizes`, when non-empty,
/// adds inner sizes for the dimension at `vectorized_index`, and
/// `filter_small_outer_extents` removes candidates for that dimension whose
/// outer extent falls below [MIN_OUTER_EXTENT]. At `last_d`, the all-ones
/// tuple is always dropped, and the tuple equal to `extents` (no serial split
/// anywhere) is dropped unless `allow_inner_ones` is set.
pub fn generate_serial_tilings(
    extents: &[DimSize],
    d: usize,
    last_d: usize,
    vectorized_index: Option<usize>,
    vec_dim_serial_sizes: &[DimSize],
    filter_small_outer_extents: bool,
    allow_inner_ones: bool,
) -> Vec<Shape> {
    debug_assert!(d < extents.len() && last_d < extents.len());
    let equal_to_extents = |t: &[DimSize]| t.iter().zip(extents).all(|(a, b)| a == b);
    let all_ones = |t: &[DimSize]| t.iter().all(|&x| x == 1);

    let mut result = vec![Shape::new()];
    for dim in 0..=d {
        let s = extents[dim];
        let is_vector_dim = vectorized_index == Some(dim);
        let mut next = Vec::new();
        for prefix in &result {
            let mut t = prefix.clone();
            t.push(0);
            let mut used_full_extent = false;

            if is_vector_dim {
                for &inner in vec_dim_serial_sizes {
                    let outer = div_ceil(s, inner);
                    if filter_small_outer_extents && outer < MIN_OUTER_EXTENT {
                        continue;
                    }
                    t[dim] = outer;
                    if dim == last_d && (equal_to_extents(&t) || all_ones(&t)) {
                        continue;
                    }
                    used_full_extent = inner == s;
                    next.push(t.clone());
                }
            }

            let (max, factor) = match s {
                3 | 5 | 7 => (s, s),
                _ => (8, 2),
            };
            let mut inner = 1;
            while inner <= max {
                if inner > s {
                    break;
                }
                let candidate = !(inner == s && used_full_extent);
                let outer = div_ceil(s, inner);
                let filtered =
                    is_vector_dim && filter_small_outer_extents && outer < MIN_OUTER_EXTENT;
                if candidate && !filtered {
                    t[dim] = outer;
                    let trivial = dim == last_d
                        && ((!allow_inner_ones && equal_to_extents(&t)) || all_ones(&t));
                    if !trivial {
                        next.push(t.clone());
                    }
                }
                inner *= factor;
            }
        }
        result = next;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn shapes(v: &[&[DimSize]]) -> Vec<Shape> {
        v.iter().map(|s| Shape::from(*s)).collect()
    }

    #[test]
    fn test_serial_tilings_odd_extent_is_not_split() {
        assert_eq!(
            generate_serial_tilings(&[3], 0, 0, Some(0), &[], false, true),
            shapes(&[&[3]])
        );
        assert!(generate_serial_tilings(&[3], 0, 0, Some(0), &[], false, false).is_empty());
    }

    #[test]
    fn test_serial_tilings_power_of_two() {
        assert_eq!(
            generate_serial_tilings(&[8], 0, 0, Some(0), &[], false, true),
            shapes(&[&[8], &[4], &[2]])
        );
    }

    #[test]
    fn test_serial_tilings_filter_small_outer_extents() {
        assert!(generate_serial_tilings(&[8], 0, 0, Some(0), &[], true, true).is_empty());
        assert_eq!(
            generate_serial_tilings(&[8], 0, 0, Some(1), &[], true, true),
            shapes(&[&[8], &[4], &[2]])
        );
    }

    #[test]
    fn test_serial_tilings_vec_dim_serial_sizes() {
        // Serial sizes for the vectorized dimension come before the regular
        // power-of-two candidates.
        let tilings = generate_serial_tilings(&[64, 64], 1, 1, Some(1), &[64, 3], false, true);
        let outers_for_dim_1 = tilings
            .iter()
            .filter(|t| t[0] == 64)
            .map(|t| t[1])
            .collect::<Vec<_>>();
        assert_eq!(outers_for_dim_1, vec![1, 22, 64, 32, 16, 8]);
    }

    #[test]
    fn test_tilings_of_a_power_of_two() {
        assert_eq!(
            generate_tilings(&[8], 2, true, &[]),
            shapes(&[&[4], &[2], &[3]])
        );
    }

    #[test]
    fn test_tilings_of_a_unit_extent_is_empty() {
        assert!(generate_tilings(&[1], 2, true, &[]).is_empty());
        assert!(generate_tilings(&[1, 8], 2, true, &[])
            .iter()
            .all(|t| t[0] == 1));
    }

    #[test]
    fn test_tilings_of_no_dimensions() {
        assert_eq!(generate_tilings(&[], 2, true, &[]), vec![Shape::new()]);
    }

    #[test]
    fn test_tilings_with_inner_sizes() {
        assert_eq!(
            generate_tilings(&[10, 16], 2, true, &[8]),
            shapes(&[&[2, 2]])
        );
    }

    #[test]
    fn test_throttle_bounds_enumeration() {
        let n = Tilings::new(
            TilingPolicy::default(),
            &[4096, 4096, 4096, 4096],
            2,
            true,
            &[],
        )
        .count();
        let unthrottled = Tilings::new(
            TilingPolicy {
                throttle: DimSize::MAX / 64,
                ..TilingPolicy::default()
            },
            &[4096, 4096, 4096, 4096],
            2,
            true,
            &[],
        )
        .count();
        assert!(n < unthrottled, "{n} should be below {unthrottled}");
    }

    #[test]
    fn test_tilings_are_lazy() {
        let mut iter = Tilings::new(TilingPolicy::default(), &[1024, 1024], 2, true, &[]);
        let first = iter.next().unwrap();
        assert_eq!(first.len(), 2);
    }

    proptest! {
        #[test]
        fn test_tilings_are_sound(
            extents in proptest::collection::vec(1u64..=300, 1..=3),
            factor in 2u64..=4,
        ) {
            for t in generate_tilings(&extents, factor, true, &[]) {
                prop_assert_eq!(t.len(), extents.len());
                for (&outer, &s) in t.iter().zip(&extents) {
                    prop_assert!(outer >= 1);
                    let inner = div_ceil(s, outer);
                    prop_assert!(outer * inner >= s);
                }
            }
        }

        #[test]
        fn test_tilings_without_splits_are_whole_or_full(
            extents in proptest::collection::vec(1u64..=300, 1..=4),
        ) {
            for t in generate_tilings(&extents, 2, false, &[]) {
                for (&outer, &s) in t.iter().zip(&extents) {
                    prop_assert!(outer == 1 || outer == s);
                }
            }
        }

        #[test]
        fn test_tilings_exclude_trivial_tuples(
            extents in proptest::collection::vec(2u64..=300, 1..=3),
        ) {
            for t in generate_tilings(&extents, 2, true, &[]) {
                prop_assert!(!t.iter().all(|&o| o == 1));
                prop_assert!(t.iter().zip(&extents).any(|(o, s)| o != s));
            }
        }

        #[test]
        fn test_tilings_are_deterministic_and_unique(
            extents in proptest::collection::vec(1u64..=300, 1..=3),
            allow_splits in any::<bool>(),
        ) {
            let a = generate_tilings(&extents, 2, allow_splits, &[]);
            let b = generate_tilings(&extents, 2, allow_splits, &[]);
            prop_assert_eq!(&a, &b);
            let mut dedup = a.clone();
            dedup.sort();
            dedup.dedup();
            prop_assert_eq!(dedup.len(), a.len());
        }

        #[test]
        fn test_serial_tilings_are_deterministic_and_small(
            extents in proptest::collection::vec(1u64..=64, 1..=3),
            allow_inner_ones in any::<bool>(),
        ) {
            let last = extents.len() - 1;
            let a = generate_serial_tilings(&extents, last, last, Some(0), &[], false, allow_inner_ones);
            let b = generate_serial_tilings(&extents, last, last, Some(0), &[], false, allow_inner_ones);
            prop_assert_eq!(&a, &b);
            for t in &a {
                for (&outer, &s) in t.iter().zip(&extents) {
                    prop_assert!(div_ceil(s, outer) <= 8);
                }
            }
        }
    }
}
