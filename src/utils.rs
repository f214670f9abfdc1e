use crate::common::DimSize;

const INDENT_SIZE: usize = 2;

pub fn indent(depth: usize) -> String {
    " ".repeat(depth * INDENT_SIZE)
}

/// Mixes `value` into the running hash `h`.
///
/// This is the usual golden-ratio combiner. It is order-sensitive, so callers
/// may rely on sequences hashing differently from their permutations.
pub fn hash_combine(h: &mut u64, value: u64) {
    *h ^= value
        .wrapping_add(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(*h << 6)
        .wrapping_add(*h >> 2);
}

pub fn div_ceil(numerator: DimSize, denominator: DimSize) -> DimSize {
    debug_assert_ne!(denominator, 0);
    divrem::DivCeil::div_ceil(numerator, denominator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_hash_combine_is_order_sensitive() {
        let mut a = 0;
        hash_combine(&mut a, 1);
        hash_combine(&mut a, 2);
        let mut b = 0;
        hash_combine(&mut b, 2);
        hash_combine(&mut b, 1);
        assert_ne!(a, b);
    }

    proptest! {
        #[test]
        fn test_div_ceil_covers_numerator(n in 1u64..10_000, d in 1u64..200) {
            let q = div_ceil(n, d);
            prop_assert!(q * d >= n);
            prop_assert!((q - 1) * d < n);
        }
    }
}
