use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt::{self, Display};

pub type DimSize = u64;
pub type Shape = SmallVec<[DimSize; 4]>;
pub type Region = SmallVec<[Interval; 4]>;

/// A closed integer interval `[min, max]`. Empty whenever `max < min`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Interval {
    pub min: i64,
    pub max: i64,
}

impl Interval {
    pub const fn new(min: i64, max: i64) -> Self {
        Interval { min, max }
    }

    pub const fn empty() -> Self {
        Interval {
            min: i64::MAX,
            max: i64::MIN,
        }
    }

    pub const fn point(x: i64) -> Self {
        Interval { min: x, max: x }
    }

    /// The interval `[min, min + extent - 1]`.
    pub fn with_extent(min: i64, extent: DimSize) -> Self {
        debug_assert!(extent > 0);
        Interval {
            min,
            max: min + i64::try_from(extent).unwrap_or(i64::MAX) - 1,
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.max < self.min
    }

    pub fn extent(&self) -> DimSize {
        if self.is_empty() {
            0
        } else {
            (self.max - self.min) as DimSize + 1
        }
    }

    pub fn set_extent(&mut self, extent: DimSize) {
        *self = Interval::with_extent(self.min, extent);
    }

    pub fn translate(&self, delta: i64) -> Self {
        if self.is_empty() {
            return *self;
        }
        Interval::new(self.min + delta, self.max + delta)
    }

    pub fn union(&self, other: &Interval) -> Self {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Interval::new(self.min.min(other.min), self.max.max(other.max))
    }

    /// Returns `true` if `other` lies within `self`. Empty intervals are
    /// contained by everything.
    pub fn contains(&self, other: &Interval) -> bool {
        other.is_empty() || (self.min <= other.min && other.max <= self.max)
    }
}

impl Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "[]")
        } else {
            write!(f, "[{}, {}]", self.min, self.max)
        }
    }
}

/// The region `[0, e - 1]` along every dimension.
pub fn full_region(extents: &[DimSize]) -> Region {
    extents
        .iter()
        .map(|&e| Interval::with_extent(0, e))
        .collect()
}

pub fn empty_region(rank: usize) -> Region {
    smallvec::smallvec![Interval::empty(); rank]
}

pub fn region_extents(region: &[Interval]) -> Shape {
    region.iter().map(Interval::extent).collect()
}

/// The number of points in a region.
pub fn region_volume(region: &[Interval]) -> DimSize {
    region.iter().map(Interval::extent).product()
}

pub fn region_union_into(acc: &mut Region, other: &[Interval]) {
    debug_assert_eq!(acc.len(), other.len());
    for (a, o) in acc.iter_mut().zip(other) {
        *a = a.union(o);
    }
}

pub fn shape_string(shape: &[DimSize]) -> String {
    let parts = shape.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    format!("[{}]", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_interval_has_zero_extent() {
        assert_eq!(Interval::empty().extent(), 0);
        assert!(Interval::empty().is_empty());
    }

    #[test]
    fn test_union_with_empty_is_identity() {
        let i = Interval::new(-3, 4);
        assert_eq!(i.union(&Interval::empty()), i);
        assert_eq!(Interval::empty().union(&i), i);
    }

    proptest! {
        #[test]
        fn test_union_contains_both(
            a in -100i64..100, ea in 1u64..50, b in -100i64..100, eb in 1u64..50
        ) {
            let x = Interval::with_extent(a, ea);
            let y = Interval::with_extent(b, eb);
            let u = x.union(&y);
            prop_assert!(u.contains(&x));
            prop_assert!(u.contains(&y));
            prop_assert!(u.extent() >= ea.max(eb));
        }

        #[test]
        fn test_translate_preserves_extent(a in -100i64..100, e in 1u64..50, d in -100i64..100) {
            let x = Interval::with_extent(a, e);
            prop_assert_eq!(x.translate(d).extent(), e);
        }
    }
}
