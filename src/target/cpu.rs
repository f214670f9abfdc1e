use crate::target::{Target, TargetId};

use std::fmt::Debug;

/// Shared description of the multicore CPU targets.
pub(super) trait CpuTarget:
    Clone + Copy + std::hash::Hash + Eq + Default + Debug + 'static
{
    fn target_id() -> TargetId;
    fn vector_bytes() -> u32;
    fn processors() -> u32;
    fn llc_bytes() -> u64;
}

impl<T: CpuTarget> Target for T {
    fn line_size() -> u32 {
        64
    }

    fn vector_bytes() -> u32 {
        <T as CpuTarget>::vector_bytes()
    }

    fn processors() -> u32 {
        <T as CpuTarget>::processors()
    }

    fn llc_bytes() -> u64 {
        <T as CpuTarget>::llc_bytes()
    }

    fn balance() -> f64 {
        40.0
    }

    fn target_id() -> TargetId {
        <T as CpuTarget>::target_id()
    }
}
