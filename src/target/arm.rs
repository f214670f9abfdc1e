use crate::target::{cpu::CpuTarget, TargetId};

use serde::Serialize;

/// A NEON-class ARM part.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Default, Debug, Serialize)]
pub struct ArmTarget;

impl CpuTarget for ArmTarget {
    fn target_id() -> TargetId {
        TargetId::Arm
    }

    fn vector_bytes() -> u32 {
        16
    }

    fn processors() -> u32 {
        8
    }

    fn llc_bytes() -> u64 {
        8 * 1024 * 1024
    }
}
