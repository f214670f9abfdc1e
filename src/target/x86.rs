use crate::target::{cpu::CpuTarget, TargetId};

use serde::Serialize;

/// An AVX2-class x86 server part.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Default, Debug, Serialize)]
pub struct X86Target;

impl CpuTarget for X86Target {
    fn target_id() -> TargetId {
        TargetId::X86
    }

    fn vector_bytes() -> u32 {
        32
    }

    fn processors() -> u32 {
        16
    }

    fn llc_bytes() -> u64 {
        16 * 1024 * 1024
    }
}
