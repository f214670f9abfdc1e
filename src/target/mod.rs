mod arm;
mod cpu;
mod x86;

pub use arm::ArmTarget;
pub use x86::X86Target;

use crate::machine::MachineParams;

use std::fmt::Debug;

pub trait Target: Clone + Copy + std::hash::Hash + Eq + Default + Debug + 'static {
    fn line_size() -> u32;
    /// Width of the widest native vector register, in bytes.
    fn vector_bytes() -> u32;
    fn processors() -> u32;
    /// Size of the last-level cache, in bytes.
    fn llc_bytes() -> u64;
    /// Cost of moving one cache line from memory, relative to one arithmetic
    /// operation.
    fn balance() -> f64;
    fn target_id() -> TargetId;

    fn machine_params() -> MachineParams {
        MachineParams {
            parallelism: Self::processors(),
            cache_bytes: Self::llc_bytes(),
            balance: Self::balance(),
            line_size: Self::line_size(),
            vector_bytes: Self::vector_bytes(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum TargetId {
    X86,
    Arm,
}

impl TargetId {
    pub fn machine_params(self) -> MachineParams {
        match self {
            TargetId::X86 => X86Target::machine_params(),
            TargetId::Arm => ArmTarget::machine_params(),
        }
    }
}
