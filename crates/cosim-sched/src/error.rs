use thiserror::Error;

use crate::cpu::CpuIndex;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedError {
    #[error("scheduler started with an empty CPU roster")]
    NoCpus,
    #[error("no vCPU with index {0} in the roster")]
    UnknownCpu(CpuIndex),
}
