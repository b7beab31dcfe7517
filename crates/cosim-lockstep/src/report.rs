use serde::{Deserialize, Serialize};

/// What the emulator publishes after retiring one instruction under lockstep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsnReport {
    pub cpu_index: u32,
    pub pc_before: u64,
    pub pc_after: u64,
}
