use crate::gateway::StepGateway;
use crate::handshake::StartupHandshake;

/// Synchronization state shared by the external driver and the emulator thread.
///
/// The two channels are independent: the handshake is used exactly once at startup, the gateway
/// for every step afterwards.
#[derive(Debug, Default)]
pub struct LockstepSession {
    handshake: StartupHandshake,
    gateway: StepGateway,
}

impl LockstepSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handshake(&self) -> &StartupHandshake {
        &self.handshake
    }

    pub fn gateway(&self) -> &StepGateway {
        &self.gateway
    }
}
