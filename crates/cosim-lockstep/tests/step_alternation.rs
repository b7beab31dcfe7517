#![cfg(not(feature = "loom"))]

use std::sync::{Arc, Mutex};
use std::thread;

use cosim_lockstep::{InsnReport, LockstepError, LockstepSession};
use pretty_assertions::assert_eq;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    DriverRequest,
    EmulatorDone,
    DriverWake,
}

#[test]
fn m_steps_produce_m_strictly_alternating_handovers() {
    const STEPS: u64 = 64;

    let session = Arc::new(LockstepSession::new());
    let log = Arc::new(Mutex::new(Vec::new()));

    let emulator = {
        let session = session.clone();
        let log = log.clone();
        thread::spawn(move || {
            session.handshake().emulator_ready_and_wait();
            let gateway = session.gateway();
            gateway.open();
            let mut pc = 0x8000_0000u64;
            while !gateway.is_closed() {
                if !gateway.step_pending() {
                    thread::yield_now();
                    continue;
                }
                log.lock().unwrap().push(Signal::EmulatorDone);
                assert!(gateway.complete_step(InsnReport {
                    cpu_index: 0,
                    pc_before: pc,
                    pc_after: pc + 4,
                }));
                pc += 4;
            }
        })
    };

    session.handshake().driver_ready_and_wait();
    session.gateway().wait_open().unwrap();
    for _ in 0..STEPS {
        log.lock().unwrap().push(Signal::DriverRequest);
        session.gateway().step().unwrap();
        log.lock().unwrap().push(Signal::DriverWake);
    }
    session.gateway().close();
    emulator.join().unwrap();

    let expected: Vec<Signal> = (0..STEPS)
        .flat_map(|_| [Signal::DriverRequest, Signal::EmulatorDone, Signal::DriverWake])
        .collect();
    assert_eq!(*log.lock().unwrap(), expected);
    assert_eq!(session.gateway().completed_steps(), STEPS);
    assert_eq!(session.gateway().last_pc(), 0x8000_0000 + STEPS * 4);
    assert_eq!(session.gateway().step(), Err(LockstepError::Closed));
}

#[test]
fn driver_may_start_before_emulator_is_initialized() {
    let session = Arc::new(LockstepSession::new());

    let driver = {
        let session = session.clone();
        thread::spawn(move || {
            session.handshake().driver_ready_and_wait();
            session.gateway().wait_open()
        })
    };

    thread::sleep(std::time::Duration::from_millis(20));
    assert!(!session.handshake().is_complete());

    session.handshake().emulator_ready_and_wait();
    session.gateway().open();
    assert_eq!(driver.join().unwrap(), Ok(()));
    assert!(session.gateway().is_running());
}
