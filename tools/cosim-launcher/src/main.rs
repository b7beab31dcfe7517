#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context};
use clap::Parser;
use cosim_lockstep::{
    ComponentError, ComponentLoader, EmulatorComponent, LoadError, LockstepError, LockstepSession,
};
use cosim_machine::RefLoader;
use tracing_subscriber::EnvFilter;

const EXIT_LOAD: i32 = 3;
const EXIT_MISSING_ENTRY_POINT: i32 = 4;
const EXIT_SYNC: i32 = 5;
const EXIT_EMULATOR_INIT: i32 = 6;
const EXIT_EMULATOR_RUNTIME: i32 = 7;

#[derive(Parser, Debug)]
#[command(
    name = "cosim-launcher",
    about = "Load an emulator component and single-step its guest in lockstep until it finishes."
)]
struct Args {
    /// Enable the emulator's own log prefix and debug-level logging
    #[arg(long, action = clap::ArgAction::SetTrue)]
    qlog: bool,

    /// Emulator component manifest, or a directory containing cosim-emu.json
    emulator: PathBuf,

    /// Instrumentation plugin passed to the emulator
    plugin: String,

    /// Guest executable loaded as the emulator BIOS
    guest: PathBuf,

    /// Number of virtual CPUs
    #[arg(long, value_name = "N", default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    smp: u32,
}

struct Failure {
    code: i32,
    error: anyhow::Error,
}

impl Failure {
    fn new(code: i32, error: anyhow::Error) -> Self {
        Self { code, error }
    }
}

fn main() {
    let args = Args::parse();

    let default_level = if args.qlog { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(&args) {
        Ok(steps) => println!("The test is completed - {steps} instructions executed"),
        Err(failure) => {
            tracing::error!(code = failure.code, "{:#}", failure.error);
            eprintln!("cosim-launcher: {:#}", failure.error);
            process::exit(failure.code);
        }
    }
}

/// The argument vector handed to the emulator's `main`.
fn emulator_argv(args: &Args) -> Vec<String> {
    let log_items = if args.qlog {
        "nochain,prefix:cosim"
    } else {
        "nochain"
    };
    let guest = args.guest.display().to_string();
    let smp = args.smp.to_string();
    [
        "emulator",
        "-nographic",
        "-accel",
        "tcg,one-insn-per-tb=on,thread=single",
        "-d",
        log_items,
        "-plugin",
        args.plugin.as_str(),
        "-machine",
        "virt",
        "-bios",
        guest.as_str(),
        "-smp",
        smp.as_str(),
        "-cosim",
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect()
}

fn load(args: &Args) -> Result<Arc<dyn EmulatorComponent>, Failure> {
    RefLoader.load(&args.emulator).map_err(|err| {
        let code = match err {
            LoadError::MissingEntryPoint(_) => EXIT_MISSING_ENTRY_POINT,
            _ => EXIT_LOAD,
        };
        Failure::new(
            code,
            anyhow::Error::new(err)
                .context(format!("load emulator component {}", args.emulator.display())),
        )
    })
}

/// Run the guest in lockstep and return the number of retired instructions.
fn run(args: &Args) -> Result<u64, Failure> {
    let argv = emulator_argv(args);
    tracing::debug!(?argv, "emulator command line");

    let component = load(args)?;
    let session = Arc::new(LockstepSession::new());
    component.pass_sync(session.clone());

    let emulator = {
        let component = component.clone();
        let session = session.clone();
        thread::Builder::new()
            .name("emulator-main".to_string())
            .spawn(move || {
                session.handshake().emulator_ready_and_wait();
                let result = component.main(&argv);
                // Releases a driver blocked in `step()` once the guest is done.
                session.gateway().close();
                result
            })
            .context("spawn emulator thread")
            .map_err(|err| Failure::new(EXIT_SYNC, err))?
    };

    session.handshake().driver_ready_and_wait();
    let opened = session.gateway().wait_open().is_ok();
    let steps = if opened {
        step_until_done(component.as_ref(), &session)?
    } else {
        0
    };

    match emulator.join() {
        Ok(Ok(())) => {}
        Ok(Err(err @ ComponentError::Init(_))) => {
            return Err(Failure::new(EXIT_EMULATOR_INIT, err.into()))
        }
        Ok(Err(err @ ComponentError::Runtime(_))) => {
            return Err(Failure::new(EXIT_EMULATOR_RUNTIME, err.into()))
        }
        Err(_) => {
            return Err(Failure::new(
                EXIT_EMULATOR_RUNTIME,
                anyhow!("emulator thread panicked"),
            ))
        }
    }
    if !opened {
        return Err(Failure::new(
            EXIT_SYNC,
            anyhow!("emulator exited without opening the step channel"),
        ));
    }
    Ok(steps)
}

fn step_until_done(
    component: &dyn EmulatorComponent,
    session: &LockstepSession,
) -> Result<u64, Failure> {
    let mut steps = 0;
    loop {
        match component.step() {
            Ok(()) => {
                steps += 1;
                if tracing::enabled!(tracing::Level::DEBUG) {
                    let report = serde_json::to_string(&session.gateway().last_report())
                        .context("encode instruction report")
                        .map_err(|err| Failure::new(EXIT_SYNC, err))?;
                    tracing::debug!(step = steps, %report, "step");
                }
            }
            Err(LockstepError::Closed) => return Ok(steps),
            Err(err @ LockstepError::NotInitialized) => {
                return Err(Failure::new(EXIT_SYNC, err.into()))
            }
        }
    }
}
