//! `strato <program> [args...]`: run an x86-64 Linux binary under the
//! emulator. The host environment is forwarded, the guest's exit status
//! becomes ours, and an emulator crash exits 255 after the panic dump.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::Context;
use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use strato_kernel::Config;
use strato_machine::{Machine, MachineError};

#[derive(Parser)]
#[command(name = "strato", about = "user-mode emulator for Linux x86-64 binaries")]
struct Args {
    /// Path to the guest ELF executable.
    program: String,

    /// Arguments forwarded to the guest program.
    #[arg(trailing_var_arg = true)]
    program_args: Vec<String>,

    /// Log every syscall with its arguments and result.
    #[arg(long)]
    log_syscalls: bool,

    /// Trace every executed instruction once this many have retired.
    #[arg(long, value_name = "TICKS")]
    log_instructions_after: Option<u64>,

    /// Disable the System V shared-memory family.
    #[arg(long)]
    no_shm: bool,

    /// Number of CPU cores reported to the guest.
    #[arg(long, default_value_t = 1)]
    cores: u32,
}

static INTERRUPT: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_sigint(_sig: i32) {
    if let Some(flag) = INTERRUPT.get() {
        flag.store(true, Ordering::Relaxed);
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config {
        log_syscalls: args.log_syscalls,
        log_instructions_after: args.log_instructions_after,
        enable_shm: !args.no_shm,
        nb_cores: args.cores,
    };

    let mut machine = Machine::new(config);
    let _ = INTERRUPT.set(machine.interrupt_flag());
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as usize);
    }

    let envs: Vec<String> = std::env::vars().map(|(k, v)| format!("{k}={v}")).collect();
    machine
        .load(&args.program, &args.program_args, &envs)
        .with_context(|| format!("loading {}", args.program))?;

    match machine.run() {
        Ok(status) => {
            debug!(status, "guest exited");
            std::process::exit(status & 0xff);
        }
        Err(MachineError::Interrupted) => std::process::exit(130),
        Err(err) => {
            eprintln!("strato: {err}");
            std::process::exit(255);
        }
    }
}
