//! `rv` — a user-mode RV32I emulator driven by the GDB Remote Serial
//! Protocol over TCP.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;

use rv::cpu::Cpu;
use rv::gdb::server::{GdbServer, Session};
use rv::syscall::StdHostIo;
use rv::loader;

/// A user-mode emulator for RV32I ELF executables, controlled over the GDB
/// Remote Serial Protocol.
#[derive(Parser, Debug)]
#[command(name = "rv", version, about)]
struct Args {
    /// Path to the RV32 ELF executable to load.
    elf_path: String,

    /// TCP port to listen for a GDB connection on.
    #[arg(short, long, default_value_t = 3333)]
    port: u16,

    /// Enable verbose diagnostic logging.
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

fn run(args: Args, running: Arc<AtomicBool>) -> anyhow::Result<()> {
    let data = std::fs::read(&args.elf_path)
        .map_err(|e| anyhow::anyhow!("could not read {}: {e}", args.elf_path))?;

    let loaded = elf::load(&data)?;
    let (mut mem, entry) = loader::load_into_memory(&loaded)?;
    let mut cpu = Cpu::new(entry);
    let mut host = StdHostIo;

    let server = GdbServer::bind(args.port)?;
    let stream = server.accept()?;

    let mut session = Session::new(stream, &mut cpu, &mut mem, &mut host, running);
    session.run()?;

    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    setup_logging(args.verbose);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    }) {
        tracing::warn!(error = %e, "failed to install SIGINT handler");
    }

    let interrupted = running.clone();
    match run(args, running) {
        Ok(()) if !interrupted.load(Ordering::SeqCst) => {
            // SIGINT broke the session loop rather than a clean disconnect
            // or guest Exit ECALL; re-raise the conventional SIGINT status.
            ExitCode::from(130)
        }
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
