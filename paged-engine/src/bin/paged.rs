use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use paged_engine::{Allocator, EngineRegistry, DEFAULT_BASE_DIR};
use paged_socket::{Dispatcher, DEFAULT_SOCKET_PATH};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

/// Cleared by SIGINT and SIGTERM.
static RUNNING: AtomicBool = AtomicBool::new(true);

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = EngineCommand::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "page engine failed");
            ExitCode::FAILURE
        }
    }
}

/// Arbitrates journal pages between the processes of one host.
#[derive(Parser)]
#[command(name = "paged")]
struct EngineCommand {
    /// The control plane endpoint clients register at.
    #[arg(long, env = "PAGED_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Directory of the comm file.
    #[arg(long, env = "PAGED_BASE_DIR", default_value = DEFAULT_BASE_DIR)]
    base_dir: PathBuf,

    /// Pause of the allocator after a scan without requests, in microseconds.
    #[arg(long, env = "PAGED_SCAN_INTERVAL_US", default_value_t = 50)]
    scan_interval_us: u64,
}

fn run(args: EngineCommand) -> Result<(), std::io::Error> {
    let registry = Arc::new(Mutex::new(EngineRegistry::create(&args.base_dir)?));
    let dispatcher = Dispatcher::bind(&args.socket, registry.clone())?;
    let stop = dispatcher.stop_handle();

    unsafe { install_signal_handlers() };

    let control = std::thread::Builder::new()
        .name("paged-control".into())
        .spawn(move || dispatcher.run())?;

    let mut allocator = Allocator::new();
    allocator.run(
        &registry,
        &RUNNING,
        Duration::from_micros(args.scan_interval_us),
    );

    tracing::info!("shutting down");
    stop.stop();
    if control.join().is_err() {
        tracing::error!("control plane panicked");
    }

    // Last owner, removes the comm file.
    drop(registry);
    Ok(())
}

extern "C" fn request_shutdown(_: libc::c_int) {
    RUNNING.store(false, Ordering::Release);
}

unsafe fn install_signal_handlers() {
    let mut action: libc::sigaction = core::mem::zeroed();
    action.sa_sigaction = request_shutdown as extern "C" fn(libc::c_int) as usize;
    action.sa_flags = libc::SA_RESTART;

    libc::sigaction(libc::SIGTERM, &action, core::ptr::null_mut());
    libc::sigaction(libc::SIGINT, &action, core::ptr::null_mut());
}
