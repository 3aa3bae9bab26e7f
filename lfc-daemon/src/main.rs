//! LinuxFanControl daemon (lfcd)
//!
//! Privileged service controlling local fans over hwmon. Exposes a
//! line-framed JSON-RPC 2.0 surface over TCP, publishes telemetry snapshots
//! to POSIX shared memory, and runs the control engine plus detection and
//! import workers.
//!
//! Lifecycle: load config, scan inventory, open telemetry, start the control
//! thread, serve RPC until a stop signal, then restore PWM state and clean
//! up. SIGINT/SIGTERM and `daemon.shutdown` both set the stop flag;
//! `daemon.restart` additionally asks the supervisor for a restart via the
//! exit path.

mod handlers;
mod import;
mod jobs;
mod registry;
mod server;
mod state;

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use lfc_core::constants::{paths, timing};
use lfc_core::{default_config_path, DaemonConfig};

use registry::CommandRegistry;
use state::DaemonState;

const VERSION: &str = env!("CARGO_PKG_VERSION");

struct CliArgs {
    config_path: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
}

fn print_help() {
    eprintln!("lfcd {} - LinuxFanControl daemon", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    lfcd [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -c, --config PATH   Config file (default: XDG config dir)");
    eprintln!("        --host HOST     Override RPC bind host");
    eprintln!("        --port PORT     Override RPC port");
    eprintln!("    -f, --foreground    Run in foreground (always on)");
    eprintln!("    -v, --version       Print version");
    eprintln!("    -h, --help          Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    LFCD_LOG            Log filter (trace, debug, info, warn, error)");
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut out = CliArgs {
        config_path: None,
        host: None,
        port: None,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                println!("lfcd {}", VERSION);
                std::process::exit(0);
            }
            "-f" | "--foreground" => {
                // no daemonization implemented; flag accepted for service files
            }
            "-c" | "--config" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
                out.config_path = Some(PathBuf::from(&args[i]));
            }
            "--host" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("Error: --host requires an argument");
                    std::process::exit(1);
                }
                out.host = Some(args[i].clone());
            }
            "--port" => {
                i += 1;
                let parsed = args.get(i).and_then(|s| s.parse::<u16>().ok());
                match parsed {
                    Some(p) => out.port = Some(p),
                    None => {
                        eprintln!("Error: --port requires a number");
                        std::process::exit(1);
                    }
                }
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }
    out
}

fn init_logging(debug_mode: bool) {
    let default = if debug_mode { "debug" } else { "info" };
    let filter = std::env::var("LFCD_LOG").unwrap_or_else(|_| default.to_string());

    let journald_available = Path::new("/run/systemd/journal/socket").exists();
    if journald_available {
        match tracing_journald::layer() {
            Ok(layer) => {
                use tracing_subscriber::prelude::*;
                tracing_subscriber::registry()
                    .with(layer)
                    .with(tracing_subscriber::EnvFilter::new(&filter))
                    .init();
                return;
            }
            Err(e) => {
                eprintln!("journald unavailable ({}), logging to stderr", e);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .init();
}

// ============================================================================
// PID file
// ============================================================================

fn write_pid_file(path: &Path) -> std::io::Result<()> {
    if path.exists() {
        if let Ok(content) = std::fs::read_to_string(path) {
            if let Ok(old_pid) = content.trim().parse::<i32>() {
                // SAFETY: kill with signal 0 only checks whether the process
                // exists; old_pid comes from a well-formed pidfile.
                if unsafe { libc::kill(old_pid, 0) } == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::AddrInUse,
                        format!("another instance is running (pid {})", old_pid),
                    ));
                }
            }
        }
        let _ = std::fs::remove_file(path);
    }
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    std::fs::write(path, format!("{}\n", std::process::id()))
}

fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "could not remove pidfile");
        }
    }
}

// ============================================================================
// Control thread
// ============================================================================

/// Engine tick at `tickMs` plus inventory refresh and telemetry publication
/// at the hwmon refresh cadence, in one thread.
fn control_loop(state: Arc<DaemonState>) {
    let refresh = Duration::from_millis(timing::HWMON_REFRESH_MS_DEFAULT);
    let mut last_publish: Option<Instant> = None;

    while !state.stop.load(Ordering::Acquire) {
        let tick_start = Instant::now();
        state.tick_engine(tick_start);

        if last_publish.map_or(true, |t| t.elapsed() >= refresh) {
            state.refresh_inventory();
            if let Err(e) = state.publish_telemetry() {
                debug!(error = %e, "telemetry publish failed");
            }
            last_publish = Some(Instant::now());
        }

        let budget = Duration::from_millis(state.config.lock().tick_ms);
        let elapsed = tick_start.elapsed();
        if elapsed < budget {
            std::thread::sleep(budget - elapsed);
        }
    }
    debug!("control loop stopped");
}

// ============================================================================
// Entry point
// ============================================================================

fn main() -> anyhow::Result<()> {
    let cli = parse_args();

    let config_path = cli.config_path.clone().unwrap_or_else(default_config_path);
    let mut config = match DaemonConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error ({}): {}", config_path.display(), e);
            std::process::exit(1);
        }
    };
    // CLI overrides on top of file values
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    init_logging(config.debug);
    info!("lfcd {} starting", VERSION);
    info!(config = %config_path.display(), host = %config.host, port = config.port, "configuration");

    let pidfile = PathBuf::from(&config.pidfile);
    if let Err(e) = write_pid_file(&pidfile) {
        error!(path = %pidfile.display(), error = %e, "pidfile");
        std::process::exit(1);
    }

    let state = DaemonState::new(
        config,
        config_path,
        PathBuf::from(paths::HWMON_BASE),
    );

    // Telemetry must come up via SHM or the file fallback; losing both is
    // fatal.
    if let Err(e) = state.publish_telemetry() {
        error!(error = %e, "cannot publish telemetry (shm and file fallback failed)");
        remove_pid_file(&pidfile);
        std::process::exit(1);
    }

    // Signals set the stop flag; the loops notice and unwind.
    {
        let sig_state = state.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("signal received, shutting down");
            sig_state.request_shutdown();
        }) {
            warn!(error = %e, "could not install signal handler");
        }
    }

    // Optionally apply the last active profile.
    let startup_profile = state.config.lock().profile_name.clone();
    if !startup_profile.is_empty() {
        let dir = PathBuf::from(state.config.lock().profiles_path.clone());
        let result = lfc_core::profile_path(&dir, &startup_profile)
            .and_then(|p| lfc_core::load_profile(&p))
            .and_then(|profile| state.engine.lock().apply_profile(profile));
        match result {
            Ok(()) => {
                *state.active_profile.lock() = startup_profile.clone();
                state.engine.lock().enable(true);
                info!(profile = %startup_profile, "startup profile applied");
            }
            Err(e) => warn!(profile = %startup_profile, error = %e, "startup profile not applied"),
        }
    }

    let registry = Arc::new(CommandRegistry::new());
    handlers::register_all(&registry, state.clone());
    handlers::register_introspection(&registry);
    info!(commands = registry.len(), "rpc surface registered");

    let control_state = state.clone();
    let control_handle = std::thread::Builder::new()
        .name("lfc-control".to_string())
        .spawn(move || control_loop(control_state))?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let (host, port) = {
        let cfg = state.config.lock();
        (cfg.host.clone(), cfg.port)
    };
    let serve = runtime.block_on(server::run_server(
        &host,
        port,
        registry,
        state.stop.clone(),
    ));

    state.request_shutdown();
    let _ = control_handle.join();
    state.teardown();
    remove_pid_file(&pidfile);

    if let Err(e) = serve {
        error!(error = %e, "rpc server failed");
        std::process::exit(1);
    }

    if state.restart_requested.load(Ordering::Acquire) {
        info!("exiting for supervisor restart");
    } else {
        info!("shutdown complete");
    }
    Ok(())
}
