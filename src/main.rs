// ADHOCD — Orchestrator
// CLI entry (start/stop/restart/status), worker spawn/join, signal-driven
// shutdown, and the interface cleanup that must happen even on a panic.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use adhocd::config::Config;
use adhocd::engine::dispatch::Dispatch;
use adhocd::engine::runtime::{clock_ns, fatal, Core, E_CONFIG, E_IPC, E_PIDFILE, E_RAW, E_TUN, E_WORKER};
use adhocd::network::datapath::{self, TunDevice};
use adhocd::network::ipc;
use adhocd::network::transport::{FrameTransport, RawTransport};
use adhocd::routing::neighbors::Advertiser;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
extern "C" fn signal_handler(_sig: i32) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

/// Consecutive I/O failures a reader worker tolerates before it declares
/// itself dead and brings the daemon down.
const WORKER_IO_ERROR_CAP: u32 = 5;

#[derive(Parser)]
#[command(name = "adhocd", version, about = "RL ad-hoc mesh routing daemon")]
struct Cli {
    /// JSON configuration file (defaults apply when omitted).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the routing daemon (foreground; the init wrapper daemonizes).
    Start,
    /// Signal a running daemon to shut down.
    Stop,
    /// Stop, then start.
    Restart,
    /// Report whether the daemon is running.
    Status,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let cfg = match Config::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => fatal(E_CONFIG, &e.to_string()),
    };

    match cli.command {
        Command::Start => cmd_start(cfg),
        Command::Stop => cmd_stop(&cfg),
        Command::Restart => {
            cmd_stop(&cfg);
            cmd_start(cfg);
        }
        Command::Status => cmd_status(&cfg),
    }
}

// ── THE EXECUTIVE ────────────────────────────────────────────────────────

fn cmd_start(cfg: Config) {
    // SAFETY: the handler performs a single relaxed atomic store, which is
    // async-signal-safe per POSIX.
    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGINT, signal_handler as *const () as libc::sighandler_t);
    }

    if let Some(pid) = read_pidfile(&cfg.pid_file) {
        if process_alive(pid) {
            fatal(E_PIDFILE, &format!("daemon already running (pid {pid})"));
        }
        let _ = std::fs::remove_file(&cfg.pid_file);
    }

    // Panic hook: the tunnel must not outlive the daemon, and a stale
    // pidfile must not block the next start.
    let panic_tun = cfg.tun_iface.clone();
    let panic_pidfile = cfg.pid_file.clone();
    std::panic::set_hook(Box::new(move |panic_info| {
        eprintln!("[ADHOCD] PANIC: {panic_info}");
        datapath::cleanup_tun(&panic_tun);
        let _ = std::fs::remove_file(&panic_pidfile);
        std::process::exit(1);
    }));

    let Some(node_mac) = datapath::detect_mac(&cfg.physical_iface) else {
        fatal(
            E_RAW,
            &format!("cannot read MAC of interface {}", cfg.physical_iface),
        );
    };

    let tun = match TunDevice::create(&cfg.tun_iface) {
        Ok(tun) => Arc::new(tun),
        Err(e) => fatal(E_TUN, &e.to_string()),
    };
    if let Some(cidr) = &cfg.tun_addr4 {
        tun.assign_addr(cidr);
    }

    let transport: Arc<dyn FrameTransport> = match RawTransport::open(&cfg.physical_iface, node_mac)
    {
        Ok(t) => Arc::new(t),
        Err(e) => fatal(E_RAW, &e.to_string()),
    };

    let local_ips = collect_local_ips(&cfg, tun.name());
    if local_ips.is_empty() {
        warn!("no tunnel address configured; this node cannot originate discoveries");
    }

    let core = Arc::new(Core::new(cfg.clone(), node_mac));
    core.table.lock().set_local_ips(node_mac, local_ips.clone());
    let dispatch = Arc::new(Dispatch::new(core.clone(), transport.clone(), tun.clone()));

    if let Err(e) = write_pidfile(&cfg.pid_file) {
        fatal(E_PIDFILE, &format!("cannot write pidfile: {e}"));
    }

    info!(
        iface = %cfg.physical_iface,
        tun = %cfg.tun_iface,
        mac = %adhocd::engine::codec::mac_str(&node_mac),
        ips = ?local_ips,
        "adhocd starting"
    );

    let worker_failed = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();

    // Worker 1: tunnel → daemon.
    {
        let dispatch = dispatch.clone();
        let core = core.clone();
        let tun = tun.clone();
        let failed = worker_failed.clone();
        handles.push(
            std::thread::Builder::new()
                .name("adhocd-tun-rx".into())
                .spawn(move || {
                    let mut buf = [0u8; 2048];
                    let mut io_errors = 0u32;
                    while !core.shutting_down() {
                        match tun.read_datagram(&mut buf) {
                            Ok(Some(n)) => {
                                io_errors = 0;
                                dispatch.handle_outbound(&buf[..n], clock_ns());
                            }
                            Ok(None) => {}
                            Err(e) => {
                                io_errors += 1;
                                error!(error = %e, "tunnel read failed");
                                if io_errors >= WORKER_IO_ERROR_CAP {
                                    failed.store(true, Ordering::Relaxed);
                                    core.request_shutdown();
                                }
                            }
                        }
                    }
                })
                .unwrap_or_else(|_| fatal(E_WORKER, "tun-rx thread spawn failed")),
        );
    }

    // Worker 2: physical → daemon.
    {
        let dispatch = dispatch.clone();
        let core = core.clone();
        let transport = transport.clone();
        let failed = worker_failed.clone();
        handles.push(
            std::thread::Builder::new()
                .name("adhocd-phy-rx".into())
                .spawn(move || {
                    let mut buf = [0u8; 2048];
                    let mut io_errors = 0u32;
                    while !core.shutting_down() {
                        match transport.recv_frame(&mut buf) {
                            Ok(Some((src_mac, n))) => {
                                io_errors = 0;
                                dispatch.handle_frame(src_mac, &buf[..n], clock_ns());
                            }
                            Ok(None) => {}
                            Err(e) => {
                                io_errors += 1;
                                error!(error = %e, "raw receive failed");
                                if io_errors >= WORKER_IO_ERROR_CAP {
                                    failed.store(true, Ordering::Relaxed);
                                    core.request_shutdown();
                                }
                            }
                        }
                    }
                })
                .unwrap_or_else(|_| fatal(E_WORKER, "phy-rx thread spawn failed")),
        );
    }

    // Worker 3: HELLO advertiser.
    {
        let dispatch = dispatch.clone();
        let core = core.clone();
        let mut advertiser = Advertiser::new(core.node_id, &local_ips);
        handles.push(
            std::thread::Builder::new()
                .name("adhocd-hello".into())
                .spawn(move || {
                    let interval = Duration::from_nanos(core.cfg.hello_interval_ns());
                    while !core.shutting_down() {
                        dispatch.send_hello(advertiser.next_hello());
                        // Sleep in slices so shutdown is observed promptly.
                        let mut left = interval;
                        while !core.shutting_down() && left > Duration::ZERO {
                            let step = left.min(Duration::from_millis(200));
                            std::thread::sleep(step);
                            left = left.saturating_sub(step);
                        }
                    }
                })
                .unwrap_or_else(|_| fatal(E_WORKER, "hello thread spawn failed")),
        );
    }

    match ipc::spawn(dispatch.clone(), &cfg.ctrl_socket) {
        Ok(handle) => handles.push(handle),
        Err(e) => {
            datapath::cleanup_tun(&cfg.tun_iface);
            let _ = std::fs::remove_file(&cfg.pid_file);
            fatal(E_IPC, &e.to_string());
        }
    }

    info!("workers running");
    housekeeping_loop(&core, &dispatch);

    for handle in handles {
        let _ = handle.join();
    }
    drop(transport);
    datapath::cleanup_tun(&cfg.tun_iface);
    let _ = std::fs::remove_file(&cfg.pid_file);

    if worker_failed.load(Ordering::Relaxed) {
        fatal(E_WORKER, "a worker died; daemon terminated");
    }
    info!("clean exit");
}

/// The main thread doubles as the housekeeping ticker: neighbor expiry, ARQ
/// retransmits, reward-wait timeouts, discovery deadlines, and a periodic
/// telemetry line.
fn housekeeping_loop(core: &Arc<Core>, dispatch: &Arc<Dispatch>) {
    let sweep_interval = core.cfg.hello_interval_ns();
    let mut last_neighbor_sweep = clock_ns();
    let mut last_report = clock_ns();
    loop {
        if SHUTDOWN.load(Ordering::Relaxed) {
            core.request_shutdown();
        }
        if core.shutting_down() {
            return;
        }
        std::thread::sleep(Duration::from_millis(200));
        let now = clock_ns();

        dispatch.arq_tick(now);
        dispatch.reward_tick(now);
        dispatch.pending_tick(now);
        if now.saturating_sub(last_neighbor_sweep) >= sweep_interval {
            dispatch.neighbor_sweep(now);
            last_neighbor_sweep = now;
        }
        if now.saturating_sub(last_report) >= 10_000_000_000 {
            info!(
                neighbors = core.neighbors.lock().len(),
                routes = core.table.lock().len(),
                arq_in_flight = core.arq.lock().in_flight(),
                "{}",
                core.counters.summary()
            );
            last_report = now;
        }
    }
}

fn collect_local_ips(cfg: &Config, tun_iface: &str) -> Vec<IpAddr> {
    let mut ips = Vec::new();
    if let Some(cidr) = &cfg.tun_addr4 {
        if let Some(addr) = cidr.split('/').next() {
            if let Ok(ip) = addr.parse::<IpAddr>() {
                ips.push(ip);
            }
        }
    }
    if ips.is_empty() {
        if let Some(v4) = datapath::interface_ipv4(tun_iface) {
            ips.push(IpAddr::V4(v4));
        }
    }
    ips
}

// ── PIDFILE CONTROL (stop / restart / status) ────────────────────────────

fn read_pidfile(path: &str) -> Option<i32> {
    std::fs::read_to_string(path)
        .ok()?
        .trim()
        .parse::<i32>()
        .ok()
}

fn write_pidfile(path: &str) -> std::io::Result<()> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{}\n", std::process::id()))
}

fn process_alive(pid: i32) -> bool {
    // SAFETY: kill with signal 0 only probes for existence.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn cmd_stop(cfg: &Config) {
    let Some(pid) = read_pidfile(&cfg.pid_file) else {
        eprintln!("adhocd: not running (no pidfile at {})", cfg.pid_file);
        return;
    };
    if !process_alive(pid) {
        eprintln!("adhocd: stale pidfile (pid {pid} gone), removing");
        let _ = std::fs::remove_file(&cfg.pid_file);
        return;
    }
    // SAFETY: plain kill(2) on a pid read from our own pidfile.
    unsafe { libc::kill(pid, libc::SIGTERM) };
    for _ in 0..50 {
        if !process_alive(pid) {
            println!("adhocd: stopped (pid {pid})");
            let _ = std::fs::remove_file(&cfg.pid_file);
            return;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    fatal(E_WORKER, &format!("pid {pid} did not exit within 5s"));
}

fn cmd_status(cfg: &Config) {
    match read_pidfile(&cfg.pid_file) {
        Some(pid) if process_alive(pid) => {
            println!("adhocd: running (pid {pid})");
        }
        Some(pid) => {
            eprintln!("adhocd: not running (stale pidfile, pid {pid})");
            std::process::exit(3);
        }
        None => {
            eprintln!("adhocd: not running");
            std::process::exit(3);
        }
    }
}
