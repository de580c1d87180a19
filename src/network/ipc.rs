// ADHOCD — NETWORK: LOCAL IPC ENDPOINT
// Line-oriented control socket for operators: inspect the routing table and
// neighbor set, read the counters, inject a test datagram into the outbound
// pipeline. Off the routing hot path by design.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::engine::codec::mac_str;
use crate::engine::dispatch::Dispatch;
use crate::engine::runtime::clock_ns;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("cannot bind control socket {path}: {source}")]
    Bind {
        path: String,
        source: std::io::Error,
    },
    #[error("ipc listener thread spawn failed: {0}")]
    Spawn(std::io::Error),
    #[error("connection i/o: {0}")]
    Connection(#[from] std::io::Error),
}

/// Bind the control socket and serve requests until shutdown. A stale socket
/// file from a previous run is removed first.
pub fn spawn(dispatch: Arc<Dispatch>, path: &str) -> Result<JoinHandle<()>, IpcError> {
    let sock_path = Path::new(path);
    if sock_path.exists() {
        let _ = std::fs::remove_file(sock_path);
    }
    if let Some(parent) = sock_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let bind_err = |source| IpcError::Bind {
        path: path.to_string(),
        source,
    };
    let listener = UnixListener::bind(sock_path).map_err(bind_err)?;
    listener.set_nonblocking(true).map_err(bind_err)?;
    let path_owned = path.to_string();

    std::thread::Builder::new()
        .name("adhocd-ipc".into())
        .spawn(move || {
            serve(dispatch, listener);
            let _ = std::fs::remove_file(&path_owned);
        })
        .map_err(IpcError::Spawn)
}

fn serve(dispatch: Arc<Dispatch>, listener: UnixListener) {
    loop {
        if dispatch.core().shutting_down() {
            return;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(e) = handle_connection(&dispatch, stream) {
                    debug!(error = %e, "ipc connection error");
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(200));
            }
            Err(e) => {
                warn!(error = %e, "ipc accept failed");
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    }
}

fn handle_connection(dispatch: &Arc<Dispatch>, stream: UnixStream) -> Result<(), IpcError> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut out = stream;
    let mut line = String::new();
    while reader.read_line(&mut line)? > 0 {
        let reply = execute(dispatch, line.trim());
        out.write_all(reply.as_bytes())?;
        out.write_all(b"end\n")?;
        line.clear();
    }
    Ok(())
}

fn execute(dispatch: &Arc<Dispatch>, command: &str) -> String {
    let core = dispatch.core();
    let mut parts = command.split_whitespace();
    match parts.next() {
        Some("table") => {
            let snapshot = core.table.lock().snapshot();
            let mut out = String::new();
            for (dst, actions) in snapshot {
                out.push_str(&format!("dst {dst}\n"));
                for (mac, value, steps) in actions {
                    out.push_str(&format!(
                        "  via {} value {:.2} steps {}\n",
                        mac_str(&mac),
                        value,
                        steps
                    ));
                }
            }
            out
        }
        Some("neighbors") => {
            let now = clock_ns();
            let neighbors = core.neighbors.lock().snapshot();
            let mut out = String::new();
            for n in neighbors {
                let age_ms = now.saturating_sub(n.last_seen) / 1_000_000;
                out.push_str(&format!(
                    "{} node_id {:#010x} v4 {} v6 {} age_ms {}\n",
                    mac_str(&n.mac),
                    n.node_id,
                    n.ipv4.map(|a| a.to_string()).unwrap_or_else(|| "-".into()),
                    n.ipv6.map(|a| a.to_string()).unwrap_or_else(|| "-".into()),
                    age_ms
                ));
            }
            out
        }
        Some("counters") => format!("{}\n", core.counters.summary()),
        Some("inject") => match parts.next().and_then(decode_hex) {
            Some(datagram) => {
                dispatch.handle_outbound(&datagram, clock_ns());
                "injected\n".to_string()
            }
            None => "error: inject expects one hex-encoded datagram\n".to_string(),
        },
        Some(other) => format!("error: unknown command '{other}'\n"),
        None => String::new(),
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::runtime::Core;
    use crate::network::datapath::ChannelSink;
    use crate::network::transport::VirtualSwitch;

    fn test_dispatch() -> Arc<Dispatch> {
        let mac = [0x02, 0, 0, 0, 0, 0x01];
        let core = Arc::new(Core::new(Config::default(), mac));
        core.table
            .lock()
            .set_local_ips(mac, vec!["10.0.0.1".parse().unwrap()]);
        let sw = VirtualSwitch::new();
        let port = sw.attach(mac, Duration::from_millis(1));
        let (sink, _rx) = ChannelSink::new();
        Arc::new(Dispatch::new(core, Arc::new(port), Arc::new(sink)))
    }

    #[test]
    fn decodes_hex() {
        assert_eq!(decode_hex("4500"), Some(vec![0x45, 0x00]));
        assert_eq!(decode_hex("450"), None);
        assert_eq!(decode_hex("zz"), None);
        assert_eq!(decode_hex(""), Some(vec![]));
    }

    #[test]
    fn table_and_neighbors_commands_render() {
        let d = test_dispatch();
        d.core()
            .table
            .lock()
            .update("10.0.0.9".parse().unwrap(), [2, 0, 0, 0, 0, 9], 10.0);
        let table = execute(&d, "table");
        assert!(table.contains("dst 10.0.0.9"));
        assert!(table.contains("02:00:00:00:00:09"));
        let neighbors = execute(&d, "neighbors");
        assert!(neighbors.is_empty());
        let counters = execute(&d, "counters");
        assert!(counters.contains("rx:0"));
    }

    #[test]
    fn inject_runs_the_outbound_pipeline() {
        let d = test_dispatch();
        // 20-byte IPv4 header to an unknown destination: starts discovery.
        let mut pkt = vec![0u8; 20];
        pkt[0] = 0x45;
        pkt[12..16].copy_from_slice(&[10, 0, 0, 1]);
        pkt[16..20].copy_from_slice(&[10, 0, 0, 9]);
        let hex: String = pkt.iter().map(|b| format!("{b:02x}")).collect();
        let reply = execute(&d, &format!("inject {hex}"));
        assert_eq!(reply, "injected\n");
        assert!(d.core().pending.lock().contains(&"10.0.0.9".parse().unwrap()));
        assert!(execute(&d, "inject xyz").starts_with("error"));
        assert!(execute(&d, "bogus").starts_with("error"));
    }
}
