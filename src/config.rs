// ADHOCD — CONFIGURATION
// Static key/value block loaded once at startup. Keys are UPPERCASE to match
// the operator-facing configuration format; every key has a default so an
// absent file yields a runnable daemon. Parsing is delegated to serde_json.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn d_physical_iface() -> String {
    "wlan0".into()
}
fn d_tun_iface() -> String {
    "adhoc0".into()
}
fn d_hello_interval() -> f64 {
    2.0
}
fn d_neighbor_ttl() -> f64 {
    7.0
}
fn d_alpha() -> f64 {
    0.3
}
fn d_tau() -> f64 {
    1.0
}
fn d_arq_retry_interval() -> f64 {
    0.5
}
fn d_arq_max_retries() -> u32 {
    5
}
fn d_arq_fail_reward() -> f64 {
    -50.0
}
fn d_reward_wait() -> f64 {
    3.0
}
fn d_hop_reward_timeout() -> f64 {
    -2.0
}
fn d_pending_queue_max() -> usize {
    64
}
fn d_rreq_deadline() -> f64 {
    3.0
}
fn d_selection_method() -> String {
    "soft-max".into()
}
fn d_epsilon() -> f64 {
    0.1
}
fn d_arq_ok_reward() -> f64 {
    10.0
}
fn d_rreq_reward_base() -> f64 {
    50.0
}
fn d_neighbor_reward() -> f64 {
    50.0
}
fn d_self_reward() -> f64 {
    100.0
}
fn d_reward_holdown() -> f64 {
    2.0
}
fn d_max_hops() -> u8 {
    16
}
fn d_max_broadcast_ttl() -> u8 {
    1
}
fn d_arq_protocols() -> Vec<u8> {
    // TCP, ICMPv4, ICMPv6
    vec![6, 1, 58]
}
fn d_pid_file() -> String {
    "/run/adhocd/adhocd.pid".into()
}
fn d_ctrl_socket() -> String {
    "/run/adhocd/ctl.sock".into()
}

/// Daemon configuration. Durations are seconds; the `*_ns` accessors convert
/// once for the hot path.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(rename = "PHYSICAL_IFACE", default = "d_physical_iface")]
    pub physical_iface: String,
    #[serde(rename = "TUN_IFACE", default = "d_tun_iface")]
    pub tun_iface: String,
    /// Optional IPv4 address (CIDR) assigned to the tunnel at startup.
    #[serde(rename = "TUN_ADDR4", default)]
    pub tun_addr4: Option<String>,

    #[serde(rename = "HELLO_INTERVAL", default = "d_hello_interval")]
    pub hello_interval: f64,
    #[serde(rename = "NEIGHBOR_TTL", default = "d_neighbor_ttl")]
    pub neighbor_ttl: f64,

    #[serde(rename = "ALPHA", default = "d_alpha")]
    pub alpha: f64,
    #[serde(rename = "TAU", default = "d_tau")]
    pub tau: f64,
    #[serde(rename = "V_INIT", default)]
    pub v_init: f64,
    #[serde(rename = "SELECTION_METHOD", default = "d_selection_method")]
    pub selection_method: String,
    #[serde(rename = "EPSILON", default = "d_epsilon")]
    pub epsilon: f64,

    #[serde(rename = "ARQ_RETRY_INTERVAL", default = "d_arq_retry_interval")]
    pub arq_retry_interval: f64,
    #[serde(rename = "ARQ_MAX_RETRIES", default = "d_arq_max_retries")]
    pub arq_max_retries: u32,
    #[serde(rename = "ARQ_FAIL_REWARD", default = "d_arq_fail_reward")]
    pub arq_fail_reward: f64,
    #[serde(rename = "ARQ_OK_REWARD", default = "d_arq_ok_reward")]
    pub arq_ok_reward: f64,
    /// Inner IP protocol numbers transmitted reliably (stop-and-wait ARQ).
    #[serde(rename = "ARQ_PROTOCOLS", default = "d_arq_protocols")]
    pub arq_protocols: Vec<u8>,

    #[serde(rename = "REWARD_WAIT", default = "d_reward_wait")]
    pub reward_wait: f64,
    #[serde(rename = "HOP_REWARD_TIMEOUT", default = "d_hop_reward_timeout")]
    pub hop_reward_timeout: f64,
    #[serde(rename = "REWARD_HOLDOWN", default = "d_reward_holdown")]
    pub reward_holdown: f64,
    #[serde(rename = "RREQ_REWARD_BASE", default = "d_rreq_reward_base")]
    pub rreq_reward_base: f64,
    #[serde(rename = "NEIGHBOR_REWARD", default = "d_neighbor_reward")]
    pub neighbor_reward: f64,
    #[serde(rename = "SELF_REWARD", default = "d_self_reward")]
    pub self_reward: f64,

    #[serde(rename = "PENDING_QUEUE_MAX", default = "d_pending_queue_max")]
    pub pending_queue_max: usize,
    #[serde(rename = "RREQ_DEADLINE", default = "d_rreq_deadline")]
    pub rreq_deadline: f64,

    #[serde(rename = "MAX_HOPS", default = "d_max_hops")]
    pub max_hops: u8,
    #[serde(rename = "MAX_BROADCAST_TTL", default = "d_max_broadcast_ttl")]
    pub max_broadcast_ttl: u8,

    #[serde(rename = "PID_FILE", default = "d_pid_file")]
    pub pid_file: String,
    #[serde(rename = "CTRL_SOCKET", default = "d_ctrl_socket")]
    pub ctrl_socket: String,
}

impl Default for Config {
    fn default() -> Self {
        // An empty JSON object exercises every serde default.
        serde_json::from_str("{}").expect("defaults are total")
    }
}

const NS: f64 = 1e9;

impl Config {
    /// Load from a JSON file, or defaults when `path` is None.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let cfg = match path {
            None => Config::default(),
            Some(p) => {
                let text = fs::read_to_string(p).map_err(|source| ConfigError::Read {
                    path: p.display().to_string(),
                    source,
                })?;
                serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                    path: p.display().to_string(),
                    source,
                })?
            }
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let err = |m: &str| Err(ConfigError::Invalid(m.to_string()));
        if self.physical_iface.is_empty() || self.physical_iface.len() > 15 {
            return err("PHYSICAL_IFACE must be 1..=15 chars");
        }
        if self.tun_iface.is_empty() || self.tun_iface.len() > 15 {
            return err("TUN_IFACE must be 1..=15 chars");
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return err("ALPHA must be within 0..=1");
        }
        if self.tau <= 0.0 {
            return err("TAU must be > 0");
        }
        if !(0.0..=1.0).contains(&self.epsilon) {
            return err("EPSILON must be within 0..=1");
        }
        for (name, v) in [
            ("HELLO_INTERVAL", self.hello_interval),
            ("NEIGHBOR_TTL", self.neighbor_ttl),
            ("ARQ_RETRY_INTERVAL", self.arq_retry_interval),
            ("REWARD_WAIT", self.reward_wait),
            ("RREQ_DEADLINE", self.rreq_deadline),
        ] {
            if v <= 0.0 || !v.is_finite() {
                return Err(ConfigError::Invalid(format!("{name} must be > 0")));
            }
        }
        if self.reward_holdown < 0.0 || !self.reward_holdown.is_finite() {
            return err("REWARD_HOLDOWN must be >= 0");
        }
        if self.arq_max_retries == 0 {
            return err("ARQ_MAX_RETRIES must be >= 1");
        }
        if self.pending_queue_max == 0 {
            return err("PENDING_QUEUE_MAX must be >= 1");
        }
        if self.max_hops == 0 {
            return err("MAX_HOPS must be >= 1");
        }
        match self.selection_method.as_str() {
            "soft-max" | "greedy" | "e-greedy" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "SELECTION_METHOD '{other}' is not one of soft-max|greedy|e-greedy"
                )))
            }
        }
        Ok(())
    }

    pub fn hello_interval_ns(&self) -> u64 {
        (self.hello_interval * NS) as u64
    }
    pub fn neighbor_ttl_ns(&self) -> u64 {
        (self.neighbor_ttl * NS) as u64
    }
    pub fn arq_retry_interval_ns(&self) -> u64 {
        (self.arq_retry_interval * NS) as u64
    }
    pub fn reward_wait_ns(&self) -> u64 {
        (self.reward_wait * NS) as u64
    }
    pub fn reward_holdown_ns(&self) -> u64 {
        (self.reward_holdown * NS) as u64
    }
    pub fn rreq_deadline_ns(&self) -> u64 {
        (self.rreq_deadline * NS) as u64
    }
}
