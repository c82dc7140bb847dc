//! Scan configuration and shared runtime state.
//!
//! [`ScanConfig`] is built once (by the CLI or an embedding program),
//! validated by the engine, and shared immutably behind an `Arc`. Nothing
//! in the hot paths mutates it. The runtime-tunable knobs - target rate,
//! stop flags, global counters - live in [`RuntimeState`] as atomics.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::targets::PortList;

/// An Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 6]
    }
}

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(format!("invalid MAC address '{s}'"));
        }
        let mut octets = [0u8; 6];
        for (i, p) in parts.iter().enumerate() {
            octets[i] =
                u8::from_str_radix(p, 16).map_err(|_| format!("invalid MAC address '{s}'"))?;
        }
        Ok(MacAddr(octets))
    }
}

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

/// Output encoding selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Json,
    Csv,
}

/// Immutable configuration for one scan run.
pub struct ScanConfig {
    /// Identifier attached to logs and the end-of-scan summary.
    pub scan_id: Uuid,
    /// Global packets-per-second target. 0 = derive from bandwidth, or the
    /// 10k pps default when bandwidth is unset too.
    pub rate: u64,
    /// Bits-per-second cap, converted to a rate at startup. 0 = unset.
    pub bandwidth: u64,
    /// Sender threads on this machine.
    pub senders: u8,
    /// This machine's shard number, `0 <= shard_num < total_shards`.
    pub shard_num: u16,
    /// Number of cooperating machines.
    pub total_shards: u16,
    /// Probes sent to each target (distinct probe numbers).
    pub packet_streams: u16,
    /// Per-shard cap on targets scanned.
    pub max_targets: Option<u64>,
    /// Per-shard cap on packets sent.
    pub max_packets: Option<u64>,
    /// Wall-clock cap on the sending phase.
    pub max_runtime: Option<Duration>,
    /// How long the receiver keeps listening after the last sender stops.
    pub cooldown: Duration,
    /// Transient send retries inside one batch submission.
    pub retries: u8,
    /// Packets per transmit batch.
    pub batch_size: u16,
    /// Probe module name (registry key).
    pub probe_name: String,
    /// Module-specific argument string.
    pub probe_args: Option<String>,
    /// Source addresses probes are sent from.
    pub source_ips: Vec<Ipv4Addr>,
    /// Inclusive source port range.
    pub source_port_first: u16,
    pub source_port_last: u16,
    /// Destination ports.
    pub ports: PortList,
    /// Outgoing interface (transport adapters resolve it).
    pub interface: Option<String>,
    pub source_mac: MacAddr,
    pub gateway_mac: MacAddr,
    /// TTL written into probe IP headers.
    pub probe_ttl: u8,
    /// Serialize packets to stdout instead of transmitting.
    pub dryrun: bool,
    /// Whether modules should require the response source port to be one
    /// of the scanned ports.
    pub validate_source_port: bool,
    /// DNS module: overwrite the first 16 qname bytes with the target IP
    /// encoded as four three-digit labels (legacy wire format).
    pub dns_ip_in_qname: bool,
    /// Allowlist/blocklist CIDR files (consumed by the oracle builder).
    pub allowlist_file: Option<PathBuf>,
    pub blocklist_file: Option<PathBuf>,
    /// Explicit list of target IPs; the iterator skips everything else.
    pub list_of_ips_file: Option<PathBuf>,
    /// IPv6 scanning inputs.
    pub ipv6_source_ip: Option<Ipv6Addr>,
    pub ipv6_target_file: Option<PathBuf>,
    /// Seed for the permutation and validation key; set for multi-machine
    /// scans so shards agree.
    pub seed: Option<u64>,
    /// Output selection.
    pub output_format: OutputFormat,
    pub output_file: Option<PathBuf>,
}

impl ScanConfig {
    /// Number of usable source ports.
    pub fn num_source_ports(&self) -> u32 {
        self.source_port_last as u32 - self.source_port_first as u32 + 1
    }

    /// Whether this run scans IPv6 targets from a file.
    pub fn is_ipv6(&self) -> bool {
        self.ipv6_target_file.is_some()
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_id: Uuid::new_v4(),
            rate: 0,
            bandwidth: 0,
            senders: 1,
            shard_num: 0,
            total_shards: 1,
            packet_streams: 1,
            max_targets: None,
            max_packets: None,
            max_runtime: None,
            cooldown: Duration::from_secs(8),
            retries: 1,
            batch_size: 64,
            probe_name: "tcp_syn".to_string(),
            probe_args: None,
            source_ips: Vec::new(),
            source_port_first: 32768,
            source_port_last: 61000,
            ports: PortList::from_ports(vec![80]),
            interface: None,
            source_mac: MacAddr::default(),
            gateway_mac: MacAddr::default(),
            probe_ttl: 255,
            dryrun: false,
            validate_source_port: true,
            dns_ip_in_qname: false,
            allowlist_file: None,
            blocklist_file: None,
            list_of_ips_file: None,
            ipv6_source_ip: None,
            ipv6_target_file: None,
            seed: None,
            output_format: OutputFormat::Json,
            output_file: None,
        }
    }
}

// =============================================================================
// Runtime state
// =============================================================================

/// Mutable cross-thread scan state: counters and cooperative stop flags.
///
/// Everything here is lock-free except `last_send_finished`, which is
/// touched once per sender thread at exit.
pub struct RuntimeState {
    /// Current global pps target. Signal handlers nudge this; the rate
    /// controllers re-read it on each measurement cycle.
    pub rate: AtomicU64,
    /// Set to stop all sender threads (max runtime, SIGINT).
    pub senders_stop: AtomicBool,
    /// Set by the monitor when the cooldown window closes; the receiver
    /// emits nothing after observing it.
    pub recv_complete: AtomicBool,
    /// Set while the post-send cooldown window is open.
    pub in_cooldown: AtomicBool,
    /// Set once the receiver is listening; senders wait for it at startup.
    pub recv_ready: AtomicBool,
    /// Orderly-shutdown request from SIGINT/SIGTERM.
    pub shutdown_requested: AtomicBool,
    /// Count of sender threads that have finished their shard.
    pub senders_done: AtomicU32,
    /// When the last sender finished, for the cooldown timer.
    pub last_send_finished: Mutex<Option<Instant>>,
    // Aggregate counters (the per-shard counters remain authoritative for
    // the per-thread view).
    pub targets_scanned: AtomicU64,
    pub packets_sent: AtomicU64,
    pub packets_failed: AtomicU64,
    pub responses_received: AtomicU64,
    pub start: Instant,
}

impl RuntimeState {
    pub fn new(rate: u64) -> Self {
        Self {
            rate: AtomicU64::new(rate),
            senders_stop: AtomicBool::new(false),
            recv_complete: AtomicBool::new(false),
            in_cooldown: AtomicBool::new(false),
            recv_ready: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            senders_done: AtomicU32::new(0),
            last_send_finished: Mutex::new(None),
            targets_scanned: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_failed: AtomicU64::new(0),
            responses_received: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    /// Multiply the live rate by `1.0 + pct`, clamping at 1 pps.
    ///
    /// Only load/store atomics - this is called from signal handlers.
    pub fn adjust_rate(&self, pct: f64) -> (u64, u64) {
        let old = self.rate.load(Ordering::Relaxed);
        let new = ((old as f64 * (1.0 + pct)) as u64).max(1);
        self.rate.store(new, Ordering::Relaxed);
        (old, new)
    }

    /// Record a sender thread's completion.
    pub fn sender_finished(&self) {
        *self
            .last_send_finished
            .lock()
            .expect("send-finish clock poisoned") = Some(Instant::now());
        self.senders_done.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Tests
// =============================================================================
