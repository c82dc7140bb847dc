//! Receiver thread: capture, validate, dedup, classify, emit.
//!
//! A single consumer drains the capture path. Each frame is stripped to
//! its IP packet and offered to the probe module; accepted responses are
//! deduplicated against the seen-set (a bitmap over allowed-address
//! ordinals for IPv4, a hash-set for IPv6), stamped with the shared IP and
//! system fields, and handed to the output sink. The capture call carries
//! a bounded timeout so the loop observes the completion flag promptly,
//! and nothing is emitted once it is set.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::config::{RuntimeState, ScanConfig};
use crate::crypto::Validator;
use crate::output::{FieldSet, OutputSink};
use crate::probe::packet::{Ipv4View, Ipv6View, ETHERTYPE_IPV4, ETHERTYPE_IPV6, ETH_HLEN};
use crate::probe::ProbeModule;
use crate::targets::{AddressOracle, PagedBitmap};
use crate::transport::{Captured, PacketCapture};

const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Everything the receiver thread shares with the rest of the scan.
pub struct ReceiverContext {
    pub config: Arc<ScanConfig>,
    pub runtime: Arc<RuntimeState>,
    pub module: Arc<dyn ProbeModule>,
    pub validator: Validator,
    pub oracle: Arc<dyn AddressOracle>,
    pub sink: Arc<OutputSink>,
}

/// Receiver-local dedup state; only this thread ever touches it.
///
/// IPv4 is a paged bitmap over allowed-address ordinals; IPv6 targets
/// come from a file of unknown shape, so a hash-set serves there.
struct SeenSet {
    v4: PagedBitmap,
    v6: HashSet<Ipv6Addr>,
}

impl SeenSet {
    fn new(_allowed: u64) -> Self {
        Self {
            v4: PagedBitmap::new(),
            v6: HashSet::new(),
        }
    }

    /// Record `target`; returns `(is_repeat, known_target)`.
    fn record(&mut self, target: IpAddr, oracle: &dyn AddressOracle) -> (bool, bool) {
        match target {
            IpAddr::V4(ip) => match oracle.ordinal(ip) {
                Some(ord) => {
                    let ord = ord as u32;
                    let repeat = self.v4.check(ord);
                    if !repeat {
                        self.v4.set(ord);
                    }
                    (repeat, true)
                }
                // A response credited to an address we never probe.
                None => (false, false),
            },
            IpAddr::V6(ip) => (!self.v6.insert(ip), true),
        }
    }
}

/// Run the receiver until the cooldown window closes.
pub fn run_receiver(ctx: &ReceiverContext, capture: &mut dyn PacketCapture) {
    let runtime = &ctx.runtime;
    let mut seen = SeenSet::new(ctx.oracle.count_allowed());
    let mut write_errors = 0u64;

    runtime.recv_ready.store(true, Ordering::SeqCst);
    tracing::debug!(filter = ctx.module.pcap_filter(), "receiver listening");

    while !runtime.recv_complete.load(Ordering::Relaxed) {
        let Some(cap) = capture.capture_next(POLL_TIMEOUT) else {
            continue;
        };
        handle_frame(ctx, &mut seen, &cap, &mut write_errors);
    }
    if let Err(e) = ctx.sink.flush() {
        tracing::warn!(error = %e, "output flush failed at receiver shutdown");
    }
    tracing::debug!(
        records = ctx.sink.records_written(),
        "receiver thread finished"
    );
}

fn handle_frame(ctx: &ReceiverContext, seen: &mut SeenSet, cap: &Captured, write_errors: &mut u64) {
    let data = &cap.data;
    if data.len() <= ETH_HLEN {
        return;
    }
    let ethertype = u16::from_be_bytes([data[12], data[13]]);
    let pkt = &data[ETH_HLEN..];

    let (meta, v6) = match ethertype {
        ETHERTYPE_IPV4 => match ctx
            .module
            .validate_packet(pkt, &ctx.validator, &ctx.config.ports)
        {
            Some(meta) => (meta, false),
            None => return,
        },
        ETHERTYPE_IPV6 => match ctx
            .module
            .validate_packet_v6(pkt, &ctx.validator, &ctx.config.ports)
        {
            Some(meta) => (meta, true),
            None => return,
        },
        _ => return,
    };

    ctx.runtime.responses_received.fetch_add(1, Ordering::Relaxed);
    let (repeat, known) = seen.record(meta.target, ctx.oracle.as_ref());
    if !known {
        return;
    }

    let mut fs = FieldSet::new();
    if v6 {
        add_ipv6_fields(pkt, &mut fs);
        ctx.module.process_packet_v6(pkt, &meta, &mut fs);
    } else {
        add_ipv4_fields(pkt, &mut fs);
        ctx.module.process_packet(pkt, &meta, &mut fs);
    }
    add_system_fields(
        &mut fs,
        repeat,
        ctx.runtime.in_cooldown.load(Ordering::Relaxed),
        cap.ts.into(),
    );

    // The window may have closed while this packet was in flight; emit
    // nothing after completion.
    if ctx.runtime.recv_complete.load(Ordering::Relaxed) {
        return;
    }
    if let Err(e) = ctx.sink.write_record(&fs) {
        *write_errors += 1;
        if write_errors.is_power_of_two() {
            tracing::warn!(failures = *write_errors, error = %e, "record write failed");
        }
    }
}

/// Shared IP-layer fields for an IPv4 response.
fn add_ipv4_fields(pkt: &[u8], fs: &mut FieldSet) {
    let ip = Ipv4View::new(pkt).expect("validated packet");
    fs.add_str("saddr", ip.saddr().to_string());
    fs.add_uint("saddr_raw", u32::from(ip.saddr()).swap_bytes() as u64);
    fs.add_str("daddr", ip.daddr().to_string());
    fs.add_uint("daddr_raw", u32::from(ip.daddr()).swap_bytes() as u64);
    fs.add_uint("ipid", ip.id() as u64);
    fs.add_uint("ttl", ip.ttl() as u64);
}

/// Shared IP-layer fields for an IPv6 response. The raw-integer and ip-id
/// columns do not exist in v6; they stay zero so the schema lines up.
fn add_ipv6_fields(pkt: &[u8], fs: &mut FieldSet) {
    let ip = Ipv6View::new(pkt).expect("validated packet");
    fs.add_str("saddr", ip.saddr().to_string());
    fs.add_uint("saddr_raw", 0);
    fs.add_str("daddr", ip.daddr().to_string());
    fs.add_uint("daddr_raw", 0);
    fs.add_uint("ipid", 0);
    fs.add_uint("ttl", ip.hop_limit() as u64);
}

fn add_system_fields(fs: &mut FieldSet, repeat: bool, cooldown: bool, ts: DateTime<Utc>) {
    fs.add_bool("repeat", repeat);
    fs.add_bool("cooldown", cooldown);
    fs.add_str(
        "timestamp_str",
        ts.to_rfc3339_opts(SecondsFormat::Micros, true),
    );
    fs.add_uint("timestamp_ts", ts.timestamp() as u64);
    fs.add_uint("timestamp_us", ts.timestamp_subsec_micros() as u64);
}

// =============================================================================
// Tests
// =============================================================================
