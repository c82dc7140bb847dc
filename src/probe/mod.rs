//! Probe module contract and registry.
//!
//! Every scan protocol plugs in through [`ProbeModule`]: build the packet
//! for a target, decide whether a captured packet is a response to one of
//! our probes, and extract output fields. Modules are selected by name
//! from the registry; the engine and receiver only ever see the trait.

pub mod dns;
pub mod icmp_echo;
pub mod packet;
pub mod tcp_syn;
pub mod udp;

use std::any::Any;
use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

use crate::config::{MacAddr, ScanConfig};
use crate::crypto::{Validation, Validator};
use crate::output::{FieldDef, FieldSet};
use crate::targets::PortList;

/// Error from a probe module.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid probe arguments: {0}")]
    BadArgs(String),

    #[error("probe module initialization failed: {0}")]
    Init(String),

    #[error("module produced a {len} byte packet, above the {max} limit")]
    Oversized { len: usize, max: usize },
}

/// Coordinates of one outgoing probe.
#[derive(Debug, Clone, Copy)]
pub struct ProbeTarget {
    pub saddr: Ipv4Addr,
    pub daddr: Ipv4Addr,
    /// Destination port in host order; 0 for portless modules.
    pub dport: u16,
    pub ttl: u8,
    /// Probe stream index, `0..packet_streams`.
    pub probe_num: u16,
    /// IP identification value (low bits of the last validation word).
    pub ip_id: u16,
}

/// Coordinates of one outgoing IPv6 probe.
#[derive(Debug, Clone, Copy)]
pub struct ProbeTargetV6 {
    pub saddr: Ipv6Addr,
    pub daddr: Ipv6Addr,
    pub dport: u16,
    pub hop_limit: u8,
    pub probe_num: u16,
}

/// What a module reports about a captured packet it accepted.
#[derive(Debug, Clone, Copy)]
pub struct ResponseMeta {
    /// The scanned target this response is credited to. For ICMP error
    /// responses this is the embedded probe's destination, not the
    /// responding router.
    pub target: IpAddr,
    /// Validation words the original probe was built with.
    pub validation: Validation,
}

/// Opaque per-thread module state (e.g. an RNG for templated payloads).
pub type ThreadState = Box<dyn Any + Send>;

/// The capability set every protocol module implements.
///
/// `global_init` runs once before threads start; afterwards the module is
/// shared immutably between the sender threads and the receiver.
pub trait ProbeModule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Largest packet this module can emit, for batch buffer sizing and
    /// bandwidth -> rate conversion.
    fn max_packet_length(&self) -> usize;

    /// BPF expression handed to the capture adapter.
    fn pcap_filter(&self) -> &'static str;

    /// Whether the destination port is a per-target input.
    fn port_args(&self) -> bool {
        true
    }

    /// Module-specific output schema, in emission order.
    fn fields(&self) -> &'static [FieldDef];

    /// Parse module args and derive shared immutable state.
    fn global_init(&mut self, _conf: &ScanConfig) -> Result<(), ProbeError> {
        Ok(())
    }

    /// Per-sender-thread state.
    fn thread_init(&self) -> Result<ThreadState, ProbeError> {
        Ok(Box::new(()))
    }

    /// Write the invariant packet prefix (headers that never change per
    /// target) into a batch slot.
    fn prepare_packet(
        &self,
        buf: &mut [u8],
        src_mac: MacAddr,
        gw_mac: MacAddr,
        thread_state: &mut ThreadState,
    ) -> Result<(), ProbeError>;

    /// Patch per-target fields and checksums; returns the packet length.
    fn make_packet(
        &self,
        buf: &mut [u8],
        target: &ProbeTarget,
        validation: &Validation,
        thread_state: &mut ThreadState,
    ) -> Result<usize, ProbeError>;

    /// Dry-run dump of a built packet.
    fn print_packet(&self, w: &mut dyn Write, buf: &[u8]) -> io::Result<()>;

    /// Decide whether `pkt` (starting at the IP header) answers one of our
    /// probes. Modules recompute the validation words from packet fields
    /// via `validator`; `ports` is the scanned destination port set.
    fn validate_packet(
        &self,
        pkt: &[u8],
        validator: &Validator,
        ports: &PortList,
    ) -> Option<ResponseMeta>;

    /// Extract module output fields from a validated packet.
    fn process_packet(&self, pkt: &[u8], meta: &ResponseMeta, fs: &mut FieldSet);

    /// Whether the module can build and validate IPv6 probes.
    fn supports_ipv6(&self) -> bool {
        false
    }

    /// IPv6 variant of `make_packet`. Only called when `supports_ipv6`.
    fn make_packet_v6(
        &self,
        _buf: &mut [u8],
        _target: &ProbeTargetV6,
        _validation: &Validation,
        _thread_state: &mut ThreadState,
    ) -> Result<usize, ProbeError> {
        Err(ProbeError::Init(format!(
            "probe module {} does not support IPv6",
            self.name()
        )))
    }

    /// IPv6 variant of `validate_packet`; `pkt` starts at the IPv6 header.
    fn validate_packet_v6(
        &self,
        _pkt: &[u8],
        _validator: &Validator,
        _ports: &PortList,
    ) -> Option<ResponseMeta> {
        None
    }

    /// Extract output fields from a validated IPv6 packet.
    fn process_packet_v6(&self, _pkt: &[u8], _meta: &ResponseMeta, _fs: &mut FieldSet) {}

    /// Teardown hook.
    fn close(&self) {}
}

// =============================================================================
// Registry
// =============================================================================

/// Names of all registered probe modules.
pub const MODULE_NAMES: &[&str] = &["tcp_syn", "icmp_echo", "udp", "dns"];

/// Instantiate a module by name. The caller runs `global_init` before
/// sharing it.
pub fn create_module(name: &str) -> Option<Box<dyn ProbeModule>> {
    match name {
        "tcp_syn" => Some(Box::new(tcp_syn::TcpSynModule::new())),
        "icmp_echo" => Some(Box::new(icmp_echo::IcmpEchoModule::new())),
        "udp" => Some(Box::new(udp::UdpModule::new())),
        "dns" => Some(Box::new(dns::DnsModule::new())),
        _ => None,
    }
}

// =============================================================================
// Shared source-port discipline
// =============================================================================

/// Source-port window parameters shared by every port-carrying module.
///
/// The source port of probe `i` is `first + (V[1] + i) % count`; a response
/// must come back to a port inside the window `[V[1], V[1] + streams - 1]`
/// (mod count). Captured at `global_init` from the scan config.
#[derive(Debug, Clone, Copy)]
pub struct PortCtx {
    pub first: u16,
    pub last: u16,
    pub count: u32,
    pub streams: u16,
    pub validate_src_port: bool,
}

impl PortCtx {
    pub fn from_config(conf: &ScanConfig) -> Self {
        Self {
            first: conf.source_port_first,
            last: conf.source_port_last,
            count: conf.num_source_ports(),
            streams: conf.packet_streams,
            validate_src_port: conf.validate_source_port,
        }
    }

    /// Source port used for probe stream `probe_num`.
    pub fn source_port(&self, probe_num: u16, validation: &Validation) -> u16 {
        let off = (validation.word(1) as u64 + probe_num as u64) % self.count as u64;
        self.first + off as u16
    }

    /// Whether a response destination port (our source port) lands inside
    /// the expected window for these validation words.
    pub fn check_response_dport(&self, port: u16, validation: &Validation) -> bool {
        if port < self.first || port > self.last {
            return false;
        }
        let to_validate = (port - self.first) as u32;
        let min = validation.word(1) % self.count;
        let max =
            ((validation.word(1) as u64 + self.streams as u64 - 1) % self.count as u64) as u32;
        if min <= max {
            to_validate >= min && to_validate <= max
        } else {
            // window wraps the end of the range
            to_validate <= max || to_validate >= min
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Validator;

    fn ctx(first: u16, last: u16, streams: u16) -> PortCtx {
        PortCtx {
            first,
            last,
            count: (last - first + 1) as u32,
            streams,
            validate_src_port: true,
        }
    }

    fn words() -> Validation {
        Validator::new([7u8; 16]).words(
            Ipv4Addr::new(192, 0, 2, 1),
            Ipv4Addr::new(198, 51, 100, 1),
            443,
        )
    }

    #[test]
    fn test_registry_knows_all_modules() {
        for name in MODULE_NAMES {
            assert!(create_module(name).is_some(), "module {name} missing");
        }
        assert!(create_module("quic").is_none());
    }

    #[test]
    fn test_source_port_in_range() {
        let c = ctx(32768, 61000, 1);
        let v = words();
        for probe_num in 0..4 {
            let p = c.source_port(probe_num, &v);
            assert!(p >= c.first && p <= c.last);
        }
    }

    #[test]
    fn test_source_port_accepted_by_window() {
        let c = ctx(32768, 61000, 4);
        let v = words();
        for probe_num in 0..4 {
            let p = c.source_port(probe_num, &v);
            assert!(
                c.check_response_dport(p, &v),
                "port {p} for stream {probe_num} must validate"
            );
        }
    }

    #[test]
    fn test_window_rejects_outside_range() {
        let c = ctx(32768, 61000, 1);
        let v = words();
        assert!(!c.check_response_dport(32767, &v));
        assert!(!c.check_response_dport(61001, &v));
    }

    #[test]
    fn test_window_rejects_wrong_offset() {
        let c = ctx(40000, 40063, 1);
        let v = words();
        let good = c.source_port(0, &v);
        let bad = if good == c.last { c.first } else { good + 1 };
        assert!(!c.check_response_dport(bad, &v));
    }

    #[test]
    fn test_window_wraparound() {
        // count=8, V1 % 8 could be anything; force a wrapping window by
        // using enough streams to cross the end.
        let c = ctx(1000, 1007, 6);
        let v = words();
        let min = v.word(1) % 8;
        for s in 0..6u32 {
            let off = (v.word(1) + s) % 8;
            assert!(
                c.check_response_dport(1000 + off as u16, &v),
                "offset {off} inside window (min={min})"
            );
        }
        let outside = (v.word(1) + 6) % 8;
        assert!(!c.check_response_dport(1000 + outside as u16, &v));
    }
}
