//! UDP probe module.
//!
//! Sends a fixed payload (empty by default, or supplied via probe args as
//! `text:`, `hex:`, or `file:`) to each target. Responses are either UDP
//! datagrams from the probed port or ICMP errors quoting our probe; both
//! paths re-derive the validation words from packet fields alone.

use std::io::{self, Write};
use std::net::IpAddr;

use crate::config::{MacAddr, ScanConfig};
use crate::crypto::{Validation, Validator};
use crate::output::{FieldDef, FieldSet, FieldType};
use crate::targets::PortList;

use super::packet::{
    finalize_ipv4_checksum, format_eth_header, format_ip_header, icmp_embedded_probe,
    icmp_unreach_str, ipv6_payload_checksum, write_eth, write_ipv4, write_ipv6, write_udp,
    IcmpView, Ipv4View, Ipv6View, UdpView, ETHERTYPE_IPV4, ETHERTYPE_IPV6, ETH_HLEN,
    ICMP_UNREACH, IPPROTO_ICMP, IPPROTO_UDP, IPV4_HLEN, IPV6_HLEN, PRINT_PACKET_SEP, UDP_HLEN,
};
use super::{
    PortCtx, ProbeError, ProbeModule, ProbeTarget, ProbeTargetV6, ResponseMeta, ThreadState,
};

const FIELDS: &[FieldDef] = &[
    FieldDef { name: "classification", ftype: FieldType::String, desc: "packet classification" },
    FieldDef { name: "success", ftype: FieldType::Bool, desc: "is response considered success" },
    FieldDef { name: "sport", ftype: FieldType::Int, desc: "UDP source port of response" },
    FieldDef { name: "dport", ftype: FieldType::Int, desc: "UDP destination port of response" },
    FieldDef { name: "icmp_responder", ftype: FieldType::String, desc: "Source IP of ICMP_UNREACH messages" },
    FieldDef { name: "icmp_type", ftype: FieldType::Int, desc: "icmp message type" },
    FieldDef { name: "icmp_code", ftype: FieldType::Int, desc: "icmp message sub type code" },
    FieldDef { name: "icmp_unreach_str", ftype: FieldType::String, desc: "for icmp_unreach responses, the string version of icmp_code" },
    FieldDef { name: "udp_pkt_size", ftype: FieldType::Int, desc: "UDP packet length" },
    FieldDef { name: "data", ftype: FieldType::Binary, desc: "UDP payload" },
];

/// UDP scan module.
pub struct UdpModule {
    ports: Option<PortCtx>,
    payload: Vec<u8>,
}

impl UdpModule {
    pub fn new() -> Self {
        Self {
            ports: None,
            payload: Vec::new(),
        }
    }

    fn ctx(&self) -> &PortCtx {
        self.ports.as_ref().expect("module used before global_init")
    }

    fn packet_len(&self) -> usize {
        ETH_HLEN + IPV4_HLEN + UDP_HLEN + self.payload.len()
    }
}

impl Default for UdpModule {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a UDP payload argument: `text:<str>`, `hex:<bytes>`, `file:<path>`.
pub fn parse_payload(args: Option<&str>) -> Result<Vec<u8>, ProbeError> {
    let Some(args) = args else {
        return Ok(Vec::new());
    };
    if let Some(text) = args.strip_prefix("text:") {
        return Ok(text.as_bytes().to_vec());
    }
    if let Some(hex) = args.strip_prefix("hex:") {
        let hex = hex.trim_start_matches("0x");
        if hex.len() % 2 != 0 {
            return Err(ProbeError::BadArgs(format!(
                "odd-length hex payload '{hex}'"
            )));
        }
        return (0..hex.len())
            .step_by(2)
            .map(|i| {
                u8::from_str_radix(&hex[i..i + 2], 16)
                    .map_err(|_| ProbeError::BadArgs(format!("invalid hex payload '{hex}'")))
            })
            .collect();
    }
    if let Some(path) = args.strip_prefix("file:") {
        return std::fs::read(path)
            .map_err(|e| ProbeError::BadArgs(format!("cannot read payload file {path}: {e}")));
    }
    Err(ProbeError::BadArgs(format!(
        "expected text:, hex:, or file: payload argument, got '{args}'"
    )))
}

/// Shared UDP/ICMP response validation, also used by the DNS module.
///
/// Accepts a UDP datagram answering one of our probes, or an ICMP error
/// quoting one; in the latter case the embedded probe's own coordinates
/// reproduce the validation words directly.
pub(crate) fn validate_udp_or_icmp(
    ip: &Ipv4View<'_>,
    validator: &Validator,
    ports: &PortList,
    ctx: &PortCtx,
) -> Option<ResponseMeta> {
    match ip.protocol() {
        IPPROTO_UDP => {
            let udp = UdpView::new(ip.payload())?;
            let validation = validator.words(ip.daddr(), ip.saddr(), udp.sport());
            if !ctx.check_response_dport(udp.dport(), &validation) {
                return None;
            }
            if ctx.validate_src_port && !ports.contains(udp.sport()) {
                return None;
            }
            Some(ResponseMeta {
                target: IpAddr::V4(ip.saddr()),
                validation,
            })
        }
        IPPROTO_ICMP => {
            let (_icmp, inner) = icmp_embedded_probe(ip, UDP_HLEN)?;
            if inner.protocol() != IPPROTO_UDP {
                return None;
            }
            let inner_udp = UdpView::new(inner.payload())?;
            // The embedded packet is our probe verbatim: its coordinates
            // are the PRF input, its source port must sit in the window.
            let validation = validator.words(inner.saddr(), inner.daddr(), inner_udp.dport());
            if !ctx.check_response_dport(inner_udp.sport(), &validation) {
                return None;
            }
            Some(ResponseMeta {
                target: IpAddr::V4(inner.daddr()),
                validation,
            })
        }
        _ => None,
    }
}

/// Fill the ICMP error output fields and fix up `saddr` to the probed
/// host. Shared with the DNS module.
pub(crate) fn add_icmp_fields(ip: &Ipv4View<'_>, fs: &mut FieldSet) {
    let icmp = IcmpView::new(ip.payload()).expect("validated ICMP packet");
    if let Some((_, inner)) = icmp_embedded_probe(ip, UDP_HLEN) {
        fs.set_str("saddr", inner.daddr().to_string());
    }
    fs.add_str("icmp_responder", ip.saddr().to_string());
    fs.add_uint("icmp_type", icmp.icmp_type() as u64);
    fs.add_uint("icmp_code", icmp.code() as u64);
    if icmp.icmp_type() == ICMP_UNREACH {
        fs.add_str("icmp_unreach_str", icmp_unreach_str(icmp.code()));
    } else {
        fs.add_str("icmp_unreach_str", "unknown");
    }
}

pub(crate) fn add_null_icmp_fields(fs: &mut FieldSet) {
    fs.add_null("icmp_responder");
    fs.add_null("icmp_type");
    fs.add_null("icmp_code");
    fs.add_null("icmp_unreach_str");
}

impl ProbeModule for UdpModule {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn max_packet_length(&self) -> usize {
        self.packet_len()
    }

    fn pcap_filter(&self) -> &'static str {
        "udp || icmp"
    }

    fn fields(&self) -> &'static [FieldDef] {
        FIELDS
    }

    fn global_init(&mut self, conf: &ScanConfig) -> Result<(), ProbeError> {
        self.ports = Some(PortCtx::from_config(conf));
        self.payload = parse_payload(conf.probe_args.as_deref())?;
        Ok(())
    }

    fn prepare_packet(
        &self,
        buf: &mut [u8],
        src_mac: MacAddr,
        gw_mac: MacAddr,
        _thread_state: &mut ThreadState,
    ) -> Result<(), ProbeError> {
        write_eth(buf, src_mac, gw_mac, ETHERTYPE_IPV4);
        Ok(())
    }

    fn make_packet(
        &self,
        buf: &mut [u8],
        target: &ProbeTarget,
        validation: &Validation,
        _thread_state: &mut ThreadState,
    ) -> Result<usize, ProbeError> {
        let ctx = self.ctx();
        let udp_len = (UDP_HLEN + self.payload.len()) as u16;
        write_ipv4(
            &mut buf[ETH_HLEN..],
            IPPROTO_UDP,
            IPV4_HLEN as u16 + udp_len,
            target.ttl,
            target.ip_id,
            target.saddr,
            target.daddr,
        );
        let sport = ctx.source_port(target.probe_num, validation);
        write_udp(&mut buf[ETH_HLEN + IPV4_HLEN..], sport, target.dport, udp_len);
        let payload_at = ETH_HLEN + IPV4_HLEN + UDP_HLEN;
        buf[payload_at..payload_at + self.payload.len()].copy_from_slice(&self.payload);
        finalize_ipv4_checksum(&mut buf[ETH_HLEN..]);
        Ok(self.packet_len())
    }

    fn print_packet(&self, w: &mut dyn Write, buf: &[u8]) -> io::Result<()> {
        let ip = Ipv4View::new(&buf[ETH_HLEN..]).expect("dry-run packet we just built");
        let udp = UdpView::new(ip.payload()).expect("dry-run packet we just built");
        writeln!(w, "{PRINT_PACKET_SEP}")?;
        writeln!(
            w,
            "udp {{ source: {} | dest: {} | len: {} }}",
            udp.sport(),
            udp.dport(),
            udp.len()
        )?;
        writeln!(w, "{}", format_ip_header(&ip))?;
        writeln!(w, "{}", format_eth_header(buf))?;
        writeln!(w, "{PRINT_PACKET_SEP}")
    }

    fn validate_packet(
        &self,
        pkt: &[u8],
        validator: &Validator,
        ports: &PortList,
    ) -> Option<ResponseMeta> {
        let ip = Ipv4View::new(pkt)?;
        validate_udp_or_icmp(&ip, validator, ports, self.ctx())
    }

    fn supports_ipv6(&self) -> bool {
        true
    }

    fn make_packet_v6(
        &self,
        buf: &mut [u8],
        target: &ProbeTargetV6,
        validation: &Validation,
        _thread_state: &mut ThreadState,
    ) -> Result<usize, ProbeError> {
        let ctx = self.ctx();
        let udp_len = (UDP_HLEN + self.payload.len()) as u16;
        // The prepared Ethernet header assumed IPv4; fix the EtherType.
        buf[12..14].copy_from_slice(&ETHERTYPE_IPV6.to_be_bytes());
        write_ipv6(
            &mut buf[ETH_HLEN..],
            IPPROTO_UDP,
            udp_len,
            target.hop_limit,
            &target.saddr,
            &target.daddr,
        );
        let sport = ctx.source_port(target.probe_num, validation);
        let udp_at = ETH_HLEN + IPV6_HLEN;
        write_udp(&mut buf[udp_at..], sport, target.dport, udp_len);
        buf[udp_at + UDP_HLEN..udp_at + UDP_HLEN + self.payload.len()]
            .copy_from_slice(&self.payload);
        // UDP checksum is mandatory over IPv6.
        let sum = ipv6_payload_checksum(
            &buf[udp_at..udp_at + udp_len as usize],
            &target.saddr,
            &target.daddr,
            IPPROTO_UDP,
        );
        buf[udp_at + 6..udp_at + 8].copy_from_slice(&sum.to_be_bytes());
        Ok(udp_at + udp_len as usize)
    }

    fn validate_packet_v6(
        &self,
        pkt: &[u8],
        validator: &Validator,
        ports: &PortList,
    ) -> Option<ResponseMeta> {
        let ctx = self.ctx();
        let ip = Ipv6View::new(pkt)?;
        if ip.next_header() != IPPROTO_UDP {
            return None;
        }
        let udp = UdpView::new(ip.payload())?;
        let saddr = ip.saddr();
        let daddr = ip.daddr();
        let validation = validator.words_v6(&daddr, &saddr, udp.sport());
        if !ctx.check_response_dport(udp.dport(), &validation) {
            return None;
        }
        if ctx.validate_src_port && !ports.contains(udp.sport()) {
            return None;
        }
        Some(ResponseMeta {
            target: IpAddr::V6(saddr),
            validation,
        })
    }

    fn process_packet_v6(&self, pkt: &[u8], _meta: &ResponseMeta, fs: &mut FieldSet) {
        let ip = Ipv6View::new(pkt).expect("validated packet");
        let udp = UdpView::new(ip.payload()).expect("validated packet");
        fs.add_str("classification", "udp");
        fs.add_bool("success", true);
        fs.add_uint("sport", udp.sport() as u64);
        fs.add_uint("dport", udp.dport() as u64);
        add_null_icmp_fields(fs);
        fs.add_uint("udp_pkt_size", udp.len() as u64);
        fs.add_binary("data", udp.payload().to_vec());
    }

    fn process_packet(&self, pkt: &[u8], _meta: &ResponseMeta, fs: &mut FieldSet) {
        let ip = Ipv4View::new(pkt).expect("validated packet");
        if ip.protocol() == IPPROTO_UDP {
            let udp = UdpView::new(ip.payload()).expect("validated packet");
            fs.add_str("classification", "udp");
            fs.add_bool("success", true);
            fs.add_uint("sport", udp.sport() as u64);
            fs.add_uint("dport", udp.dport() as u64);
            add_null_icmp_fields(fs);
            fs.add_uint("udp_pkt_size", udp.len() as u64);
            fs.add_binary("data", udp.payload().to_vec());
        } else {
            fs.add_str("classification", "icmp-unreach");
            fs.add_bool("success", false);
            fs.add_null("sport");
            fs.add_null("dport");
            add_icmp_fields(&ip, fs);
            fs.add_null("udp_pkt_size");
            fs.add_null("data");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
