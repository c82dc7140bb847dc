//! ICMP echo (ping) probe module.
//!
//! Portless: one echo request per address. The echo identifier carries
//! validation word 2, so replies validate without any state. Unreachable
//! and time-exceeded errors that quote our request are re-validated
//! against the embedded packet and classified accordingly.

use std::io::{self, Write};
use std::net::IpAddr;

use crate::config::{MacAddr, ScanConfig};
use crate::crypto::{Validation, Validator};
use crate::output::{FieldDef, FieldSet, FieldType};
use crate::targets::PortList;

use super::packet::{
    finalize_icmp_checksum, finalize_ipv4_checksum, format_eth_header, format_ip_header,
    icmp_embedded_probe, icmp_unreach_str, write_eth, write_icmp_echo, write_ipv4, IcmpView,
    Ipv4View, ETHERTYPE_IPV4, ETH_HLEN, ICMP_ECHO_REPLY, ICMP_ECHO_REQUEST, ICMP_HLEN,
    ICMP_REDIRECT, ICMP_SOURCE_QUENCH, ICMP_TIME_EXCEEDED, ICMP_UNREACH, IPPROTO_ICMP,
    IPV4_HLEN, PRINT_PACKET_SEP,
};
use super::{ProbeError, ProbeModule, ProbeTarget, ResponseMeta, ThreadState};

const PACKET_LEN: usize = ETH_HLEN + IPV4_HLEN + ICMP_HLEN;

const FIELDS: &[FieldDef] = &[
    FieldDef { name: "icmp_type", ftype: FieldType::Int, desc: "icmp message type" },
    FieldDef { name: "icmp_code", ftype: FieldType::Int, desc: "icmp message sub type code" },
    FieldDef { name: "icmp_id", ftype: FieldType::Int, desc: "icmp echo identifier" },
    FieldDef { name: "icmp_seq", ftype: FieldType::Int, desc: "icmp echo sequence number" },
    FieldDef { name: "classification", ftype: FieldType::String, desc: "packet classification" },
    FieldDef { name: "success", ftype: FieldType::Bool, desc: "is response considered success" },
];

/// Echo scan module.
pub struct IcmpEchoModule;

impl IcmpEchoModule {
    pub fn new() -> Self {
        Self
    }

    fn ident(validation: &Validation) -> u16 {
        (validation.word(2) & 0xFFFF) as u16
    }
}

impl Default for IcmpEchoModule {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeModule for IcmpEchoModule {
    fn name(&self) -> &'static str {
        "icmp_echo"
    }

    fn max_packet_length(&self) -> usize {
        PACKET_LEN
    }

    fn pcap_filter(&self) -> &'static str {
        "icmp and icmp[0]!=8"
    }

    fn port_args(&self) -> bool {
        false
    }

    fn fields(&self) -> &'static [FieldDef] {
        FIELDS
    }

    fn global_init(&mut self, _conf: &ScanConfig) -> Result<(), ProbeError> {
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
        write_ipv4(
            &mut buf[ETH_HLEN..],
            IPPROTO_ICMP,
            (IPV4_HLEN + ICMP_HLEN) as u16,
            target.ttl,
            target.ip_id,
            target.saddr,
            target.daddr,
        );
        write_icmp_echo(
            &mut buf[ETH_HLEN + IPV4_HLEN..],
            Self::ident(validation),
            target.probe_num,
        );
        finalize_icmp_checksum(&mut buf[ETH_HLEN + IPV4_HLEN..ETH_HLEN + IPV4_HLEN + ICMP_HLEN]);
        finalize_ipv4_checksum(&mut buf[ETH_HLEN..]);
        Ok(PACKET_LEN)
    }

    fn print_packet(&self, w: &mut dyn Write, buf: &[u8]) -> io::Result<()> {
        let ip = Ipv4View::new(&buf[ETH_HLEN..]).expect("dry-run packet we just built");
        let icmp = IcmpView::new(ip.payload()).expect("dry-run packet we just built");
        writeln!(w, "{PRINT_PACKET_SEP}")?;
        writeln!(
            w,
            "icmp {{ type: {} | code: {} | id: {} | seq: {} }}",
            icmp.icmp_type(),
            icmp.code(),
            icmp.ident(),
            icmp.seq()
        )?;
        writeln!(w, "{}", format_ip_header(&ip))?;
        writeln!(w, "{}", format_eth_header(buf))?;
        writeln!(w, "{PRINT_PACKET_SEP}")
    }

    fn validate_packet(
        &self,
        pkt: &[u8],
        validator: &Validator,
        _ports: &PortList,
    ) -> Option<ResponseMeta> {
        let ip = Ipv4View::new(pkt)?;
        if ip.protocol() != IPPROTO_ICMP {
            return None;
        }
        let icmp = IcmpView::new(ip.payload())?;
        match icmp.icmp_type() {
            ICMP_ECHO_REPLY => {
                let validation = validator.words(ip.daddr(), ip.saddr(), 0);
                if icmp.ident() != Self::ident(&validation) {
                    return None;
                }
                Some(ResponseMeta {
                    target: IpAddr::V4(ip.saddr()),
                    validation,
                })
            }
            ICMP_UNREACH | ICMP_SOURCE_QUENCH | ICMP_REDIRECT | ICMP_TIME_EXCEEDED => {
                // Error message quoting our echo request: re-validate the
                // embedded probe as if it were the original.
                let (_outer, inner) = icmp_embedded_probe(&ip, ICMP_HLEN)?;
                if inner.protocol() != IPPROTO_ICMP {
                    return None;
                }
                let inner_icmp = IcmpView::new(inner.payload())?;
                if inner_icmp.icmp_type() != ICMP_ECHO_REQUEST {
                    return None;
                }
                let validation = validator.words(inner.saddr(), inner.daddr(), 0);
                if inner_icmp.ident() != Self::ident(&validation) {
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

    fn process_packet(&self, pkt: &[u8], _meta: &ResponseMeta, fs: &mut FieldSet) {
        let ip = Ipv4View::new(pkt).expect("validated packet");
        let icmp = IcmpView::new(ip.payload()).expect("validated packet");
        fs.add_uint("icmp_type", icmp.icmp_type() as u64);
        fs.add_uint("icmp_code", icmp.code() as u64);
        fs.add_uint("icmp_id", icmp.ident() as u64);
        fs.add_uint("icmp_seq", icmp.seq() as u64);
        match icmp.icmp_type() {
            ICMP_ECHO_REPLY => {
                fs.add_str("classification", "echoreply");
                fs.add_bool("success", true);
            }
            ICMP_UNREACH => {
                // Credit the response to the probed host, not the router
                // that answered for it.
                if let Some((_, inner)) = icmp_embedded_probe(&ip, ICMP_HLEN) {
                    fs.set_str("saddr", inner.daddr().to_string());
                }
                fs.add_str("classification", icmp_unreach_str(icmp.code()));
                fs.add_bool("success", false);
            }
            ICMP_TIME_EXCEEDED => {
                if let Some((_, inner)) = icmp_embedded_probe(&ip, ICMP_HLEN) {
                    fs.set_str("saddr", inner.daddr().to_string());
                }
                fs.add_str("classification", "timxceed");
                fs.add_bool("success", false);
            }
            _ => {
                fs.add_str("classification", "other");
                fs.add_bool("success", false);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
