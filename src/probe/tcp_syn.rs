//! TCP SYN probe module.
//!
//! One SYN per target. The initial sequence number carries validation
//! word 0, so a SYN-ACK (or RST) is ours exactly when its acknowledgement
//! equals that word plus one.

use std::io::{self, Write};
use std::net::IpAddr;

use crate::config::{MacAddr, ScanConfig};
use crate::crypto::{Validation, Validator};
use crate::output::{FieldDef, FieldSet, FieldType};
use crate::targets::PortList;

use super::packet::{
    finalize_ipv4_checksum, finalize_tcp_checksum, format_eth_header, format_ip_header,
    write_eth, write_ipv4, write_tcp, Ipv4View, TcpView, ETHERTYPE_IPV4, ETH_HLEN, IPPROTO_TCP,
    IPV4_HLEN, PRINT_PACKET_SEP, TCP_FLAG_SYN, TCP_HLEN,
};
use super::{PortCtx, ProbeError, ProbeModule, ProbeTarget, ResponseMeta, ThreadState};

const PACKET_LEN: usize = ETH_HLEN + IPV4_HLEN + TCP_HLEN;

const FIELDS: &[FieldDef] = &[
    FieldDef { name: "sport", ftype: FieldType::Int, desc: "TCP source port of response" },
    FieldDef { name: "dport", ftype: FieldType::Int, desc: "TCP destination port of response" },
    FieldDef { name: "seqnum", ftype: FieldType::Int, desc: "TCP sequence number of response" },
    FieldDef { name: "acknum", ftype: FieldType::Int, desc: "TCP acknowledgement number of response" },
    FieldDef { name: "window", ftype: FieldType::Int, desc: "TCP window of response" },
    FieldDef { name: "classification", ftype: FieldType::String, desc: "packet classification" },
    FieldDef { name: "success", ftype: FieldType::Bool, desc: "is response considered success" },
];

/// SYN scan module.
pub struct TcpSynModule {
    ports: Option<PortCtx>,
}

impl TcpSynModule {
    pub fn new() -> Self {
        Self { ports: None }
    }

    fn ctx(&self) -> &PortCtx {
        self.ports.as_ref().expect("module used before global_init")
    }
}

impl Default for TcpSynModule {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeModule for TcpSynModule {
    fn name(&self) -> &'static str {
        "tcp_syn"
    }

    fn max_packet_length(&self) -> usize {
        PACKET_LEN
    }

    fn pcap_filter(&self) -> &'static str {
        // SYN-ACKs and RSTs only
        "tcp && (tcp[13] & 4 != 0 || tcp[13] == 18)"
    }

    fn fields(&self) -> &'static [FieldDef] {
        FIELDS
    }

    fn global_init(&mut self, conf: &ScanConfig) -> Result<(), ProbeError> {
        self.ports = Some(PortCtx::from_config(conf));
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
        write_ipv4(
            &mut buf[ETH_HLEN..],
            IPPROTO_TCP,
            (IPV4_HLEN + TCP_HLEN) as u16,
            target.ttl,
            target.ip_id,
            target.saddr,
            target.daddr,
        );
        let sport = ctx.source_port(target.probe_num, validation);
        write_tcp(
            &mut buf[ETH_HLEN + IPV4_HLEN..],
            sport,
            target.dport,
            validation.word(0),
            0,
            TCP_FLAG_SYN,
            65535,
        );
        finalize_tcp_checksum(
            &mut buf[ETH_HLEN + IPV4_HLEN..ETH_HLEN + IPV4_HLEN + TCP_HLEN],
            target.saddr,
            target.daddr,
        );
        finalize_ipv4_checksum(&mut buf[ETH_HLEN..]);
        Ok(PACKET_LEN)
    }

    fn print_packet(&self, w: &mut dyn Write, buf: &[u8]) -> io::Result<()> {
        let ip = Ipv4View::new(&buf[ETH_HLEN..]).expect("dry-run packet we just built");
        let tcp = TcpView::new(ip.payload()).expect("dry-run packet we just built");
        writeln!(w, "{PRINT_PACKET_SEP}")?;
        writeln!(
            w,
            "tcp {{ source: {} | dest: {} | seq: {} | checksum: {:#06X} }}",
            tcp.sport(),
            tcp.dport(),
            tcp.seq(),
            u16::from_be_bytes([ip.payload()[16], ip.payload()[17]])
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
        let ctx = self.ctx();
        let ip = Ipv4View::new(pkt)?;
        if ip.protocol() != IPPROTO_TCP {
            return None;
        }
        let tcp = TcpView::new(ip.payload())?;
        // The response flips the probe's coordinates: its source is the
        // target, its destination is us, its source port is the probed
        // port.
        let validation = validator.words(ip.daddr(), ip.saddr(), tcp.sport());
        if !ctx.check_response_dport(tcp.dport(), &validation) {
            return None;
        }
        if ctx.validate_src_port && !ports.contains(tcp.sport()) {
            return None;
        }
        if tcp.ack() != validation.word(0).wrapping_add(1) {
            return None;
        }
        Some(ResponseMeta {
            target: IpAddr::V4(ip.saddr()),
            validation,
        })
    }

    fn process_packet(&self, pkt: &[u8], _meta: &ResponseMeta, fs: &mut FieldSet) {
        let ip = Ipv4View::new(pkt).expect("validated packet");
        let tcp = TcpView::new(ip.payload()).expect("validated packet");
        fs.add_uint("sport", tcp.sport() as u64);
        fs.add_uint("dport", tcp.dport() as u64);
        fs.add_uint("seqnum", tcp.seq() as u64);
        fs.add_uint("acknum", tcp.ack() as u64);
        fs.add_uint("window", tcp.window() as u64);
        if tcp.is_rst() {
            fs.add_str("classification", "rst");
            fs.add_bool("success", false);
        } else {
            fs.add_str("classification", "synack");
            fs.add_bool("success", true);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
