//! DNS probe module: scans for open UDP resolvers.
//!
//! Takes probe args of the form `"A,example.com"` or several questions
//! joined with `;` (`"A,example.com;AAAA,www.example.org"`); with multiple
//! questions, `packet_streams` must be a multiple of the question count and
//! probe stream `i` asks question `i % count`. Appending `:nr` to a qtype
//! (`"A:nr,example.com"`) clears the recursion-desired bit.
//!
//! Response handling is deliberately shallow: a packet counts as `success`
//! when the transaction id and the echoed question match what we sent, and
//! `app_success` additionally requires `qr=1, rcode=0`. Everything else -
//! including full section parsing into repeated fieldsets - is extraction,
//! not validation; deep analysis belongs offline.

use std::io::{self, Write};
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::config::{MacAddr, ScanConfig};
use crate::crypto::{Validation, Validator};
use crate::output::{FieldDef, FieldSet, FieldType};
use crate::targets::PortList;

use super::packet::{
    finalize_ipv4_checksum, format_eth_header, format_ip_header, write_eth, write_ipv4,
    write_udp, Ipv4View, UdpView, ETHERTYPE_IPV4, ETH_HLEN, IPPROTO_UDP, IPV4_HLEN,
    PRINT_PACKET_SEP, UDP_HLEN,
};
use super::udp::{add_icmp_fields, add_null_icmp_fields, validate_udp_or_icmp};
use super::{PortCtx, ProbeError, ProbeModule, ProbeTarget, ResponseMeta, ThreadState};

const DNS_HLEN: usize = 12;
const QUESTION_TAIL: usize = 4; // qtype + qclass
const DNS_PAYLOAD_LIMIT: usize = 512;
const MAX_NAME_LENGTH: usize = 512;
const MAX_POINTER_JUMPS: usize = 10;
/// Length of the IP-in-qname prefix: four labels of `\x03` + 3 digits.
const IP_QNAME_LEN: usize = 16;

const DEFAULT_DOMAIN: &str = "www.google.com";

const FIELDS: &[FieldDef] = &[
    FieldDef { name: "sport", ftype: FieldType::Int, desc: "UDP source port of response" },
    FieldDef { name: "dport", ftype: FieldType::Int, desc: "UDP destination port of response" },
    FieldDef { name: "classification", ftype: FieldType::String, desc: "packet classification" },
    FieldDef { name: "success", ftype: FieldType::Bool, desc: "did the response echo our transaction id and question" },
    FieldDef { name: "app_success", ftype: FieldType::Bool, desc: "was the response a well-formed answer (qr=1, rcode=0)" },
    FieldDef { name: "icmp_responder", ftype: FieldType::String, desc: "Source IP of ICMP_UNREACH messages" },
    FieldDef { name: "icmp_type", ftype: FieldType::Int, desc: "icmp message type" },
    FieldDef { name: "icmp_code", ftype: FieldType::Int, desc: "icmp message sub type code" },
    FieldDef { name: "icmp_unreach_str", ftype: FieldType::String, desc: "string version of icmp_code" },
    FieldDef { name: "udp_len", ftype: FieldType::Int, desc: "UDP packet length" },
    FieldDef { name: "dns_id", ftype: FieldType::Int, desc: "DNS transaction id" },
    FieldDef { name: "dns_rd", ftype: FieldType::Int, desc: "recursion desired bit" },
    FieldDef { name: "dns_tc", ftype: FieldType::Int, desc: "truncated bit" },
    FieldDef { name: "dns_aa", ftype: FieldType::Int, desc: "authoritative answer bit" },
    FieldDef { name: "dns_opcode", ftype: FieldType::Int, desc: "DNS opcode" },
    FieldDef { name: "dns_qr", ftype: FieldType::Int, desc: "query/response bit" },
    FieldDef { name: "dns_rcode", ftype: FieldType::Int, desc: "DNS response code" },
    FieldDef { name: "dns_cd", ftype: FieldType::Int, desc: "checking disabled bit" },
    FieldDef { name: "dns_ad", ftype: FieldType::Int, desc: "authenticated data bit" },
    FieldDef { name: "dns_z", ftype: FieldType::Int, desc: "reserved bit" },
    FieldDef { name: "dns_ra", ftype: FieldType::Int, desc: "recursion available bit" },
    FieldDef { name: "dns_qdcount", ftype: FieldType::Int, desc: "number of questions" },
    FieldDef { name: "dns_ancount", ftype: FieldType::Int, desc: "number of answers" },
    FieldDef { name: "dns_nscount", ftype: FieldType::Int, desc: "number of authority records" },
    FieldDef { name: "dns_arcount", ftype: FieldType::Int, desc: "number of additional records" },
    FieldDef { name: "dns_questions", ftype: FieldType::Repeated, desc: "question section" },
    FieldDef { name: "dns_answers", ftype: FieldType::Repeated, desc: "answer section" },
    FieldDef { name: "dns_authorities", ftype: FieldType::Repeated, desc: "authority section" },
    FieldDef { name: "dns_additionals", ftype: FieldType::Repeated, desc: "additional section" },
    FieldDef { name: "dns_parse_err", ftype: FieldType::Int, desc: "did section parsing hit malformed data" },
    FieldDef { name: "dns_unconsumed_bytes", ftype: FieldType::Int, desc: "bytes left after parsing all sections" },
];

// =============================================================================
// Query types
// =============================================================================

const QTYPES: &[(&str, u16)] = &[
    ("A", 1),
    ("NS", 2),
    ("CNAME", 5),
    ("SOA", 6),
    ("PTR", 12),
    ("MX", 15),
    ("TXT", 16),
    ("AAAA", 28),
    ("RRSIG", 46),
    ("ALL", 255),
];

fn qtype_code(s: &str) -> Option<u16> {
    QTYPES.iter().find(|(n, _)| *n == s).map(|(_, c)| *c)
}

fn qtype_str(code: u16) -> &'static str {
    QTYPES
        .iter()
        .find(|(_, c)| *c == code)
        .map(|(n, _)| *n)
        .unwrap_or("BAD QTYPE")
}

// =============================================================================
// Module
// =============================================================================

struct Question {
    qname: Vec<u8>,
    qtype: u16,
    /// Complete DNS payload: header + qname + qtype/qclass, id zeroed.
    packet: Vec<u8>,
}

/// DNS resolver scan module.
pub struct DnsModule {
    ports: Option<PortCtx>,
    questions: Vec<Question>,
    ip_in_qname: bool,
    max_payload: usize,
}

impl DnsModule {
    pub fn new() -> Self {
        Self {
            ports: None,
            questions: Vec::new(),
            ip_in_qname: false,
            max_payload: 0,
        }
    }

    fn ctx(&self) -> &PortCtx {
        self.ports.as_ref().expect("module used before global_init")
    }

    fn question_for(&self, probe_num: u16) -> &Question {
        &self.questions[probe_num as usize % self.questions.len()]
    }
}

impl Default for DnsModule {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a domain as a DNS qname: length-prefixed labels, trailing zero.
fn domain_to_qname(domain: &str) -> Vec<u8> {
    let mut qname = Vec::with_capacity(domain.len() + 2);
    for label in domain.split('.') {
        qname.push(label.len() as u8);
        qname.extend_from_slice(label.as_bytes());
    }
    qname.push(0);
    qname
}

/// Encode an IPv4 address as four `\x03` + zero-padded-decimal labels.
fn encode_ip_in_qname(ip: Ipv4Addr) -> [u8; IP_QNAME_LEN] {
    let mut out = [0u8; IP_QNAME_LEN];
    for (i, octet) in ip.octets().iter().enumerate() {
        out[i * 4] = 3;
        let digits = format!("{octet:03}");
        out[i * 4 + 1..i * 4 + 4].copy_from_slice(digits.as_bytes());
    }
    out
}

fn build_question(domain: &str, qtype: u16, recurse: bool) -> Result<Question, ProbeError> {
    if domain.is_empty() {
        return Err(ProbeError::BadArgs("domain cannot be empty".to_string()));
    }
    let qname = domain_to_qname(domain);
    let len = DNS_HLEN + qname.len() + QUESTION_TAIL;
    if len > DNS_PAYLOAD_LIMIT {
        return Err(ProbeError::BadArgs(format!(
            "DNS packet for '{domain}' is {len} bytes, above the {DNS_PAYLOAD_LIMIT} limit"
        )));
    }
    let mut packet = vec![0u8; len];
    if recurse {
        packet[2] |= 0x01; // rd
    }
    packet[4..6].copy_from_slice(&1u16.to_be_bytes()); // qdcount
    packet[DNS_HLEN..DNS_HLEN + qname.len()].copy_from_slice(&qname);
    let tail = DNS_HLEN + qname.len();
    packet[tail..tail + 2].copy_from_slice(&qtype.to_be_bytes());
    packet[tail + 2..tail + 4].copy_from_slice(&1u16.to_be_bytes()); // qclass IN
    Ok(Question {
        qname,
        qtype,
        packet,
    })
}

/// Parse `"A,example.com;AAAA:nr,example.org"` into questions.
fn parse_questions(args: &str) -> Result<Vec<Question>, ProbeError> {
    let mut questions = Vec::new();
    for part in args.trim_matches(';').split(';') {
        let (qtype_part, domain) = part.split_once(',').ok_or_else(|| {
            ProbeError::BadArgs(format!(
                "expected \"QTYPE,domain\" (e.g. \"A,example.com\"), got '{part}'"
            ))
        })?;
        let (qtype_name, recurse) = match qtype_part.split_once(':') {
            Some((name, "nr")) => (name, false),
            Some((name, other)) => {
                tracing::warn!(
                    qtype = name,
                    option = other,
                    "unknown DNS query option, expected \"nr\"; recursion stays on"
                );
                (name, true)
            }
            None => (qtype_part, true),
        };
        let qtype = qtype_code(qtype_name.trim())
            .ok_or_else(|| ProbeError::BadArgs(format!("unsupported qtype '{qtype_name}'")))?;
        questions.push(build_question(domain.trim(), qtype, recurse)?);
    }
    Ok(questions)
}

impl ProbeModule for DnsModule {
    fn name(&self) -> &'static str {
        "dns"
    }

    fn max_packet_length(&self) -> usize {
        ETH_HLEN + IPV4_HLEN + UDP_HLEN + self.max_payload
    }

    fn pcap_filter(&self) -> &'static str {
        "udp || icmp"
    }

    fn fields(&self) -> &'static [FieldDef] {
        FIELDS
    }

    fn global_init(&mut self, conf: &ScanConfig) -> Result<(), ProbeError> {
        self.ports = Some(PortCtx::from_config(conf));
        self.questions = match conf.probe_args.as_deref() {
            Some(args) => parse_questions(args)?,
            None => {
                tracing::warn!(
                    domain = DEFAULT_DOMAIN,
                    qtype = "A",
                    "no DNS questions provided, using default"
                );
                vec![build_question(DEFAULT_DOMAIN, 1, true)?]
            }
        };
        if conf.packet_streams as usize % self.questions.len() != 0 {
            return Err(ProbeError::BadArgs(format!(
                "probe count ({}) must be a multiple of the DNS question count ({})",
                conf.packet_streams,
                self.questions.len()
            )));
        }
        self.ip_in_qname = conf.dns_ip_in_qname;
        if self.ip_in_qname {
            if let Some(q) = self.questions.iter().find(|q| q.qname.len() < IP_QNAME_LEN) {
                return Err(ProbeError::BadArgs(format!(
                    "qname of {} bytes too short for IP-in-qname encoding (need {IP_QNAME_LEN})",
                    q.qname.len()
                )));
            }
        }
        self.max_payload = self
            .questions
            .iter()
            .map(|q| q.packet.len())
            .max()
            .unwrap_or(0);
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
        let q = self.question_for(target.probe_num);
        let udp_len = (UDP_HLEN + q.packet.len()) as u16;
        write_ipv4(
            &mut buf[ETH_HLEN..],
            IPPROTO_UDP,
            IPV4_HLEN as u16 + udp_len,
            target.ttl,
            target.ip_id,
            target.saddr,
            target.daddr,
        );
        // The source port uses the raw probe number so repeated probes of
        // the same question still get distinct ports.
        let sport = ctx.source_port(target.probe_num, validation);
        write_udp(&mut buf[ETH_HLEN + IPV4_HLEN..], sport, target.dport, udp_len);

        let payload_at = ETH_HLEN + IPV4_HLEN + UDP_HLEN;
        buf[payload_at..payload_at + q.packet.len()].copy_from_slice(&q.packet);
        let txid = (validation.word(2) & 0xFFFF) as u16;
        buf[payload_at..payload_at + 2].copy_from_slice(&txid.to_be_bytes());
        if self.ip_in_qname {
            let qname_at = payload_at + DNS_HLEN;
            buf[qname_at..qname_at + IP_QNAME_LEN]
                .copy_from_slice(&encode_ip_in_qname(target.daddr));
        }
        finalize_ipv4_checksum(&mut buf[ETH_HLEN..]);
        Ok(payload_at + q.packet.len())
    }

    fn print_packet(&self, w: &mut dyn Write, buf: &[u8]) -> io::Result<()> {
        let ip = Ipv4View::new(&buf[ETH_HLEN..]).expect("dry-run packet we just built");
        let udp = UdpView::new(ip.payload()).expect("dry-run packet we just built");
        let txid = u16::from_be_bytes([udp.payload()[0], udp.payload()[1]]);
        writeln!(w, "{PRINT_PACKET_SEP}")?;
        writeln!(
            w,
            "dns {{ source: {} | dest: {} | id: {} }}",
            udp.sport(),
            udp.dport(),
            txid
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
        let meta = validate_udp_or_icmp(&ip, validator, ports, self.ctx())?;
        if ip.protocol() == IPPROTO_UDP {
            let udp = UdpView::new(ip.payload())?;
            let udp_len = udp.len() as usize;
            // A legitimate answer is never shorter than the smallest query
            // we could have sent.
            if !self
                .questions
                .iter()
                .any(|q| udp_len >= UDP_HLEN + q.packet.len())
            {
                return None;
            }
            if ip.payload().len() < UDP_HLEN + DNS_HLEN {
                return None;
            }
        }
        Some(meta)
    }

    fn process_packet(&self, pkt: &[u8], meta: &ResponseMeta, fs: &mut FieldSet) {
        let ip = Ipv4View::new(pkt).expect("validated packet");
        if ip.protocol() != IPPROTO_UDP {
            fs.add_null("sport");
            fs.add_null("dport");
            fs.add_str("classification", "icmp-unreach");
            fs.add_bool("success", false);
            fs.add_bool("app_success", false);
            add_icmp_fields(&ip, fs);
            fs.add_null("udp_len");
            add_null_dns_fields(fs, 0);
            return;
        }

        let udp = UdpView::new(ip.payload()).expect("validated packet");
        // Clamp to the UDP length so Ethernet trailer padding is never
        // parsed as DNS data.
        let dns_len = (udp.len() as usize)
            .saturating_sub(UDP_HLEN)
            .min(udp.payload().len());
        let payload = &udp.payload()[..dns_len];
        let hdr = DnsHeader(payload);
        let txid = (meta.validation.word(2) & 0xFFFF) as u16;
        let qname_skip = if self.ip_in_qname { IP_QNAME_LEN } else { 0 };
        let is_valid = hdr.id() == txid
            && self.questions.iter().any(|q| {
                payload.len() >= q.packet.len()
                    && payload[DNS_HLEN + qname_skip..DNS_HLEN + q.qname.len()]
                        == q.qname[qname_skip..]
                    && payload[DNS_HLEN + q.qname.len()..DNS_HLEN + q.qname.len() + 2]
                        == q.qtype.to_be_bytes()
                    && payload[DNS_HLEN + q.qname.len() + 2..DNS_HLEN + q.qname.len() + 4]
                        == 1u16.to_be_bytes()
            });

        fs.add_uint("sport", udp.sport() as u64);
        fs.add_uint("dport", udp.dport() as u64);
        fs.add_str("classification", "dns");
        fs.add_bool("success", is_valid);
        fs.add_bool(
            "app_success",
            is_valid && hdr.qr() == 1 && hdr.rcode() == 0,
        );
        add_null_icmp_fields(fs);
        fs.add_uint("udp_len", udp.len() as u64);

        if !is_valid {
            add_null_dns_fields(fs, 1);
            return;
        }

        fs.add_uint("dns_id", hdr.id() as u64);
        fs.add_uint("dns_rd", hdr.rd() as u64);
        fs.add_uint("dns_tc", hdr.tc() as u64);
        fs.add_uint("dns_aa", hdr.aa() as u64);
        fs.add_uint("dns_opcode", hdr.opcode() as u64);
        fs.add_uint("dns_qr", hdr.qr() as u64);
        fs.add_uint("dns_rcode", hdr.rcode() as u64);
        fs.add_uint("dns_cd", hdr.cd() as u64);
        fs.add_uint("dns_ad", hdr.ad() as u64);
        fs.add_uint("dns_z", hdr.z() as u64);
        fs.add_uint("dns_ra", hdr.ra() as u64);
        fs.add_uint("dns_qdcount", hdr.qdcount() as u64);
        fs.add_uint("dns_ancount", hdr.ancount() as u64);
        fs.add_uint("dns_nscount", hdr.nscount() as u64);
        fs.add_uint("dns_arcount", hdr.arcount() as u64);

        let mut pos = DNS_HLEN;
        let mut err = false;
        let mut questions = Vec::new();
        for _ in 0..hdr.qdcount() {
            match parse_question(payload, pos) {
                Some((q, next)) => {
                    questions.push(q);
                    pos = next;
                }
                None => {
                    err = true;
                    break;
                }
            }
        }
        fs.add_repeated("dns_questions", questions);
        let sections = [
            ("dns_answers", hdr.ancount()),
            ("dns_authorities", hdr.nscount()),
            ("dns_additionals", hdr.arcount()),
        ];
        for (name, count) in sections {
            let mut records = Vec::new();
            for _ in 0..count {
                if err {
                    break;
                }
                match parse_record(payload, pos) {
                    Some((r, next)) => {
                        records.push(r);
                        pos = next;
                    }
                    None => err = true,
                }
            }
            fs.add_repeated(name, records);
        }
        fs.add_uint("dns_parse_err", err as u64);
        fs.add_uint(
            "dns_unconsumed_bytes",
            payload.len().saturating_sub(pos) as u64,
        );
    }
}

fn add_null_dns_fields(fs: &mut FieldSet, parse_err: u64) {
    for name in [
        "dns_id", "dns_rd", "dns_tc", "dns_aa", "dns_opcode", "dns_qr", "dns_rcode", "dns_cd",
        "dns_ad", "dns_z", "dns_ra", "dns_qdcount", "dns_ancount", "dns_nscount", "dns_arcount",
    ] {
        fs.add_null(name);
    }
    for name in [
        "dns_questions",
        "dns_answers",
        "dns_authorities",
        "dns_additionals",
    ] {
        fs.add_repeated(name, Vec::new());
    }
    fs.add_uint("dns_parse_err", parse_err);
    fs.add_uint("dns_unconsumed_bytes", 0);
}

// =============================================================================
// Wire parsing
// =============================================================================

/// Accessor over the 12-byte DNS header.
struct DnsHeader<'a>(&'a [u8]);

impl DnsHeader<'_> {
    fn id(&self) -> u16 {
        u16::from_be_bytes([self.0[0], self.0[1]])
    }
    fn qr(&self) -> u8 {
        self.0[2] >> 7
    }
    fn opcode(&self) -> u8 {
        (self.0[2] >> 3) & 0x0F
    }
    fn aa(&self) -> u8 {
        (self.0[2] >> 2) & 1
    }
    fn tc(&self) -> u8 {
        (self.0[2] >> 1) & 1
    }
    fn rd(&self) -> u8 {
        self.0[2] & 1
    }
    fn ra(&self) -> u8 {
        self.0[3] >> 7
    }
    fn z(&self) -> u8 {
        (self.0[3] >> 6) & 1
    }
    fn ad(&self) -> u8 {
        (self.0[3] >> 5) & 1
    }
    fn cd(&self) -> u8 {
        (self.0[3] >> 4) & 1
    }
    fn rcode(&self) -> u8 {
        self.0[3] & 0x0F
    }
    fn qdcount(&self) -> u16 {
        u16::from_be_bytes([self.0[4], self.0[5]])
    }
    fn ancount(&self) -> u16 {
        u16::from_be_bytes([self.0[6], self.0[7]])
    }
    fn nscount(&self) -> u16 {
        u16::from_be_bytes([self.0[8], self.0[9]])
    }
    fn arcount(&self) -> u16 {
        u16::from_be_bytes([self.0[10], self.0[11]])
    }
}

/// Decode a (possibly compressed) name starting at `pos`.
///
/// Returns the dotted name and the number of bytes consumed at the
/// original position (compression pointers consume two bytes regardless of
/// where they lead). Pointer chains are capped to defeat loops.
fn parse_name(payload: &[u8], mut pos: usize) -> Option<(String, usize)> {
    let mut name = String::new();
    let mut consumed = 0usize;
    let mut jumped = false;
    let mut jumps = 0usize;
    loop {
        let byte = *payload.get(pos)?;
        if byte & 0xC0 == 0xC0 {
            let low = *payload.get(pos + 1)?;
            if !jumped {
                consumed += 2;
            }
            jumped = true;
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return None;
            }
            let offset = (((byte & 0x3F) as usize) << 8) | low as usize;
            if offset >= payload.len() {
                return None;
            }
            pos = offset;
        } else if byte == 0 {
            if !jumped {
                consumed += 1;
            }
            return Some((name, consumed));
        } else {
            let label = payload.get(pos + 1..pos + 1 + byte as usize)?;
            if !name.is_empty() {
                name.push('.');
            }
            name.push_str(&String::from_utf8_lossy(label));
            if name.len() > MAX_NAME_LENGTH {
                return None;
            }
            if !jumped {
                consumed += 1 + byte as usize;
            }
            pos += 1 + byte as usize;
        }
    }
}

fn parse_question(payload: &[u8], pos: usize) -> Option<(FieldSet, usize)> {
    let (name, consumed) = parse_name(payload, pos)?;
    let tail = payload.get(pos + consumed..pos + consumed + QUESTION_TAIL)?;
    let qtype = u16::from_be_bytes([tail[0], tail[1]]);
    let qclass = u16::from_be_bytes([tail[2], tail[3]]);
    let mut fs = FieldSet::new();
    fs.add_str("name", name);
    fs.add_uint("qtype", qtype as u64);
    fs.add_str("qtype_str", qtype_str(qtype));
    fs.add_uint("qclass", qclass as u64);
    Some((fs, pos + consumed + QUESTION_TAIL))
}

fn parse_record(payload: &[u8], pos: usize) -> Option<(FieldSet, usize)> {
    let (name, consumed) = parse_name(payload, pos)?;
    let tail_at = pos + consumed;
    let tail = payload.get(tail_at..tail_at + 10)?;
    let rtype = u16::from_be_bytes([tail[0], tail[1]]);
    let class = u16::from_be_bytes([tail[2], tail[3]]);
    let ttl = u32::from_be_bytes([tail[4], tail[5], tail[6], tail[7]]);
    let rdlength = u16::from_be_bytes([tail[8], tail[9]]) as usize;
    let rdata_at = tail_at + 10;
    let rdata = payload.get(rdata_at..rdata_at + rdlength)?;

    let mut fs = FieldSet::new();
    fs.add_str("name", name);
    fs.add_uint("type", rtype as u64);
    fs.add_str("type_str", qtype_str(rtype));
    fs.add_uint("class", class as u64);
    fs.add_uint("ttl", ttl as u64);
    fs.add_uint("rdlength", rdlength as u64);
    add_rdata(&mut fs, payload, rdata_at, rdata, rtype);
    Some((fs, rdata_at + rdlength))
}

/// Decode rdata for the record types worth reading inline; everything
/// else stays binary.
fn add_rdata(fs: &mut FieldSet, payload: &[u8], rdata_at: usize, rdata: &[u8], rtype: u16) {
    match rtype {
        // NS / CNAME / PTR: a single name
        2 | 5 | 12 => match parse_name(payload, rdata_at) {
            Some((name, _)) => {
                fs.add_uint("rdata_is_parsed", 1);
                fs.add_str("rdata", name);
            }
            None => add_raw_rdata(fs, rdata),
        },
        // MX: preference + name
        15 => {
            if rdata.len() <= 4 {
                add_raw_rdata(fs, rdata);
            } else {
                let pref = u16::from_be_bytes([rdata[0], rdata[1]]);
                match parse_name(payload, rdata_at + 2) {
                    Some((name, _)) => {
                        fs.add_uint("rdata_is_parsed", 1);
                        fs.add_str("rdata", format!("{pref} {name}"));
                    }
                    None => add_raw_rdata(fs, rdata),
                }
            }
        }
        // TXT: length-prefixed string
        16 => {
            if rdata.is_empty() || rdata[0] as usize != rdata.len() - 1 {
                add_raw_rdata(fs, rdata);
            } else {
                fs.add_uint("rdata_is_parsed", 1);
                fs.add_str("rdata", String::from_utf8_lossy(&rdata[1..]).into_owned());
            }
        }
        // A
        1 => {
            if rdata.len() == 4 {
                fs.add_uint("rdata_is_parsed", 1);
                fs.add_str(
                    "rdata",
                    Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]).to_string(),
                );
            } else {
                add_raw_rdata(fs, rdata);
            }
        }
        // AAAA
        28 => {
            if rdata.len() == 16 {
                let mut o = [0u8; 16];
                o.copy_from_slice(rdata);
                fs.add_uint("rdata_is_parsed", 1);
                fs.add_str("rdata", Ipv6Addr::from(o).to_string());
            } else {
                add_raw_rdata(fs, rdata);
            }
        }
        _ => add_raw_rdata(fs, rdata),
    }
}

fn add_raw_rdata(fs: &mut FieldSet, rdata: &[u8]) {
    fs.add_uint("rdata_is_parsed", 0);
    fs.add_binary("rdata", rdata.to_vec());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::Value;
    use std::net::IpAddr;

    const US: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
    const RESOLVER: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 53);

    fn module(args: Option<&str>, streams: u16) -> DnsModule {
        let mut m = DnsModule::new();
        let conf = ScanConfig {
            probe_args: args.map(str::to_string),
            packet_streams: streams,
            ..ScanConfig::default()
        };
        m.global_init(&conf).unwrap();
        m
    }

    fn build(m: &DnsModule, v: &Validator, probe_num: u16) -> (Vec<u8>, Validation) {
        let mut buf = vec![0u8; m.max_packet_length()];
        let mut ts: ThreadState = Box::new(());
        m.prepare_packet(
            &mut buf,
            "02:00:00:00:00:01".parse().unwrap(),
            "02:00:00:00:00:02".parse().unwrap(),
            &mut ts,
        )
        .unwrap();
        let validation = v.words(US, RESOLVER, 53);
        let target = ProbeTarget {
            saddr: US,
            daddr: RESOLVER,
            dport: 53,
            ttl: 64,
            probe_num,
            ip_id: validation.ip_id(),
        };
        let len = m.make_packet(&mut buf, &target, &validation, &mut ts).unwrap();
        buf.truncate(len);
        (buf, validation)
    }

    /// Build the resolver's answer to `probe`: echoes the question, adds
    /// one A record via a compression pointer.
    fn answer_for(probe: &[u8], rcode: u8, answer_ip: [u8; 4]) -> Vec<u8> {
        let ip = Ipv4View::new(&probe[ETH_HLEN..]).unwrap();
        let udp = UdpView::new(ip.payload()).unwrap();
        let query = udp.payload();

        let mut dns = query.to_vec();
        dns[2] |= 0x80; // qr = response
        dns[3] = (dns[3] & 0xF0) | (rcode & 0x0F);
        dns[6..8].copy_from_slice(&1u16.to_be_bytes()); // ancount
        // answer record: pointer to qname at offset 12
        dns.extend_from_slice(&[0xC0, 0x0C]);
        dns.extend_from_slice(&1u16.to_be_bytes()); // type A
        dns.extend_from_slice(&1u16.to_be_bytes()); // class IN
        dns.extend_from_slice(&300u32.to_be_bytes()); // ttl
        dns.extend_from_slice(&4u16.to_be_bytes()); // rdlength
        dns.extend_from_slice(&answer_ip);

        let total = IPV4_HLEN + UDP_HLEN + dns.len();
        let mut resp = vec![0u8; total];
        write_ipv4(&mut resp, IPPROTO_UDP, total as u16, 58, 2, ip.daddr(), ip.saddr());
        write_udp(
            &mut resp[IPV4_HLEN..],
            udp.dport(),
            udp.sport(),
            (UDP_HLEN + dns.len()) as u16,
        );
        resp[IPV4_HLEN + UDP_HLEN..].copy_from_slice(&dns);
        finalize_ipv4_checksum(&mut resp);
        resp
    }

    #[test]
    fn test_domain_to_qname_encoding() {
        assert_eq!(
            domain_to_qname("www.google.com"),
            b"\x03www\x06google\x03com\x00".to_vec()
        );
    }

    #[test]
    fn test_encode_ip_in_qname() {
        let enc = encode_ip_in_qname(Ipv4Addr::new(1, 20, 255, 0));
        assert_eq!(&enc[0..4], b"\x03001");
        assert_eq!(&enc[4..8], b"\x03020");
        assert_eq!(&enc[8..12], b"\x03255");
        assert_eq!(&enc[12..16], b"\x03000");
    }

    #[test]
    fn test_default_question_is_google_a() {
        let m = module(None, 1);
        assert_eq!(m.questions.len(), 1);
        assert_eq!(m.questions[0].qtype, 1);
        assert_eq!(m.questions[0].qname, domain_to_qname(DEFAULT_DOMAIN));
        assert_eq!(m.questions[0].packet[2] & 0x01, 1, "recursion on by default");
    }

    #[test]
    fn test_multi_question_parsing_and_nr() {
        let m = module(Some("A,example.com;AAAA:nr,example.org"), 2);
        assert_eq!(m.questions.len(), 2);
        assert_eq!(m.questions[0].qtype, 1);
        assert_eq!(m.questions[1].qtype, 28);
        assert_eq!(m.questions[1].packet[2] & 0x01, 0, ":nr clears recursion");
    }

    #[test]
    fn test_streams_must_be_multiple_of_questions() {
        let mut m = DnsModule::new();
        let conf = ScanConfig {
            probe_args: Some("A,example.com;AAAA,example.org".to_string()),
            packet_streams: 3,
            ..ScanConfig::default()
        };
        assert!(matches!(
            m.global_init(&conf),
            Err(ProbeError::BadArgs(_))
        ));
    }

    #[test]
    fn test_bad_qtype_rejected() {
        let mut m = DnsModule::new();
        let conf = ScanConfig {
            probe_args: Some("BOGUS,example.com".to_string()),
            ..ScanConfig::default()
        };
        assert!(m.global_init(&conf).is_err());
    }

    #[test]
    fn test_probe_carries_txid_and_question() {
        let v = Validator::new([1u8; 16]);
        let m = module(Some("A,example.com"), 1);
        let (probe, validation) = build(&m, &v, 0);
        let ip = Ipv4View::new(&probe[ETH_HLEN..]).unwrap();
        let udp = UdpView::new(ip.payload()).unwrap();
        let dns = udp.payload();
        assert_eq!(
            u16::from_be_bytes([dns[0], dns[1]]) as u32,
            validation.word(2) & 0xFFFF
        );
        assert_eq!(&dns[DNS_HLEN..DNS_HLEN + 13], b"\x07example\x03com\x00");
    }

    #[test]
    fn test_good_answer_success_and_rdata() {
        let v = Validator::new([1u8; 16]);
        let m = module(Some("A,example.com"), 1);
        let ports = PortList::from_ports(vec![53]);
        let (probe, _) = build(&m, &v, 0);
        let resp = answer_for(&probe, 0, [93, 184, 216, 34]);

        let meta = m.validate_packet(&resp, &v, &ports).expect("answer validates");
        assert_eq!(meta.target, IpAddr::V4(RESOLVER));

        let mut fs = FieldSet::new();
        m.process_packet(&resp, &meta, &mut fs);
        assert_eq!(fs.get("success"), Some(&Value::Bool(true)));
        assert_eq!(fs.get("app_success"), Some(&Value::Bool(true)));
        assert_eq!(fs.get("dns_parse_err"), Some(&Value::Uint(0)));
        match fs.get("dns_answers") {
            Some(Value::Repeated(answers)) => {
                assert_eq!(answers.len(), 1);
                assert_eq!(
                    answers[0].get("rdata"),
                    Some(&Value::Str("93.184.216.34".into()))
                );
                assert_eq!(answers[0].get("name"), Some(&Value::Str("example.com".into())));
            }
            other => panic!("dns_answers missing or wrong type: {other:?}"),
        }
    }

    #[test]
    fn test_servfail_is_success_but_not_app_success() {
        let v = Validator::new([1u8; 16]);
        let m = module(Some("A,example.com"), 1);
        let ports = PortList::from_ports(vec![53]);
        let (probe, _) = build(&m, &v, 0);
        let resp = answer_for(&probe, 2, [0, 0, 0, 0]);
        let meta = m.validate_packet(&resp, &v, &ports).unwrap();
        let mut fs = FieldSet::new();
        m.process_packet(&resp, &meta, &mut fs);
        assert_eq!(fs.get("success"), Some(&Value::Bool(true)));
        assert_eq!(fs.get("app_success"), Some(&Value::Bool(false)));
    }

    #[test]
    fn test_wrong_txid_not_success() {
        let v = Validator::new([1u8; 16]);
        let m = module(Some("A,example.com"), 1);
        let ports = PortList::from_ports(vec![53]);
        let (probe, _) = build(&m, &v, 0);
        let mut resp = answer_for(&probe, 0, [93, 184, 216, 34]);
        resp[IPV4_HLEN + UDP_HLEN] ^= 0xFF; // corrupt transaction id
        let meta = m.validate_packet(&resp, &v, &ports).unwrap();
        let mut fs = FieldSet::new();
        m.process_packet(&resp, &meta, &mut fs);
        assert_eq!(fs.get("success"), Some(&Value::Bool(false)));
        assert_eq!(fs.get("app_success"), Some(&Value::Bool(false)));
    }

    #[test]
    fn test_short_response_rejected() {
        let v = Validator::new([1u8; 16]);
        let m = module(Some("A,example.com"), 1);
        let ports = PortList::from_ports(vec![53]);
        let (probe, _) = build(&m, &v, 0);
        let resp = answer_for(&probe, 0, [93, 184, 216, 34]);
        // Truncate below the query size and fix the UDP length field.
        let keep = IPV4_HLEN + UDP_HLEN + 6;
        let mut short = resp[..keep].to_vec();
        short[IPV4_HLEN + 4..IPV4_HLEN + 6]
            .copy_from_slice(&((UDP_HLEN + 6) as u16).to_be_bytes());
        assert!(m.validate_packet(&short, &v, &ports).is_none());
    }

    #[test]
    fn test_probe_num_selects_question() {
        let v = Validator::new([1u8; 16]);
        let m = module(Some("A,example.com;AAAA,example.org"), 2);
        let (p0, _) = build(&m, &v, 0);
        let (p1, _) = build(&m, &v, 1);
        let q0 = UdpView::new(Ipv4View::new(&p0[ETH_HLEN..]).unwrap().payload())
            .unwrap()
            .payload()
            .to_vec();
        let q1 = UdpView::new(Ipv4View::new(&p1[ETH_HLEN..]).unwrap().payload())
            .unwrap()
            .payload()
            .to_vec();
        assert!(q0[DNS_HLEN..].starts_with(b"\x07example\x03com"));
        assert!(q1[DNS_HLEN..].starts_with(b"\x07example\x03org"));
    }

    #[test]
    fn test_ip_in_qname_mode_rewrites_prefix() {
        let mut m = DnsModule::new();
        let conf = ScanConfig {
            probe_args: Some("A,aaaaaaaaaaaaaaaaaaaa.example.com".to_string()),
            dns_ip_in_qname: true,
            ..ScanConfig::default()
        };
        m.global_init(&conf).unwrap();
        let v = Validator::new([1u8; 16]);
        let (probe, _) = build(&m, &v, 0);
        let dns = UdpView::new(Ipv4View::new(&probe[ETH_HLEN..]).unwrap().payload())
            .unwrap()
            .payload()
            .to_vec();
        assert_eq!(
            &dns[DNS_HLEN..DNS_HLEN + IP_QNAME_LEN],
            &encode_ip_in_qname(RESOLVER)
        );
    }

    #[test]
    fn test_ip_in_qname_requires_long_qname() {
        let mut m = DnsModule::new();
        let conf = ScanConfig {
            probe_args: Some("A,a.io".to_string()),
            dns_ip_in_qname: true,
            ..ScanConfig::default()
        };
        assert!(m.global_init(&conf).is_err());
    }

    #[test]
    fn test_parse_name_compression_loop_bounded() {
        // A pointer that points at itself must not hang.
        let payload = [0xC0u8, 0x00];
        assert!(parse_name(&payload, 0).is_none());
    }

    #[test]
    fn test_parse_name_plain() {
        let payload = b"\x03www\x07example\x03com\x00";
        let (name, consumed) = parse_name(payload, 0).unwrap();
        assert_eq!(name, "www.example.com");
        assert_eq!(consumed, payload.len());
    }
}
