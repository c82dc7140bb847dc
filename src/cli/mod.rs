//! CLI entrypoint: flag parsing and scan assembly.
//!
//! Parses the flag surface, resolves the allow/block lists into the
//! address oracle, builds the output sink, and hands everything to the
//! engine. All policy lives in [`crate::engine`]; this module only maps
//! flags onto configuration.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use uuid::Uuid;

use crate::config::{MacAddr, OutputFormat, ScanConfig};
use crate::engine::Scanner;
use crate::output::{CsvEncoder, Encoder, JsonEncoder, OutputSink};
use crate::targets::{read_cidr_lines, CidrOracle, PortList};
use crate::transport::OsTransport;

/// petrel - high-rate stateless single-packet network scanner.
#[derive(Parser, Debug)]
#[command(name = "petrel", version, about)]
#[command(
    long_about = "Petrel enumerates an address x port space through a cyclic-group \
    permutation, sends one probe per target at a precisely limited rate, and validates \
    responses statelessly with a keyed function. Requires CAP_NET_RAW unless --dryrun."
)]
pub struct Cli {
    /// Target address ranges in CIDR notation (default: 0.0.0.0/0)
    pub targets: Vec<String>,

    /// Destination port(s): "443", "1-1024", "80,443,8080"
    #[arg(short = 'p', long = "target-ports")]
    pub target_ports: Option<String>,

    /// Send rate in packets per second (default 10000)
    #[arg(short = 'r', long, conflicts_with = "bandwidth")]
    pub rate: Option<u64>,

    /// Send rate in bits per second (converted using the probe size)
    #[arg(short = 'B', long)]
    pub bandwidth: Option<u64>,

    /// Number of sender threads
    #[arg(short = 'T', long, default_value_t = 1)]
    pub senders: u8,

    /// This machine's shard number, 0 <= shard < shards
    #[arg(long, default_value_t = 0)]
    pub shard: u16,

    /// Total number of machine shards
    #[arg(long = "shards", default_value_t = 1)]
    pub total_shards: u16,

    /// Probes to send to each target
    #[arg(short = 'P', long = "probes", default_value_t = 1)]
    pub packet_streams: u16,

    /// Cap on targets scanned per shard
    #[arg(short = 'n', long)]
    pub max_targets: Option<u64>,

    /// Cap on packets sent per shard
    #[arg(short = 'N', long)]
    pub max_packets: Option<u64>,

    /// Cap on sending phase duration in seconds
    #[arg(short = 't', long)]
    pub max_runtime: Option<u64>,

    /// How long to keep receiving after the last sender finishes
    #[arg(short = 'c', long, default_value_t = 8)]
    pub cooldown_secs: u64,

    /// Retries for transient send failures within a batch
    #[arg(long, default_value_t = 1)]
    pub retries: u8,

    /// Packets per transmit batch
    #[arg(long = "batch", default_value_t = 64)]
    pub batch_size: u16,

    /// Probe module (tcp_syn, icmp_echo, udp, dns)
    #[arg(short = 'M', long = "probe-module", default_value = "tcp_syn")]
    pub probe_module: String,

    /// Module-specific arguments (e.g. "A,example.com" for dns)
    #[arg(long = "probe-args")]
    pub probe_args: Option<String>,

    /// Source address(es) to send from (repeatable)
    #[arg(short = 'S', long = "source-ip")]
    pub source_ips: Vec<Ipv4Addr>,

    /// First source port
    #[arg(long, default_value_t = 32768)]
    pub source_port_first: u16,

    /// Last source port
    #[arg(long, default_value_t = 61000)]
    pub source_port_last: u16,

    /// File of CIDR ranges to exclude, one per line
    #[arg(short = 'b', long = "blocklist-file")]
    pub blocklist_file: Option<PathBuf>,

    /// File of CIDR ranges to include, one per line
    #[arg(short = 'w', long = "allowlist-file")]
    pub allowlist_file: Option<PathBuf>,

    /// File of individual target IPs; everything else is skipped
    #[arg(short = 'I', long = "list-of-ips-file")]
    pub list_of_ips_file: Option<PathBuf>,

    /// Outgoing network interface
    #[arg(short = 'i', long)]
    pub interface: Option<String>,

    /// Gateway MAC address (frames are addressed to it)
    #[arg(short = 'G', long = "gateway-mac")]
    pub gateway_mac: Option<MacAddr>,

    /// Source MAC address
    #[arg(long = "source-mac")]
    pub source_mac: Option<MacAddr>,

    /// IPv6 source address, required with --ipv6-target-file
    #[arg(long = "ipv6-source-ip")]
    pub ipv6_source_ip: Option<Ipv6Addr>,

    /// File of IPv6 targets, one address per line
    #[arg(long = "ipv6-target-file")]
    pub ipv6_target_file: Option<PathBuf>,

    /// TTL for probe packets
    #[arg(long = "probe-ttl", default_value_t = 255)]
    pub probe_ttl: u8,

    /// Print packets to stdout instead of sending them
    #[arg(short = 'd', long)]
    pub dryrun: bool,

    /// Accept responses from source ports we did not scan
    #[arg(long = "no-validate-source-port")]
    pub no_validate_source_port: bool,

    /// DNS: encode the target IP into the leading qname labels
    #[arg(long = "dns-ip-in-qname")]
    pub dns_ip_in_qname: bool,

    /// Seed for the permutation and validation key (distributed scans
    /// must share it)
    #[arg(short = 'e', long)]
    pub seed: Option<u64>,

    /// Output file (default stdout)
    #[arg(short = 'o', long = "output-file")]
    pub output_file: Option<PathBuf>,

    /// Output encoding
    #[arg(short = 'O', long = "output-module", value_enum, default_value = "json")]
    pub output_module: OutputArg,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputArg {
    Json,
    Csv,
}

impl From<OutputArg> for OutputFormat {
    fn from(a: OutputArg) -> Self {
        match a {
            OutputArg::Json => OutputFormat::Json,
            OutputArg::Csv => OutputFormat::Csv,
        }
    }
}

impl Cli {
    /// Map flags to an engine configuration.
    pub fn to_config(&self) -> Result<ScanConfig, String> {
        let ports = match &self.target_ports {
            Some(spec) => PortList::parse(spec).map_err(|e| e.to_string())?,
            None => PortList::from_ports(Vec::new()),
        };
        let mut rate = self.rate.unwrap_or(0);
        let bandwidth = self.bandwidth.unwrap_or(0);
        if self.rate.is_none() && bandwidth == 0 {
            rate = 10_000;
        }
        Ok(ScanConfig {
            scan_id: Uuid::new_v4(),
            rate,
            bandwidth,
            senders: self.senders,
            shard_num: self.shard,
            total_shards: self.total_shards,
            packet_streams: self.packet_streams,
            max_targets: self.max_targets,
            max_packets: self.max_packets,
            max_runtime: self.max_runtime.map(std::time::Duration::from_secs),
            cooldown: std::time::Duration::from_secs(self.cooldown_secs),
            retries: self.retries,
            batch_size: self.batch_size,
            probe_name: self.probe_module.clone(),
            probe_args: self.probe_args.clone(),
            source_ips: self.source_ips.clone(),
            source_port_first: self.source_port_first,
            source_port_last: self.source_port_last,
            ports,
            interface: self.interface.clone(),
            source_mac: self.source_mac.unwrap_or_default(),
            gateway_mac: self.gateway_mac.unwrap_or_default(),
            probe_ttl: self.probe_ttl,
            dryrun: self.dryrun,
            validate_source_port: !self.no_validate_source_port,
            dns_ip_in_qname: self.dns_ip_in_qname,
            allowlist_file: self.allowlist_file.clone(),
            blocklist_file: self.blocklist_file.clone(),
            list_of_ips_file: self.list_of_ips_file.clone(),
            ipv6_source_ip: self.ipv6_source_ip,
            ipv6_target_file: self.ipv6_target_file.clone(),
            seed: self.seed,
            output_format: self.output_module.into(),
            output_file: self.output_file.clone(),
        })
    }

    /// Combine positional CIDRs with the allowlist/blocklist files into
    /// the address oracle.
    pub fn build_oracle(&self) -> Result<CidrOracle, String> {
        let mut allow = self.targets.clone();
        if let Some(path) = &self.allowlist_file {
            allow.extend(read_cidr_lines(path).map_err(|e| e.to_string())?);
        }
        let block = match &self.blocklist_file {
            Some(path) => read_cidr_lines(path).map_err(|e| e.to_string())?,
            None => Vec::new(),
        };
        CidrOracle::from_cidrs(&allow, &block).map_err(|e| e.to_string())
    }
}

fn build_sink(config: &ScanConfig) -> Result<OutputSink, std::io::Error> {
    let encoder: Box<dyn Encoder> = match config.output_format {
        OutputFormat::Json => Box::new(JsonEncoder),
        OutputFormat::Csv => Box::new(CsvEncoder),
    };
    let writer: Box<dyn Write + Send> = match &config.output_file {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(std::io::stdout()),
    };
    Ok(OutputSink::new(encoder, writer))
}

/// Parse arguments, run the scan, and return the process exit code.
pub fn run() -> i32 {
    let cli = Cli::parse();
    run_with(cli)
}

fn run_with(cli: Cli) -> i32 {
    let config = match cli.to_config() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "invalid arguments");
            return 1;
        }
    };
    let oracle = match cli.build_oracle() {
        Ok(o) => Arc::new(o),
        Err(e) => {
            tracing::error!(error = %e, "could not build target address set");
            return 1;
        }
    };
    if !config.dryrun && config.interface.is_none() {
        tracing::error!("an --interface is required unless --dryrun is set");
        return 1;
    }
    if !config.dryrun && (config.source_mac.is_zero() || config.gateway_mac.is_zero()) {
        tracing::warn!(
            "source or gateway MAC is zero; frames will likely be dropped \
             (set --source-mac / --gateway-mac)"
        );
    }

    let sink = match build_sink(&config) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!(error = %e, "could not open output");
            return 1;
        }
    };
    let interface = config.interface.clone().unwrap_or_default();
    let scanner = match Scanner::new(config, oracle) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "scan configuration rejected");
            return 1;
        }
    };
    let mut factory = OsTransport::new(interface);
    match scanner.run(&mut factory, sink) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "scan failed");
            1
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("petrel").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_minimal_invocation_defaults() {
        let cli = parse(&["-p", "443", "10.0.0.0/24"]);
        let config = cli.to_config().unwrap();
        assert_eq!(config.rate, 10_000, "default rate when nothing is given");
        assert_eq!(config.ports.as_slice(), &[443]);
        assert_eq!(config.senders, 1);
        assert_eq!(config.cooldown.as_secs(), 8);
        assert!(config.validate_source_port);
    }

    #[test]
    fn test_rate_and_bandwidth_conflict_at_parse_time() {
        let result = Cli::try_parse_from(["petrel", "-p", "80", "-r", "1000", "-B", "1000000"]);
        assert!(result.is_err(), "clap must reject -r with -B");
    }

    #[test]
    fn test_explicit_rate_zero_survives_to_config() {
        // --rate 0 is an explicit request and must reach the engine's
        // validation (which rejects it) rather than the 10k default.
        let cli = parse(&["-p", "80", "-r", "0"]);
        assert_eq!(cli.to_config().unwrap().rate, 0);
    }

    #[test]
    fn test_shard_flags() {
        let cli = parse(&["-p", "80", "--shard", "2", "--shards", "8", "-T", "4"]);
        let config = cli.to_config().unwrap();
        assert_eq!(config.shard_num, 2);
        assert_eq!(config.total_shards, 8);
        assert_eq!(config.senders, 4);
    }

    #[test]
    fn test_mac_and_source_flags() {
        let cli = parse(&[
            "-p",
            "80",
            "-S",
            "192.0.2.1",
            "-S",
            "192.0.2.2",
            "--source-mac",
            "02:00:00:00:00:01",
            "--gateway-mac",
            "02:00:00:00:00:02",
        ]);
        let config = cli.to_config().unwrap();
        assert_eq!(config.source_ips.len(), 2);
        assert_eq!(config.source_mac.to_string(), "02:00:00:00:00:01");
        assert_eq!(config.gateway_mac.to_string(), "02:00:00:00:00:02");
    }

    #[test]
    fn test_oracle_from_positional_cidrs() {
        let cli = parse(&["-p", "80", "10.0.0.0/30", "10.0.1.0/30"]);
        let oracle = cli.build_oracle().unwrap();
        use crate::targets::AddressOracle;
        assert_eq!(oracle.count_allowed(), 8);
    }

    #[test]
    fn test_bad_port_spec_rejected() {
        let cli = parse(&["-p", "99999", "10.0.0.0/24"]);
        assert!(cli.to_config().is_err());
    }

    #[test]
    fn test_output_module_selection() {
        let cli = parse(&["-p", "80", "-O", "csv"]);
        assert_eq!(cli.to_config().unwrap().output_format, OutputFormat::Csv);
    }

    #[test]
    fn test_probe_module_and_args() {
        let cli = parse(&["-p", "53", "-M", "dns", "--probe-args", "A,example.com"]);
        let config = cli.to_config().unwrap();
        assert_eq!(config.probe_name, "dns");
        assert_eq!(config.probe_args.as_deref(), Some("A,example.com"));
    }
}
