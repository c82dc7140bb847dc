//! Scan orchestration: configuration validation, thread lifecycle, and
//! signal wiring.
//!
//! The engine owns nothing ambient. It validates the configuration into
//! hard startup errors, builds the shared immutable pieces (probe module,
//! validator, cyclic permutation), spawns the receiver, sender, and
//! monitor threads, and joins them in order. Shutdown is cooperative:
//! atomic flags plus joins, never a forced kill.

use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;

use crate::config::{RuntimeState, ScanConfig};
use crate::crypto::Validator;
use crate::cyclic::{Cycle, CycleError};
use crate::monitor::{run_monitor, MonitorContext};
use crate::output::{FieldDef, OutputSink, IP_FIELDS, SYS_FIELDS};
use crate::probe::{create_module, ProbeError, ProbeModule};
use crate::recv::{run_receiver, ReceiverContext};
use crate::send::{run_sender, run_sender_v6, SenderContext};
use crate::shard::{Shard, TargetSpace};
use crate::targets::{
    AddressOracle, Ipv6TargetFile, PagedBitmap, PortList, SourcePool, TargetError,
};
use crate::transport::{BatchSender, DryRunSender, TransportError, TransportFactory};

/// Fatal configuration error; the process exits non-zero without scanning.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown probe module '{0}'")]
    UnknownProbeModule(String),

    #[error("must specify rate or bandwidth, not both")]
    RateAndBandwidth,

    #[error("rate impossibly slow")]
    RateZero,

    #[error("no destination ports configured")]
    NoPorts,

    #[error("probe module takes no target port, but {0} were configured")]
    PortsNotAccepted(usize),

    #[error("senders x shards ({subshards}) > allowed probes ({probes})")]
    Oversubscribed { subshards: u64, probes: u64 },

    #[error("senders x shards ({subshards}) > max targets ({max_targets})")]
    MoreShardsThanTargets { subshards: u64, max_targets: u64 },

    #[error("shard number {shard} out of range (total shards {total})")]
    ShardOutOfRange { shard: u16, total: u16 },

    #[error("at least one sender thread is required")]
    NoSenders,

    #[error("source port range {first}..{last} is reversed")]
    ReversedSourcePorts { first: u16, last: u16 },

    #[error("no source IP address configured")]
    NoSourceIp,

    #[error("IPv6 scan requires an IPv6 source address")]
    MissingIpv6Source,

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error(transparent)]
    Target(#[from] TargetError),
}

/// Fatal runtime error during the scan.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("output error: {0}")]
    Output(#[from] std::io::Error),

    #[error("worker thread panicked: {0}")]
    ThreadPanic(String),
}

/// Convert a bits-per-second budget into packets per second.
///
/// The frame cost is the probe length floored at the 84-byte Ethernet
/// minimum, plus 24 bytes of preamble, start-of-frame, CRC, and
/// inter-frame gap. A budget above u32 pps means no effective limit; a
/// budget below one packet per second is clamped up with a warning.
pub fn bandwidth_to_rate(bandwidth: u64, max_packet_length: usize) -> u64 {
    let bits = (max_packet_length as u64).max(84) * 8 + 24 * 8;
    let rate = bandwidth / bits;
    if rate > u32::MAX as u64 {
        0
    } else if rate == 0 {
        tracing::warn!(
            bandwidth,
            "bandwidth is slower than 1 pkt/s, setting rate to 1 pkt/s"
        );
        1
    } else {
        rate
    }
}

/// A validated, ready-to-run scan.
pub struct Scanner {
    config: Arc<ScanConfig>,
    runtime: Arc<RuntimeState>,
    module: Arc<dyn ProbeModule>,
    oracle: Arc<dyn AddressOracle>,
    validator: Validator,
    ip_filter: Option<Arc<PagedBitmap>>,
    ipv6_targets: Option<Arc<Ipv6TargetFile>>,
    expected_targets: u64,
}

impl Scanner {
    /// Validate `config` against `oracle` and build the scan.
    ///
    /// Everything that can fail at startup fails here; `run` only hits
    /// steady-state errors afterwards.
    pub fn new(
        mut config: ScanConfig,
        oracle: Arc<dyn AddressOracle>,
    ) -> Result<Self, ConfigError> {
        if config.senders == 0 {
            return Err(ConfigError::NoSenders);
        }
        if config.shard_num >= config.total_shards {
            return Err(ConfigError::ShardOutOfRange {
                shard: config.shard_num,
                total: config.total_shards,
            });
        }
        if config.source_port_first > config.source_port_last {
            return Err(ConfigError::ReversedSourcePorts {
                first: config.source_port_first,
                last: config.source_port_last,
            });
        }
        if config.bandwidth > 0 && config.rate > 0 {
            return Err(ConfigError::RateAndBandwidth);
        }
        if config.batch_size == 0 {
            config.batch_size = 1;
        }

        let mut module = create_module(&config.probe_name)
            .ok_or_else(|| ConfigError::UnknownProbeModule(config.probe_name.clone()))?;

        // Portless modules scan one pseudo-port; everyone else needs a
        // real port list.
        if module.port_args() {
            if config.ports.is_empty() {
                return Err(ConfigError::NoPorts);
            }
        } else {
            if config.ports.len() > 1 {
                return Err(ConfigError::PortsNotAccepted(config.ports.len()));
            }
            config.ports = PortList::from_ports(vec![0]);
        }

        module.global_init(&config)?;

        if config.bandwidth > 0 {
            config.rate = bandwidth_to_rate(config.bandwidth, module.max_packet_length());
            tracing::debug!(
                bandwidth = config.bandwidth,
                rate = config.rate,
                probe_len = module.max_packet_length(),
                "bandwidth converted to packet rate"
            );
        }
        if config.rate == 0 && config.bandwidth == 0 {
            return Err(ConfigError::RateZero);
        }

        let ipv6 = config.is_ipv6();
        let ipv6_targets = match (&config.ipv6_target_file, ipv6) {
            (Some(path), true) => {
                if config.ipv6_source_ip.is_none() {
                    return Err(ConfigError::MissingIpv6Source);
                }
                if !module.supports_ipv6() {
                    return Err(ConfigError::Probe(ProbeError::Init(format!(
                        "probe module {} does not support IPv6",
                        module.name()
                    ))));
                }
                Some(Arc::new(Ipv6TargetFile::open(path)?))
            }
            _ => None,
        };
        if !ipv6 && config.source_ips.is_empty() {
            return Err(ConfigError::NoSourceIp);
        }

        let probes = oracle.count_allowed() * config.ports.len() as u64;
        let subshards = config.senders as u64 * config.total_shards as u64;
        if !ipv6 {
            if subshards > probes {
                return Err(ConfigError::Oversubscribed { subshards, probes });
            }
            if let Some(max) = config.max_targets {
                if subshards > max {
                    return Err(ConfigError::MoreShardsThanTargets {
                        subshards,
                        max_targets: max,
                    });
                }
            }
        }

        let ip_filter = match &config.list_of_ips_file {
            Some(path) => Some(Arc::new(PagedBitmap::from_file(path)?)),
            None => None,
        };

        let validator = Validator::generate(config.seed);
        let runtime = Arc::new(RuntimeState::new(config.rate));
        let expected_targets = probes / config.total_shards as u64;

        Ok(Self {
            config: Arc::new(config),
            runtime,
            module: Arc::from(module),
            oracle,
            validator,
            ip_filter,
            ipv6_targets,
            expected_targets,
        })
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<RuntimeState> {
        &self.runtime
    }

    /// Field schema of this scan's output records.
    pub fn output_fields(&self) -> Vec<FieldDef> {
        let mut defs = Vec::new();
        defs.extend_from_slice(IP_FIELDS);
        defs.extend_from_slice(self.module.fields());
        defs.extend_from_slice(SYS_FIELDS);
        defs
    }

    /// Run the scan to completion.
    pub fn run(
        &self,
        factory: &mut dyn TransportFactory,
        sink: Arc<OutputSink>,
    ) -> Result<(), ScanError> {
        let config = &self.config;
        tracing::info!(
            scan_id = %config.scan_id,
            probe = self.module.name(),
            rate = config.rate,
            senders = config.senders,
            shard = config.shard_num,
            total_shards = config.total_shards,
            dryrun = config.dryrun,
            "scan starting"
        );
        install_signal_handlers(&self.runtime);
        sink.write_header(&self.output_fields())?;

        // Receiver first, so no response can beat the capture loop.
        let recv_handle = if config.dryrun {
            None
        } else {
            let mut capture = factory.capture(self.module.pcap_filter())?;
            let ctx = ReceiverContext {
                config: Arc::clone(config),
                runtime: Arc::clone(&self.runtime),
                module: Arc::clone(&self.module),
                validator: self.validator.clone(),
                oracle: Arc::clone(&self.oracle),
                sink: Arc::clone(&sink),
            };
            let handle = std::thread::Builder::new()
                .name("recv".to_string())
                .spawn(move || run_receiver(&ctx, capture.as_mut()))
                .expect("spawn receiver thread");
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            while !self.runtime.recv_ready.load(Ordering::SeqCst) {
                if std::time::Instant::now() >= deadline {
                    tracing::warn!("receiver did not report ready; proceeding");
                    break;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            Some(handle)
        };

        // Per-thread send setup is serialized; some transports require it.
        let send_init = Mutex::new(());
        let sender_ctx = Arc::new(SenderContext {
            config: Arc::clone(config),
            runtime: Arc::clone(&self.runtime),
            module: Arc::clone(&self.module),
            validator: self.validator.clone(),
            source_pool: SourcePool::new(if config.is_ipv6() {
                // The v4 pool is unused on v6 scans; keep it well-formed.
                vec![std::net::Ipv4Addr::UNSPECIFIED]
            } else {
                config.source_ips.clone()
            }),
            ipv6_targets: self.ipv6_targets.clone(),
        });

        let cycle = if config.is_ipv6() {
            None
        } else {
            let mut rng = match config.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            let space = self.oracle.count_allowed() * config.ports.len() as u64;
            Some(Cycle::new(space, &mut rng).map_err(|e| {
                // Guarded against at construction; a failure here is a bug.
                ScanError::ThreadPanic(format!("cycle construction failed: {e}"))
            })?)
        };
        let space = Arc::new(TargetSpace {
            oracle: Arc::clone(&self.oracle),
            ports: config.ports.clone(),
        });

        let stride = config.senders as u64 * config.total_shards as u64;
        let mut sender_handles = Vec::with_capacity(config.senders as usize);
        let mut spawn_error: Option<ScanError> = None;
        for thread_id in 0..config.senders {
            let thread_state = match self.module.thread_init() {
                Ok(ts) => ts,
                Err(e) => {
                    spawn_error = Some(e.into());
                    break;
                }
            };
            let mut transport: Box<dyn BatchSender> = if config.dryrun {
                Box::new(DryRunSender::new(Arc::clone(&self.module)))
            } else {
                let _guard = send_init.lock().expect("send init lock poisoned");
                match factory.sender(thread_id) {
                    Ok(t) => t,
                    Err(e) => {
                        spawn_error = Some(e.into());
                        break;
                    }
                }
            };
            let ctx = Arc::clone(&sender_ctx);
            let shard = cycle.as_ref().map(|cycle| {
                let runtime = Arc::clone(&self.runtime);
                Shard::new(
                    cycle,
                    Shard::sub_shard_offset(thread_id, config.senders, config.shard_num),
                    stride,
                    thread_id,
                    Arc::clone(&space),
                    self.ip_filter.clone(),
                    config.max_targets,
                    config.max_packets,
                    Some(Box::new(move |tid| {
                        runtime.sender_finished();
                        tracing::debug!(thread = tid, "shard completed");
                    })),
                )
            });
            let handle = std::thread::Builder::new()
                .name(format!("send-{thread_id}"))
                .spawn(move || match shard {
                    Some(shard) => run_sender(&ctx, shard, transport.as_mut(), thread_state),
                    None => run_sender_v6(&ctx, thread_id, transport.as_mut(), thread_state),
                })
                .expect("spawn sender thread");
            sender_handles.push(handle);
        }

        // A per-thread init failure aborts the whole scan before the
        // monitor even starts; unwind whatever was already running.
        if let Some(e) = spawn_error {
            tracing::error!(error = %e, "sender thread setup failed, aborting scan");
            self.runtime.senders_stop.store(true, Ordering::SeqCst);
            self.runtime.recv_complete.store(true, Ordering::SeqCst);
            for handle in sender_handles {
                let _ = handle.join();
            }
            if let Some(handle) = recv_handle {
                let _ = handle.join();
            }
            return Err(e);
        }

        let monitor_ctx = MonitorContext {
            config: Arc::clone(config),
            runtime: Arc::clone(&self.runtime),
            expected_targets: self.expected_targets,
            cadence: Duration::from_secs(1),
        };
        let monitor_handle = std::thread::Builder::new()
            .name("monitor".to_string())
            .spawn(move || run_monitor(&monitor_ctx))
            .expect("spawn monitor thread");

        // Join senders; a module error in any of them aborts the scan.
        let mut fatal: Option<ScanError> = None;
        for handle in sender_handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "sender thread failed");
                    self.runtime.senders_stop.store(true, Ordering::SeqCst);
                    // Keep the completion machinery moving for the others.
                    self.runtime.sender_finished();
                    fatal.get_or_insert(ScanError::Probe(e));
                }
                Err(_) => {
                    self.runtime.senders_stop.store(true, Ordering::SeqCst);
                    self.runtime.sender_finished();
                    fatal.get_or_insert(ScanError::ThreadPanic("sender".to_string()));
                }
            }
        }
        if fatal.is_some() {
            // Skip the cooldown; nothing trustworthy is coming.
            self.runtime.recv_complete.store(true, Ordering::SeqCst);
        }

        monitor_handle
            .join()
            .map_err(|_| ScanError::ThreadPanic("monitor".to_string()))?;
        if let Some(handle) = recv_handle {
            handle
                .join()
                .map_err(|_| ScanError::ThreadPanic("receiver".to_string()))?;
        }

        self.module.close();
        sink.flush()?;
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// =============================================================================
// Signals
// =============================================================================

// The live runtime the signal handlers act on. Replaced wholesale per
// scan; the handler only ever loads the pointer and touches atomics.
static SIGNAL_STATE: AtomicPtr<RuntimeState> = AtomicPtr::new(std::ptr::null_mut());

extern "C" fn handle_rate_up(_sig: libc::c_int) {
    let ptr = SIGNAL_STATE.load(Ordering::Relaxed);
    if !ptr.is_null() {
        unsafe { &*ptr }.adjust_rate(0.05);
    }
}

extern "C" fn handle_rate_down(_sig: libc::c_int) {
    let ptr = SIGNAL_STATE.load(Ordering::Relaxed);
    if !ptr.is_null() {
        unsafe { &*ptr }.adjust_rate(-0.05);
    }
}

extern "C" fn handle_shutdown(_sig: libc::c_int) {
    let ptr = SIGNAL_STATE.load(Ordering::Relaxed);
    if !ptr.is_null() {
        unsafe { &*ptr }
            .shutdown_requested
            .store(true, Ordering::SeqCst);
    }
}

/// Wire SIGUSR1/SIGUSR2 to the +/-5% rate knobs and SIGINT/SIGTERM to
/// orderly shutdown through the monitor.
fn install_signal_handlers(runtime: &Arc<RuntimeState>) {
    let ptr = Arc::into_raw(Arc::clone(runtime)) as *mut RuntimeState;
    let old = SIGNAL_STATE.swap(ptr, Ordering::SeqCst);
    if !old.is_null() {
        unsafe { drop(Arc::from_raw(old)) };
    }
    unsafe {
        libc::signal(libc::SIGUSR1, handle_rate_up as libc::sighandler_t);
        libc::signal(libc::SIGUSR2, handle_rate_down as libc::sighandler_t);
        libc::signal(libc::SIGINT, handle_shutdown as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_shutdown as libc::sighandler_t);
    }
}

// =============================================================================
// Tests
// =============================================================================
