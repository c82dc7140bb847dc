//! Sender threads: drive a shard through the probe module into batched
//! transmission at the configured rate.
//!
//! Each thread owns its shard and batch outright. Per target it computes
//! the validation words, picks the source address and port, asks the probe
//! module to build one packet per stream into the next batch slot, and
//! submits full batches through the transport. On exit the partial batch
//! is drained, the shard callback fires, and the runtime's send-completion
//! clock is stamped.

pub mod rate;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::config::{RuntimeState, ScanConfig};
use crate::crypto::Validator;
use crate::probe::packet::MAX_PACKET_SIZE;
use crate::probe::{ProbeError, ProbeModule, ProbeTarget, ProbeTargetV6, ThreadState};
use crate::shard::{Shard, ShardState};
use crate::targets::{Ipv6TargetFile, SourcePool};
use crate::transport::{Batch, BatchSender};

use rate::RateController;

/// Everything a sender thread shares with the rest of the scan.
pub struct SenderContext {
    pub config: Arc<ScanConfig>,
    pub runtime: Arc<RuntimeState>,
    pub module: Arc<dyn ProbeModule>,
    pub validator: Validator,
    pub source_pool: SourcePool,
    pub ipv6_targets: Option<Arc<Ipv6TargetFile>>,
}

/// Prepare a batch whose every slot carries the module's invariant
/// packet prefix. Slot buffers survive `clear()`, so this happens once.
fn prepared_batch(
    ctx: &SenderContext,
    thread_state: &mut ThreadState,
) -> Result<Batch, ProbeError> {
    let mut batch = Batch::new(ctx.config.batch_size);
    for _ in 0..batch.capacity() {
        let slot = batch.next_slot();
        ctx.module.prepare_packet(
            &mut slot.buf,
            ctx.config.source_mac,
            ctx.config.gateway_mac,
            thread_state,
        )?;
        batch.commit();
    }
    batch.clear();
    Ok(batch)
}

/// Submit every filled slot; returns `(submitted, accepted)`. Errors are
/// absorbed into the failure count, logged at a decaying rate.
fn submit(
    batch: &mut Batch,
    transport: &mut dyn BatchSender,
    attempts: u8,
    thread_id: u8,
    error_count: &mut u64,
) -> (u64, u64) {
    if batch.is_empty() {
        return (0, 0);
    }
    let submitted = batch.len() as u64;
    let accepted = match transport.send_batch(batch, attempts) {
        Ok(n) => n as u64,
        Err(e) => {
            *error_count += 1;
            if error_count.is_power_of_two() {
                tracing::error!(
                    thread = thread_id,
                    failures = *error_count,
                    error = %e,
                    "could not send batch packets"
                );
            }
            0
        }
    };
    batch.clear();
    (submitted, accepted)
}

fn should_stop(ctx: &SenderContext) -> bool {
    let runtime = &ctx.runtime;
    if runtime.recv_complete.load(Ordering::Relaxed)
        || runtime.senders_stop.load(Ordering::Relaxed)
    {
        return true;
    }
    match ctx.config.max_runtime {
        Some(max) => runtime.start.elapsed() >= max,
        None => false,
    }
}

/// Run one IPv4 sender thread to completion.
pub fn run_sender(
    ctx: &SenderContext,
    mut shard: Shard,
    transport: &mut dyn BatchSender,
    mut thread_state: ThreadState,
) -> Result<(), ProbeError> {
    let conf = &ctx.config;
    let runtime = &ctx.runtime;
    let thread_id = shard.thread_id();
    tracing::debug!(thread = thread_id, "send thread started");

    let mut batch = prepared_batch(ctx, &mut thread_state)?;
    let attempts = conf.retries + 1;
    let mut controller = RateController::new(
        runtime.rate.load(Ordering::Relaxed),
        conf.senders,
        conf.packet_streams,
    );
    let mut send_errors = 0u64;

    let mut current = shard.current_target();
    while let Some(target) = current {
        controller.pace(&runtime.rate);
        if should_stop(ctx) {
            break;
        }
        if shard.hit_max_targets() {
            tracing::debug!(thread = thread_id, "sender finished: max targets reached");
            break;
        }
        if shard.hit_max_packets() {
            tracing::debug!(thread = thread_id, "sender finished: max packets reached");
            break;
        }
        for probe_num in 0..conf.packet_streams {
            let saddr = ctx.source_pool.source_for(target.ip, probe_num);
            let validation = ctx.validator.words(saddr, target.ip, target.port);
            let probe = ProbeTarget {
                saddr,
                daddr: target.ip,
                dport: target.port,
                ttl: conf.probe_ttl,
                probe_num,
                ip_id: validation.ip_id(),
            };
            let slot = batch.next_slot();
            let len = ctx
                .module
                .make_packet(&mut slot.buf, &probe, &validation, &mut thread_state)?;
            if len > MAX_PACKET_SIZE {
                return Err(ProbeError::Oversized {
                    len,
                    max: MAX_PACKET_SIZE,
                });
            }
            slot.len = len;
            batch.commit();
            if batch.is_full() {
                let (submitted, accepted) =
                    submit(&mut batch, transport, attempts, thread_id, &mut send_errors);
                shard.record_batch(submitted, accepted);
                runtime.packets_sent.fetch_add(accepted, Ordering::Relaxed);
                runtime
                    .packets_failed
                    .fetch_add(submitted - accepted, Ordering::Relaxed);
            }
        }
        shard.mark_scanned(&target);
        runtime.targets_scanned.fetch_add(1, Ordering::Relaxed);
        current = shard.next_target();
    }

    // Drain whatever is left in the batch.
    let (submitted, accepted) =
        submit(&mut batch, transport, attempts, thread_id, &mut send_errors);
    shard.record_batch(submitted, accepted);
    runtime.packets_sent.fetch_add(accepted, Ordering::Relaxed);
    runtime
        .packets_failed
        .fetch_add(submitted - accepted, Ordering::Relaxed);

    // The completion callback is what tells the orchestrator this shard
    // is done; it stamps the cooldown clock.
    shard.complete();
    tracing::debug!(
        thread = thread_id,
        targets = shard.state.targets_scanned,
        sent = shard.state.packets_sent,
        failed = shard.state.packets_failed,
        "send thread cleanly finished"
    );
    Ok(())
}

/// Run one IPv6 sender thread: targets come sequentially from the shared
/// target file instead of the cyclic permutation, so threads draw from a
/// common reader and there is no per-thread shard.
pub fn run_sender_v6(
    ctx: &SenderContext,
    thread_id: u8,
    transport: &mut dyn BatchSender,
    mut thread_state: ThreadState,
) -> Result<(), ProbeError> {
    let conf = &ctx.config;
    let runtime = &ctx.runtime;
    let targets = ctx
        .ipv6_targets
        .as_ref()
        .expect("IPv6 sender without a target file");
    let saddr = conf
        .ipv6_source_ip
        .expect("IPv6 sender without a source address");
    let dport = conf.ports.get(0);
    tracing::debug!(thread = thread_id, "IPv6 send thread started");

    let mut batch = prepared_batch(ctx, &mut thread_state)?;
    let attempts = conf.retries + 1;
    let mut controller = RateController::new(
        runtime.rate.load(Ordering::Relaxed),
        conf.senders,
        conf.packet_streams,
    );
    let mut send_errors = 0u64;
    let mut state = ShardState {
        max_targets: conf.max_targets,
        max_packets: conf.max_packets,
        ..ShardState::default()
    };

    loop {
        controller.pace(&runtime.rate);
        if should_stop(ctx) {
            break;
        }
        if state.max_targets.is_some_and(|m| state.targets_scanned >= m)
            || state.max_packets.is_some_and(|m| state.packets_sent >= m)
        {
            break;
        }
        let Some(daddr) = targets.next_addr() else {
            tracing::debug!(thread = thread_id, "no more target IPv6 addresses");
            break;
        };
        for probe_num in 0..conf.packet_streams {
            let validation = ctx.validator.words_v6(&saddr, &daddr, dport);
            let probe = ProbeTargetV6 {
                saddr,
                daddr,
                dport,
                hop_limit: conf.probe_ttl,
                probe_num,
            };
            let slot = batch.next_slot();
            let len = ctx
                .module
                .make_packet_v6(&mut slot.buf, &probe, &validation, &mut thread_state)?;
            if len > MAX_PACKET_SIZE {
                return Err(ProbeError::Oversized {
                    len,
                    max: MAX_PACKET_SIZE,
                });
            }
            slot.len = len;
            batch.commit();
            if batch.is_full() {
                let (submitted, accepted) =
                    submit(&mut batch, transport, attempts, thread_id, &mut send_errors);
                state.packets_sent += accepted;
                state.packets_failed += submitted - accepted;
                runtime.packets_sent.fetch_add(accepted, Ordering::Relaxed);
                runtime
                    .packets_failed
                    .fetch_add(submitted - accepted, Ordering::Relaxed);
            }
        }
        state.targets_scanned += 1;
        runtime.targets_scanned.fetch_add(1, Ordering::Relaxed);
    }

    let (submitted, accepted) =
        submit(&mut batch, transport, attempts, thread_id, &mut send_errors);
    state.packets_sent += accepted;
    runtime.packets_sent.fetch_add(accepted, Ordering::Relaxed);
    runtime
        .packets_failed
        .fetch_add(submitted - accepted, Ordering::Relaxed);

    runtime.sender_finished();
    tracing::debug!(
        thread = thread_id,
        targets = state.targets_scanned,
        sent = state.packets_sent,
        "IPv6 send thread cleanly finished"
    );
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
