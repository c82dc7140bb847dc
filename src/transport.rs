//! Transport seam: batched transmit and raw capture.
//!
//! The scan core only ever calls `send_batch` and `capture_next`; what sits
//! behind them is an adapter. Production Linux uses an `AF_PACKET` socket
//! with `sendmmsg` batching; tests use in-memory mocks; dry-run mode routes
//! batches to stdout through the active probe module's printer.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use thiserror::Error;

use crate::probe::packet::MAX_PACKET_SIZE;
use crate::probe::ProbeModule;

/// Error from a transport adapter.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket setup failed: {0}")]
    Socket(String),

    #[error("send failed: {0}")]
    Send(String),
}

// =============================================================================
// Batch
// =============================================================================

/// One packet slot inside a batch.
pub struct BatchPacket {
    pub buf: Vec<u8>,
    pub len: usize,
}

/// A fixed-capacity array of packet buffers filled by a sender thread and
/// submitted in one transport call.
pub struct Batch {
    slots: Vec<BatchPacket>,
    len: usize,
}

impl Batch {
    pub fn new(capacity: u16) -> Self {
        let mut slots = Vec::with_capacity(capacity as usize);
        slots.resize_with(capacity as usize, || BatchPacket {
            buf: vec![0u8; MAX_PACKET_SIZE],
            len: 0,
        });
        Self { slots, len: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    /// The slot the next packet should be built into.
    pub fn next_slot(&mut self) -> &mut BatchPacket {
        let i = self.len;
        &mut self.slots[i]
    }

    /// Mark the current slot as filled.
    pub fn commit(&mut self) {
        debug_assert!(self.len < self.slots.len());
        self.len += 1;
    }

    /// Drop all filled slots (after submission).
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// The filled slots, in fill order.
    pub fn filled(&self) -> impl Iterator<Item = &BatchPacket> {
        self.slots[..self.len].iter()
    }
}

// =============================================================================
// Traits
// =============================================================================

/// Batched packet transmitter.
pub trait BatchSender: Send {
    /// Submit every filled slot. Returns how many packets the transport
    /// accepted; transient per-packet errors are retried internally up to
    /// `attempts` times before the remainder counts as failed.
    fn send_batch(&mut self, batch: &Batch, attempts: u8) -> Result<usize, TransportError>;
}

/// A captured frame, starting at the link-layer header.
pub struct Captured {
    pub data: Vec<u8>,
    pub ts: SystemTime,
}

/// Passive capture source consumed by the receiver thread.
pub trait PacketCapture: Send {
    /// Next captured frame, or `None` if nothing arrived before `timeout`.
    /// The bounded wait is what lets the receiver observe stop flags.
    fn capture_next(&mut self, timeout: Duration) -> Option<Captured>;
}

/// Creates the per-thread senders and the capture source for one scan.
///
/// The orchestrator serializes calls to `sender` during thread startup,
/// which is the only time adapters may assume exclusive setup access.
/// `filter` is the probe module's BPF expression; adapters that cannot
/// attach a kernel filter may ignore it (validation catches strays).
pub trait TransportFactory {
    fn sender(&mut self, thread_id: u8) -> Result<Box<dyn BatchSender>, TransportError>;
    fn capture(&mut self, filter: &str) -> Result<Box<dyn PacketCapture>, TransportError>;
}

/// Capture source that never produces a frame (dry-run mode).
pub struct NullCapture;

impl PacketCapture for NullCapture {
    fn capture_next(&mut self, timeout: Duration) -> Option<Captured> {
        std::thread::sleep(timeout);
        None
    }
}

/// Production factory backed by the OS raw-packet facilities.
pub struct OsTransport {
    interface: String,
}

impl OsTransport {
    pub fn new(interface: String) -> Self {
        Self { interface }
    }
}

#[cfg(target_os = "linux")]
impl TransportFactory for OsTransport {
    fn sender(&mut self, _thread_id: u8) -> Result<Box<dyn BatchSender>, TransportError> {
        Ok(Box::new(AfPacketSender::new(&self.interface)?))
    }

    fn capture(&mut self, filter: &str) -> Result<Box<dyn PacketCapture>, TransportError> {
        // AF_PACKET delivers everything; the keyed validation drops what
        // the kernel filter would have.
        tracing::debug!(filter, "capture filter applied in userspace");
        Ok(Box::new(AfPacketCapture::new(&self.interface)?))
    }
}

#[cfg(not(target_os = "linux"))]
impl TransportFactory for OsTransport {
    fn sender(&mut self, _thread_id: u8) -> Result<Box<dyn BatchSender>, TransportError> {
        Err(TransportError::Socket(format!(
            "raw transmit on {} is only supported on Linux",
            self.interface
        )))
    }

    fn capture(&mut self, _filter: &str) -> Result<Box<dyn PacketCapture>, TransportError> {
        Err(TransportError::Socket(
            "raw capture is only supported on Linux".to_string(),
        ))
    }
}

// =============================================================================
// Dry-run sender
// =============================================================================

/// "Transport" that prints packets to stdout instead of sending them.
///
/// Holding the stdout lock for the whole batch keeps per-thread dumps
/// contiguous, mirroring the file lock on the real output sink.
pub struct DryRunSender {
    module: Arc<dyn ProbeModule>,
}

impl DryRunSender {
    pub fn new(module: Arc<dyn ProbeModule>) -> Self {
        Self { module }
    }
}

impl BatchSender for DryRunSender {
    fn send_batch(&mut self, batch: &Batch, _attempts: u8) -> Result<usize, TransportError> {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        for pkt in batch.filled() {
            self.module
                .print_packet(&mut lock, &pkt.buf[..pkt.len])
                .map_err(|e| TransportError::Send(format!("dry-run write: {e}")))?;
        }
        Ok(batch.len())
    }
}

// =============================================================================
// Mocks
// =============================================================================

/// In-memory sender recording every submitted packet.
///
/// `accept_per_batch` caps how many packets each `send_batch` call accepts,
/// for exercising shortfall accounting; `fail_batches` makes calls error.
#[derive(Default)]
pub struct MockBatchSender {
    pub sent: Vec<Vec<u8>>,
    pub accept_per_batch: Option<usize>,
    pub fail_batches: bool,
    pub batches: usize,
}

impl MockBatchSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accepting_at_most(limit: usize) -> Self {
        Self {
            accept_per_batch: Some(limit),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_batches: true,
            ..Self::default()
        }
    }
}

impl BatchSender for MockBatchSender {
    fn send_batch(&mut self, batch: &Batch, _attempts: u8) -> Result<usize, TransportError> {
        self.batches += 1;
        if self.fail_batches {
            return Err(TransportError::Send("mock failure".to_string()));
        }
        let accept = self
            .accept_per_batch
            .map_or(batch.len(), |cap| cap.min(batch.len()));
        for pkt in batch.filled().take(accept) {
            self.sent.push(pkt.buf[..pkt.len].to_vec());
        }
        Ok(accept)
    }
}

/// In-memory capture source fed by tests.
pub struct MockCapture {
    queue: VecDeque<Captured>,
}

impl MockCapture {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    pub fn push(&mut self, data: Vec<u8>) {
        self.queue.push_back(Captured {
            data,
            ts: SystemTime::now(),
        });
    }
}

impl Default for MockCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketCapture for MockCapture {
    fn capture_next(&mut self, _timeout: Duration) -> Option<Captured> {
        self.queue.pop_front()
    }
}

// =============================================================================
// Linux AF_PACKET adapters
// =============================================================================

/// Raw `AF_PACKET` transmitter using `sendmmsg` for whole-batch submits.
///
/// Requires `CAP_NET_RAW`. Packets must be complete Ethernet frames; the
/// kernel transmits them on the bound interface verbatim.
#[cfg(target_os = "linux")]
pub struct AfPacketSender {
    fd: i32,
    ifindex: i32,
}

#[cfg(target_os = "linux")]
impl AfPacketSender {
    pub fn new(interface: &str) -> Result<Self, TransportError> {
        let ifindex = ifindex_for(interface)?;
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                (libc::ETH_P_ALL as u16).to_be() as i32,
            )
        };
        if fd < 0 {
            return Err(TransportError::Socket(format!(
                "AF_PACKET socket (requires CAP_NET_RAW): {}",
                std::io::Error::last_os_error()
            )));
        }
        let addr = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: (libc::ETH_P_ALL as u16).to_be(),
            sll_ifindex: ifindex,
            sll_hatype: 0,
            sll_pkttype: 0,
            sll_halen: 0,
            sll_addr: [0; 8],
        };
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(TransportError::Socket(format!(
                "bind to {interface}: {err}"
            )));
        }
        Ok(Self { fd, ifindex })
    }

    pub fn interface_index(&self) -> i32 {
        self.ifindex
    }
}

#[cfg(target_os = "linux")]
fn ifindex_for(interface: &str) -> Result<i32, TransportError> {
    let name = std::ffi::CString::new(interface)
        .map_err(|_| TransportError::Socket(format!("bad interface name '{interface}'")))?;
    let idx = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if idx == 0 {
        return Err(TransportError::Socket(format!(
            "unknown interface '{interface}': {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(idx as i32)
}

#[cfg(target_os = "linux")]
impl Drop for AfPacketSender {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
        }
    }
}

#[cfg(target_os = "linux")]
impl BatchSender for AfPacketSender {
    /// Submit the batch with `sendmmsg`, resuming after partial accepts.
    /// Transient errors (EAGAIN, ENOBUFS) burn one attempt and retry the
    /// remainder; anything else fails the rest of the batch.
    fn send_batch(&mut self, batch: &Batch, attempts: u8) -> Result<usize, TransportError> {
        let packets: Vec<&BatchPacket> = batch.filled().collect();
        let mut accepted = 0usize;
        let mut tries = attempts.max(1);

        while accepted < packets.len() && tries > 0 {
            let remaining = &packets[accepted..];
            let mut iovs: Vec<libc::iovec> = remaining
                .iter()
                .map(|p| libc::iovec {
                    iov_base: p.buf.as_ptr() as *mut libc::c_void,
                    iov_len: p.len,
                })
                .collect();
            let mut msgs: Vec<libc::mmsghdr> = iovs
                .iter_mut()
                .map(|iov| {
                    let mut hdr: libc::mmsghdr = unsafe { std::mem::zeroed() };
                    hdr.msg_hdr.msg_iov = iov as *mut libc::iovec;
                    hdr.msg_hdr.msg_iovlen = 1;
                    hdr
                })
                .collect();
            let rc = unsafe {
                libc::sendmmsg(self.fd, msgs.as_mut_ptr(), msgs.len() as libc::c_uint, 0)
            };
            if rc > 0 {
                accepted += rc as usize;
                continue;
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::ENOBUFS) | Some(libc::EINTR) => {
                    tries -= 1;
                    std::thread::yield_now();
                }
                _ => {
                    if accepted == 0 {
                        return Err(TransportError::Send(format!("sendmmsg: {err}")));
                    }
                    break;
                }
            }
        }
        Ok(accepted)
    }
}

/// Raw `AF_PACKET` capture with a `poll`-bounded read, so the receiver can
/// observe stop flags between frames.
#[cfg(target_os = "linux")]
pub struct AfPacketCapture {
    fd: i32,
}

#[cfg(target_os = "linux")]
impl AfPacketCapture {
    pub fn new(interface: &str) -> Result<Self, TransportError> {
        let ifindex = ifindex_for(interface)?;
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                (libc::ETH_P_ALL as u16).to_be() as i32,
            )
        };
        if fd < 0 {
            return Err(TransportError::Socket(format!(
                "AF_PACKET capture socket: {}",
                std::io::Error::last_os_error()
            )));
        }
        let addr = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: (libc::ETH_P_ALL as u16).to_be(),
            sll_ifindex: ifindex,
            sll_hatype: 0,
            sll_pkttype: 0,
            sll_halen: 0,
            sll_addr: [0; 8],
        };
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(TransportError::Socket(format!(
                "bind capture to {interface}: {err}"
            )));
        }
        Ok(Self { fd })
    }
}

#[cfg(target_os = "linux")]
impl Drop for AfPacketCapture {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
        }
    }
}

#[cfg(target_os = "linux")]
impl PacketCapture for AfPacketCapture {
    fn capture_next(&mut self, timeout: Duration) -> Option<Captured> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
        if rc <= 0 || pfd.revents & libc::POLLIN == 0 {
            return None;
        }
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let n = unsafe {
            libc::recv(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if n <= 0 {
            return None;
        }
        buf.truncate(n as usize);
        Some(Captured {
            data: buf,
            ts: SystemTime::now(),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(batch: &mut Batch, count: usize) {
        for i in 0..count {
            let slot = batch.next_slot();
            slot.buf[0] = i as u8;
            slot.len = 1;
            batch.commit();
        }
    }

    #[test]
    fn test_batch_fill_cycle() {
        let mut batch = Batch::new(4);
        assert!(batch.is_empty());
        fill(&mut batch, 4);
        assert!(batch.is_full());
        assert_eq!(batch.filled().count(), 4);
        batch.clear();
        assert!(batch.is_empty());
        assert_eq!(batch.filled().count(), 0);
    }

    #[test]
    fn test_batch_slots_keep_capacity_after_clear() {
        let mut batch = Batch::new(2);
        fill(&mut batch, 2);
        batch.clear();
        assert_eq!(batch.next_slot().buf.len(), MAX_PACKET_SIZE);
    }

    #[test]
    fn test_mock_sender_records_filled_slots_only() {
        let mut batch = Batch::new(8);
        fill(&mut batch, 3);
        let mut sender = MockBatchSender::new();
        let accepted = sender.send_batch(&batch, 1).unwrap();
        assert_eq!(accepted, 3);
        assert_eq!(sender.sent.len(), 3);
        assert_eq!(sender.sent[2], vec![2u8]);
    }

    #[test]
    fn test_mock_sender_partial_accept() {
        let mut batch = Batch::new(8);
        fill(&mut batch, 5);
        let mut sender = MockBatchSender::accepting_at_most(2);
        assert_eq!(sender.send_batch(&batch, 1).unwrap(), 2);
    }

    #[test]
    fn test_mock_sender_failure() {
        let mut batch = Batch::new(2);
        fill(&mut batch, 1);
        let mut sender = MockBatchSender::failing();
        assert!(sender.send_batch(&batch, 3).is_err());
    }

    #[test]
    fn test_mock_capture_fifo_then_none() {
        let mut cap = MockCapture::new();
        cap.push(vec![1]);
        cap.push(vec![2]);
        assert_eq!(cap.capture_next(Duration::from_millis(1)).unwrap().data, vec![1]);
        assert_eq!(cap.capture_next(Duration::from_millis(1)).unwrap().data, vec![2]);
        assert!(cap.capture_next(Duration::from_millis(1)).is_none());
    }
}
