//! Target-space plumbing: the allowed-address oracle, destination port
//! list, source address pool, presence bitmaps, and the IPv6 target file.
//!
//! The scan core never materializes the target list. It sees the address
//! space only through [`AddressOracle`] rank queries, and the port space
//! through [`PortList`] indexing; the cyclic iterator supplies indices.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::Mutex;

use thiserror::Error;

/// Error from target-space construction.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("invalid port specification: {0}")]
    BadPortSpec(String),

    #[error("invalid CIDR '{0}'")]
    BadCidr(String),

    #[error("failed to read {path}: {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no addresses remain after applying the blocklist")]
    NothingAllowed,
}

// =============================================================================
// Address oracle
// =============================================================================

/// Queryable view of the allowed destination address set.
///
/// `rank` and `ordinal` are inverses: `ordinal(rank(k)) == Some(k)` for
/// every `k < count_allowed()`. The receiver's seen-set is indexed by
/// ordinal, so both directions must be cheap.
pub trait AddressOracle: Send + Sync {
    /// Whether probes to `ip` are permitted.
    fn allowed(&self, ip: Ipv4Addr) -> bool;

    /// Number of allowed addresses.
    fn count_allowed(&self) -> u64;

    /// The `k`-th allowed address in canonical (numeric) order.
    ///
    /// # Panics
    /// Panics if `k >= count_allowed()`; the iterator never produces an
    /// out-of-range ordinal.
    fn rank(&self, k: u64) -> Ipv4Addr;

    /// Position of `ip` within the allowed set, if it is a member.
    fn ordinal(&self, ip: Ipv4Addr) -> Option<u64>;
}

/// Address oracle over a set of disjoint, sorted, inclusive u32 ranges.
///
/// Built from allowlist CIDRs minus blocklist CIDRs. With no allowlist the
/// base set is the full IPv4 space.
pub struct CidrOracle {
    // (start, end) inclusive, sorted, non-overlapping, non-adjacent.
    ranges: Vec<(u32, u32)>,
    // Cumulative count of addresses before each range, for rank queries.
    prefix: Vec<u64>,
    total: u64,
}

impl CidrOracle {
    /// Oracle over the entire IPv4 address space.
    pub fn full() -> Self {
        Self::from_ranges(vec![(0, u32::MAX)], &[]).expect("full space is non-empty")
    }

    /// Build from raw allowed ranges minus blocked ranges.
    pub fn from_ranges(
        allowed: Vec<(u32, u32)>,
        blocked: &[(u32, u32)],
    ) -> Result<Self, TargetError> {
        let mut ranges = normalize(allowed);
        for &b in &subtract_prep(blocked) {
            ranges = subtract(&ranges, b);
        }
        if ranges.is_empty() {
            return Err(TargetError::NothingAllowed);
        }
        let mut prefix = Vec::with_capacity(ranges.len());
        let mut total = 0u64;
        for &(s, e) in &ranges {
            prefix.push(total);
            total += (e - s) as u64 + 1;
        }
        Ok(Self {
            ranges,
            prefix,
            total,
        })
    }

    /// Build from CIDR strings.
    pub fn from_cidrs(allow: &[String], block: &[String]) -> Result<Self, TargetError> {
        let allowed = if allow.is_empty() {
            vec![(0, u32::MAX)]
        } else {
            allow
                .iter()
                .map(|c| parse_cidr(c))
                .collect::<Result<Vec<_>, _>>()?
        };
        let blocked = block
            .iter()
            .map(|c| parse_cidr(c))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_ranges(allowed, &blocked)
    }

    /// Build from on-disk allowlist/blocklist files: one CIDR per line,
    /// `#` comments and blank lines ignored.
    pub fn from_files(
        allowlist: Option<&Path>,
        blocklist: Option<&Path>,
    ) -> Result<Self, TargetError> {
        let allow = match allowlist {
            Some(p) => read_cidr_lines(p)?,
            None => Vec::new(),
        };
        let block = match blocklist {
            Some(p) => read_cidr_lines(p)?,
            None => Vec::new(),
        };
        tracing::debug!(
            allow_entries = allow.len(),
            block_entries = block.len(),
            "address oracle built from list files"
        );
        Self::from_cidrs(&allow, &block)
    }

    fn range_index(&self, v: u32) -> Result<usize, usize> {
        self.ranges.binary_search_by(|&(s, e)| {
            if v < s {
                std::cmp::Ordering::Greater
            } else if v > e {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Equal
            }
        })
    }
}

impl AddressOracle for CidrOracle {
    fn allowed(&self, ip: Ipv4Addr) -> bool {
        self.range_index(u32::from(ip)).is_ok()
    }

    fn count_allowed(&self) -> u64 {
        self.total
    }

    fn rank(&self, k: u64) -> Ipv4Addr {
        assert!(k < self.total, "ordinal {k} out of range ({})", self.total);
        let idx = match self.prefix.binary_search(&k) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let (start, _) = self.ranges[idx];
        Ipv4Addr::from(start + (k - self.prefix[idx]) as u32)
    }

    fn ordinal(&self, ip: Ipv4Addr) -> Option<u64> {
        let v = u32::from(ip);
        let idx = self.range_index(v).ok()?;
        Some(self.prefix[idx] + (v - self.ranges[idx].0) as u64)
    }
}

/// Merge overlapping/adjacent ranges and sort.
fn normalize(mut ranges: Vec<(u32, u32)>) -> Vec<(u32, u32)> {
    ranges.retain(|&(s, e)| s <= e);
    ranges.sort_unstable();
    let mut out: Vec<(u32, u32)> = Vec::with_capacity(ranges.len());
    for (s, e) in ranges {
        match out.last_mut() {
            Some(last) if s <= last.1.saturating_add(1) => last.1 = last.1.max(e),
            _ => out.push((s, e)),
        }
    }
    out
}

fn subtract_prep(blocked: &[(u32, u32)]) -> Vec<(u32, u32)> {
    normalize(blocked.to_vec())
}

/// Remove one blocked range from a normalized range set.
fn subtract(ranges: &[(u32, u32)], block: (u32, u32)) -> Vec<(u32, u32)> {
    let (bs, be) = block;
    let mut out = Vec::with_capacity(ranges.len() + 1);
    for &(s, e) in ranges {
        if e < bs || s > be {
            out.push((s, e));
            continue;
        }
        if s < bs {
            out.push((s, bs - 1));
        }
        if e > be {
            out.push((be + 1, e));
        }
    }
    out
}

/// Parse `a.b.c.d/len` or a bare address into an inclusive range.
pub fn parse_cidr(s: &str) -> Result<(u32, u32), TargetError> {
    let s = s.trim();
    let (addr_str, len) = match s.split_once('/') {
        Some((a, l)) => {
            let len: u32 = l
                .parse()
                .map_err(|_| TargetError::BadCidr(s.to_string()))?;
            if len > 32 {
                return Err(TargetError::BadCidr(s.to_string()));
            }
            (a, len)
        }
        None => (s, 32),
    };
    let addr: Ipv4Addr = addr_str
        .parse()
        .map_err(|_| TargetError::BadCidr(s.to_string()))?;
    let base = u32::from(addr);
    let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
    let start = base & mask;
    let end = start | !mask;
    Ok((start, end))
}

/// Read one CIDR/address entry per line; `#` comments and blanks skipped.
pub fn read_cidr_lines(path: &Path) -> Result<Vec<String>, TargetError> {
    let file = File::open(path).map_err(|e| TargetError::FileRead {
        path: path.display().to_string(),
        source: e,
    })?;
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| TargetError::FileRead {
            path: path.display().to_string(),
            source: e,
        })?;
        let entry = line.split('#').next().unwrap_or("").trim().to_string();
        if !entry.is_empty() {
            out.push(entry);
        }
    }
    Ok(out)
}

// =============================================================================
// Ports
// =============================================================================

/// Ordered destination port list with O(1) membership.
///
/// Order matters: target index `i` decodes to port `ports[(i-1) % len]`,
/// and the receiver checks that a response's source port is one of ours.
#[derive(Clone)]
pub struct PortList {
    ports: Vec<u16>,
    bitmap: Box<[u64; 1024]>,
}

impl PortList {
    /// Parse a port spec: `"443"`, `"1-1024"`, `"80,443,8080"`.
    /// Duplicates are dropped, first occurrence wins; order is preserved.
    pub fn parse(spec: &str) -> Result<Self, TargetError> {
        let mut ports: Vec<u16> = Vec::new();
        for part in spec.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(TargetError::BadPortSpec(spec.to_string()));
            }
            if let Some((lo, hi)) = part.split_once('-') {
                let lo: u16 = lo
                    .trim()
                    .parse()
                    .map_err(|_| TargetError::BadPortSpec(spec.to_string()))?;
                let hi: u16 = hi
                    .trim()
                    .parse()
                    .map_err(|_| TargetError::BadPortSpec(spec.to_string()))?;
                if hi < lo {
                    return Err(TargetError::BadPortSpec(spec.to_string()));
                }
                ports.extend(lo..=hi);
            } else {
                ports.push(
                    part.parse()
                        .map_err(|_| TargetError::BadPortSpec(spec.to_string()))?,
                );
            }
        }
        Ok(Self::from_ports(ports))
    }

    /// Build from an explicit list, deduplicating while preserving order.
    pub fn from_ports(raw: Vec<u16>) -> Self {
        let mut bitmap = Box::new([0u64; 1024]);
        let mut ports = Vec::with_capacity(raw.len());
        for p in raw {
            let (word, bit) = (p as usize / 64, p as usize % 64);
            if bitmap[word] & (1 << bit) == 0 {
                bitmap[word] |= 1 << bit;
                ports.push(p);
            }
        }
        Self { ports, bitmap }
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Port at position `i`.
    pub fn get(&self, i: usize) -> u16 {
        self.ports[i]
    }

    /// Whether `port` is one of the scan's destination ports.
    pub fn contains(&self, port: u16) -> bool {
        self.bitmap[port as usize / 64] & (1 << (port as usize % 64)) != 0
    }

    pub fn as_slice(&self) -> &[u16] {
        &self.ports
    }
}

// =============================================================================
// Source address pool
// =============================================================================

/// Ordered pool of source addresses probes are sent from.
///
/// Probe `i` to destination `d` uses `pool[(u32(d) + i) % len]`, spreading
/// load across sources while keeping the choice recomputable on receive.
#[derive(Clone)]
pub struct SourcePool {
    addrs: Vec<Ipv4Addr>,
}

impl SourcePool {
    pub fn new(addrs: Vec<Ipv4Addr>) -> Self {
        assert!(!addrs.is_empty(), "source pool cannot be empty");
        Self { addrs }
    }

    /// Source address for probe number `probe_num` to `daddr`.
    pub fn source_for(&self, daddr: Ipv4Addr, probe_num: u16) -> Ipv4Addr {
        if self.addrs.len() == 1 {
            return self.addrs[0];
        }
        let idx = (u32::from(daddr) as u64 + probe_num as u64) % self.addrs.len() as u64;
        self.addrs[idx as usize]
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn first(&self) -> Ipv4Addr {
        self.addrs[0]
    }

    pub fn as_slice(&self) -> &[Ipv4Addr] {
        &self.addrs
    }
}

// =============================================================================
// Presence bitmaps
// =============================================================================

/// Lazily-paged bitmap over the full u32 index space.
///
/// Backs both the list-of-IPs allowlist predicate (keyed by raw address)
/// and the receiver's seen-set (keyed by allowed-address ordinal): pages
/// materialize only for populated /16-sized chunks, so a sparse full-v4
/// scan never allocates the whole 512 MB bit space.
pub struct PagedBitmap {
    // One page per /16: 65536 bits = 1024 words.
    pages: Vec<Option<Box<[u64; 1024]>>>,
}

impl PagedBitmap {
    pub fn new() -> Self {
        let mut pages = Vec::with_capacity(65536);
        pages.resize_with(65536, || None);
        Self { pages }
    }

    pub fn set(&mut self, v: u32) {
        let page = (v >> 16) as usize;
        let low = (v & 0xFFFF) as usize;
        let words = self.pages[page].get_or_insert_with(|| Box::new([0u64; 1024]));
        words[low / 64] |= 1 << (low % 64);
    }

    pub fn check(&self, v: u32) -> bool {
        let page = (v >> 16) as usize;
        let low = (v & 0xFFFF) as usize;
        match &self.pages[page] {
            Some(words) => words[low / 64] & (1 << (low % 64)) != 0,
            None => false,
        }
    }

    /// Load one IPv4 address per line (comments/blank lines skipped).
    pub fn from_file(path: &Path) -> Result<Self, TargetError> {
        let mut set = Self::new();
        for entry in read_cidr_lines(path)? {
            let ip: Ipv4Addr = entry
                .parse()
                .map_err(|_| TargetError::BadCidr(entry.clone()))?;
            set.set(u32::from(ip));
        }
        Ok(set)
    }
}

impl Default for PagedBitmap {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// IPv6 target file
// =============================================================================

/// Sequential reader of IPv6 targets, one address per line.
///
/// IPv6 scans do not go through the cyclic permutation; sender threads
/// share this reader and each `next_addr` call hands out one target.
pub struct Ipv6TargetFile {
    reader: Mutex<BufReader<File>>,
}

impl Ipv6TargetFile {
    pub fn open(path: &Path) -> Result<Self, TargetError> {
        let file = File::open(path).map_err(|e| TargetError::FileRead {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(Self {
            reader: Mutex::new(BufReader::new(file)),
        })
    }

    /// Next target address, or `None` when the file is exhausted.
    /// Malformed lines are skipped with a warning.
    pub fn next_addr(&self) -> Option<Ipv6Addr> {
        let mut reader = self.reader.lock().expect("ipv6 target reader poisoned");
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => return None,
                Ok(_) => {
                    let entry = line.trim();
                    if entry.is_empty() || entry.starts_with('#') {
                        continue;
                    }
                    match entry.parse::<Ipv6Addr>() {
                        Ok(addr) => return Some(addr),
                        Err(_) => {
                            tracing::warn!(line = entry, "skipping malformed IPv6 target");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "IPv6 target file read error, stopping");
                    return None;
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // ── CIDR parsing ───────────────────────────────────────────────────────

    #[test]
    fn test_parse_cidr_basic() {
        assert_eq!(
            parse_cidr("10.0.0.0/8").unwrap(),
            (u32::from(Ipv4Addr::new(10, 0, 0, 0)), u32::from(Ipv4Addr::new(10, 255, 255, 255)))
        );
    }

    #[test]
    fn test_parse_cidr_host() {
        let v = u32::from(Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(parse_cidr("1.2.3.4").unwrap(), (v, v));
    }

    #[test]
    fn test_parse_cidr_zero_len_is_everything() {
        assert_eq!(parse_cidr("0.0.0.0/0").unwrap(), (0, u32::MAX));
    }

    #[test]
    fn test_parse_cidr_rejects_garbage() {
        assert!(parse_cidr("10.0.0.0/33").is_err());
        assert!(parse_cidr("not-an-ip/8").is_err());
    }

    // ── oracle ─────────────────────────────────────────────────────────────

    #[test]
    fn test_oracle_count_and_rank() {
        let o = CidrOracle::from_cidrs(&["10.0.0.0/30".into()], &[]).unwrap();
        assert_eq!(o.count_allowed(), 4);
        assert_eq!(o.rank(0), Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(o.rank(3), Ipv4Addr::new(10, 0, 0, 3));
    }

    #[test]
    fn test_oracle_rank_ordinal_inverse() {
        let o = CidrOracle::from_cidrs(
            &["10.0.0.0/29".into(), "192.168.1.0/30".into()],
            &["10.0.0.2/31".into()],
        )
        .unwrap();
        for k in 0..o.count_allowed() {
            let ip = o.rank(k);
            assert!(o.allowed(ip));
            assert_eq!(o.ordinal(ip), Some(k), "ordinal(rank({k})) mismatch");
        }
    }

    #[test]
    fn test_oracle_blocklist_excludes() {
        let o =
            CidrOracle::from_cidrs(&["10.0.0.0/29".into()], &["10.0.0.4/30".into()]).unwrap();
        assert_eq!(o.count_allowed(), 4);
        assert!(o.allowed(Ipv4Addr::new(10, 0, 0, 3)));
        assert!(!o.allowed(Ipv4Addr::new(10, 0, 0, 4)));
        assert_eq!(o.ordinal(Ipv4Addr::new(10, 0, 0, 5)), None);
    }

    #[test]
    fn test_oracle_full_space() {
        let o = CidrOracle::full();
        assert_eq!(o.count_allowed(), 1u64 << 32);
        assert_eq!(o.ordinal(Ipv4Addr::new(0, 0, 0, 5)), Some(5));
        assert_eq!(o.rank(256), Ipv4Addr::new(0, 0, 1, 0));
    }

    #[test]
    fn test_oracle_everything_blocked_is_error() {
        let r = CidrOracle::from_cidrs(&["10.0.0.0/24".into()], &["10.0.0.0/24".into()]);
        assert!(matches!(r, Err(TargetError::NothingAllowed)));
    }

    // ── ports ──────────────────────────────────────────────────────────────

    #[test]
    fn test_port_list_single() {
        let p = PortList::parse("443").unwrap();
        assert_eq!(p.as_slice(), &[443]);
        assert!(p.contains(443));
        assert!(!p.contains(80));
    }

    #[test]
    fn test_port_list_range_and_list() {
        let p = PortList::parse("80,443,1000-1002").unwrap();
        assert_eq!(p.as_slice(), &[80, 443, 1000, 1001, 1002]);
    }

    #[test]
    fn test_port_list_dedup_keeps_order() {
        let p = PortList::parse("443,80,443").unwrap();
        assert_eq!(p.as_slice(), &[443, 80]);
    }

    #[test]
    fn test_port_list_rejects_reversed_range() {
        assert!(PortList::parse("1024-80").is_err());
        assert!(PortList::parse("abc").is_err());
    }

    // ── source pool ────────────────────────────────────────────────────────

    #[test]
    fn test_source_pool_single_always_first() {
        let pool = SourcePool::new(vec![Ipv4Addr::new(10, 0, 0, 9)]);
        assert_eq!(
            pool.source_for(Ipv4Addr::new(1, 2, 3, 4), 5),
            Ipv4Addr::new(10, 0, 0, 9)
        );
    }

    #[test]
    fn test_source_pool_rotation() {
        let pool = SourcePool::new(vec![
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 3),
        ]);
        let d = Ipv4Addr::new(0, 0, 0, 0);
        let a = pool.source_for(d, 0);
        let b = pool.source_for(d, 1);
        let c = pool.source_for(d, 2);
        assert_eq!(pool.source_for(d, 3), a, "pool wraps with probe number");
        assert_ne!(a, b);
        assert_ne!(b, c);
    }

    // ── bitmaps ────────────────────────────────────────────────────────────

    #[test]
    fn test_paged_bitmap_sparse() {
        let mut bm = PagedBitmap::new();
        let a = u32::from(Ipv4Addr::new(1, 1, 1, 1));
        let b = u32::from(Ipv4Addr::new(200, 0, 0, 1));
        bm.set(a);
        assert!(bm.check(a));
        assert!(!bm.check(b));
        assert!(!bm.check(a + 1));
    }
}
