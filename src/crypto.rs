//! Keyed validation function for stateless response matching.
//!
//! Every outgoing probe encodes `prf(key, saddr‖daddr‖dport)` into protocol
//! fields (TCP sequence, UDP source port, DNS transaction id, ...). A
//! received packet is a response to one of our probes exactly when the same
//! function, recomputed from the packet's addresses, reproduces those
//! fields. No per-probe state is kept anywhere.
//!
//! The function is AES-128 over a single block, so a sender thread pays one
//! block encryption per probe, comfortably under a microsecond per packet.

use std::net::{Ipv4Addr, Ipv6Addr};

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use rand::rngs::OsRng;
use rand::{RngCore, SeedableRng};

/// The four 32-bit validation words derived for one (saddr, daddr, dport).
///
/// Word meanings are assigned by the probe modules: `word(0)` is the TCP
/// initial sequence number, `word(1)` drives source-port selection,
/// `word(2)` the DNS transaction id, and `word(3)` the IP id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validation([u32; 4]);

impl Validation {
    /// Validation word `i` (0..4).
    pub fn word(&self, i: usize) -> u32 {
        self.0[i]
    }

    /// Low 16 bits of the last word, used as the IP identification field.
    pub fn ip_id(&self) -> u16 {
        (self.0[3] & 0xFFFF) as u16
    }
}

/// Keyed PRF over probe coordinates.
///
/// Holds the expanded AES-128 key schedule; cloning is cheap enough that
/// each sender thread and the receiver keep their own copy.
#[derive(Clone)]
pub struct Validator {
    cipher: Aes128,
}

impl Validator {
    /// Construct from an explicit 128-bit key.
    pub fn new(key: [u8; 16]) -> Self {
        Self {
            cipher: Aes128::new(GenericArray::from_slice(&key)),
        }
    }

    /// Generate a fresh key.
    ///
    /// Without a seed the key comes from the OS entropy source. With a seed
    /// it is derived deterministically so that shards running on separate
    /// machines validate each other's probes.
    pub fn generate(seed: Option<u64>) -> Self {
        let mut key = [0u8; 16];
        match seed {
            Some(s) => rand::rngs::StdRng::seed_from_u64(s).fill_bytes(&mut key),
            None => OsRng.fill_bytes(&mut key),
        }
        Self::new(key)
    }

    /// Validation words for an IPv4 probe.
    ///
    /// `dport` is the destination port of the probe in host order.
    pub fn words(&self, saddr: Ipv4Addr, daddr: Ipv4Addr, dport: u16) -> Validation {
        let mut block = [0u8; 16];
        block[0..4].copy_from_slice(&saddr.octets());
        block[4..8].copy_from_slice(&daddr.octets());
        block[8..10].copy_from_slice(&dport.to_be_bytes());
        let mut ga = GenericArray::clone_from_slice(&block);
        self.cipher.encrypt_block(&mut ga);
        Validation(split_words(&ga))
    }

    /// Validation words for an IPv6 probe.
    ///
    /// The two addresses no longer fit one block, so this is a two-block
    /// CBC-MAC: encrypt the source address, XOR in the destination address
    /// with the port folded into its first two bytes, and encrypt again.
    pub fn words_v6(&self, saddr: &Ipv6Addr, daddr: &Ipv6Addr, dport: u16) -> Validation {
        let mut ga = GenericArray::clone_from_slice(&saddr.octets());
        self.cipher.encrypt_block(&mut ga);

        let daddr_octets = daddr.octets();
        let port = dport.to_be_bytes();
        for i in 0..16 {
            ga[i] ^= daddr_octets[i];
        }
        ga[0] ^= port[0];
        ga[1] ^= port[1];
        self.cipher.encrypt_block(&mut ga);
        Validation(split_words(&ga))
    }
}

fn split_words(block: &GenericArray<u8, aes::cipher::consts::U16>) -> [u32; 4] {
    let mut words = [0u32; 4];
    for (i, chunk) in block.chunks_exact(4).enumerate() {
        words[i] = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    words
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_validator() -> Validator {
        Validator::new([0x42; 16])
    }

    #[test]
    fn test_words_deterministic() {
        let v = test_validator();
        let a = v.words(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(1, 2, 3, 4), 443);
        let b = v.words(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(1, 2, 3, 4), 443);
        assert_eq!(a, b, "same inputs must produce identical words");
    }

    #[test]
    fn test_words_change_with_any_coordinate() {
        let v = test_validator();
        let base = v.words(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(1, 2, 3, 4), 443);
        let saddr = v.words(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(1, 2, 3, 4), 443);
        let daddr = v.words(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(1, 2, 3, 5), 443);
        let dport = v.words(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(1, 2, 3, 4), 444);
        assert_ne!(base, saddr);
        assert_ne!(base, daddr);
        assert_ne!(base, dport);
    }

    #[test]
    fn test_words_change_with_key() {
        let a = Validator::new([0x42; 16]).words(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(1, 2, 3, 4),
            80,
        );
        let b = Validator::new([0x43; 16]).words(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(1, 2, 3, 4),
            80,
        );
        assert_ne!(a, b, "different keys must produce different words");
    }

    #[test]
    fn test_seeded_generation_is_deterministic() {
        let v1 = Validator::generate(Some(7));
        let v2 = Validator::generate(Some(7));
        let a = v1.words(Ipv4Addr::new(192, 0, 2, 1), Ipv4Addr::new(198, 51, 100, 7), 53);
        let b = v2.words(Ipv4Addr::new(192, 0, 2, 1), Ipv4Addr::new(198, 51, 100, 7), 53);
        assert_eq!(a, b, "seeded validators on two machines must agree");
    }

    #[test]
    fn test_unseeded_generation_varies() {
        let a = Validator::generate(None).words(
            Ipv4Addr::new(192, 0, 2, 1),
            Ipv4Addr::new(198, 51, 100, 7),
            53,
        );
        let b = Validator::generate(None).words(
            Ipv4Addr::new(192, 0, 2, 1),
            Ipv4Addr::new(198, 51, 100, 7),
            53,
        );
        assert_ne!(a, b, "fresh keys must not collide");
    }

    #[test]
    fn test_ip_id_is_low_16_of_last_word() {
        let v = test_validator();
        let w = v.words(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(1, 2, 3, 4), 80);
        assert_eq!(w.ip_id() as u32, w.word(3) & 0xFFFF);
    }

    #[test]
    fn test_v6_words_deterministic_and_port_sensitive() {
        let v = test_validator();
        let s: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let d: Ipv6Addr = "2001:db8::2".parse().unwrap();
        assert_eq!(v.words_v6(&s, &d, 443), v.words_v6(&s, &d, 443));
        assert_ne!(v.words_v6(&s, &d, 443), v.words_v6(&s, &d, 444));
        assert_ne!(v.words_v6(&s, &d, 443), v.words_v6(&d, &s, 443));
    }
}
