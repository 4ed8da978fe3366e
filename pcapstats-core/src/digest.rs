//! FNV-1a digest used by the hash table, seeded per-process to resist
//! adversarial bucket collisions. 32-bit variant.

use rand::Rng;
use std::sync::OnceLock;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

fn process_seed() -> u32 {
    static SEED: OnceLock<u32> = OnceLock::new();
    *SEED.get_or_init(|| rand::rng().random())
}

/// FNV-1a over `bytes`, mixed with the per-process seed. Wrapping
/// arithmetic throughout, matching the C implementation's reliance on
/// unsigned overflow.
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hval = FNV_OFFSET_BASIS;
    for &byte in bytes {
        hval ^= byte as u32;
        hval = hval.wrapping_mul(FNV_PRIME);
    }
    hval.wrapping_add(process_seed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_same_process_seed() {
        let a = fnv1a_32(b"hello");
        let b = fnv1a_32(b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn distinguishes_distinct_keys_with_overwhelming_probability() {
        let a = fnv1a_32(b"10.0.0.1:80");
        let b = fnv1a_32(b"10.0.0.2:80");
        assert_ne!(a, b);
    }
}
