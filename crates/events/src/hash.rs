//! Seeded routing hash for partitioned transports.

/// Seeded DJB2 over `key`.
///
/// The seed is mixed into the initial state together with the key length, and
/// the high bits are folded down at the end so that `hash % partitions`
/// spreads well for small partition counts.
pub fn djb2(seed: u32, key: &[u8]) -> u32 {
    let mut d = 5381u32
        .wrapping_add(seed)
        .wrapping_add(key.len() as u32);
    for &b in key {
        d = d.wrapping_mul(33) ^ u32::from(b);
    }
    d ^ (d >> 16)
}

/// Fresh random seed for one bus instance.
pub fn seed() -> u32 {
    rand::random::<u32>()
}

/// Partition index for `key` among `partitions` lanes.
pub fn partition(seed: u32, key: &[u8], partitions: usize) -> usize {
    if partitions <= 1 {
        return 0;
    }
    djb2(seed, key) as usize % partitions
}
