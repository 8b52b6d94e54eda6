// =============================================================================
// Key partitioner: murmur2, compatible with the Kafka default partitioner
// =============================================================================
//
//   partition = (murmur2(key) & 0x7fffffff) % partitions
//
// All records of one pair hash to the same partition in every process and
// across restarts, so a pair's window state is owned by exactly one worker.

const SEED: u32 = 0x9747_b28c;
const M: u32 = 0x5bd1_e995;
const R: u32 = 24;

/// 32-bit murmur2 as used by Kafka clients.
pub fn murmur2(data: &[u8]) -> i32 {
    let mut h: u32 = SEED ^ data.len() as u32;

    let chunks = data.chunks_exact(4);
    let tail = chunks.remainder();
    for chunk in chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    if tail.len() >= 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h as i32
}

/// Partition for `key` among `partitions` (must be > 0).
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    debug_assert!(partitions > 0);
    ((murmur2(key.as_bytes()) as u32) & 0x7fff_ffff) % partitions.max(1)
}
