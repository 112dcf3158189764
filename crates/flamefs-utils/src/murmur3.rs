//! MurmurHash3, 128-bit x64 variant.
//!
//! Used for rendezvous hashing of inode ids onto metadata servers; the hash
//! must be stable across versions and platforms.

const C1: u64 = 0x87c37b91114253d5;
const C2: u64 = 0x4cf5ad432745937f;

#[inline(always)]
fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51afd7ed558ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ceb9fe1a85ec53);
    k ^= k >> 33;
    k
}

#[inline(always)]
fn mix_k1(mut k1: u64) -> u64 {
    k1 = k1.wrapping_mul(C1);
    k1 = k1.rotate_left(31);
    k1.wrapping_mul(C2)
}

#[inline(always)]
fn mix_k2(mut k2: u64) -> u64 {
    k2 = k2.wrapping_mul(C2);
    k2 = k2.rotate_left(33);
    k2.wrapping_mul(C1)
}

/// Compute the MurmurHash3 x64 128-bit hash of `data` with the given seed.
/// Returns the two 64-bit output lanes `(h1, h2)`.
pub fn murmurhash3_x64_128(data: &[u8], seed: u64) -> (u64, u64) {
    let mut h1 = seed;
    let mut h2 = seed;

    let nblocks = data.len() / 16;

    for block in data.chunks_exact(16) {
        let k1 = u64::from_le_bytes(block[..8].try_into().unwrap());
        let k2 = u64::from_le_bytes(block[8..].try_into().unwrap());

        h1 ^= mix_k1(k1);
        h1 = h1.rotate_left(27);
        h1 = h1.wrapping_add(h2);
        h1 = h1.wrapping_mul(5).wrapping_add(0x52dce729);

        h2 ^= mix_k2(k2);
        h2 = h2.rotate_left(31);
        h2 = h2.wrapping_add(h1);
        h2 = h2.wrapping_mul(5).wrapping_add(0x38495ab5);
    }

    // Tail bytes accumulate little-endian into k1 (bytes 0..8) and k2 (8..16).
    let tail = &data[nblocks * 16..];
    if tail.len() > 8 {
        let mut k2 = 0u64;
        for &b in tail[8..].iter().rev() {
            k2 = (k2 << 8) | b as u64;
        }
        h2 ^= mix_k2(k2);
    }
    if !tail.is_empty() {
        let mut k1 = 0u64;
        for &b in tail[..tail.len().min(8)].iter().rev() {
            k1 = (k1 << 8) | b as u64;
        }
        h1 ^= mix_k1(k1);
    }

    h1 ^= data.len() as u64;
    h2 ^= data.len() as u64;

    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);

    h1 = fmix64(h1);
    h2 = fmix64(h2);

    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);

    (h1, h2)
}

/// The hash as 16 little-endian bytes.
pub fn murmurhash3_x64_128_bytes(data: &[u8], seed: u64) -> [u8; 16] {
    let (h1, h2) = murmurhash3_x64_128(data, seed);
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&h1.to_le_bytes());
    out[8..].copy_from_slice(&h2.to_le_bytes());
    out
}
