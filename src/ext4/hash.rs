//! Htree hash functions (§4.6): `legacy`, `half_md4`, `tea`. `siphash` is recognized but not
//! implemented, matching the fast-commit-only corner of the format this library does not write.

use crate::error::{Error, Result};

/// `dx_root.hash_version` values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashVersion {
    Legacy,
    HalfMd4,
    Tea,
    LegacyUnsigned,
    HalfMd4Unsigned,
    TeaUnsigned,
    Siphash,
}

impl HashVersion {
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Legacy,
            1 => Self::HalfMd4,
            2 => Self::Tea,
            3 => Self::LegacyUnsigned,
            4 => Self::HalfMd4Unsigned,
            5 => Self::TeaUnsigned,
            6 => Self::Siphash,
            _ => return None,
        })
    }

    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Legacy => 0,
            Self::HalfMd4 => 1,
            Self::Tea => 2,
            Self::LegacyUnsigned => 3,
            Self::HalfMd4Unsigned => 4,
            Self::TeaUnsigned => 5,
            Self::Siphash => 6,
        }
    }
}

/// Computes the htree hash of `name` under `seed` (the superblock's `hash_seed`), per
/// `dx_root.hash_version`. The low 1 bit of the result is cleared by callers before comparison
/// since it is reserved to mark a collision continuation, not by this function.
pub fn hash(version: HashVersion, seed: [u32; 4], name: &[u8]) -> Result<u32> {
    match version {
        HashVersion::Legacy | HashVersion::LegacyUnsigned => Ok(legacy_hash(name)),
        HashVersion::HalfMd4 | HashVersion::HalfMd4Unsigned => Ok(half_md4_hash(seed, name)),
        HashVersion::Tea | HashVersion::TeaUnsigned => Ok(tea_hash(seed, name)),
        HashVersion::Siphash => Err(Error::NotImplemented("siphash htree hash (fast_commit only)")),
    }
}

/// The original, simple ext2 rolling hash: no seed mixing, just a multiply-and-add roll over
/// 4-byte little-endian chunks of the name.
#[must_use]
pub fn legacy_hash(name: &[u8]) -> u32 {
    let mut hash: u32 = 0x4F2D_FA67;
    let mut hash1: u32 = 0x7B1B_3F9E;
    for chunk in name.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        let val = u32::from_le_bytes(word);
        let new_hash = hash1.wrapping_add(hash.rotate_left(7) ^ val.wrapping_mul(0x6352_5E91));
        hash1 = hash;
        hash = new_hash;
    }
    hash << 1
}

fn str_to_words(name: &[u8], out_words: &mut [u32]) {
    let padding = (name.len() as u32) | ((name.len() as u32) << 8) | ((name.len() as u32) << 16) | ((name.len() as u32) << 24);
    let bytes_needed = out_words.len() * 4;
    let mut buf = vec![0u8; bytes_needed];
    let copy_len = name.len().min(bytes_needed);
    buf[..copy_len].copy_from_slice(&name[..copy_len]);
    if copy_len < bytes_needed {
        let pad_bytes = padding.to_le_bytes();
        for i in copy_len..bytes_needed {
            buf[i] = pad_bytes[(i - copy_len) % 4];
        }
    }
    for (i, word) in out_words.iter_mut().enumerate() {
        *word = u32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
    }
}

/// TEA (Tiny Encryption Algorithm) based htree hash, consuming the name in 16-byte chunks.
#[must_use]
pub fn tea_hash(seed: [u32; 4], name: &[u8]) -> u32 {
    let mut buf = [seed[0], seed[1], seed[2], seed[3]];
    let mut offset = 0;
    while offset < name.len() || offset == 0 {
        let chunk = &name[offset..(offset + 16).min(name.len())];
        let mut input = [0u32; 4];
        str_to_words(chunk, &mut input);
        tea_transform(&mut buf, &input);
        if name.is_empty() {
            break;
        }
        offset += 16;
    }
    buf[0]
}

fn tea_transform(buf: &mut [u32; 4], input: &[u32; 4]) {
    const DELTA: u32 = 0x9E37_79B9;
    let (mut a, mut b) = (buf[0], buf[1]);
    let mut sum: u32 = 0;
    for _ in 0..16 {
        sum = sum.wrapping_add(DELTA);
        a = a.wrapping_add(
            (b.wrapping_shl(4).wrapping_add(input[0]))
                ^ b.wrapping_add(sum)
                ^ (b.wrapping_shr(5).wrapping_add(input[1])),
        );
        b = b.wrapping_add(
            (a.wrapping_shl(4).wrapping_add(input[2]))
                ^ a.wrapping_add(sum)
                ^ (a.wrapping_shr(5).wrapping_add(input[3])),
        );
    }
    buf[0] = buf[0].wrapping_add(a);
    buf[1] = buf[1].wrapping_add(b);
}

/// Half-MD4 htree hash: the MD4 compression function's round structure (no padding scheme, no
/// final length block), consuming the name in 32-byte chunks.
#[must_use]
pub fn half_md4_hash(seed: [u32; 4], name: &[u8]) -> u32 {
    let mut buf = [seed[0], seed[1], seed[2], seed[3]];
    let mut offset = 0;
    loop {
        let chunk = &name[offset..(offset + 32).min(name.len())];
        let mut input = [0u32; 8];
        str_to_words(chunk, &mut input);
        half_md4_transform(&mut buf, &input);
        offset += 32;
        if offset >= name.len() {
            break;
        }
    }
    buf[0]
}

fn f(x: u32, y: u32, z: u32) -> u32 {
    (x & y) | (!x & z)
}

fn g(x: u32, y: u32, z: u32) -> u32 {
    (x & y) | (x & z) | (y & z)
}

fn h(x: u32, y: u32, z: u32) -> u32 {
    x ^ y ^ z
}

const K2: u32 = 0x5A82_7999;
const K3: u32 = 0x6ED9_EBA1;

#[allow(clippy::too_many_arguments)]
fn round1(a: u32, b: u32, c: u32, d: u32, k: u32, s: u32) -> u32 {
    a.wrapping_add(f(b, c, d)).wrapping_add(k).rotate_left(s)
}

fn round2(a: u32, b: u32, c: u32, d: u32, k: u32, s: u32) -> u32 {
    a.wrapping_add(g(b, c, d)).wrapping_add(k).wrapping_add(K2).rotate_left(s)
}

fn round3(a: u32, b: u32, c: u32, d: u32, k: u32, s: u32) -> u32 {
    a.wrapping_add(h(b, c, d)).wrapping_add(k).wrapping_add(K3).rotate_left(s)
}

fn half_md4_transform(buf: &mut [u32; 4], input: &[u32; 8]) {
    let (mut a, mut b, mut c, mut d) = (buf[0], buf[1], buf[2], buf[3]);

    a = round1(a, b, c, d, input[0], 3);
    d = round1(d, a, b, c, input[1], 7);
    c = round1(c, d, a, b, input[2], 11);
    b = round1(b, c, d, a, input[3], 19);
    a = round1(a, b, c, d, input[4], 3);
    d = round1(d, a, b, c, input[5], 7);
    c = round1(c, d, a, b, input[6], 11);
    b = round1(b, c, d, a, input[7], 19);

    a = round2(a, b, c, d, input[1], 3);
    d = round2(d, a, b, c, input[3], 5);
    c = round2(c, d, a, b, input[5], 9);
    b = round2(b, c, d, a, input[7], 13);
    a = round2(a, b, c, d, input[0], 3);
    d = round2(d, a, b, c, input[2], 5);
    c = round2(c, d, a, b, input[4], 9);
    b = round2(b, c, d, a, input[6], 13);

    a = round3(a, b, c, d, input[3], 3);
    d = round3(d, a, b, c, input[7], 9);
    c = round3(c, d, a, b, input[2], 11);
    b = round3(b, c, d, a, input[6], 15);
    a = round3(a, b, c, d, input[1], 3);
    d = round3(d, a, b, c, input[5], 9);
    c = round3(c, d, a, b, input[0], 11);
    b = round3(b, c, d, a, input[4], 15);

    buf[0] = buf[0].wrapping_add(a);
    buf[1] = buf[1].wrapping_add(b);
    buf[2] = buf[2].wrapping_add(c);
    buf[3] = buf[3].wrapping_add(d);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_hash_is_deterministic() {
        assert_eq!(legacy_hash(b"foo"), legacy_hash(b"foo"));
        assert_ne!(legacy_hash(b"foo"), legacy_hash(b"bar"));
    }

    #[test]
    fn tea_hash_is_deterministic_and_seed_sensitive() {
        let seed = [1, 2, 3, 4];
        let a = tea_hash(seed, b"example.txt");
        let b = tea_hash(seed, b"example.txt");
        assert_eq!(a, b);
        let c = tea_hash([5, 6, 7, 8], b"example.txt");
        assert_ne!(a, c);
    }

    #[test]
    fn half_md4_hash_is_deterministic_and_seed_sensitive() {
        let seed = [1, 2, 3, 4];
        let a = half_md4_hash(seed, b"example.txt");
        let b = half_md4_hash(seed, b"example.txt");
        assert_eq!(a, b);
        let c = half_md4_hash([9, 9, 9, 9], b"example.txt");
        assert_ne!(a, c);
    }

    #[test]
    fn siphash_is_not_implemented() {
        assert!(hash(HashVersion::Siphash, [0; 4], b"x").is_err());
    }

    #[test]
    fn hash_dispatches_by_version() {
        assert!(hash(HashVersion::Legacy, [0; 4], b"a").is_ok());
        assert!(hash(HashVersion::Tea, [1, 2, 3, 4], b"a").is_ok());
        assert!(hash(HashVersion::HalfMd4, [1, 2, 3, 4], b"a").is_ok());
    }
}
