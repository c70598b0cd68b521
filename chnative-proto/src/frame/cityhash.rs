//! CityHash v1.0.2, 128-bit variant.
//!
//! The server checksums every compressed block with this exact (old) revision of
//! the algorithm, so later CityHash releases cannot be substituted.

const K0: u64 = 0xc3a5c85c97cb3127;
const K1: u64 = 0xb492b66fbe98f273;
const K2: u64 = 0x9ae16a3b2f90404f;
const K3: u64 = 0xc949d7c7509e6557;
const K_MUL: u64 = 0x9ddfea08eb382d69;

/// 128-bit hash split the way it is laid out in a block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hash128 {
    pub low: u64,
    pub high: u64,
}

impl Hash128 {
    pub fn as_u128(self) -> u128 {
        ((self.high as u128) << 64) | self.low as u128
    }

    /// Header layout: low half then high half, each little-endian.
    pub fn to_le_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.low.to_le_bytes());
        out[8..].copy_from_slice(&self.high.to_le_bytes());
        out
    }

    pub fn from_le_bytes(raw: &[u8; 16]) -> Self {
        let mut low = [0u8; 8];
        let mut high = [0u8; 8];
        low.copy_from_slice(&raw[..8]);
        high.copy_from_slice(&raw[8..]);
        Hash128 {
            low: u64::from_le_bytes(low),
            high: u64::from_le_bytes(high),
        }
    }
}

#[inline]
fn fetch64(s: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&s[at..at + 8]);
    u64::from_le_bytes(b)
}

#[inline]
fn fetch32(s: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&s[at..at + 4]);
    u32::from_le_bytes(b) as u64
}

#[inline]
fn rotate(v: u64, shift: u32) -> u64 {
    if shift == 0 {
        v
    } else {
        v.rotate_right(shift)
    }
}

#[inline]
fn shift_mix(v: u64) -> u64 {
    v ^ (v >> 47)
}

#[inline]
fn hash_128_to_64(low: u64, high: u64) -> u64 {
    let mut a = (low ^ high).wrapping_mul(K_MUL);
    a ^= a >> 47;
    let mut b = (high ^ a).wrapping_mul(K_MUL);
    b ^= b >> 47;
    b.wrapping_mul(K_MUL)
}

#[inline]
fn hash_len_16(u: u64, v: u64) -> u64 {
    hash_128_to_64(u, v)
}

fn hash_len_0_to_16(s: &[u8]) -> u64 {
    let len = s.len();
    if len > 8 {
        let a = fetch64(s, 0);
        let b = fetch64(s, len - 8);
        // RotateByAtLeast1: len is in 9..=16 here, never zero.
        return hash_len_16(a, (b.wrapping_add(len as u64)).rotate_right(len as u32)) ^ b;
    }
    if len >= 4 {
        let a = fetch32(s, 0);
        return hash_len_16((len as u64).wrapping_add(a << 3), fetch32(s, len - 4));
    }
    if len > 0 {
        let a = s[0] as u32;
        let b = s[len >> 1] as u32;
        let c = s[len - 1] as u32;
        let y = a.wrapping_add(b << 8);
        let z = (len as u32).wrapping_add(c << 2);
        return shift_mix((y as u64).wrapping_mul(K2) ^ (z as u64).wrapping_mul(K3))
            .wrapping_mul(K2);
    }
    K2
}

#[inline]
fn weak_hash_len_32_with_seeds_raw(
    w: u64,
    x: u64,
    y: u64,
    z: u64,
    mut a: u64,
    mut b: u64,
) -> (u64, u64) {
    a = a.wrapping_add(w);
    b = rotate(b.wrapping_add(a).wrapping_add(z), 21);
    let c = a;
    a = a.wrapping_add(x);
    a = a.wrapping_add(y);
    b = b.wrapping_add(rotate(a, 44));
    (a.wrapping_add(z), b.wrapping_add(c))
}

#[inline]
fn weak_hash_len_32_with_seeds(s: &[u8], at: usize, a: u64, b: u64) -> (u64, u64) {
    weak_hash_len_32_with_seeds_raw(
        fetch64(s, at),
        fetch64(s, at + 8),
        fetch64(s, at + 16),
        fetch64(s, at + 24),
        a,
        b,
    )
}

fn city_murmur(s: &[u8], seed: Hash128) -> Hash128 {
    let len = s.len();
    let mut a = seed.low;
    let mut b = seed.high;
    let mut c: u64;
    let mut d: u64;
    if len <= 16 {
        a = shift_mix(a.wrapping_mul(K1)).wrapping_mul(K1);
        c = b.wrapping_mul(K1).wrapping_add(hash_len_0_to_16(s));
        d = shift_mix(a.wrapping_add(if len >= 8 { fetch64(s, 0) } else { c }));
    } else {
        c = hash_len_16(fetch64(s, len - 8).wrapping_add(K1), a);
        d = hash_len_16(b.wrapping_add(len as u64), c.wrapping_add(fetch64(s, len - 16)));
        a = a.wrapping_add(d);
        let mut at = 0;
        let mut l = len as isize - 16;
        loop {
            a ^= shift_mix(fetch64(s, at).wrapping_mul(K1)).wrapping_mul(K1);
            a = a.wrapping_mul(K1);
            b ^= a;
            c ^= shift_mix(fetch64(s, at + 8).wrapping_mul(K1)).wrapping_mul(K1);
            c = c.wrapping_mul(K1);
            d ^= c;
            at += 16;
            l -= 16;
            if l <= 0 {
                break;
            }
        }
    }
    a = hash_len_16(a, c);
    b = hash_len_16(d, b);
    Hash128 {
        low: a ^ b,
        high: hash_len_16(b, a),
    }
}

fn city_hash_128_with_seed(s: &[u8], seed: Hash128) -> Hash128 {
    let mut len = s.len();
    if len < 128 {
        return city_murmur(s, seed);
    }

    let mut x = seed.low;
    let mut y = seed.high;
    let mut z = (len as u64).wrapping_mul(K1);
    let mut v = (0u64, 0u64);
    let mut w = (0u64, 0u64);
    v.0 = rotate(y ^ K1, 49).wrapping_mul(K1).wrapping_add(fetch64(s, 0));
    v.1 = rotate(v.0, 42).wrapping_mul(K1).wrapping_add(fetch64(s, 8));
    w.0 = rotate(y.wrapping_add(z), 35).wrapping_mul(K1).wrapping_add(x);
    w.1 = rotate(x.wrapping_add(fetch64(s, 88)), 53).wrapping_mul(K1);

    let mut at = 0;
    loop {
        for _ in 0..2 {
            x = rotate(
                x.wrapping_add(y)
                    .wrapping_add(v.0)
                    .wrapping_add(fetch64(s, at + 16)),
                37,
            )
            .wrapping_mul(K1);
            y = rotate(y.wrapping_add(v.1).wrapping_add(fetch64(s, at + 48)), 42).wrapping_mul(K1);
            x ^= w.1;
            y ^= v.0;
            z = rotate(z ^ w.0, 33);
            v = weak_hash_len_32_with_seeds(s, at, v.1.wrapping_mul(K1), x.wrapping_add(w.0));
            w = weak_hash_len_32_with_seeds(s, at + 32, z.wrapping_add(w.1), y);
            std::mem::swap(&mut z, &mut x);
            at += 64;
        }
        len -= 128;
        if len < 128 {
            break;
        }
    }

    y = y.wrapping_add(rotate(w.0, 37).wrapping_mul(K0)).wrapping_add(z);
    x = x.wrapping_add(rotate(v.0.wrapping_add(z), 49).wrapping_mul(K0));

    // Up to four trailing 32-byte chunks, hashed backwards from the end.
    let mut tail_done = 0;
    while tail_done < len {
        tail_done += 32;
        y = rotate(y.wrapping_sub(x), 42)
            .wrapping_mul(K0)
            .wrapping_add(v.1);
        w.0 = w.0.wrapping_add(fetch64(s, at + len - tail_done + 16));
        x = rotate(x, 49).wrapping_mul(K0).wrapping_add(w.0);
        w.0 = w.0.wrapping_add(v.0);
        v = weak_hash_len_32_with_seeds(s, at + len - tail_done, v.0, v.1);
    }

    x = hash_len_16(x, v.0);
    y = hash_len_16(y, w.0);
    Hash128 {
        low: hash_len_16(x.wrapping_add(v.1), w.1).wrapping_add(y),
        high: hash_len_16(x.wrapping_add(w.1), y.wrapping_add(v.1)),
    }
}

/// Computes the 128-bit CityHash v1.0.2 of `s`.
pub fn city_hash_128(s: &[u8]) -> Hash128 {
    let len = s.len();
    if len >= 16 {
        city_hash_128_with_seed(
            &s[16..],
            Hash128 {
                low: fetch64(s, 0) ^ K3,
                high: fetch64(s, 8),
            },
        )
    } else if len >= 8 {
        city_hash_128_with_seed(
            &[],
            Hash128 {
                low: fetch64(s, 0) ^ (len as u64).wrapping_mul(K0),
                high: fetch64(s, len - 8) ^ K1,
            },
        )
    } else {
        city_hash_128_with_seed(s, Hash128 { low: K0, high: K1 })
    }
}
