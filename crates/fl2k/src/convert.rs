// Copyright 2025-2026 CEMAXECUTER LLC

//! Sample buffer conversion into the FL2000's on-wire byte order.
//!
//! The bulk endpoint does not take a plain interleave: the scanout engine
//! reads samples in groups of 24 wire bytes per 8 samples per channel, in an
//! empirically determined order that must be reproduced byte for byte. The
//! three channel permutations together cover all 24 positions of a group
//! exactly once.
//!
//! `bias` is 128 for producers supplying two's-complement samples (flipping
//! the sign bit lands them in unsigned DAC space) and 0 otherwise.

/// Wire offsets written by the red channel, per 8-sample group.
pub const R_WIRE_OFFSETS: [usize; 8] = [6, 1, 12, 15, 10, 21, 16, 19];
/// Wire offsets written by the green channel.
pub const G_WIRE_OFFSETS: [usize; 8] = [5, 0, 3, 14, 9, 20, 23, 18];
/// Wire offsets written by the blue channel.
pub const B_WIRE_OFFSETS: [usize; 8] = [4, 7, 2, 13, 8, 11, 22, 17];

fn scatter(out: &mut [u8], input: &[u8], offsets: &[usize; 8], bias: u8) {
    for (group, samples) in out.chunks_exact_mut(24).zip(input.chunks_exact(8)) {
        for (&off, &sample) in offsets.iter().zip(samples) {
            group[off] = sample.wrapping_add(bias);
        }
    }
}

/// Scatter red-channel samples into a multichannel wire buffer.
/// `out` holds 24 wire bytes for every 8 bytes of `input`.
pub fn red(out: &mut [u8], input: &[u8], bias: u8) {
    scatter(out, input, &R_WIRE_OFFSETS, bias);
}

/// Scatter green-channel samples into a multichannel wire buffer.
pub fn green(out: &mut [u8], input: &[u8], bias: u8) {
    scatter(out, input, &G_WIRE_OFFSETS, bias);
}

/// Scatter blue-channel samples into a multichannel wire buffer.
pub fn blue(out: &mut [u8], input: &[u8], bias: u8) {
    scatter(out, input, &B_WIRE_OFFSETS, bias);
}

/// Rewrite a single-channel (palette mode) buffer for the wire: the two
/// 32-bit words of every 8-byte group swap places. Applying it twice with
/// zero bias restores the input.
pub fn singlechan(out: &mut [u8], input: &[u8], bias: u8) {
    for (group, samples) in out.chunks_exact_mut(8).zip(input.chunks_exact(8)) {
        for k in 0..4 {
            group[k] = samples[k + 4].wrapping_add(bias);
            group[k + 4] = samples[k].wrapping_add(bias);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_cover_group_exactly_once() {
        let mut seen = [0u8; 24];
        for &off in R_WIRE_OFFSETS
            .iter()
            .chain(&G_WIRE_OFFSETS)
            .chain(&B_WIRE_OFFSETS)
        {
            seen[off] += 1;
        }
        assert!(seen.iter().all(|&n| n == 1), "coverage: {:?}", seen);
    }

    #[test]
    fn test_multichan_group_layout() {
        let r: Vec<u8> = (0..8).collect();
        let g: Vec<u8> = (8..16).collect();
        let b: Vec<u8> = (16..24).collect();
        let mut out = vec![0u8; 24];

        red(&mut out, &r, 0);
        green(&mut out, &g, 0);
        blue(&mut out, &b, 0);

        for (j, &off) in R_WIRE_OFFSETS.iter().enumerate() {
            assert_eq!(out[off], j as u8, "red sample {} at wire offset {}", j, off);
        }
        for (j, &off) in G_WIRE_OFFSETS.iter().enumerate() {
            assert_eq!(out[off], 8 + j as u8);
        }
        for (j, &off) in B_WIRE_OFFSETS.iter().enumerate() {
            assert_eq!(out[off], 16 + j as u8);
        }
    }

    #[test]
    fn test_multichan_alignment_across_groups() {
        // sample k of each channel lands in wire group k / 8 so that R/G/B
        // samples with the same index leave the DAC pins together
        let input: Vec<u8> = (0..48).map(|i| i as u8).collect();
        let mut out = vec![0u8; 144];
        red(&mut out, &input, 0);

        for (k, &sample) in input.iter().enumerate() {
            let group = k / 8;
            let off = R_WIRE_OFFSETS[k % 8];
            assert_eq!(out[group * 24 + off], sample);
        }
    }

    #[test]
    fn test_singlechan_swaps_words() {
        let input: Vec<u8> = (0..16).collect();
        let mut out = vec![0u8; 16];
        singlechan(&mut out, &input, 0);
        assert_eq!(
            out,
            [4, 5, 6, 7, 0, 1, 2, 3, 12, 13, 14, 15, 8, 9, 10, 11]
        );
    }

    #[test]
    fn test_singlechan_involution() {
        let input: Vec<u8> = (0..64).map(|i| (i * 37) as u8).collect();
        let mut once = vec![0u8; 64];
        let mut twice = vec![0u8; 64];
        singlechan(&mut once, &input, 0);
        singlechan(&mut twice, &once, 0);
        assert_eq!(twice, input);
    }

    #[test]
    fn test_signed_bias_shifts_every_byte() {
        let input: Vec<u8> = (0..24).map(|i| (i as u8).wrapping_mul(11)).collect();
        let mut unbiased = vec![0u8; 72];
        let mut biased = vec![0u8; 72];
        red(&mut unbiased, &input, 0);
        red(&mut biased, &input, 128);

        for (&u, &b) in unbiased.iter().zip(&biased) {
            if u != 0 || b != 0 {
                assert_eq!(b, u.wrapping_add(128));
            }
        }
    }
}
