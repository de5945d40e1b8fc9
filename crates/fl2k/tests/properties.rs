//! Property-based tests for the PLL solver and the wire-format permutations.

use fl2k::convert::{self, B_WIRE_OFFSETS, G_WIRE_OFFSETS, R_WIRE_OFFSETS};
use fl2k::pll;
use proptest::prelude::*;

proptest! {
    /// No reachable PLL register may decode closer to the target than the
    /// solver's pick (the decoder is a left inverse of the solver).
    #[test]
    fn prop_solver_is_optimal(
        target in 100_000u32..=150_000_000,
        mult in 3u32..=6,
        div in 2u32..=63,
        frac in 1u32..=15,
    ) {
        let (_, solved) = pll::freq_to_reg(target);
        let solver_error = (solved - target as f64).abs();

        let candidate = (mult << 20) | (frac << 16) | 0x6100 | div;
        let candidate_error = (pll::reg_to_freq(candidate) - target as f64).abs();

        prop_assert!(solver_error <= candidate_error,
            "target {target}: solver error {solver_error} beaten by \
             mult={mult} div={div} frac={frac} ({candidate_error})");
    }

    /// The solver's register always decodes to the rate it reports.
    #[test]
    fn prop_solver_reports_decoded_rate(target in 100_000u32..=150_000_000) {
        let (reg, freq) = pll::freq_to_reg(target);
        prop_assert_eq!(freq, pll::reg_to_freq(reg));
    }

    /// The three channel permutations together write every byte of a
    /// 24-byte wire group exactly once.
    #[test]
    fn prop_multichan_is_bijective(
        r in prop::collection::vec(any::<u8>(), 8),
        g in prop::collection::vec(any::<u8>(), 8),
        b in prop::collection::vec(any::<u8>(), 8),
    ) {
        let mut out = vec![0xa5u8; 24];
        convert::red(&mut out, &r, 0);
        convert::green(&mut out, &g, 0);
        convert::blue(&mut out, &b, 0);

        let mut expected: Vec<u8> = r.iter().chain(&g).chain(&b).copied().collect();
        expected.sort_unstable();
        let mut written = out.clone();
        written.sort_unstable();
        prop_assert_eq!(written, expected, "some wire byte was dropped or duplicated");

        for (&off, &sample) in R_WIRE_OFFSETS.iter().zip(&r) {
            prop_assert_eq!(out[off], sample);
        }
        for (&off, &sample) in G_WIRE_OFFSETS.iter().zip(&g) {
            prop_assert_eq!(out[off], sample);
        }
        for (&off, &sample) in B_WIRE_OFFSETS.iter().zip(&b) {
            prop_assert_eq!(out[off], sample);
        }
    }

    /// Word swapping is an involution: applied twice with zero bias it
    /// restores the input.
    #[test]
    fn prop_singlechan_involution(
        input in prop::collection::vec(any::<u8>(), 8..=256)
            .prop_map(|mut v| { v.truncate(v.len() / 8 * 8); v })
    ) {
        let mut once = vec![0u8; input.len()];
        let mut twice = vec![0u8; input.len()];
        convert::singlechan(&mut once, &input, 0);
        convert::singlechan(&mut twice, &once, 0);
        prop_assert_eq!(twice, input);
    }

    /// The signed-sample flag shifts every output byte by exactly +128
    /// modulo 256.
    #[test]
    fn prop_signed_bias_is_plus_128(input in prop::collection::vec(any::<u8>(), 8)) {
        let mut unbiased = vec![0u8; 24];
        let mut biased = vec![0u8; 24];
        convert::red(&mut unbiased, &input, 0);
        convert::red(&mut biased, &input, 128);

        for &off in &R_WIRE_OFFSETS {
            prop_assert_eq!(biased[off], unbiased[off].wrapping_add(128));
        }

        let mut unbiased = vec![0u8; 8];
        let mut biased = vec![0u8; 8];
        convert::singlechan(&mut unbiased, &input, 0);
        convert::singlechan(&mut biased, &input, 128);
        for (u, b) in unbiased.iter().zip(&biased) {
            prop_assert_eq!(*b, u.wrapping_add(128));
        }
    }
}
