// Copyright 2025-2026 CEMAXECUTER LLC

//! Sample-clock PLL register search.
//!
//! Register 0x802c packs the PLL configuration: input divider in bits 0-5,
//! output divider in bits 8-11, fractional multiplier in bits 16-19 and
//! integer multiplier in bits 20-23, fed from a fixed 160 MHz reference.

/// PLL reference clock in Hz.
pub const PLL_REF_HZ: u32 = 160_000_000;

/// Decode a PLL register word to the sample clock it produces, in Hz.
///
/// The integer truncations mirror the device's own divider chain: the base
/// clock is an integer division of the multiplied reference, and the
/// fractional step is truncated to whole Hz before scaling.
pub fn reg_to_freq(reg: u32) -> f64 {
    let div = reg & 0x3f;
    let out_div = (reg >> 8) & 0xf;
    let frac = (reg >> 16) & 0xf;
    let mult = (reg >> 20) & 0xf;

    let base = (PLL_REF_HZ * mult) / div;
    let offs_div = (PLL_REF_HZ as f64 / 5.0) * mult as f64;
    let offset = (base as f64 / (offs_div / 2.0)) * 1_000_000.0;

    (base as f64 + (offset as u32 * frac) as f64) / out_div as f64
}

/// Exhaustively search the divider space for the register word whose decoded
/// rate is closest to `target_freq`. Returns the register and its decoded
/// rate in Hz.
///
/// A multiplier of 7 also locks but carries more phase noise, so the search
/// stops at 6 and prefers the higher multipliers. The output divider works
/// too, but injects enough phase noise that it stays fixed at 1.
pub fn freq_to_reg(target_freq: u32) -> (u32, f64) {
    let out_div: u32 = 1;
    let mut result_reg = 0u32;
    let mut last_error = f64::INFINITY;

    for mult in (3..=6u32).rev() {
        for div in (2..=63u32).rev() {
            for frac in 1..=15u32 {
                let reg = (mult << 20) | (frac << 16) | (0x60 << 8) | (out_div << 8) | div;
                let error = (reg_to_freq(reg) - target_freq as f64).abs();

                // keep the closest match; first found wins on ties
                if error < last_error {
                    result_reg = reg;
                    last_error = error;
                }
            }
        }
    }

    (result_reg, reg_to_freq(result_reg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_100msps_exact() {
        let (reg, freq) = freq_to_reg(100_000_000);
        assert!(
            (freq - 100_000_000.0).abs() <= 1.0,
            "100 MS/s should be reachable within 1 Hz, got {}",
            freq
        );
        assert_eq!(freq, reg_to_freq(reg));
    }

    #[test]
    fn test_7msps_is_best_reachable() {
        let target = 7_000_000u32;
        let (_, freq) = freq_to_reg(target);
        let solver_error = (freq - target as f64).abs();

        // no reachable register may beat the solver
        for mult in 3..=6u32 {
            for div in 2..=63u32 {
                for frac in 1..=15u32 {
                    let reg = (mult << 20) | (frac << 16) | 0x6100 | div;
                    let error = (reg_to_freq(reg) - target as f64).abs();
                    assert!(
                        solver_error <= error,
                        "solver error {} beaten by mult={} div={} frac={} ({})",
                        solver_error,
                        mult,
                        div,
                        frac,
                        error
                    );
                }
            }
        }
    }

    #[test]
    fn test_register_field_layout() {
        let (reg, _) = freq_to_reg(50_000_000);
        let div = reg & 0x3f;
        let out_div = (reg >> 8) & 0xf;
        let frac = (reg >> 16) & 0xf;
        let mult = (reg >> 20) & 0xf;

        assert!((2..=63).contains(&div));
        assert_eq!(out_div, 1);
        assert!((1..=15).contains(&frac));
        assert!((3..=6).contains(&mult));
        // fixed control bits carried in every programmed word
        assert_eq!(reg & 0x6000, 0x6000);
    }

    #[test]
    fn test_decode_init_parking_value() {
        // the init sequence parks the PLL at 0x00416f3f, far below any
        // usable sample rate
        let freq = reg_to_freq(0x0041_6f3f);
        assert!(freq > 0.0 && freq < 1_000_000.0, "parked at {}", freq);
    }

    #[test]
    fn test_prefers_high_multiplier() {
        // 100 MS/s decodes exactly from mult=6, div=10, frac=4; later
        // multipliers only get within 1 Hz and must not displace it
        let (reg, _) = freq_to_reg(100_000_000);
        assert_eq!((reg >> 20) & 0xf, 6);
        assert_eq!(reg & 0x3f, 10);
        assert_eq!((reg >> 16) & 0xf, 4);
    }
}
