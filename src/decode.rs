//! Packed I/Q sample helpers and phase-code decoding.
//!
//! Samples arrive as `u32` words with I in the low 16 bits and Q in the high
//! 16 bits, both two's complement.

/// Split a packed sample into `(I, Q)`.
pub fn unpack(sample: u32) -> (i16, i16) {
    (sample as u16 as i16, (sample >> 16) as u16 as i16)
}

/// Pack `(I, Q)` into a sample word.
pub fn pack(i: i16, q: i16) -> u32 {
    (u32::from(q as u16) << 16) | u32::from(i as u16)
}

/// Negate I and Q of every sample.
///
/// Negation wraps, so `i16::MIN` maps to itself and applying this twice
/// always restores the input.
pub fn invert(samples: &mut [u32]) {
    for s in samples.iter_mut() {
        let (i, q) = unpack(*s);
        *s = pack(i.wrapping_neg(), q.wrapping_neg());
    }
}

/// Remove a phase code from one channel in place.
///
/// Each output sample `n` for `n < len - code.len()` is the correlation of
/// the `code.len()` raw samples starting at `n` with the code, divided by the
/// code length and rounded to the nearest integer (ties away from zero).
/// Samples from `len - code.len()` onward are left untouched. Codes of
/// length 0 or 1 leave the channel unchanged.
pub fn phase_decode(samples: &mut [u32], code: &[i32]) {
    let nbaud = code.len();
    if nbaud <= 1 || samples.len() <= nbaud {
        return;
    }
    for n in 0..samples.len() - nbaud {
        let (mut isum, mut qsum) = (0i64, 0i64);
        for (k, &chip) in code.iter().enumerate() {
            let (i, q) = unpack(samples[n + k]);
            isum += i64::from(i) * i64::from(chip);
            qsum += i64::from(q) * i64::from(chip);
        }
        samples[n] = pack(average(isum, nbaud), average(qsum, nbaud));
    }
}

fn average(sum: i64, n: usize) -> i16 {
    let v = (sum as f64 / n as f64).round();
    v.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_layout() {
        assert_eq!(pack(1, -1), 0xFFFF_0001);
        assert_eq!(unpack(0xFFFF_0001), (1, -1));
        assert_eq!(unpack(pack(i16::MIN, i16::MAX)), (i16::MIN, i16::MAX));
    }

    #[test]
    fn invert_negates() {
        let mut s = [pack(100, -200)];
        invert(&mut s);
        assert_eq!(unpack(s[0]), (-100, 200));
    }

    #[test]
    fn invert_twice_is_identity() {
        let original: Vec<u32> = [0u32, 1, 0x8000_8000, 0x7FFF_0001, 0xDEAD_BEEF, u32::MAX]
            .into_iter()
            .collect();
        let mut s = original.clone();
        invert(&mut s);
        invert(&mut s);
        assert_eq!(s, original);
    }

    #[test]
    fn decode_collapses_barker_pulse() {
        // A 5-baud Barker-coded pulse of amplitude 100 on I, followed by zeros.
        let code = [1, 1, 1, -1, 1];
        let mut s: Vec<u32> = code.iter().map(|&c| pack((100 * c) as i16, 0)).collect();
        s.extend([0u32; 5]);
        phase_decode(&mut s, &code);
        assert_eq!(unpack(s[0]), (100, 0));
        // One chip overlapping at n=4: 100*1/5
        assert_eq!(unpack(s[4]), (20, 0));
        // Tail is untouched.
        assert_eq!(s[5..], [0u32; 5]);
    }

    #[test]
    fn decode_rounds_to_nearest() {
        let code = [1, 1, 1];
        // I sum = 1 + 1 + 0 = 2, 2/3 rounds to 1; Q sum = -2, rounds to -1.
        let mut s = vec![pack(1, -1), pack(1, -1), pack(0, 0), 0];
        phase_decode(&mut s, &code);
        assert_eq!(unpack(s[0]), (1, -1));
    }

    #[test]
    fn all_ones_code_on_constant_signal_is_stable() {
        let code = [1, 1, 1, 1];
        let mut s = vec![pack(7, -3); 12];
        phase_decode(&mut s, &code);
        let once = s.clone();
        phase_decode(&mut s, &code);
        assert_eq!(s, once);
    }

    #[test]
    fn single_baud_is_noop() {
        let mut s = vec![pack(5, 5); 4];
        let before = s.clone();
        phase_decode(&mut s, &[1]);
        assert_eq!(s, before);
    }
}
