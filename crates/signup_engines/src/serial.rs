#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use rand::Rng;
use signup_contracts::registration::{
    Serial, SerialScheme, RANDOM_SERIAL_MAX, RANDOM_SERIAL_MIN,
};
use signup_contracts::ContractViolation;

/// Draws before giving up on finding an unused random serial.
pub const RANDOM_SERIAL_MAX_DRAWS: u32 = 64;

/// Picks the serial for the next row.
///
/// `current_count` is the number of rows already stored; callers hold the store
/// lock so the sequential ordinal cannot race with another append.
pub fn assign_serial<R: Rng + ?Sized>(
    scheme: SerialScheme,
    current_count: usize,
    existing: &BTreeSet<&str>,
    rng: &mut R,
) -> Result<Serial, ContractViolation> {
    match scheme {
        SerialScheme::Sequential => {
            let ordinal = u32::try_from(current_count)
                .ok()
                .and_then(|c| c.checked_add(1))
                .ok_or(ContractViolation::InvalidValue {
                    field: "serial",
                    reason: "sequential ordinal overflow",
                })?;
            Serial::sequential(ordinal)
        }
        SerialScheme::Random => {
            for _ in 0..RANDOM_SERIAL_MAX_DRAWS {
                let candidate = Serial::random(rng.gen_range(RANDOM_SERIAL_MIN..=RANDOM_SERIAL_MAX))?;
                if !existing.contains(candidate.as_str()) {
                    return Ok(candidate);
                }
            }
            Err(ContractViolation::InvalidValue {
                field: "serial",
                reason: "no unused random serial found",
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn at_serial_01_sequential_uses_count_plus_one() {
        let mut rng = StdRng::seed_from_u64(7);
        let empty = BTreeSet::new();
        let s = assign_serial(SerialScheme::Sequential, 0, &empty, &mut rng).unwrap();
        assert_eq!(s.as_str(), "001");
        let s = assign_serial(SerialScheme::Sequential, 41, &empty, &mut rng).unwrap();
        assert_eq!(s.as_str(), "042");
    }

    #[test]
    fn at_serial_02_random_is_prefixed_and_in_range() {
        let mut rng = StdRng::seed_from_u64(11);
        let empty = BTreeSet::new();
        for _ in 0..100 {
            let s = assign_serial(SerialScheme::Random, 0, &empty, &mut rng).unwrap();
            let digits = s.as_str().strip_prefix('R').unwrap();
            assert_eq!(digits.len(), 5);
            let n: u32 = digits.parse().unwrap();
            assert!((RANDOM_SERIAL_MIN..=RANDOM_SERIAL_MAX).contains(&n));
        }
    }

    #[test]
    fn at_serial_03_random_redraws_on_collision() {
        let first = {
            let mut rng = StdRng::seed_from_u64(99);
            assign_serial(SerialScheme::Random, 0, &BTreeSet::new(), &mut rng).unwrap()
        };
        let mut taken = BTreeSet::new();
        taken.insert(first.as_str());
        let mut rng = StdRng::seed_from_u64(99);
        let second = assign_serial(SerialScheme::Random, 1, &taken, &mut rng).unwrap();
        assert_ne!(first, second);
    }
}
