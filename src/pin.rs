use rand::Rng;

use crate::error::SessionError;

pub const PIN_LEN: usize = 6;
const MAX_ATTEMPTS: usize = 64;

pub fn generate_pin<R: Rng>(rng: &mut R) -> String {
    rng.gen_range(100_000..=999_999u32).to_string()
}

/// Draws PINs until one is not taken. Only sessions that still exist count as
/// taken, so a deleted session's PIN can come back.
pub fn allocate_pin<R, F>(rng: &mut R, is_taken: F) -> Result<String, SessionError>
where
    R: Rng,
    F: Fn(&str) -> bool,
{
    for _ in 0..MAX_ATTEMPTS {
        let pin = generate_pin(rng);
        if !is_taken(&pin) {
            return Ok(pin);
        }
        log::debug!("PIN {pin} already in use, retrying");
    }
    Err(SessionError::PinExhausted)
}

pub fn is_valid_pin(pin: &str) -> bool {
    pin.len() == PIN_LEN && pin.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::cell::Cell;

    #[test]
    fn generated_pins_are_six_digits() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let pin = generate_pin(&mut rng);
            assert!(is_valid_pin(&pin), "bad pin {pin}");
        }
    }

    #[test]
    fn allocation_retries_past_collisions() {
        let mut rng = StdRng::seed_from_u64(42);
        let calls = Cell::new(0);
        let pin = allocate_pin(&mut rng, |_| {
            calls.set(calls.get() + 1);
            calls.get() <= 3
        })
        .unwrap();
        assert_eq!(calls.get(), 4);
        assert!(is_valid_pin(&pin));
    }

    #[test]
    fn allocation_gives_up_when_everything_is_taken() {
        let mut rng = StdRng::seed_from_u64(1);
        let err = allocate_pin(&mut rng, |_| true).unwrap_err();
        assert!(matches!(err, SessionError::PinExhausted));
    }

    #[test]
    fn rejects_malformed_pins() {
        assert!(!is_valid_pin("12345"));
        assert!(!is_valid_pin("12345a"));
        assert!(!is_valid_pin("1234567"));
        assert!(is_valid_pin("012345"));
    }
}
