// Local Confirmation Numbers
//
// Produced on the device before any network call so a report has an identity
// the user can see even if the regulator is never reached. Format:
//
//     HRV-YYYYMMDD-XXXXXX-NNNN
//
// date (UTC), six random characters, process-wide sequence tag (at least four
// digits). The regulator issues its own confirmation number later; the two are
// stored side by side.

use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use uuid::Uuid;

const PREFIX: &str = "HRV";

/// No 0/O, 1/I/L - these get read back over the phone
const ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

const RANDOM_LEN: usize = 6;

static SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// Generate a local confirmation number for "now"
pub fn generate() -> String {
    generate_at(Utc::now())
}

/// Generate a local confirmation number stamped with `at`
pub fn generate_at(at: DateTime<Utc>) -> String {
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    format!(
        "{}-{}-{}-{:04}",
        PREFIX,
        at.format("%Y%m%d"),
        random_segment(),
        seq
    )
}

/// True if `value` has the shape of a locally generated number
pub fn is_local_confirmation(value: &str) -> bool {
    let parts: Vec<&str> = value.split('-').collect();
    parts.len() == 4
        && parts[0] == PREFIX
        && parts[1].len() == 8
        && parts[1].chars().all(|c| c.is_ascii_digit())
        && parts[2].len() == RANDOM_LEN
        && parts[2].bytes().all(|b| ALPHABET.contains(&b))
        && parts[3].len() >= 4
        && parts[3].chars().all(|c| c.is_ascii_digit())
}

fn random_segment() -> String {
    Uuid::new_v4()
        .as_bytes()
        .iter()
        .take(RANDOM_LEN)
        .map(|b| ALPHABET[*b as usize % ALPHABET.len()] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;

    #[test]
    fn test_format() {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 8, 30, 0).unwrap();
        let number = generate_at(at);
        assert!(number.starts_with("HRV-20261019-"), "{}", number);
        assert!(is_local_confirmation(&number), "{}", number);
    }

    #[test]
    fn test_no_collisions_in_process() {
        let numbers: HashSet<String> = (0..2000).map(|_| generate()).collect();
        assert_eq!(numbers.len(), 2000);
    }

    #[test]
    fn test_rejects_regulator_numbers() {
        assert!(!is_local_confirmation("DMF-123456"));
        assert!(!is_local_confirmation("HRV-2026-ABCDEF-0001"));
        assert!(!is_local_confirmation("HRV-20261019-ABC0EF-0001"));
    }
}
