#![no_main]

use keysign::target::{TargetKey, FINGERPRINT_LEN};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(key) = TargetKey::parse(input) {
        let digits = key.as_str();
        assert!(digits.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
        assert_eq!(key.is_fingerprint(), digits.len() == FINGERPRINT_LEN);

        // Normalized form parses to itself
        assert_eq!(TargetKey::parse(digits).ok(), Some(key.clone()));
    }
});
