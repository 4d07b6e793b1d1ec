#![no_main]

use keysign::gpg::parse_primary_fingerprints;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let listing = String::from_utf8_lossy(data);
    let fingerprints = parse_primary_fingerprints(&listing);

    // At most one fingerprint per primary key record
    let primaries = listing.lines().filter(|line| line.starts_with("pub:")).count();
    assert!(fingerprints.len() <= primaries);
    assert!(fingerprints.iter().all(|f| !f.is_empty()));
});
