#![no_main]

use arbitrary::Arbitrary;
use keysign::CeremonyConfig;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    identities: Vec<String>,
    target: String,
    confirmation: String,
}

fuzz_target!(|input: Input| {
    let config = CeremonyConfig {
        identities: input.identities,
        target: input.target,
        confirmation: input.confirmation,
        ..Default::default()
    };

    if config.validate().is_ok() {
        assert!(!config.identities.is_empty());
        assert!(config.identities.iter().all(|id| !id.is_empty() && !id.contains('/')));

        // A valid configuration survives a TOML round trip
        let text = config.to_toml().unwrap();
        let parsed = CeremonyConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.identities, config.identities);
        assert!(parsed.validate().is_ok());
    }
});
