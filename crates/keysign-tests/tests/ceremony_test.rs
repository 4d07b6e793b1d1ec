//! End-to-end ceremony tests against scripted tools

use std::path::Path;

use chrono::Utc;
use keysign::ceremony::{
    CONFIRM_TARGET, DISCOVER_KEYSERVERS, LOAD_IDENTITIES, PROVISION_KEYRING, PROVISION_VOLUME,
    PUBLISH, RETRIEVE_TARGET, SIGN_TARGET,
};
use keysign::gpg::isolation_args;
use keysign::{CeremonyReport, TargetKey};
use keysign_core::{Error, SequenceError, StepOutcome};
use keysign_tests::*;

#[test]
fn test_full_ceremony_with_fingerprint() {
    let harness = Harness::standard();
    let mut ceremony = harness.ceremony(harness.config(TARGET_FPR));

    let report = ceremony.run().unwrap();

    assert_eq!(report.outcome(CONFIRM_TARGET), Some(StepOutcome::Skipped));
    assert_eq!(
        report.ran(),
        vec![
            PROVISION_VOLUME,
            LOAD_IDENTITIES,
            DISCOVER_KEYSERVERS,
            PROVISION_KEYRING,
            RETRIEVE_TARGET,
            SIGN_TARGET,
            PUBLISH,
        ]
    );

    let world = harness.world.borrow();
    assert_eq!(
        world.signatures,
        vec![
            Signature {
                signer: RELEASE_FPR.into(),
                target: TARGET_FPR.into(),
                passphrase: RELEASE_PASSPHRASE.into(),
            },
            Signature {
                signer: ARCHIVE_FPR.into(),
                target: TARGET_FPR.into(),
                passphrase: ARCHIVE_PASSPHRASE.into(),
            },
        ]
    );
    let published: Vec<&str> = world.published.iter().map(|(ks, _)| ks.as_str()).collect();
    assert_eq!(published, harness.keyservers());
    assert!(world.published.iter().all(|(_, key)| key == TARGET_FPR));

    assert_eq!(world.volume_operations(), vec!["create", "destroy"]);
    assert!(!world.volume_exists);
    assert!(harness.console.borrow().prompts.is_empty());
    assert!(ceremony.volume_path().is_none());
}

#[test]
fn test_single_identity_single_keyserver() {
    let harness = Harness::default();
    {
        let mut world = harness.world.borrow_mut();
        world.add_identity(RELEASE, RELEASE_FPR, RELEASE_PASSPHRASE);
        world.keyservers = vec!["hkps://keys.example.org".into()];
        world.host_key("hkps://keys.example.org", TARGET_FPR);
    }
    let mut config = harness.config(TARGET_FPR);
    config.identities = vec![RELEASE.into()];

    harness.ceremony(config).run().unwrap();

    let world = harness.world.borrow();
    assert_eq!(world.volume_operations(), vec!["create", "destroy"]);
    assert!(!world.volume_exists);
    assert_eq!(world.calls.iter().filter(|c| c.is_gpg("--import")).count(), 1);
    assert_eq!(
        world.retrieval_attempts(),
        vec!["hkps://keys.example.org"]
    );
    assert_eq!(world.signatures.len(), 1);
    assert_eq!(world.signatures[0].signer, RELEASE_FPR);
    assert_eq!(
        world.published,
        vec![("hkps://keys.example.org".to_string(), TARGET_FPR.to_string())]
    );
}

#[test]
fn test_volume_creation_failure_is_not_retryable() {
    let harness = Harness::standard();
    harness.world.borrow_mut().fail(FailPoint::CreateVolume);

    let err = harness
        .ceremony(harness.config(TARGET_FPR))
        .run()
        .unwrap_err();

    assert_eq!(err.failed_step(), Some(PROVISION_VOLUME));
    assert!(!err.primary().is_retryable());
    assert!(err.primary().to_string().contains("out of memory"));
}

#[test]
fn test_identities_and_keyservers_loaded() {
    let harness = Harness::standard();
    let mut ceremony = harness.ceremony(harness.config(TARGET_FPR));

    ceremony.run().unwrap();

    assert_eq!(
        ceremony.identities(),
        vec![(RELEASE, RELEASE_FPR), (ARCHIVE, ARCHIVE_FPR)]
    );
    assert_eq!(ceremony.keyservers(), harness.keyservers().as_slice());
}

#[test]
fn test_short_key_id_requires_confirmation() {
    let harness = Harness::standard();
    harness.answer("sign");
    let mut ceremony = harness.ceremony(harness.config(TARGET_SHORT_ID));

    let report = ceremony.run().unwrap();

    assert_eq!(report.outcome(CONFIRM_TARGET), Some(StepOutcome::Ran));
    assert_eq!(ceremony.target(), &TargetKey::Fingerprint(TARGET_FPR.into()));

    let console = harness.console.borrow();
    assert_eq!(console.prompts.len(), 1);
    assert!(console.prompts[0].contains("'sign'"));
    assert!(console.shown[0].contains(TARGET_FPR));

    let world = harness.world.borrow();
    assert!(world.signatures.iter().all(|s| s.target == TARGET_FPR));
    assert!(world.published.iter().all(|(_, key)| key == TARGET_FPR));
}

#[test]
fn test_custom_confirmation_string() {
    let harness = Harness::standard();
    harness.answer("I have verified this key");
    let mut config = harness.config(TARGET_SHORT_ID);
    config.confirmation = "I have verified this key".into();

    assert!(harness.ceremony(config).run().is_ok());
}

#[test]
fn test_wrong_confirmation_aborts() {
    let harness = Harness::standard();
    harness.answer("Sign");
    let mut ceremony = harness.ceremony(harness.config(TARGET_SHORT_ID));

    let err = ceremony.run().unwrap_err();

    assert_eq!(err.failed_step(), Some(CONFIRM_TARGET));
    assert!(matches!(err.primary(), Error::OperatorAbort(_)));
    assert!(!err.primary().is_retryable());

    let world = harness.world.borrow();
    assert!(world.signatures.is_empty());
    assert!(world.published.is_empty());
    assert_eq!(world.destroys, 1);
}

#[test]
fn test_end_of_input_aborts() {
    let harness = Harness::standard();
    let mut ceremony = harness.ceremony(harness.config(TARGET_SHORT_ID));

    let err = ceremony.run().unwrap_err();

    assert!(matches!(err.primary(), Error::OperatorAbort(_)));
    assert!(harness.world.borrow().signatures.is_empty());
}

#[test]
fn test_ambiguous_key_id_is_refused() {
    let harness = Harness::standard();
    harness
        .world
        .borrow_mut()
        .host_key("hkps://keys-a.example.org", COLLIDING_FPR);
    harness.answer("sign");
    let mut ceremony = harness.ceremony(harness.config(TARGET_SHORT_ID));

    let err = ceremony.run().unwrap_err();

    assert_eq!(err.failed_step(), Some(CONFIRM_TARGET));
    assert!(matches!(err.primary(), Error::Precondition(msg) if msg.contains("ambiguous")));
    assert!(harness.console.borrow().prompts.is_empty());
    assert!(harness.world.borrow().signatures.is_empty());
}

#[test]
fn test_retrieval_stops_at_first_success() {
    let harness = Harness::standard();
    harness
        .world
        .borrow_mut()
        .remote_keys
        .remove("hkps://keys-a.example.org");
    let mut ceremony = harness.ceremony(harness.config(TARGET_FPR));

    ceremony.run().unwrap();

    assert_eq!(
        harness.world.borrow().retrieval_attempts(),
        vec!["hkps://keys-a.example.org", "hkps://keys-b.example.org"]
    );
}

#[test]
fn test_retrieval_exhausted() {
    let harness = Harness::standard();
    harness.world.borrow_mut().remote_keys.clear();
    let mut ceremony = harness.ceremony(harness.config(TARGET_FPR));

    let err = ceremony.run().unwrap_err();

    assert_eq!(err.failed_step(), Some(RETRIEVE_TARGET));
    assert!(matches!(
        err.primary(),
        Error::ExhaustedAlternatives { attempted: 3, .. }
    ));
    assert_eq!(harness.world.borrow().retrieval_attempts().len(), 3);
    assert_eq!(harness.world.borrow().destroys, 1);
}

#[test]
fn test_no_keyservers_discovered() {
    let harness = Harness::standard();
    harness.world.borrow_mut().keyservers.clear();
    let mut ceremony = harness.ceremony(harness.config(TARGET_FPR));

    let err = ceremony.run().unwrap_err();

    assert!(ceremony.keyservers().is_empty());
    assert_eq!(err.failed_step(), Some(RETRIEVE_TARGET));
    assert!(matches!(
        err.primary(),
        Error::ExhaustedAlternatives { attempted: 0, .. }
    ));
}

#[test]
fn test_failure_at_each_step_destroys_volume_once() {
    let cases = [
        (FailPoint::CreateVolume, PROVISION_VOLUME),
        (FailPoint::FetchFingerprint, LOAD_IDENTITIES),
        (FailPoint::DiscoverKeyservers, DISCOVER_KEYSERVERS),
        (FailPoint::Import, PROVISION_KEYRING),
        (FailPoint::Sign, SIGN_TARGET),
    ];

    for (point, step) in cases {
        let harness = Harness::standard();
        harness.world.borrow_mut().fail(point);
        let mut ceremony = harness.ceremony(harness.config(TARGET_FPR));

        let err = ceremony.run().unwrap_err();

        assert_eq!(err.failed_step(), Some(step), "fail point {:?}", point);
        assert_eq!(err.report().outcome(step), Some(StepOutcome::Failed));
        assert_eq!(harness.world.borrow().destroys, 1, "fail point {:?}", point);
        assert!(err.teardown_error().is_none());
    }
}

#[test]
fn test_import_and_sign_failures_name_the_identity() {
    let harness = Harness::standard();
    harness.world.borrow_mut().fail(FailPoint::Import);
    let err = harness
        .ceremony(harness.config(TARGET_FPR))
        .run()
        .unwrap_err();
    assert!(matches!(err.primary(), Error::ImportFailed { identity, .. } if identity == RELEASE));

    let harness = Harness::standard();
    harness.world.borrow_mut().fail(FailPoint::Sign);
    let err = harness
        .ceremony(harness.config(TARGET_FPR))
        .run()
        .unwrap_err();
    assert!(matches!(err.primary(), Error::SignFailed { identity, .. } if identity == RELEASE));
}

#[test]
fn test_publish_fails_only_when_every_keyserver_fails() {
    let harness = Harness::standard();
    harness
        .world
        .borrow_mut()
        .rejecting_keyservers
        .insert("hkps://keys-b.example.org".into());
    let mut ceremony = harness.ceremony(harness.config(TARGET_FPR));

    ceremony.run().unwrap();

    assert_eq!(ceremony.publish_failures().len(), 1);
    assert_eq!(
        ceremony.publish_failures()[0].keyserver,
        "hkps://keys-b.example.org"
    );
    assert_eq!(harness.world.borrow().published.len(), 2);

    let harness = Harness::standard();
    {
        let mut world = harness.world.borrow_mut();
        let all = world.keyservers.clone();
        world.rejecting_keyservers.extend(all);
    }
    let mut ceremony = harness.ceremony(harness.config(TARGET_FPR));

    let err = ceremony.run().unwrap_err();

    assert_eq!(err.failed_step(), Some(PUBLISH));
    assert!(matches!(
        err.primary(),
        Error::ExhaustedAlternatives { attempted: 3, .. }
    ));
    assert_eq!(ceremony.publish_failures().len(), 3);
    assert_eq!(harness.world.borrow().signatures.len(), 2);
}

#[test]
fn test_teardown_failure_after_success_is_fatal() {
    let harness = Harness::standard();
    harness.world.borrow_mut().fail(FailPoint::DestroyVolume);
    let mut ceremony = harness.ceremony(harness.config(TARGET_FPR));

    let err = ceremony.run().unwrap_err();

    assert!(matches!(err, SequenceError::Teardown { .. }));
    assert_eq!(err.failed_step(), None);
    assert_eq!(err.report().ran().len(), 7);
    assert_eq!(harness.world.borrow().signatures.len(), 2);
}

#[test]
fn test_teardown_failure_does_not_mask_step_failure() {
    let harness = Harness::standard();
    {
        let mut world = harness.world.borrow_mut();
        world.fail(FailPoint::Import);
        world.fail(FailPoint::DestroyVolume);
    }
    let mut ceremony = harness.ceremony(harness.config(TARGET_FPR));

    let err = ceremony.run().unwrap_err();

    assert_eq!(err.failed_step(), Some(PROVISION_KEYRING));
    assert!(matches!(err.primary(), Error::ImportFailed { .. }));
    assert!(err.teardown_error().is_some());
    assert_eq!(harness.world.borrow().destroys, 1);
}

#[test]
fn test_passphrase_only_travels_on_descriptor() {
    let harness = Harness::standard();
    let mut ceremony = harness.ceremony(harness.config(TARGET_FPR));

    ceremony.run().unwrap();

    let world = harness.world.borrow();
    for call in &world.calls {
        for secret in [RELEASE_PASSPHRASE, ARCHIVE_PASSPHRASE] {
            assert!(
                call.args.iter().all(|arg| !arg.contains(secret)),
                "passphrase in argv of {:?}",
                call.args
            );
            if let Some(env) = &call.env {
                assert!(env.values().all(|value| !value.contains(secret)));
            }
        }
    }

    let signing: Vec<_> = world.calls.iter().filter(|c| c.is_gpg("--sign-key")).collect();
    assert_eq!(signing.len(), 2);
    assert!(signing.iter().all(|c| c.secret_fd == Some(3) && c.stdin_len.is_none()));
    assert!(signing
        .iter()
        .all(|c| c.args.windows(2).any(|w| w == ["--pinentry-mode", "loopback"])));
}

#[test]
fn test_loopback_pinentry_can_be_disabled() {
    let harness = Harness::standard();
    let mut config = harness.config(TARGET_FPR);
    config.tools.loopback_pinentry = false;

    harness.ceremony(config).run().unwrap();

    let world = harness.world.borrow();
    let signing: Vec<_> = world.calls.iter().filter(|c| c.is_gpg("--sign-key")).collect();
    assert!(signing
        .iter()
        .all(|c| !c.args.iter().any(|arg| arg == "--pinentry-mode")));
}

#[test]
fn test_tools_run_with_scrubbed_environment() {
    let harness = Harness::standard();
    harness.ceremony(harness.config(TARGET_FPR)).run().unwrap();

    let world = harness.world.borrow();
    assert!(!world.calls.is_empty());
    for call in &world.calls {
        let env = call.env.as_ref().expect("every tool gets an explicit environment");
        assert_eq!(env["PATH"], "/usr/local/bin:/usr/bin:/bin");
        assert_eq!(env["LANG"], "C.UTF-8");
        assert!(!env.contains_key("RBENV_VERSION"));
        assert!(!env.contains_key("BUNDLE_GEMFILE"));
    }
}

#[test]
fn test_every_gpg_call_is_isolated_to_the_volume() {
    let harness = Harness::standard();
    harness.ceremony(harness.config(TARGET_FPR)).run().unwrap();

    let isolation = isolation_args(Path::new(VOLUME_PATH));
    let world = harness.world.borrow();
    let gpg_calls = world.calls_to("gpg");

    assert!(gpg_calls.len() > 5);
    for call in gpg_calls {
        assert_eq!(&call.args[..isolation.len()], isolation.as_slice());
        assert_eq!(call.cwd.as_deref(), Some(Path::new(VOLUME_PATH)));
    }
}

#[test]
fn test_audit_report() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.json");

    let harness = Harness::standard();
    harness
        .world
        .borrow_mut()
        .rejecting_keyservers
        .insert("hkps://keys-c.example.org".into());
    let mut ceremony = harness.ceremony(harness.config(TARGET_FPR));

    let started_at = Utc::now();
    let outcome = ceremony.run();
    let report = CeremonyReport::new(&ceremony, started_at, &outcome);
    assert!(report.succeeded());
    report.save(&path).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(!text.contains(RELEASE_PASSPHRASE));
    assert!(!text.contains("SECRET KEY"));

    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(json["target"]["kind"], "fingerprint");
    assert_eq!(json["target"]["value"], TARGET_FPR);
    assert_eq!(json["identities"][1]["label"], ARCHIVE);
    assert_eq!(json["identities"][1]["fingerprint"], ARCHIVE_FPR);
    assert_eq!(json["steps"].as_array().unwrap().len(), 8);
    assert_eq!(json["steps"][5]["outcome"], "skipped");
    assert_eq!(
        json["publish_failures"][0]["keyserver"],
        "hkps://keys-c.example.org"
    );
    assert!(json["error"].is_null());
    assert!(json["failed_step"].is_null());
}

#[test]
fn test_audit_report_records_failure() {
    let harness = Harness::standard();
    harness.world.borrow_mut().fail(FailPoint::Sign);
    let mut ceremony = harness.ceremony(harness.config(TARGET_FPR));

    let outcome = ceremony.run();
    let report = CeremonyReport::new(&ceremony, Utc::now(), &outcome);

    assert!(!report.succeeded());
    assert_eq!(report.failed_step.as_deref(), Some(SIGN_TARGET));
    let error = report.error.unwrap();
    assert!(error.contains("org-release"));
    assert!(error.contains("Bad passphrase"));
    assert!(report.teardown_error.is_none());
}
