//! Scripted fakes for end-to-end ceremony tests
//!
//! [`FakeRunner`] stands in for every external tool a ceremony drives
//! (`ramdisk`, `fetch-password`, `ls-servers` and `gpg`), keeping their
//! combined state in a shared [`World`] so tests can arrange it beforehand
//! and inspect it afterwards. [`ScriptedOperator`] answers prompts from a
//! queue.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::io;
use std::path::PathBuf;
use std::rc::Rc;

use keysign::{CeremonyConfig, Operator, SigningCeremony};
use keysign_core::{CommandSpec, Output, ProcessError, ProcessRunner};

pub const RELEASE: &str = "org-release";
pub const RELEASE_FPR: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
pub const RELEASE_PASSPHRASE: &str = "correct horse battery staple";

pub const ARCHIVE: &str = "org-archive";
pub const ARCHIVE_FPR: &str = "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB";
pub const ARCHIVE_PASSPHRASE: &str = "archive-pass-9f2c";

/// The key being signed, and its short id
pub const TARGET_FPR: &str = "0123456789ABCDEF0123456789ABCDEF01234567";
pub const TARGET_SHORT_ID: &str = "01234567";

/// A different key sharing the target's short id
pub const COLLIDING_FPR: &str = "FEDCBA9876543210FEDCBA987654321001234567";

pub const VOLUME_NAME: &str = "keysign-test";
pub const VOLUME_PATH: &str = "/mnt/keysign-test";

/// Number of isolation flags ahead of every gpg operation
const ISOLATION_ARGS: usize = 10;

/// Tool operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateVolume,
    DestroyVolume,
    FetchFingerprint,
    DiscoverKeyservers,
    Import,
    Sign,
}

/// One recorded tool invocation
#[derive(Debug, Clone)]
pub struct Call {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Option<BTreeMap<String, String>>,
    pub stdin_len: Option<usize>,
    pub secret_fd: Option<i32>,
}

impl Call {
    pub fn is_gpg(&self, operation: &str) -> bool {
        self.program == "gpg" && self.args.iter().any(|arg| arg == operation)
    }
}

/// A signature gpg made, with the passphrase it was handed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub signer: String,
    pub target: String,
    pub passphrase: String,
}

/// Combined state of every faked tool
#[derive(Debug, Default)]
pub struct World {
    pub volume_exists: bool,
    pub secrets: HashMap<String, String>,
    pub keyservers: Vec<String>,
    /// Fingerprints each keyserver can hand out
    pub remote_keys: HashMap<String, Vec<String>>,
    /// Keyservers that reject uploads
    pub rejecting_keyservers: HashSet<String>,
    pub public_keys: BTreeSet<String>,
    pub secret_keys: BTreeSet<String>,
    pub failures: HashSet<FailPoint>,
    pub calls: Vec<Call>,
    pub signatures: Vec<Signature>,
    pub published: Vec<(String, String)>,
    pub creates: u32,
    pub destroys: u32,
}

impl World {
    /// Store fingerprint, key material and passphrase for an identity
    pub fn add_identity(&mut self, label: &str, fingerprint: &str, passphrase: &str) {
        let path = |field: &str| format!("gnupg/{}/{}", label, field);
        self.secrets
            .insert(path("fingerprint"), format!("{}\n", fingerprint));
        self.secrets
            .insert(path("pubkey"), format!("PUBLIC KEY {}\n", fingerprint));
        self.secrets
            .insert(path("privkey"), format!("SECRET KEY {}\n", fingerprint));
        self.secrets
            .insert(path("passphrase"), format!("{}\n", passphrase));
    }

    /// Make `fingerprint` available from `keyserver`
    pub fn host_key(&mut self, keyserver: &str, fingerprint: &str) {
        self.remote_keys
            .entry(keyserver.to_string())
            .or_default()
            .push(fingerprint.to_string());
    }

    pub fn fail(&mut self, point: FailPoint) {
        self.failures.insert(point);
    }

    fn fails(&self, point: FailPoint) -> bool {
        self.failures.contains(&point)
    }

    /// Invocations of one program
    pub fn calls_to(&self, program: &str) -> Vec<&Call> {
        self.calls.iter().filter(|c| c.program == program).collect()
    }

    /// Keyservers `--recv-keys` was tried against, in order
    pub fn retrieval_attempts(&self) -> Vec<String> {
        self.calls
            .iter()
            .filter(|c| c.is_gpg("--recv-keys"))
            .filter_map(|c| keyserver_arg(&c.args))
            .collect()
    }

    /// Volume creations and destructions, in order
    pub fn volume_operations(&self) -> Vec<String> {
        self.calls_to("ramdisk")
            .into_iter()
            .filter_map(|c| c.args.first().cloned())
            .filter(|op| op != "path")
            .collect()
    }
}

fn keyserver_arg(args: &[String]) -> Option<String> {
    args.iter()
        .position(|arg| arg == "--keyserver")
        .and_then(|i| args.get(i + 1).cloned())
}

/// A key query matches a fingerprint or any key id suffix of it
fn matches_key(fingerprint: &str, query: &str) -> bool {
    let query = query.to_ascii_uppercase();
    fingerprint == query || (query.len() < fingerprint.len() && fingerprint.ends_with(&query))
}

fn exit(program: &str, code: i32, stderr: &str) -> ProcessError {
    ProcessError::NonZeroExit {
        program: program.to_string(),
        code: Some(code),
        status: format!("exit status: {}", code),
        stderr: stderr.to_string(),
    }
}

/// [`ProcessRunner`] that simulates the ceremony's tools
#[derive(Clone, Default)]
pub struct FakeRunner {
    world: Rc<RefCell<World>>,
}

impl FakeRunner {
    pub fn new(world: Rc<RefCell<World>>) -> Self {
        Self { world }
    }

    fn ramdisk(&self, world: &mut World, args: &[&str]) -> Result<Output, ProcessError> {
        match args {
            ["path", VOLUME_NAME] if world.volume_exists => {
                Ok(Output::new(format!("{}\n", VOLUME_PATH)))
            }
            ["path", _] => Err(exit("ramdisk", 1, "no such ramdisk")),
            ["create", _] => {
                world.creates += 1;
                if world.fails(FailPoint::CreateVolume) {
                    return Err(exit("ramdisk", 1, "out of memory"));
                }
                world.volume_exists = true;
                Ok(Output::default())
            }
            ["destroy", _] => {
                world.destroys += 1;
                if world.fails(FailPoint::DestroyVolume) {
                    return Err(exit("ramdisk", 1, "device busy"));
                }
                world.volume_exists = false;
                world.public_keys.clear();
                world.secret_keys.clear();
                Ok(Output::default())
            }
            _ => Err(exit("ramdisk", 64, "usage: ramdisk path|create|destroy <name>")),
        }
    }

    fn fetch_password(&self, world: &mut World, args: &[&str]) -> Result<Output, ProcessError> {
        let [path] = args else {
            return Err(exit("fetch-password", 64, "usage: fetch-password <path>"));
        };
        if path.ends_with("/fingerprint") && world.fails(FailPoint::FetchFingerprint) {
            return Err(exit("fetch-password", 1, "store locked"));
        }
        match world.secrets.get(*path) {
            Some(value) => Ok(Output::new(value.clone())),
            None => Err(exit("fetch-password", 1, "no such secret")),
        }
    }

    fn ls_servers(&self, world: &mut World) -> Result<Output, ProcessError> {
        if world.fails(FailPoint::DiscoverKeyservers) {
            return Err(exit("ls-servers", 1, "directory unavailable"));
        }
        let mut listing = world.keyservers.join("\n");
        listing.push('\n');
        Ok(Output::new(listing))
    }

    fn gpg(&self, world: &mut World, spec: &CommandSpec) -> Result<Output, ProcessError> {
        let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
        if args.len() < ISOLATION_ARGS
            || args[0] != "--homedir"
            || args[1] != VOLUME_PATH
            || spec.cwd.as_deref() != Some(std::path::Path::new(VOLUME_PATH))
        {
            return Err(exit("gpg", 2, "not isolated to the ceremony volume"));
        }
        if !world.volume_exists {
            return Err(exit("gpg", 2, "keyring directory missing"));
        }

        match &args[ISOLATION_ARGS..] {
            ["--list-keys", key] => {
                if world.public_keys.iter().any(|f| matches_key(f, key)) {
                    Ok(Output::default())
                } else {
                    Err(exit("gpg", 2, "public key not found"))
                }
            }
            ["--list-secret-keys", key] => {
                if world.secret_keys.iter().any(|f| matches_key(f, key)) {
                    Ok(Output::default())
                } else {
                    Err(exit("gpg", 2, "secret key not found"))
                }
            }
            ["--batch", "--import"] => {
                if world.fails(FailPoint::Import) {
                    return Err(exit("gpg", 2, "no valid OpenPGP data found"));
                }
                let material = spec
                    .stdin
                    .as_ref()
                    .map(|s| String::from_utf8_lossy(s.expose()).into_owned())
                    .unwrap_or_default();
                for line in material.lines() {
                    if let Some(fpr) = line.strip_prefix("PUBLIC KEY ") {
                        world.public_keys.insert(fpr.to_string());
                    } else if let Some(fpr) = line.strip_prefix("SECRET KEY ") {
                        world.secret_keys.insert(fpr.to_string());
                    }
                }
                Ok(Output::default())
            }
            ["--keyserver", keyserver, "--recv-keys", key] => {
                let found: Vec<String> = world
                    .remote_keys
                    .get(*keyserver)
                    .map(|keys| {
                        keys.iter()
                            .filter(|f| matches_key(f, key))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                if found.is_empty() {
                    return Err(exit("gpg", 2, "keyserver receive failed"));
                }
                world.public_keys.extend(found);
                Ok(Output::default())
            }
            ["--keyserver", keyserver, "--send-keys", key] => {
                if world.rejecting_keyservers.contains(*keyserver) {
                    return Err(exit("gpg", 2, "keyserver send failed"));
                }
                world
                    .published
                    .push((keyserver.to_string(), key.to_string()));
                Ok(Output::default())
            }
            ["--with-colons", "--fingerprint", key] => {
                let mut listing = String::from("tru::1:1700000000:0:3:1:5\n");
                for fpr in world.public_keys.iter().filter(|f| matches_key(f, key)) {
                    listing.push_str(&format!(
                        "pub:-:4096:1:{}:1600000000:::-:::scESC:\nfpr:::::::::{}:\n",
                        &fpr[24..],
                        fpr
                    ));
                }
                Ok(Output::new(listing))
            }
            ["--fingerprint", key] => {
                let listing: String = world
                    .public_keys
                    .iter()
                    .filter(|f| matches_key(f, key))
                    .map(|f| format!("pub   rsa4096 2020-09-13 [SC]\n      {}\nuid   Target Person\n", f))
                    .collect();
                Ok(Output::new(listing))
            }
            ["--default-key", signer, "--passphrase-fd", "3", "--batch", "--yes", rest @ ..] => {
                let target = match rest {
                    ["--pinentry-mode", "loopback", "--sign-key", target] => target,
                    ["--sign-key", target] => target,
                    _ => return Err(exit("gpg", 2, "unexpected signing arguments")),
                };
                let passphrase = match &spec.secret_fd {
                    Some(handoff) if handoff.fd == 3 => {
                        String::from_utf8_lossy(handoff.secret.expose()).into_owned()
                    }
                    _ => return Err(exit("gpg", 2, "no passphrase on fd 3")),
                };
                if world.fails(FailPoint::Sign) {
                    return Err(exit("gpg", 2, "signing failed: Bad passphrase"));
                }
                if !world.secret_keys.contains(*signer) {
                    return Err(exit("gpg", 2, "no secret key"));
                }
                if !world.public_keys.iter().any(|f| matches_key(f, target)) {
                    return Err(exit("gpg", 2, "key not found"));
                }
                world.signatures.push(Signature {
                    signer: signer.to_string(),
                    target: target.to_string(),
                    passphrase,
                });
                Ok(Output::default())
            }
            _ => Err(exit("gpg", 2, "unsupported invocation")),
        }
    }
}

impl ProcessRunner for FakeRunner {
    fn run(&self, spec: &CommandSpec) -> Result<Output, ProcessError> {
        let mut world = self.world.borrow_mut();
        world.calls.push(Call {
            program: spec.program.clone(),
            args: spec.args.clone(),
            cwd: spec.cwd.clone(),
            env: spec.env.clone(),
            stdin_len: spec.stdin.as_ref().map(|s| s.len()),
            secret_fd: spec.secret_fd.as_ref().map(|h| h.fd),
        });

        let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
        match spec.program.as_str() {
            "ramdisk" => self.ramdisk(&mut world, &args),
            "fetch-password" => self.fetch_password(&mut world, &args),
            "ls-servers" => self.ls_servers(&mut world),
            "gpg" => self.gpg(&mut world, spec),
            other => Err(ProcessError::Spawn {
                program: other.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "not installed"),
            }),
        }
    }
}

/// What the operator saw and typed
#[derive(Debug, Default)]
pub struct Console {
    pub answers: VecDeque<String>,
    pub shown: Vec<String>,
    pub prompts: Vec<String>,
}

/// [`Operator`] answering prompts from a queue; an empty queue is end of input
#[derive(Clone, Default)]
pub struct ScriptedOperator {
    console: Rc<RefCell<Console>>,
}

impl ScriptedOperator {
    pub fn new(console: Rc<RefCell<Console>>) -> Self {
        Self { console }
    }
}

impl Operator for ScriptedOperator {
    fn show(&mut self, text: &str) -> io::Result<()> {
        self.console.borrow_mut().shown.push(text.to_string());
        Ok(())
    }

    fn prompt(&mut self, question: &str) -> io::Result<Option<String>> {
        let mut console = self.console.borrow_mut();
        console.prompts.push(question.to_string());
        Ok(console.answers.pop_front())
    }
}

/// Shared world and console plus helpers to build ceremonies over them
#[derive(Default)]
pub struct Harness {
    pub world: Rc<RefCell<World>>,
    pub console: Rc<RefCell<Console>>,
}

impl Harness {
    /// Two identities, three keyservers, the target hosted on all of them
    pub fn standard() -> Self {
        let harness = Self::default();
        {
            let mut world = harness.world.borrow_mut();
            world.add_identity(RELEASE, RELEASE_FPR, RELEASE_PASSPHRASE);
            world.add_identity(ARCHIVE, ARCHIVE_FPR, ARCHIVE_PASSPHRASE);
            world.keyservers = vec![
                "hkps://keys-a.example.org".into(),
                "hkps://keys-b.example.org".into(),
                "hkps://keys-c.example.org".into(),
            ];
            for keyserver in world.keyservers.clone() {
                world.host_key(&keyserver, TARGET_FPR);
            }
        }
        harness
    }

    pub fn config(&self, target: &str) -> CeremonyConfig {
        CeremonyConfig {
            identities: vec![RELEASE.into(), ARCHIVE.into()],
            target: target.into(),
            volume_name: VOLUME_NAME.into(),
            ..Default::default()
        }
    }

    /// Process environment the ceremony starts from
    pub fn environment() -> Vec<(String, String)> {
        [
            ("HOME", "/home/op"),
            ("PATH", "/home/op/.rbenv/shims:/usr/local/bin:/usr/bin:/bin"),
            ("RBENV_VERSION", "3.2.0"),
            ("BUNDLE_GEMFILE", "/src/Gemfile"),
            ("LANG", "C.UTF-8"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    pub fn ceremony(&self, config: CeremonyConfig) -> SigningCeremony {
        SigningCeremony::from_environment(
            config,
            Box::new(FakeRunner::new(self.world.clone())),
            Box::new(ScriptedOperator::new(self.console.clone())),
            Self::environment(),
        )
        .unwrap_or_else(|e| panic!("invalid test configuration: {}", e))
    }

    pub fn answer(&self, line: &str) {
        self.console.borrow_mut().answers.push_back(line.to_string());
    }

    /// Keyservers in discovery order
    pub fn keyservers(&self) -> Vec<String> {
        self.world.borrow().keyservers.clone()
    }
}
