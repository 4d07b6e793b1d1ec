//! Environment scrubbing for spawned tools
//!
//! Language version managers put shims first on PATH and export variables
//! that change which interpreter a tool like `fetch-password` runs under.
//! Every subprocess of a ceremony gets the environment produced here.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::EnvironmentConfig;

/// Build the environment handed to every subprocess
pub fn scrub_environment<I>(vars: I, config: &EnvironmentConfig) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env: BTreeMap<String, String> = vars.into_iter().collect();
    let roots = version_manager_roots(&env, config);

    if let Some(path) = env.get("PATH") {
        let kept: Vec<&str> = path
            .split(':')
            .filter(|entry| !entry.is_empty())
            .filter(|entry| {
                let keep = !roots.iter().any(|root| Path::new(entry).starts_with(root));
                if !keep {
                    debug!(entry = %entry, "Dropping PATH entry");
                }
                keep
            })
            .collect();
        let scrubbed = kept.join(":");
        env.insert("PATH".into(), scrubbed);
    }

    for name in &config.remove_vars {
        env.remove(name);
    }
    env.retain(|name, _| {
        !config
            .remove_prefixes
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
    });

    env
}

fn version_manager_roots(env: &BTreeMap<String, String>, config: &EnvironmentConfig) -> Vec<PathBuf> {
    let home = env.get("HOME").map(PathBuf::from);

    let configured = config.strip_path_prefixes.iter().filter_map(|prefix| {
        match prefix.strip_prefix("~/") {
            Some(rest) => home.as_ref().map(|home| home.join(rest)),
            None => Some(PathBuf::from(prefix)),
        }
    });
    let from_env = config
        .root_vars
        .iter()
        .filter_map(|name| env.get(name))
        .filter(|value| !value.is_empty())
        .map(PathBuf::from);

    configured.chain(from_env).collect()
}
