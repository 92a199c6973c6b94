use std::{collections::BTreeMap, time::Duration};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Patrol mode: selects default repo count, timeouts, and the required
/// evidence level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Quick,
    Full,
    Release,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Quick => "quick",
            Mode::Full => "full",
            Mode::Release => "release",
        }
    }
}

/// Mode-dependent defaults; every one can be overridden by a flag.
#[derive(Debug, Clone, Copy)]
pub struct ModeDefaults {
    pub repo_count: usize,
    pub agent_wall_clock: Duration,
    pub stall_timeout: Duration,
    pub heartbeat: Duration,
    pub command_timeout: Duration,
    pub bootstrap_timeout: Duration,
    pub bootstrap_stall_timeout: Duration,
    pub per_query_timeout: Duration,
}

pub fn mode_defaults(mode: Mode) -> ModeDefaults {
    let base = ModeDefaults {
        repo_count: 1,
        agent_wall_clock: Duration::from_secs(600),
        stall_timeout: Duration::from_secs(300),
        heartbeat: Duration::from_secs(30),
        command_timeout: Duration::from_secs(120),
        bootstrap_timeout: Duration::from_secs(600),
        bootstrap_stall_timeout: Duration::from_secs(300),
        per_query_timeout: Duration::from_secs(60),
    };
    match mode {
        Mode::Quick => base,
        Mode::Full => ModeDefaults {
            repo_count: 3,
            agent_wall_clock: Duration::from_secs(900),
            ..base
        },
        Mode::Release => ModeDefaults {
            repo_count: 5,
            agent_wall_clock: Duration::from_secs(1200),
            bootstrap_timeout: Duration::from_secs(900),
            ..base
        },
    }
}

pub const ENV_STORAGE_CAP_TOTAL: &str = "PATROL_STORAGE_CAP_TOTAL";
pub const ENV_STORAGE_CAP_AGE_HOURS: &str = "PATROL_STORAGE_CAP_AGE_HOURS";
pub const ENV_STORAGE_CAP_ENTRIES: &str = "PATROL_STORAGE_CAP_ENTRIES";
pub const ENV_EMBEDDING_PROVIDER: &str = "INDEXER_EMBEDDING_PROVIDER";
pub const ENV_EMBEDDING_MODEL: &str = "INDEXER_EMBEDDING_MODEL";
pub const ENV_SKIP_HEALTH_ASSERT: &str = "PATROL_SKIP_HEALTH_ASSERT";
pub const ENV_AGENT_BIN: &str = "PATROL_AGENT_BIN";

/// The declared configuration variables, read exactly once at startup.
/// Nothing else in the process consults the environment.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    pub storage_cap_total: Option<u64>,
    pub storage_cap_age_hours: Option<u64>,
    pub storage_cap_entries: Option<usize>,
    pub embedding_provider: Option<String>,
    pub embedding_model: Option<String>,
    pub skip_health_assert: bool,
    pub agent_bin: Option<String>,
}

pub fn snapshot_env() -> EnvSnapshot {
    fn var(name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.trim().is_empty())
    }
    fn truthy(value: &Option<String>) -> bool {
        matches!(value.as_deref(), Some("1") | Some("true") | Some("yes"))
    }

    let skip = var(ENV_SKIP_HEALTH_ASSERT);
    EnvSnapshot {
        storage_cap_total: var(ENV_STORAGE_CAP_TOTAL).and_then(|v| v.parse().ok()),
        storage_cap_age_hours: var(ENV_STORAGE_CAP_AGE_HOURS).and_then(|v| v.parse().ok()),
        storage_cap_entries: var(ENV_STORAGE_CAP_ENTRIES).and_then(|v| v.parse().ok()),
        embedding_provider: var(ENV_EMBEDDING_PROVIDER),
        embedding_model: var(ENV_EMBEDDING_MODEL),
        skip_health_assert: truthy(&skip),
        agent_bin: var(ENV_AGENT_BIN),
    }
}

impl EnvSnapshot {
    /// Provider/model overrides passed straight through to the indexer's
    /// environment inside sandboxes.
    pub fn indexer_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Some(provider) = &self.embedding_provider {
            env.insert(ENV_EMBEDDING_PROVIDER.to_string(), provider.clone());
        }
        if let Some(model) = &self.embedding_model {
            env.insert(ENV_EMBEDDING_MODEL.to_string(), model.clone());
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_defaults_scale_with_mode() {
        assert_eq!(mode_defaults(Mode::Quick).repo_count, 1);
        assert_eq!(mode_defaults(Mode::Full).repo_count, 3);
        assert_eq!(mode_defaults(Mode::Release).repo_count, 5);
        assert!(
            mode_defaults(Mode::Release).agent_wall_clock
                > mode_defaults(Mode::Quick).agent_wall_clock
        );
    }

    #[test]
    fn indexer_env_carries_only_set_overrides() {
        let snapshot = EnvSnapshot {
            embedding_provider: Some("voyage".to_string()),
            ..EnvSnapshot::default()
        };
        let env = snapshot.indexer_env();
        assert_eq!(env.get(ENV_EMBEDDING_PROVIDER).unwrap(), "voyage");
        assert!(!env.contains_key(ENV_EMBEDDING_MODEL));
    }
}
