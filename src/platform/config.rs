//! `havoc.toml` config loading.
//!
//! One immutable `Config` is built per run and passed explicitly into every
//! component; there are no ambient globals.

use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Base directory for run artifacts.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Remote backend for all target interaction.
    #[serde(default = "default_remote_backend")]
    pub remote_backend: crate::RemoteBackend,

    /// Clock mode. Virtual makes duration-based sampling instantaneous;
    /// intended for rehearsal against the scripted backend.
    #[serde(default = "default_clock")]
    pub clock: crate::ClockMode,

    /// Target namespace when a scenario does not name one.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Database role used by the host backend's sessions.
    #[serde(default = "default_db_user")]
    pub db_user: String,

    /// Advisory lock id used by lock-holder tasks on the relational store.
    #[serde(default = "default_lock_id")]
    pub advisory_lock_id: i64,

    /// Default experiment duration when neither scenario nor CLI sets one.
    #[serde(default = "default_duration")]
    pub duration: String,

    /// Default sampling interval.
    #[serde(default = "default_sample_interval")]
    pub sample_interval: String,

    /// Extra sampling window after the injected condition should have ended,
    /// so at least one sample lands after expected release.
    #[serde(default = "default_grace_period")]
    pub grace_period: String,

    /// Skip interactive confirmation (equivalent to `--yes` everywhere).
    #[serde(default)]
    pub unattended: bool,

    /// kubectl binary for the host backend.
    #[serde(default = "default_kubectl")]
    pub kubectl_path: String,

    /// psql binary for the host backend.
    #[serde(default = "default_psql")]
    pub psql_path: String,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from(".havoc")
}

fn default_remote_backend() -> crate::RemoteBackend {
    crate::RemoteBackend::Scripted
}

fn default_clock() -> crate::ClockMode {
    crate::ClockMode::Wall
}

fn default_namespace() -> String {
    "chaos-lab".to_string()
}

fn default_db_user() -> String {
    "app".to_string()
}

fn default_lock_id() -> i64 {
    4217
}

fn default_duration() -> String {
    "60s".to_string()
}

fn default_sample_interval() -> String {
    "10s".to_string()
}

fn default_grace_period() -> String {
    "10s".to_string()
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

fn default_psql() -> String {
    "psql".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            remote_backend: default_remote_backend(),
            clock: default_clock(),
            namespace: default_namespace(),
            db_user: default_db_user(),
            advisory_lock_id: default_lock_id(),
            duration: default_duration(),
            sample_interval: default_sample_interval(),
            grace_period: default_grace_period(),
            unattended: false,
            kubectl_path: default_kubectl(),
            psql_path: default_psql(),
        }
    }
}

impl Config {
    pub fn load_optional(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(s) => match toml::from_str::<Config>(&s) {
                Ok(cfg) => cfg,
                Err(err) => {
                    tracing::warn!("failed to parse config {}: {err}", path.display());
                    Self::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                tracing::warn!("failed to read config {}: {err}", path.display());
                Self::default()
            }
        }
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.base_dir.join("runs")
    }
}
