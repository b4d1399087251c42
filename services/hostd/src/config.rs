//! Configuration for the host daemon.

use anyhow::Result;

use crate::model::BackendKind;

/// Host daemon configuration, loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for bot code folders.
    pub bots_dir: String,

    /// Path of the SQLite state database.
    pub db_path: String,

    /// Docker daemon socket for the container backend.
    pub docker_socket: String,

    /// Image the container backend launches bots from.
    pub container_image: String,

    /// Backend used for newly created bots unless the caller picks one.
    pub default_backend: BackendKind,

    /// Enforcement tick period in seconds.
    pub enforce_interval_secs: u64,

    /// Grace period before a stop escalates to a kill, in seconds.
    pub stop_grace_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let bots_dir =
            std::env::var("BOTPLANE_BOTS_DIR").unwrap_or_else(|_| "/var/lib/botplane/bots".into());

        let db_path = std::env::var("BOTPLANE_DB_PATH")
            .unwrap_or_else(|_| "/var/lib/botplane/hostd.db".into());

        let docker_socket = std::env::var("BOTPLANE_DOCKER_SOCKET")
            .unwrap_or_else(|_| "/var/run/docker.sock".into());

        let container_image = std::env::var("BOTPLANE_CONTAINER_IMAGE")
            .unwrap_or_else(|_| "botplane-runtime:latest".into());

        let default_backend = std::env::var("BOTPLANE_DEFAULT_BACKEND")
            .ok()
            .and_then(|s| BackendKind::from_str_opt(&s))
            .unwrap_or(BackendKind::Process);

        let enforce_interval_secs = std::env::var("BOTPLANE_ENFORCE_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        let stop_grace_secs = std::env::var("BOTPLANE_STOP_GRACE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let log_level = std::env::var("BOTPLANE_LOG_LEVEL").unwrap_or_else(|_| "info".into());

        Ok(Self {
            bots_dir,
            db_path,
            docker_socket,
            container_image,
            default_backend,
            enforce_interval_secs,
            stop_grace_secs,
            log_level,
        })
    }
}
