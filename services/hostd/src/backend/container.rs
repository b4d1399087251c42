//! Container execution backend over the Docker Engine unix-socket API.
//!
//! Security model, matching the platform's isolation requirements:
//! - read-only root filesystem, code bind-mounted read-only at `/app`
//! - all capabilities dropped, `no-new-privileges`
//! - no network
//! - kernel-enforced memory limit and CPU quota
//! - tmpfs `/tmp` as the only writable space
//!
//! Two detached helpers accompany every launch: a log pump that demuxes the
//! engine's multiplexed log stream into the unit's local stderr file (so the
//! LogWatcher tails one uniform file for both backends), and a deadline task
//! that force-stops the container shortly after the bot's remaining hosting
//! time as a kernel-side backstop.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use botplane_id::UnitId;
use chrono::Utc;
use hyper::body::HttpBody;
use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{BackendError, ExecutionBackend, ExecutionUnit, LaunchSpec, UnitStats};

/// Slack added to `remaining_seconds` before the deadline fires.
const DEADLINE_SLACK_SECS: i64 = 10;

/// Backend that runs bots in hardened containers.
pub struct ContainerBackend {
    socket_path: String,
    image: String,
    client: Client<UnixConnector>,
}

impl ContainerBackend {
    /// Create a backend talking to the engine at `socket_path`, launching
    /// every bot from `image`.
    pub fn new(socket_path: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
            image: image.into(),
            client: Client::unix(),
        }
    }

    /// Whether the engine socket exists on this host.
    pub fn socket_exists(&self) -> bool {
        Path::new(&self.socket_path).exists()
    }

    fn container_name(spec: &LaunchSpec) -> String {
        format!("botplane-{}", spec.bot_id)
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Vec<u8>), BackendError> {
        engine_request(&self.client, &self.socket_path, method, path, body).await
    }

    fn api_error(status: StatusCode, body: &[u8]) -> BackendError {
        #[derive(Deserialize)]
        struct EngineError {
            message: String,
        }
        let message = serde_json::from_slice::<EngineError>(body)
            .map(|e| e.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(body).to_string());
        BackendError::Api {
            status: status.as_u16(),
            message,
        }
    }

    async fn create_container(&self, spec: &LaunchSpec) -> Result<String, BackendError> {
        let command = if spec.entrypoint.ends_with(".py") {
            vec!["python3".to_string(), spec.entrypoint.clone()]
        } else {
            vec![format!("./{}", spec.entrypoint)]
        };

        let request = CreateContainerRequest {
            image: self.image.clone(),
            cmd: command,
            working_dir: "/app".to_string(),
            env: vec![
                format!("BOT_TOKEN={}", spec.token),
                format!("BOT_ID={}", spec.bot_id),
            ],
            tty: false,
            host_config: HostConfig {
                binds: vec![format!("{}:/app:ro", spec.code_dir.display())],
                network_mode: "none".to_string(),
                readonly_rootfs: true,
                cap_drop: vec!["ALL".to_string()],
                security_opt: vec!["no-new-privileges:true".to_string()],
                tmpfs: json!({"/tmp": "size=100m,noexec,nodev,nosuid"}),
                memory: spec.memory_limit_bytes as i64,
                memory_swap: spec.memory_limit_bytes as i64,
                cpu_period: 100_000,
                cpu_quota: spec.cpu_limit_millis as i64 * 100,
            },
        };

        let body = serde_json::to_vec(&request)
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        let path = format!("/containers/create?name={}", Self::container_name(spec));
        let (status, response) = self.request(Method::POST, &path, Some(body)).await?;

        match status {
            StatusCode::CREATED => {
                #[derive(Deserialize)]
                struct Created {
                    #[serde(rename = "Id")]
                    id: String,
                }
                let created: Created = serde_json::from_slice(&response)
                    .map_err(|e| BackendError::Unavailable(e.to_string()))?;
                Ok(created.id)
            }
            StatusCode::NOT_FOUND => Err(BackendError::ImageMissing(self.image.clone())),
            _ => Err(Self::api_error(status, &response)),
        }
    }

    async fn start_container(&self, id: &str) -> Result<(), BackendError> {
        let (status, body) = self
            .request(Method::POST, &format!("/containers/{id}/start"), None)
            .await?;
        match status {
            StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED => Ok(()),
            _ => Err(Self::api_error(status, &body)),
        }
    }

    async fn remove_container(&self, id: &str) {
        let path = format!("/containers/{id}?force=true");
        if let Err(e) = self.request(Method::DELETE, &path, None).await {
            warn!(container_id = %id, error = %e, "Could not remove container");
        }
    }

    /// Stream the container's stderr into a local file until the stream
    /// ends (i.e. until the container stops).
    async fn pump_logs(
        client: Client<UnixConnector>,
        socket_path: String,
        container_id: String,
        stderr_path: PathBuf,
    ) {
        let path = format!("/containers/{container_id}/logs?follow=true&stderr=true&stdout=false");
        let uri = Uri::new(&socket_path, &path);
        let request = match Request::builder().method(Method::GET).uri(uri).body(Body::empty()) {
            Ok(r) => r,
            Err(e) => {
                warn!(container_id = %container_id, error = %e, "Log pump request failed");
                return;
            }
        };

        let response = match client.request(request).await {
            Ok(r) => r,
            Err(e) => {
                warn!(container_id = %container_id, error = %e, "Log pump connect failed");
                return;
            }
        };

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&stderr_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                warn!(container_id = %container_id, error = %e, "Log pump cannot open stderr file");
                return;
            }
        };

        let mut file = file;
        let mut body = response.into_body();
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = body.data().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(_) => break,
            };
            buffer.extend_from_slice(&chunk);

            // Engine log streams are framed: 8-byte header, 4-byte
            // big-endian payload length in bytes 4..8.
            while buffer.len() >= 8 {
                let len = u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]) as usize;
                if buffer.len() < 8 + len {
                    break;
                }
                let payload: Vec<u8> = buffer[8..8 + len].to_vec();
                buffer.drain(..8 + len);
                if file.write_all(&payload).await.is_err() {
                    return;
                }
            }
            let _ = file.flush().await;
        }

        debug!(container_id = %container_id, "Log pump finished");
    }
}

#[async_trait]
impl ExecutionBackend for ContainerBackend {
    async fn launch(&self, spec: &LaunchSpec) -> Result<ExecutionUnit, BackendError> {
        let logs_dir = spec.code_dir.join("logs");
        std::fs::create_dir_all(&logs_dir)?;
        let stderr_path = logs_dir.join("stderr.log");

        let container_id = self.create_container(spec).await?;

        if let Err(e) = self.start_container(&container_id).await {
            self.remove_container(&container_id).await;
            return Err(e);
        }

        let unit = ExecutionUnit {
            unit_id: UnitId::new(),
            bot_id: spec.bot_id,
            runtime_ref: container_id.clone(),
            stderr_path: stderr_path.clone(),
            started_at: Utc::now(),
        };

        // Local stderr mirror for the log watcher; ends when the
        // container stops.
        tokio::spawn(Self::pump_logs(
            self.client.clone(),
            self.socket_path.clone(),
            container_id.clone(),
            stderr_path,
        ));

        // Deadline backstop: the ledger should sleep the bot first, this
        // catches an orchestrator that never gets the chance.
        let deadline = Duration::from_secs(
            spec.remaining_seconds.max(0) as u64 + DEADLINE_SLACK_SECS as u64,
        );
        let client = self.client.clone();
        let socket_path = self.socket_path.clone();
        let deadline_container = container_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let path = format!("/containers/{deadline_container}/stop?t=5");
            if let Ok((StatusCode::NO_CONTENT, _)) =
                engine_request(&client, &socket_path, Method::POST, &path, None).await
            {
                warn!(container_id = %deadline_container, "Deadline backstop stopped container");
            }
        });

        info!(
            bot_id = %spec.bot_id,
            unit_id = %unit.unit_id,
            container_id = %container_id,
            "Container launched"
        );

        Ok(unit)
    }

    async fn stop(&self, unit: &ExecutionUnit, grace: Duration) -> Result<bool, BackendError> {
        let id = &unit.runtime_ref;
        let path = format!("/containers/{id}/stop?t={}", grace.as_secs());
        let (status, body) = self.request(Method::POST, &path, None).await?;

        let was_running = match status {
            StatusCode::NO_CONTENT => true,
            StatusCode::NOT_MODIFIED | StatusCode::NOT_FOUND => false,
            _ => return Err(Self::api_error(status, &body)),
        };

        if status != StatusCode::NOT_FOUND {
            self.remove_container(id).await;
        }

        info!(bot_id = %unit.bot_id, container_id = %id, was_running, "Container stopped");
        Ok(was_running)
    }

    async fn stats(&self, unit: &ExecutionUnit) -> Result<UnitStats, BackendError> {
        let id = &unit.runtime_ref;
        let path = format!("/containers/{id}/stats?stream=false");
        let (status, body) = self.request(Method::GET, &path, None).await?;

        if status == StatusCode::NOT_FOUND {
            return Ok(UnitStats::gone());
        }
        if !status.is_success() {
            return Err(Self::api_error(status, &body));
        }

        let stats: EngineStats = serde_json::from_slice(&body)
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Ok(stats.to_unit_stats())
    }

    async fn poll_exit(&self, unit: &ExecutionUnit) -> Result<Option<i32>, BackendError> {
        let id = &unit.runtime_ref;
        let (status, body) = self
            .request(Method::GET, &format!("/containers/{id}/json"), None)
            .await?;

        if status == StatusCode::NOT_FOUND {
            return Ok(Some(-1));
        }
        if !status.is_success() {
            return Err(Self::api_error(status, &body));
        }

        #[derive(Deserialize)]
        struct Inspect {
            #[serde(rename = "State")]
            state: InspectState,
        }
        #[derive(Deserialize)]
        struct InspectState {
            #[serde(rename = "Running")]
            running: bool,
            #[serde(rename = "ExitCode")]
            exit_code: i32,
        }

        let inspect: Inspect = serde_json::from_slice(&body)
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        if inspect.state.running {
            Ok(None)
        } else {
            Ok(Some(inspect.state.exit_code))
        }
    }
}

/// One HTTP exchange with the engine over its unix socket.
async fn engine_request(
    client: &Client<UnixConnector>,
    socket_path: &str,
    method: Method,
    path: &str,
    body: Option<Vec<u8>>,
) -> Result<(StatusCode, Vec<u8>), BackendError> {
    let uri = Uri::new(socket_path, path);
    let mut builder = Request::builder().method(method).uri(uri);
    if body.is_some() {
        builder = builder.header("Content-Type", "application/json");
    }
    let request = builder
        .body(body.map(Body::from).unwrap_or_else(Body::empty))
        .map_err(|e| BackendError::Unavailable(e.to_string()))?;

    let response = client
        .request(request)
        .await
        .map_err(|e| BackendError::Unavailable(e.to_string()))?;

    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body())
        .await
        .map_err(|e| BackendError::Unavailable(e.to_string()))?;
    Ok((status, bytes.to_vec()))
}

#[derive(Debug, Serialize)]
struct CreateContainerRequest {
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "Cmd")]
    cmd: Vec<String>,
    #[serde(rename = "WorkingDir")]
    working_dir: String,
    #[serde(rename = "Env")]
    env: Vec<String>,
    #[serde(rename = "Tty")]
    tty: bool,
    #[serde(rename = "HostConfig")]
    host_config: HostConfig,
}

#[derive(Debug, Serialize)]
struct HostConfig {
    #[serde(rename = "Binds")]
    binds: Vec<String>,
    #[serde(rename = "NetworkMode")]
    network_mode: String,
    #[serde(rename = "ReadonlyRootfs")]
    readonly_rootfs: bool,
    #[serde(rename = "CapDrop")]
    cap_drop: Vec<String>,
    #[serde(rename = "SecurityOpt")]
    security_opt: Vec<String>,
    #[serde(rename = "Tmpfs")]
    tmpfs: serde_json::Value,
    #[serde(rename = "Memory")]
    memory: i64,
    #[serde(rename = "MemorySwap")]
    memory_swap: i64,
    #[serde(rename = "CpuPeriod")]
    cpu_period: i64,
    #[serde(rename = "CpuQuota")]
    cpu_quota: i64,
}

/// The slice of the engine's stats payload the drain math needs.
#[derive(Debug, Default, Deserialize)]
struct EngineStats {
    #[serde(default)]
    cpu_stats: CpuStats,
    #[serde(default)]
    precpu_stats: CpuStats,
    #[serde(default)]
    memory_stats: MemoryStats,
}

#[derive(Debug, Default, Deserialize)]
struct CpuStats {
    #[serde(default)]
    cpu_usage: CpuUsage,
    #[serde(default)]
    system_cpu_usage: u64,
}

#[derive(Debug, Default, Deserialize)]
struct CpuUsage {
    #[serde(default)]
    total_usage: u64,
}

#[derive(Debug, Default, Deserialize)]
struct MemoryStats {
    #[serde(default)]
    usage: u64,
}

impl EngineStats {
    /// CPU percent from cumulative usage deltas between the engine's two
    /// samples, clamped to [0, 100].
    fn to_unit_stats(&self) -> UnitStats {
        let cpu_delta = self
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(self.precpu_stats.cpu_usage.total_usage);
        let system_delta = self
            .cpu_stats
            .system_cpu_usage
            .saturating_sub(self.precpu_stats.system_cpu_usage);

        let cpu_percent = if system_delta == 0 {
            0.0
        } else {
            (cpu_delta as f64 / system_delta as f64 * 100.0).clamp(0.0, 100.0)
        };

        UnitStats {
            cpu_percent,
            memory_mb: self.memory_stats.usage as f64 / 1024.0 / 1024.0,
            alive: true,
        }
    }
}
