//! ビルドエンジンの選択
//!
//! デーモンの疎通とセッションビルド対応を一度だけ判定し、
//! クラシックとセッションのどちらのドライバーを使うかを決めます。

use crate::config::EngineConfig;
use crate::daemon::{BuilderKind, DaemonClient};
use crate::error::{BuildError, Result};
use crate::resolver::BuildResolver;
use crate::spec::BuildSpec;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// デーモンの能力判定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineCapability {
    pub available: bool,
    pub session_supported: bool,
    pub remote: bool,
}

impl EngineCapability {
    pub fn unavailable(remote: bool) -> Self {
        Self {
            available: false,
            session_supported: false,
            remote,
        }
    }

    pub fn engine(&self) -> BuildEngine {
        if self.session_supported {
            BuildEngine::Session
        } else {
            BuildEngine::Classic
        }
    }
}

/// 使用するビルドドライバー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildEngine {
    Classic,
    Session,
}

impl BuildEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildEngine::Classic => "classic",
            BuildEngine::Session => "buildkit",
        }
    }
}

pub struct BuildEngineSelector<'a> {
    daemon: &'a dyn DaemonClient,
    config: &'a EngineConfig,
}

impl<'a> BuildEngineSelector<'a> {
    pub fn new(daemon: &'a dyn DaemonClient, config: &'a EngineConfig) -> Self {
        Self { daemon, config }
    }

    /// デーモンの能力を判定
    ///
    /// 疎通できない場合は `available = false`（エラーではない）。
    /// 疎通後の判定失敗や `DOCKER_BUILDKIT` の不正値は `CapabilityDetection` エラー。
    pub async fn probe(&self, cancel: &CancellationToken) -> Result<EngineCapability> {
        let remote = self.daemon.is_remote();

        match with_deadline(self.config.probe_timeout(), cancel, self.daemon.ping()).await {
            Ok(()) => {}
            Err(BuildError::Cancelled) => return Err(BuildError::Cancelled),
            Err(e) => {
                tracing::debug!("Docker daemon is not available: {}", e);
                return Ok(EngineCapability::unavailable(remote));
            }
        }

        let builder = with_deadline(self.config.info_timeout(), cancel, self.daemon.builder_kind())
            .await
            .map_err(|e| match e {
                BuildError::Cancelled => BuildError::Cancelled,
                other => BuildError::CapabilityDetection(other.to_string()),
            })?;

        let mut session_supported = builder == BuilderKind::BuildKit;
        if let Some(value) = self.config.buildkit.as_deref() {
            session_supported = parse_bool(value).ok_or_else(|| {
                BuildError::CapabilityDetection(format!(
                    "DOCKER_BUILDKIT environment variable expects boolean value, got {:?}",
                    value
                ))
            })?;
        }

        tracing::debug!(remote, session_supported, "Docker daemon capability detected");
        Ok(EngineCapability {
            available: true,
            session_supported,
            remote,
        })
    }

    /// ビルドファイルを解決
    ///
    /// 明示指定が存在しなければ `DockerfileNotFound`。規約名が無ければ `None`。
    pub fn resolve_build_file(&self, spec: &BuildSpec) -> Result<Option<PathBuf>> {
        BuildResolver::new(spec.working_dir.clone()).resolve_dockerfile(spec.dockerfile.as_deref())
    }
}

/// タイムアウトとキャンセルを付けて待つ
pub(crate) async fn with_deadline<T>(
    timeout: Duration,
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BuildError::Cancelled),
        result = tokio::time::timeout(timeout, fut) => match result {
            Ok(inner) => inner,
            Err(_) => Err(BuildError::BuildFailed(format!(
                "timed out after {}ms",
                timeout.as_millis()
            ))),
        },
    }
}

/// `1/t/T/TRUE/true/True` と `0/f/F/FALSE/false/False` を受け付ける
fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}
