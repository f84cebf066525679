//! bollard による DaemonClient 実装

use crate::config::EngineConfig;
use crate::context::ContextBuilder;
use crate::daemon::{
    BuildMessage, BuilderKind, ClassicBuildRequest, DaemonClient, DaemonInfo, ImageDetails,
    PushProgress, SolveRequest, SolveResponse, SolveStatus, VertexLog, VertexStatus,
};
use crate::error::{BuildError, Result};
use crate::pusher::split_image_tag;
use crate::spec::BuildSpec;
use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::models::{BuildInfo, BuildInfoAux};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// 接続タイムアウト（秒）
const CONNECT_TIMEOUT_SECS: u64 = 120;

/// BuildKit が既定のビルダーになったAPIバージョン（Engine 23）
const BUILDKIT_DEFAULT_API: (u32, u32) = (1, 42);

pub struct BollardDaemon {
    docker: Docker,
    remote: bool,
}

impl BollardDaemon {
    pub fn new(docker: Docker, remote: bool) -> Self {
        Self { docker, remote }
    }

    /// 設定に従ってデーモンへ接続
    ///
    /// `daemon_host` 未指定時は `DOCKER_HOST` を含む bollard の既定値を使う。
    pub fn connect(config: &EngineConfig) -> Result<Self> {
        let docker = match config.daemon_host.as_deref() {
            Some(host) if host.starts_with("unix://") => {
                Docker::connect_with_unix(host, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
            }
            Some(host) if host.starts_with("tcp://") || host.starts_with("http://") => {
                Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
            }
            Some(host) => {
                return Err(BuildError::InvalidConfig(format!(
                    "unsupported daemon host: {}",
                    host
                )));
            }
            None => Docker::connect_with_defaults()?,
        };

        let host = config
            .daemon_host
            .clone()
            .or_else(|| std::env::var("DOCKER_HOST").ok());
        let remote = is_remote_host(host.as_deref());
        tracing::debug!(remote, host = ?host, "Connected to docker daemon");

        Ok(Self::new(docker, remote))
    }
}

/// ローカルソケット以外のアドレスはリモートとみなす
pub fn is_remote_host(host: Option<&str>) -> bool {
    match host {
        None => false,
        Some(host) if host.trim().is_empty() => false,
        Some(host) => !(host.starts_with("unix://") || host.starts_with("npipe://")),
    }
}

fn api_at_least(version: &str, required: (u32, u32)) -> bool {
    let mut parts = version.split('.').map(|p| p.parse::<u32>().ok());
    match (parts.next().flatten(), parts.next().flatten()) {
        (Some(major), Some(minor)) => (major, minor) >= required,
        _ => false,
    }
}

/// Linux デーモンで API 1.42 以上なら BuildKit が既定
fn default_builder(api_version: &str, os: &str) -> BuilderKind {
    if os.eq_ignore_ascii_case("linux") && api_at_least(api_version, BUILDKIT_DEFAULT_API) {
        BuilderKind::BuildKit
    } else {
        BuilderKind::Classic
    }
}

/// プッシュ失敗の本文
///
/// デーモンの応答エラーはステータス接頭辞を外し、レジストリのメッセージだけを残す。
fn push_error_message(err: bollard::errors::Error) -> String {
    match err {
        bollard::errors::Error::DockerResponseServerError { message, .. } => message,
        other => other.to_string(),
    }
}

fn build_message(info: BuildInfo) -> BuildMessage {
    let error = info
        .error
        .or_else(|| info.error_detail.and_then(|detail| detail.message));
    let aux = match info.aux {
        Some(BuildInfoAux::Default(image_id)) => serde_json::to_value(&image_id).ok(),
        _ => None,
    };

    BuildMessage {
        stream: info.stream,
        status: info.status,
        progress: info.progress,
        error,
        aux,
    }
}

fn attrs_with_prefix(attrs: &HashMap<String, String>, prefix: &str) -> HashMap<String, String> {
    attrs
        .iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(prefix)
                .map(|name| (name.to_string(), value.clone()))
        })
        .collect()
}

#[async_trait]
impl DaemonClient for BollardDaemon {
    fn is_remote(&self) -> bool {
        self.remote
    }

    async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }

    /// bollard は ping の `Builder-Version` ヘッダーを公開しないため、
    /// BuildKit が既定になったAPIバージョンとOSから判定する
    async fn builder_kind(&self) -> Result<BuilderKind> {
        let version = self.docker.version().await?;
        Ok(default_builder(
            version.api_version.as_deref().unwrap_or_default(),
            version.os.as_deref().unwrap_or_default(),
        ))
    }

    async fn info(&self) -> Result<DaemonInfo> {
        let info = self.docker.info().await?;
        Ok(DaemonInfo {
            server_version: info.server_version.unwrap_or_default(),
            os_type: info.os_type.unwrap_or_default(),
            architecture: info.architecture.unwrap_or_default(),
            os_version: info.os_version.unwrap_or_default(),
        })
    }

    async fn build_classic<'a>(
        &'a self,
        request: ClassicBuildRequest,
    ) -> Result<BoxStream<'a, Result<BuildMessage>>> {
        #[allow(deprecated)]
        let options = bollard::image::BuildImageOptions::<String> {
            dockerfile: request.dockerfile,
            t: request.tag,
            buildargs: request.build_args,
            labels: request.labels,
            target: request.target.unwrap_or_default(),
            nocache: request.no_cache,
            platform: request.platform,
            rm: true,      // 中間コンテナを削除
            forcerm: true, // ビルド失敗時も中間コンテナを削除
            ..Default::default()
        };

        let stream = self
            .docker
            .build_image(
                options,
                Some(request.credentials),
                Some(bollard::body_try_stream(request.context)),
            )
            .map(|item| item.map(build_message).map_err(BuildError::from));

        Ok(stream.boxed())
    }

    async fn solve(
        &self,
        request: SolveRequest,
        status: mpsc::Sender<SolveStatus>,
    ) -> Result<SolveResponse> {
        if !request.secrets.is_empty() {
            let mut ids: Vec<&str> = request.secrets.keys().map(String::as_str).collect();
            ids.sort_unstable();
            return Err(BuildError::InvalidConfig(format!(
                "build secrets cannot be forwarded through the daemon session: {}",
                ids.join(", ")
            )));
        }

        let context_dir = request
            .local_dirs
            .get("context")
            .map(PathBuf::from)
            .ok_or_else(|| BuildError::InvalidConfig("solve request has no context dir".into()))?;
        let dockerfile_dir = request
            .local_dirs
            .get("dockerfile")
            .map(PathBuf::from)
            .unwrap_or_else(|| context_dir.clone());
        let filename = request
            .frontend_attrs
            .get("filename")
            .cloned()
            .unwrap_or_else(|| "Dockerfile".to_string());
        let tag = request
            .exports
            .iter()
            .find(|export| export.kind == "moby")
            .and_then(|export| export.attrs.get("name"))
            .cloned()
            .unwrap_or_default();

        // デーモンのBuildKitはアップロードされたtarをコンテキストとして読む
        let context = ContextBuilder::package(
            &dockerfile_dir.join(&filename),
            &BuildSpec::new(&context_dir, &tag),
            self.remote,
        )?;
        let dockerfile = context
            .relative_dockerfile()
            .unwrap_or(crate::context::INJECTED_DOCKERFILE)
            .to_string();

        let attrs = &request.frontend_attrs;
        let session_id = format!(
            "fleetdeploy-{}",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );

        #[allow(deprecated)]
        let options = bollard::image::BuildImageOptions::<String> {
            dockerfile,
            t: tag,
            buildargs: attrs_with_prefix(attrs, "build-arg:"),
            labels: attrs_with_prefix(attrs, "label:"),
            target: attrs.get("target").cloned().unwrap_or_default(),
            nocache: attrs.contains_key("no-cache"),
            platform: attrs.get("platform").cloned().unwrap_or_default(),
            version: bollard::image::BuilderVersion::BuilderBuildKit,
            session: Some(session_id),
            ..Default::default()
        };

        let credentials: HashMap<String, DockerCredentials> = request.credentials;
        let mut stream = self.docker.build_image(
            options,
            Some(credentials),
            Some(bollard::body_try_stream(context)),
        );

        let mut exporter_response = HashMap::new();
        while let Some(item) = stream.next().await {
            let info = item?;
            if let Some(error) = info
                .error
                .or_else(|| info.error_detail.and_then(|detail| detail.message))
            {
                return Err(BuildError::BuildFailed(error));
            }

            match info.aux {
                Some(BuildInfoAux::BuildKit(response)) => {
                    let mut vertexes: Vec<VertexStatus> = response
                        .vertexes
                        .into_iter()
                        .map(|vertex| VertexStatus {
                            digest: vertex.digest,
                            name: vertex.name,
                            cached: vertex.cached,
                            started: vertex.started.is_some(),
                            completed: vertex.completed.is_some(),
                            current: 0,
                            total: None,
                            error: (!vertex.error.is_empty()).then_some(vertex.error),
                        })
                        .collect();
                    vertexes.extend(response.statuses.into_iter().map(|progress| VertexStatus {
                        digest: progress.vertex,
                        name: progress.id,
                        cached: false,
                        started: progress.started.is_some(),
                        completed: progress.completed.is_some(),
                        current: progress.current.max(0) as u64,
                        total: (progress.total > 0).then_some(progress.total as u64),
                        error: None,
                    }));
                    let logs = response
                        .logs
                        .into_iter()
                        .map(|log| VertexLog {
                            vertex: log.vertex,
                            message: String::from_utf8_lossy(&log.msg).into_owned(),
                        })
                        .collect();

                    if status.send(SolveStatus { vertexes, logs }).await.is_err() {
                        tracing::debug!("Solve status receiver closed");
                    }
                }
                Some(BuildInfoAux::Default(image_id)) => {
                    if let Some(id) = image_id.id {
                        exporter_response.insert("containerimage.digest".to_string(), id);
                    }
                }
                None => {}
            }
        }

        Ok(SolveResponse { exporter_response })
    }

    async fn push_image<'a>(
        &'a self,
        tag: &str,
        credentials: Option<DockerCredentials>,
    ) -> Result<BoxStream<'a, Result<PushProgress>>> {
        let (image, image_tag) = split_image_tag(tag);

        #[allow(deprecated)]
        let options = bollard::image::PushImageOptions::<String> { tag: image_tag };

        #[allow(deprecated)]
        let stream = self
            .docker
            .push_image(&image, Some(options), credentials)
            .map(|item| {
                item.map(|info| PushProgress {
                    status: info.status,
                    progress: info.progress,
                    error: info
                        .error
                        .or_else(|| info.error_detail.and_then(|detail| detail.message)),
                })
                .map_err(|e| BuildError::PushFailed {
                    message: push_error_message(e),
                })
            });

        Ok(stream.boxed())
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageDetails> {
        let inspect = self.docker.inspect_image(reference).await?;
        let raw = serde_json::to_value(&inspect).unwrap_or_default();
        Ok(ImageDetails {
            id: inspect.id.unwrap_or_default(),
            size: inspect.size.unwrap_or_default(),
            raw,
        })
    }

    async fn image_tags(&self, reference: &str) -> Result<Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert("reference".to_string(), vec![reference.to_string()]);
        let options = bollard::query_parameters::ListImagesOptions {
            filters: Some(filters),
            ..Default::default()
        };

        let images = self.docker.list_images(Some(options)).await?;
        Ok(images
            .into_iter()
            .flat_map(|image| image.repo_tags)
            .collect())
    }

    async fn remove_image(&self, tag: &str) -> Result<()> {
        self.docker
            .remove_image(tag, None::<bollard::query_parameters::RemoveImageOptions>, None)
            .await?;
        Ok(())
    }
}
