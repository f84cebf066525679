//! Dockerfile によるイメージビルドの全体制御
//!
//! デーモンの判定、ビルドファイルの解決、コンテキスト作成、ビルド、プッシュを
//! フェーズごとに記録しながら順に実行します。
//! デーモンやDockerfileが無い場合はエラーではなくスキップを返します。

use crate::auth::{CredentialProvider, RegistryAuth};
use crate::classic::ClassicBuildDriver;
use crate::config::EngineConfig;
use crate::context::{BuildContext, ContextBuilder};
use crate::daemon::DaemonClient;
use crate::docker::BollardDaemon;
use crate::error::{BuildError, Result};
use crate::lifecycle::{BuildLifecycleRecorder, BuilderMeta, Phase};
use crate::progress::{ProgressEvent, ProgressRenderer};
use crate::pusher::PushRetrier;
use crate::resolver::BuildResolver;
use crate::selector::{BuildEngine, BuildEngineSelector, with_deadline};
use crate::session::SessionBuildDriver;
use crate::spec::{BuildOutcome, BuildSpec, SkipReason, SolveOutcome};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// 選択されたドライバーと、その実行に必要な準備物
enum Prepared {
    Classic(BuildContext),
    Session,
}

pub struct DockerfileBuilder {
    daemon: Box<dyn DaemonClient>,
    config: EngineConfig,
    recorder: Arc<BuildLifecycleRecorder>,
    renderer: ProgressRenderer,
    credentials: Box<dyn CredentialProvider>,
}

impl DockerfileBuilder {
    pub fn new(daemon: Box<dyn DaemonClient>, config: EngineConfig) -> Self {
        Self {
            daemon,
            config,
            recorder: Arc::new(BuildLifecycleRecorder::new()),
            renderer: ProgressRenderer::stderr(),
            credentials: Box::new(RegistryAuth::new()),
        }
    }

    /// 設定に従ってデーモンに接続したビルダーを作成
    pub fn connect(config: EngineConfig) -> Result<Self> {
        let daemon = BollardDaemon::connect(&config)?;
        Ok(Self::new(Box::new(daemon), config))
    }

    pub fn with_recorder(mut self, recorder: Arc<BuildLifecycleRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_renderer(mut self, renderer: ProgressRenderer) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_credentials(mut self, credentials: impl CredentialProvider + 'static) -> Self {
        self.credentials = Box::new(credentials);
        self
    }

    pub fn recorder(&self) -> Arc<BuildLifecycleRecorder> {
        Arc::clone(&self.recorder)
    }

    /// イメージをビルド（`publish` 指定時はプッシュも）する
    ///
    /// ビルダーはこの呼び出しで消費され、デーモン接続はどの経路でも解放される。
    #[tracing::instrument(
        name = "dockerfile_builder",
        skip_all,
        fields(
            tag = %spec.tag,
            relative_dockerfile_path = tracing::field::Empty,
            buildkit_enabled = tracing::field::Empty,
        )
    )]
    pub async fn run(self, spec: &BuildSpec, cancel: &CancellationToken) -> Result<BuildOutcome> {
        let DockerfileBuilder {
            daemon,
            config,
            recorder,
            mut renderer,
            credentials,
        } = self;
        let daemon: &dyn DaemonClient = daemon.as_ref();

        let build_phase = recorder.start(Phase::Build);

        let init_phase = recorder.start(Phase::BuilderInit);
        let selector = BuildEngineSelector::new(daemon, &config);
        let capability = selector
            .probe(cancel)
            .await
            .map_err(|e| e.in_phase(Phase::BuilderInit))?;
        if !capability.available {
            tracing::debug!("docker daemon not available, skipping");
            return Ok(BuildOutcome::Skipped(SkipReason::DaemonUnavailable));
        }

        let Some(build_file) = selector
            .resolve_build_file(spec)
            .map_err(|e| e.in_phase(Phase::BuilderInit))?
        else {
            tracing::debug!("dockerfile not found, skipping");
            return Ok(BuildOutcome::Skipped(SkipReason::DockerfileNotFound));
        };

        let resolver = BuildResolver::new(spec.working_dir.clone());
        let relative_dockerfile = resolver.relative_dockerfile(&build_file);
        let engine = capability.engine();
        let span = tracing::Span::current();
        span.record(
            "relative_dockerfile_path",
            relative_dockerfile.as_deref().unwrap_or(""),
        );
        span.record("buildkit_enabled", engine == BuildEngine::Session);
        tracing::debug!("buildkitEnabled {}", engine == BuildEngine::Session);
        init_phase.finish();

        let mut warnings = resolver.validate_build_args(&spec.build_args);

        let pipeline = async {
            let prepared = match engine {
                BuildEngine::Classic => {
                    let _phase = recorder.start(Phase::ContextBuild);
                    renderer.set_message("Creating build context");
                    let context = ContextBuilder::package(&build_file, spec, capability.remote)
                        .map_err(|e| e.in_phase(Phase::ContextBuild))?;
                    render(&mut renderer, ProgressEvent::text("Creating build context done"));
                    Prepared::Classic(context)
                }
                BuildEngine::Session => Prepared::Session,
            };

            let image_phase = recorder.start(Phase::ImageBuild);
            let image_id = build_image(
                daemon,
                &config,
                &recorder,
                &mut renderer,
                credentials.as_ref(),
                spec,
                &build_file,
                prepared,
                capability.remote,
                &mut warnings,
                cancel,
            )
            .await
            .map_err(|e| e.in_phase(Phase::ImageBuild))?;
            image_phase.finish();
            build_phase.finish();
            render(&mut renderer, ProgressEvent::text("Building image done"));

            if spec.publish {
                let _phase = recorder.start(Phase::Push);
                renderer.set_message("Pushing image");
                let push_credentials = credentials
                    .credentials_for(&spec.tag)
                    .map_err(|e| e.in_phase(Phase::Push))?;
                let span = tracing::info_span!("push_image_to_registry", tag = %spec.tag);
                PushRetrier::new(daemon, &config)
                    .with_renderer(&mut renderer)
                    .push_with_retry(&spec.tag, push_credentials, cancel)
                    .instrument(span)
                    .await
                    .map_err(|e| e.in_phase(Phase::Push))?;
                render(&mut renderer, ProgressEvent::text("Pushing image done"));
            }

            let details = daemon
                .inspect_image(&image_id)
                .await
                .map_err(|e| e.in_phase(Phase::ImageBuild))?;
            let outcome = SolveOutcome {
                image_id: details.id,
                size: details.size,
                raw: details.raw,
            };
            Ok::<_, BuildError>(outcome.into_handle(spec.tag.as_str()))
        };
        let result = pipeline.await;

        // リモートビルダーでは並行ビルドと競合するためタグを外さない
        let published = spec.publish && result.is_ok();
        if !capability.remote && (result.is_err() || published) {
            let cleanup = clear_deployment_tags(daemon, &spec.tag);
            if tokio::time::timeout(config.info_timeout(), cleanup).await.is_err() {
                tracing::debug!("Timed out clearing local tags for {}", spec.tag);
            }
        }

        match result {
            Ok(image) => {
                renderer.finish_success(&format!("Built {}", image.tag));
                tracing::info!(id = %image.id, size = image.size, "Image ready: {}", image.tag);
                let warning = (!warnings.is_empty()).then(|| warnings.join("\n"));
                Ok(BuildOutcome::Built { image, warning })
            }
            Err(e) => {
                renderer.finish_error(&e.to_string());
                Err(e)
            }
        }
    }
}

/// デーモン情報を取得し、選択されたドライバーでビルドする
#[allow(clippy::too_many_arguments)]
async fn build_image(
    daemon: &dyn DaemonClient,
    config: &EngineConfig,
    recorder: &BuildLifecycleRecorder,
    renderer: &mut ProgressRenderer,
    credentials: &dyn CredentialProvider,
    spec: &BuildSpec,
    build_file: &Path,
    prepared: Prepared,
    remote: bool,
    warnings: &mut Vec<String>,
    cancel: &CancellationToken,
) -> Result<String> {
    tracing::debug!("fetching docker server info");
    let info = match with_deadline(config.info_timeout(), cancel, daemon.info()).await {
        Ok(info) => info,
        Err(e) => {
            if let Prepared::Classic(context) = prepared {
                context.close().await;
            }
            if matches!(e, BuildError::Cancelled) {
                return Err(e);
            }
            if remote {
                tracing::warn!(remote_builder_failure = true, "Remote builder failed: {}", e);
            }
            return Err(BuildError::BuildFailed(format!(
                "error fetching docker server info: {}",
                e
            )));
        }
    };

    render(
        renderer,
        ProgressEvent::text(format!(
            "docker host: {} {} {}",
            info.server_version, info.os_type, info.architecture
        )),
    );

    let buildkit_enabled = matches!(prepared, Prepared::Session);
    recorder.set_builder_meta(BuilderMeta {
        buildkit_enabled,
        remote,
        server_version: info.server_version.clone(),
        platform: info.platform(),
    });

    let registry_auth = credentials.all_credentials().unwrap_or_else(|e| {
        tracing::warn!("Continuing without registry credentials: {}", e);
        Default::default()
    });

    let engine = if buildkit_enabled {
        BuildEngine::Session
    } else {
        BuildEngine::Classic
    };
    let span = tracing::info_span!("build_image", "type" = engine.as_str());
    renderer.set_message("Building image with Docker");

    let result = match prepared {
        Prepared::Classic(context) => ClassicBuildDriver::new(daemon, config, renderer)
            .with_credentials(registry_auth)
            .build(context, spec, &spec.build_args, cancel)
            .instrument(span)
            .await
            .map(|outcome| {
                if let Some(warning) = ContextBuilder::check_context_size(outcome.context_size) {
                    warnings.push(warning);
                }
                outcome.image_id
            }),
        Prepared::Session => SessionBuildDriver::new(daemon, config, renderer)
            .with_credentials(registry_auth)
            .build(spec, build_file, &spec.build_args, cancel)
            .instrument(span)
            .await,
    };

    if let Err(e) = &result
        && remote
        && !matches!(e.root(), BuildError::Cancelled)
    {
        tracing::warn!(remote_builder_failure = true, "Remote builder failed: {}", e);
    }
    result
}

/// タグが指すイメージからタグを外す
async fn clear_deployment_tags(daemon: &dyn DaemonClient, tag: &str) {
    let tags = match daemon.image_tags(tag).await {
        Ok(tags) => tags,
        Err(e) => {
            tracing::debug!("Failed to list images for {}: {}", tag, e);
            return;
        }
    };

    for image_tag in tags {
        if let Err(e) = daemon.remove_image(&image_tag).await {
            tracing::debug!("Failed to untag {}: {}", image_tag, e);
        }
    }
}

fn render(renderer: &mut ProgressRenderer, event: ProgressEvent) {
    if let Err(e) = renderer.render(&event) {
        tracing::warn!("failed to render build progress: {}", e);
    }
}
