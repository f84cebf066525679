use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use fleetdeploy_build::daemon::{
    BuildMessage, BuilderKind, ClassicBuildRequest, DaemonClient, DaemonInfo, ImageDetails,
    PushProgress, SolveRequest, SolveResponse, SolveStatus, VertexStatus,
};
use fleetdeploy_build::{
    BuildError, BuildLifecycleRecorder, BuildResult, DockerfileBuilder, EngineConfig,
    ProgressMode, ProgressRenderer, StaticCredentials,
};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::mpsc;

pub struct TestProject {
    pub root: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        Self { root }
    }

    pub fn write_dockerfile(&self, content: &str) {
        fs::write(self.root.path().join("Dockerfile"), content).unwrap();
    }

    #[allow(dead_code)]
    pub fn write_file(&self, name: &str, content: &str) {
        let path = self.root.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    pub fn path(&self) -> PathBuf {
        self.root.path().to_path_buf()
    }
}

/// 台本どおりに応答するデーモン
pub struct ScriptedDaemon {
    pub remote: bool,
    pub reachable: bool,
    pub builder: BuilderKind,
    pub push_error: Option<String>,
    pub pings: AtomicUsize,
    pub classic_builds: AtomicUsize,
    pub context_bytes: AtomicUsize,
    pub solves: AtomicUsize,
    pub pushes: AtomicUsize,
    pub untagged: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl ScriptedDaemon {
    pub fn local() -> Self {
        Self {
            remote: false,
            reachable: true,
            builder: BuilderKind::Classic,
            push_error: None,
            pings: AtomicUsize::new(0),
            classic_builds: AtomicUsize::new(0),
            context_bytes: AtomicUsize::new(0),
            solves: AtomicUsize::new(0),
            pushes: AtomicUsize::new(0),
            untagged: Mutex::new(Vec::new()),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            ..Self::local()
        }
    }

    pub fn remote() -> Self {
        Self {
            remote: true,
            ..Self::local()
        }
    }

    pub fn buildkit() -> Self {
        Self {
            builder: BuilderKind::BuildKit,
            ..Self::local()
        }
    }

    pub fn denying_push() -> Self {
        Self {
            push_error: Some("denied: requested access to the resource is denied".to_string()),
            ..Self::local()
        }
    }

    pub fn driver_calls(&self) -> usize {
        self.classic_builds.load(Ordering::SeqCst) + self.solves.load(Ordering::SeqCst)
    }

    pub fn untagged(&self) -> Vec<String> {
        self.untagged.lock().unwrap().clone()
    }
}

#[async_trait]
impl DaemonClient for ScriptedDaemon {
    fn is_remote(&self) -> bool {
        self.remote
    }

    async fn ping(&self) -> BuildResult<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.reachable {
            Ok(())
        } else {
            Err(BuildError::BuildFailed(
                "Cannot connect to the Docker daemon".to_string(),
            ))
        }
    }

    async fn builder_kind(&self) -> BuildResult<BuilderKind> {
        Ok(self.builder)
    }

    async fn info(&self) -> BuildResult<DaemonInfo> {
        Ok(DaemonInfo {
            server_version: "27.3.1".to_string(),
            os_type: "linux".to_string(),
            architecture: "x86_64".to_string(),
            os_version: "12".to_string(),
        })
    }

    async fn build_classic<'a>(
        &'a self,
        mut request: ClassicBuildRequest,
    ) -> BuildResult<BoxStream<'a, BuildResult<BuildMessage>>> {
        self.classic_builds.fetch_add(1, Ordering::SeqCst);
        let mut sent = 0;
        while let Some(chunk) = request.context.next().await {
            sent += chunk?.len();
        }
        self.context_bytes.fetch_add(sent, Ordering::SeqCst);
        let messages = vec![
            BuildMessage {
                stream: Some("Step 1/1 : FROM alpine\n".to_string()),
                ..Default::default()
            },
            BuildMessage {
                aux: Some(serde_json::json!({"ID": "sha256:abc"})),
                ..Default::default()
            },
        ];
        Ok(stream::iter(messages.into_iter().map(Ok)).boxed())
    }

    async fn solve(
        &self,
        _request: SolveRequest,
        status: mpsc::Sender<SolveStatus>,
    ) -> BuildResult<SolveResponse> {
        self.solves.fetch_add(1, Ordering::SeqCst);
        let event = SolveStatus {
            vertexes: vec![VertexStatus {
                digest: "sha256:0123456789abcdef".to_string(),
                name: "[1/1] FROM docker.io/library/alpine".to_string(),
                completed: true,
                ..Default::default()
            }],
            logs: Vec::new(),
        };
        let _ = status.send(event).await;

        let mut response = SolveResponse::default();
        response
            .exporter_response
            .insert("containerimage.digest".to_string(), "sha256:abc".to_string());
        Ok(response)
    }

    async fn push_image<'a>(
        &'a self,
        _tag: &str,
        _credentials: Option<DockerCredentials>,
    ) -> BuildResult<BoxStream<'a, BuildResult<PushProgress>>> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        let last = match &self.push_error {
            Some(error) => PushProgress {
                error: Some(error.clone()),
                ..Default::default()
            },
            None => PushProgress {
                status: Some("Pushed".to_string()),
                ..Default::default()
            },
        };
        Ok(stream::iter(vec![Ok(last)]).boxed())
    }

    async fn inspect_image(&self, _reference: &str) -> BuildResult<ImageDetails> {
        Ok(ImageDetails {
            id: "sha256:abc".to_string(),
            size: 1024,
            raw: serde_json::json!({"Id": "sha256:abc", "Size": 1024}),
        })
    }

    async fn image_tags(&self, reference: &str) -> BuildResult<Vec<String>> {
        Ok(vec![reference.to_string()])
    }

    async fn remove_image(&self, tag: &str) -> BuildResult<()> {
        self.untagged.lock().unwrap().push(tag.to_string());
        Ok(())
    }
}

/// 出力を捨て、記録を共有するビルダーを作成
pub fn builder_for(
    daemon: &Arc<ScriptedDaemon>,
    config: EngineConfig,
) -> (DockerfileBuilder, Arc<BuildLifecycleRecorder>) {
    let recorder = Arc::new(BuildLifecycleRecorder::new());
    let renderer =
        ProgressRenderer::with_writer(Box::new(std::io::sink()), ProgressMode::LastUpdateOnly);
    let builder = DockerfileBuilder::new(Box::new(Arc::clone(daemon)), config)
        .with_recorder(Arc::clone(&recorder))
        .with_renderer(renderer)
        .with_credentials(StaticCredentials::new());
    (builder, recorder)
}

/// 開いたフェーズがすべて閉じていること
pub fn assert_balanced(recorder: &BuildLifecycleRecorder) {
    assert_eq!(recorder.start_count(), recorder.finish_count());
    assert!(recorder.open_phases().is_empty());
}
