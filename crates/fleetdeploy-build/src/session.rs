//! BuildKit セッションによるビルド
//!
//! solve を実行するプロデューサーと、ステータスを描画するコンシューマーの
//! 2つのタスクを同時に動かし、両方の終了を待ってから結果を返します。
//! コンシューマーは呼び出し側のキャンセルを監視せず、チャネルが閉じるまで読み続けます。

use crate::config::EngineConfig;
use crate::daemon::{DaemonClient, SolveExport, SolveRequest, SolveStatus};
use crate::error::{BuildError, Result};
use crate::progress::{ProgressEvent, ProgressRenderer, StepProgress};
use crate::spec::BuildSpec;
use bollard::auth::DockerCredentials;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const DOCKERFILE_FRONTEND: &str = "dockerfile.v0";

/// エクスポーターが返すイメージダイジェストのキー
pub const IMAGE_DIGEST_KEY: &str = "containerimage.digest";

/// solve 要求を組み立てる
pub fn solve_request(
    spec: &BuildSpec,
    build_file: &Path,
    build_args: &HashMap<String, String>,
    platform: &str,
) -> SolveRequest {
    let mut attrs = HashMap::new();
    let filename = build_file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Dockerfile".to_string());
    attrs.insert("filename".to_string(), filename);
    if let Some(target) = &spec.target {
        attrs.insert("target".to_string(), target.clone());
    }
    attrs.insert("platform".to_string(), platform.to_string());
    if spec.no_cache {
        attrs.insert("no-cache".to_string(), String::new());
    }
    for (key, value) in &spec.labels {
        attrs.insert(format!("label:{}", key), value.clone());
    }
    for (key, value) in build_args {
        attrs.insert(format!("build-arg:{}", key), value.clone());
    }

    let dockerfile_dir = build_file
        .parent()
        .unwrap_or(spec.working_dir.as_path())
        .to_string_lossy()
        .into_owned();
    let mut local_dirs = HashMap::new();
    local_dirs.insert("dockerfile".to_string(), dockerfile_dir);
    local_dirs.insert(
        "context".to_string(),
        spec.working_dir.to_string_lossy().into_owned(),
    );

    let mut export_attrs = HashMap::new();
    export_attrs.insert("name".to_string(), spec.tag.clone());

    SolveRequest {
        frontend: DOCKERFILE_FRONTEND.to_string(),
        frontend_attrs: attrs,
        local_dirs,
        exports: vec![SolveExport {
            kind: "moby".to_string(),
            attrs: export_attrs,
        }],
        credentials: HashMap::new(),
        secrets: spec.secrets.clone(),
    }
}

pub struct SessionBuildDriver<'a> {
    daemon: &'a dyn DaemonClient,
    config: &'a EngineConfig,
    renderer: &'a mut ProgressRenderer,
    credentials: HashMap<String, DockerCredentials>,
}

impl<'a> SessionBuildDriver<'a> {
    pub fn new(
        daemon: &'a dyn DaemonClient,
        config: &'a EngineConfig,
        renderer: &'a mut ProgressRenderer,
    ) -> Self {
        Self {
            daemon,
            config,
            renderer,
            credentials: HashMap::new(),
        }
    }

    /// セッションに添付するレジストリ認証情報
    pub fn with_credentials(mut self, credentials: HashMap<String, DockerCredentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// solve を実行し、イメージダイジェストを返す
    pub async fn build(
        self,
        spec: &BuildSpec,
        build_file: &Path,
        build_args: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let mut request = solve_request(spec, build_file, build_args, &self.config.platform);
        request.credentials = self.credentials;

        let (tx, rx) = mpsc::channel(1);
        let daemon = self.daemon;

        // tx は solve の future と一緒に破棄され、チャネルが閉じる
        let producer = async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(BuildError::Cancelled),
                response = daemon.solve(request, tx) => response,
            }
        };
        let consumer = render_status(rx, self.renderer);

        let (solved, rendered) = tokio::join!(producer, consumer);
        let response = solved?;
        rendered?;

        response
            .exporter_response
            .get(IMAGE_DIGEST_KEY)
            .cloned()
            .ok_or(BuildError::MissingImageId)
    }
}

/// チャネルが閉じるまでステータスを描画する
///
/// 描画エラーは最初の1件を覚えておき、読み続ける。
async fn render_status(
    mut rx: mpsc::Receiver<SolveStatus>,
    renderer: &mut ProgressRenderer,
) -> Result<()> {
    let mut display = SolveDisplay::default();
    let mut first_error = None;

    while let Some(status) = rx.recv().await {
        for event in display.events(status) {
            if let Err(e) = renderer.render(&event)
                && first_error.is_none()
            {
                tracing::debug!("Failed to render solve status: {}", e);
                first_error = Some(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(BuildError::Io(e)),
        None => Ok(()),
    }
}

/// solve ステータスを進捗イベントに変換する
#[derive(Default)]
struct SolveDisplay {
    names: HashMap<String, String>,
    done: HashSet<String>,
}

impl SolveDisplay {
    fn events(&mut self, status: SolveStatus) -> Vec<ProgressEvent> {
        let mut events = Vec::new();

        for vertex in status.vertexes {
            if !vertex.name.is_empty() && !self.names.contains_key(&vertex.digest) {
                self.names.insert(vertex.digest.clone(), vertex.name.clone());
            }
            if self.done.contains(&vertex.digest) {
                continue;
            }

            let done = vertex.completed || vertex.cached || vertex.error.is_some();
            if done {
                self.done.insert(vertex.digest.clone());
            }
            let name = self
                .names
                .get(&vertex.digest)
                .cloned()
                .unwrap_or(vertex.name);
            events.push(ProgressEvent::step(
                StepProgress {
                    id: vertex.digest,
                    name,
                    current: vertex.current,
                    total: vertex.total,
                    cached: vertex.cached,
                    error: vertex.error,
                },
                done,
            ));
        }

        for log in status.logs {
            let id: String = log
                .vertex
                .trim_start_matches("sha256:")
                .chars()
                .take(12)
                .collect();
            for line in log.message.lines().filter(|line| !line.trim().is_empty()) {
                events.push(ProgressEvent::text(format!("#{} {}", id, line)));
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::{VertexLog, VertexStatus};
    use crate::progress::ProgressMode;
    use crate::testing::FakeDaemon;
    use std::io::{self, Write};
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenWriter;

    impl Write for BrokenWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "terminal went away"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn spec() -> BuildSpec {
        let mut spec = BuildSpec::new("/src/app", "registry.example.com/app:deployment-1");
        spec.target = Some("runtime".to_string());
        spec.no_cache = true;
        spec.labels.insert("team".to_string(), "infra".to_string());
        spec.secrets.insert("npmrc".to_string(), b"//registry/:_authToken=x".to_vec());
        spec
    }

    fn vertex(digest: &str, name: &str, completed: bool) -> VertexStatus {
        VertexStatus {
            digest: digest.to_string(),
            name: name.to_string(),
            started: true,
            completed,
            ..Default::default()
        }
    }

    #[test]
    fn test_solve_request_attributes() {
        let spec = spec();
        let mut args = HashMap::new();
        args.insert("NODE_VERSION".to_string(), "20".to_string());

        let request = solve_request(
            &spec,
            &PathBuf::from("/src/app/deploy/app.Dockerfile"),
            &args,
            "linux/amd64",
        );

        assert_eq!(request.frontend, "dockerfile.v0");
        let attrs = &request.frontend_attrs;
        assert_eq!(attrs.get("filename").map(String::as_str), Some("app.Dockerfile"));
        assert_eq!(attrs.get("target").map(String::as_str), Some("runtime"));
        assert_eq!(attrs.get("platform").map(String::as_str), Some("linux/amd64"));
        assert_eq!(attrs.get("no-cache").map(String::as_str), Some(""));
        assert_eq!(attrs.get("label:team").map(String::as_str), Some("infra"));
        assert_eq!(attrs.get("build-arg:NODE_VERSION").map(String::as_str), Some("20"));

        assert_eq!(
            request.local_dirs.get("dockerfile").map(String::as_str),
            Some("/src/app/deploy")
        );
        assert_eq!(
            request.local_dirs.get("context").map(String::as_str),
            Some("/src/app")
        );
        assert_eq!(request.exports.len(), 1);
        assert_eq!(request.exports[0].kind, "moby");
        assert_eq!(
            request.exports[0].attrs.get("name").map(String::as_str),
            Some("registry.example.com/app:deployment-1")
        );
        assert!(request.secrets.contains_key("npmrc"));
    }

    #[test]
    fn test_solve_request_omits_unset_options() {
        let spec = BuildSpec::new("/src/app", "img:1");
        let request = solve_request(
            &spec,
            &PathBuf::from("/src/app/Dockerfile"),
            &HashMap::new(),
            "linux/amd64",
        );

        assert!(!request.frontend_attrs.contains_key("target"));
        assert!(!request.frontend_attrs.contains_key("no-cache"));
    }

    #[tokio::test]
    async fn test_build_returns_digest_and_renders_status() {
        let buf = SharedBuf::default();
        let mut renderer =
            ProgressRenderer::with_writer(Box::new(buf.clone()), ProgressMode::LastUpdateOnly);
        let daemon = FakeDaemon {
            solve_events: vec![
                SolveStatus {
                    vertexes: vec![vertex("sha256:aaaaaaaaaaaaaaaa", "[1/2] FROM alpine", false)],
                    logs: vec![],
                },
                SolveStatus {
                    vertexes: vec![vertex("sha256:aaaaaaaaaaaaaaaa", "", true)],
                    logs: vec![VertexLog {
                        vertex: "sha256:bbbbbbbbbbbbbbbb".to_string(),
                        message: "hello from RUN\n".to_string(),
                    }],
                },
            ],
            solve_digest: Some("sha256:abc".to_string()),
            ..FakeDaemon::new()
        };
        let config = EngineConfig::default();
        let spec = BuildSpec::new("/src/app", "img:1");

        let digest = SessionBuildDriver::new(&daemon, &config, &mut renderer)
            .build(
                &spec,
                Path::new("/src/app/Dockerfile"),
                &spec.build_args,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(digest, "sha256:abc");
        let output = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("#aaaaaaaaaaaa [1/2] FROM alpine"));
        assert!(output.contains("#bbbbbbbbbbbb hello from RUN"));
        assert_eq!(daemon.solve_requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_producer_returns_promptly() {
        let mut renderer =
            ProgressRenderer::with_writer(Box::new(io::sink()), ProgressMode::LastUpdateOnly);
        let daemon = FakeDaemon {
            solve_events: vec![SolveStatus {
                vertexes: vec![vertex("sha256:cccc", "RUN make", false)],
                logs: vec![],
            }],
            solve_error: Some("failed to solve: process \"make\" did not complete".into()),
            ..FakeDaemon::new()
        };
        let config = EngineConfig::default();
        let spec = BuildSpec::new("/src/app", "img:1");

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            SessionBuildDriver::new(&daemon, &config, &mut renderer).build(
                &spec,
                Path::new("/src/app/Dockerfile"),
                &spec.build_args,
                &CancellationToken::new(),
            ),
        )
        .await
        .expect("consumer must finish once the producer fails");

        assert!(matches!(result, Err(BuildError::BuildFailed(msg)) if msg.contains("failed to solve")));
    }

    #[tokio::test]
    async fn test_missing_digest() {
        let mut renderer =
            ProgressRenderer::with_writer(Box::new(io::sink()), ProgressMode::LastUpdateOnly);
        let daemon = FakeDaemon {
            solve_digest: None,
            ..FakeDaemon::new()
        };
        let config = EngineConfig::default();
        let spec = BuildSpec::new("/src/app", "img:1");

        let result = SessionBuildDriver::new(&daemon, &config, &mut renderer)
            .build(
                &spec,
                Path::new("/src/app/Dockerfile"),
                &spec.build_args,
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(BuildError::MissingImageId)));
    }

    #[tokio::test]
    async fn test_render_failure_keeps_draining() {
        let mut renderer = ProgressRenderer::with_writer(Box::new(BrokenWriter), ProgressMode::Full);
        let daemon = FakeDaemon {
            solve_events: (0..5)
                .map(|i| SolveStatus {
                    vertexes: vec![vertex(&format!("sha256:{}", i), "RUN step", true)],
                    logs: vec![],
                })
                .collect(),
            ..FakeDaemon::new()
        };
        let config = EngineConfig::default();
        let spec = BuildSpec::new("/src/app", "img:1");

        let result = SessionBuildDriver::new(&daemon, &config, &mut renderer)
            .build(
                &spec,
                Path::new("/src/app/Dockerfile"),
                &spec.build_args,
                &CancellationToken::new(),
            )
            .await;

        // 描画に失敗しても solve は最後まで進む
        assert!(matches!(result, Err(BuildError::Io(_))));
        assert_eq!(daemon.solve_requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_solve() {
        let mut renderer =
            ProgressRenderer::with_writer(Box::new(io::sink()), ProgressMode::LastUpdateOnly);
        let daemon = FakeDaemon {
            solve_hangs: true,
            ..FakeDaemon::new()
        };
        let config = EngineConfig::default();
        let spec = BuildSpec::new("/src/app", "img:1");
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result = SessionBuildDriver::new(&daemon, &config, &mut renderer)
            .build(
                &spec,
                Path::new("/src/app/Dockerfile"),
                &spec.build_args,
                &cancel,
            )
            .await;

        assert!(matches!(result, Err(BuildError::Cancelled)));
    }

    #[test]
    fn test_display_reports_each_step_once() {
        let mut display = SolveDisplay::default();

        let first = display.events(SolveStatus {
            vertexes: vec![vertex("sha256:dddd", "COPY . .", true)],
            logs: vec![],
        });
        let repeated = display.events(SolveStatus {
            vertexes: vec![vertex("sha256:dddd", "COPY . .", true)],
            logs: vec![],
        });

        assert_eq!(first.len(), 1);
        assert!(first[0].last_update);
        assert!(repeated.is_empty());
    }
}
