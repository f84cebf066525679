//! クラシックビルドAPIによるビルド
//!
//! コンテキストを送信し、デーモンから流れてくるJSONメッセージを逐次処理します。
//! 最後の aux メッセージに含まれるイメージIDを結果として返します。

use crate::config::EngineConfig;
use crate::context::{BuildContext, INJECTED_DOCKERFILE};
use crate::daemon::{BuildMessage, ClassicBuildRequest, ContextBody, DaemonClient};
use crate::error::{BuildError, Result};
use crate::progress::{ProgressEvent, ProgressRenderer};
use crate::spec::BuildSpec;
use bollard::auth::DockerCredentials;
use futures_util::StreamExt;
use futures_util::stream;
use indicatif::DecimalBytes;
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// ビルド完了時の aux ペイロード
#[derive(Debug, Deserialize)]
struct AuxImageId {
    #[serde(rename = "ID")]
    id: Option<String>,
}

/// クラシックビルドの結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassicOutcome {
    pub image_id: String,
    /// 送信したコンテキストのバイト数
    pub context_size: usize,
}

pub struct ClassicBuildDriver<'a> {
    daemon: &'a dyn DaemonClient,
    config: &'a EngineConfig,
    renderer: &'a mut ProgressRenderer,
    credentials: HashMap<String, DockerCredentials>,
    image_id: Option<String>,
}

impl<'a> ClassicBuildDriver<'a> {
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
            image_id: None,
        }
    }

    /// ベースイメージ取得用のレジストリ認証情報
    pub fn with_credentials(mut self, credentials: HashMap<String, DockerCredentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// イメージをビルドし、イメージIDを返す
    ///
    /// コンテキストはリクエスト本体としてデーモンが読み出すのに合わせて送られる。
    pub async fn build(
        mut self,
        context: BuildContext,
        spec: &BuildSpec,
        build_args: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<ClassicOutcome> {
        if cancel.is_cancelled() {
            context.close().await;
            return Err(BuildError::Cancelled);
        }

        let dockerfile = context
            .relative_dockerfile()
            .unwrap_or(INJECTED_DOCKERFILE)
            .to_string();
        let (progress_tx, mut progress) = watch::channel(Upload::default());

        let request = ClassicBuildRequest {
            tag: spec.tag.clone(),
            dockerfile,
            build_args: build_args.clone(),
            labels: spec.labels.clone(),
            target: spec.target.clone(),
            no_cache: spec.no_cache,
            platform: self.config.platform.clone(),
            credentials: std::mem::take(&mut self.credentials),
            context: upload_stream(context, progress_tx),
        };
        tracing::debug!(
            tag = %request.tag,
            dockerfile = %request.dockerfile,
            "Starting classic build"
        );

        let daemon = self.daemon;
        let mut stream = daemon.build_classic(request).await?;
        let mut uploading = true;
        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                changed = progress.changed(), if uploading => Step::Upload(changed.is_ok()),
                message = stream.next() => Step::Message(message),
            };

            match step {
                Step::Cancelled => return Err(BuildError::Cancelled),
                Step::Upload(alive) => {
                    let upload = progress.borrow_and_update().clone();
                    if upload.done {
                        uploading = false;
                        self.render(ProgressEvent::text(sending_line(upload.sent)));
                    } else {
                        uploading = alive;
                        self.render(ProgressEvent::partial(sending_line(upload.sent)));
                    }
                }
                Step::Message(None) => break,
                Step::Message(Some(Err(e))) => {
                    return Err(upload_error(&progress).unwrap_or(e));
                }
                Step::Message(Some(Ok(message))) => self.handle_message(message)?,
            }
        }
        if let Some(e) = upload_error(&progress) {
            return Err(e);
        }

        let context_size = progress.borrow().sent;
        let image_id = self.image_id.take().ok_or(BuildError::MissingImageId)?;
        tracing::info!("Successfully built: {} ({})", spec.tag, image_id);
        Ok(ClassicOutcome {
            image_id,
            context_size,
        })
    }

    /// ビルド出力の処理
    fn handle_message(&mut self, message: BuildMessage) -> Result<()> {
        if let Some(error) = message.error {
            return Err(BuildError::BuildFailed(error));
        }

        if let Some(aux) = message.aux {
            self.on_aux(aux);
        }

        if let Some(stream) = message.stream {
            // ビルドステップの出力
            for line in stream.lines().filter(|line| !line.trim().is_empty()) {
                self.render(ProgressEvent::text(line));
            }
        }

        if let Some(status) = message.status {
            // ステータスメッセージ（pull等）
            match message.progress {
                Some(progress) => {
                    self.render(ProgressEvent::partial(format!("{} {}", status, progress)))
                }
                None => self.render(ProgressEvent::text(status)),
            }
        }

        Ok(())
    }

    fn on_aux(&mut self, aux: serde_json::Value) {
        match serde_json::from_value::<AuxImageId>(aux) {
            Ok(AuxImageId { id: Some(id) }) => self.image_id = Some(id),
            Ok(_) => {}
            Err(e) => tracing::warn!("failed to parse aux message: {}", e),
        }
    }

    fn render(&mut self, event: ProgressEvent) {
        if let Err(e) = self.renderer.render(&event) {
            tracing::warn!("failed to render build progress: {}", e);
        }
    }
}

/// コンテキスト送信の進み具合
#[derive(Debug, Clone, Default)]
struct Upload {
    sent: usize,
    done: bool,
    error: Option<String>,
}

enum Step {
    Cancelled,
    Upload(bool),
    Message(Option<Result<BuildMessage>>),
}

/// 読み出されたバイト数を `progress` に流しながらコンテキストを送るストリーム
///
/// 読み切った時点でコンテキストを閉じる。途中で破棄された場合もアーカイブ処理は止まる。
fn upload_stream(context: BuildContext, progress: watch::Sender<Upload>) -> ContextBody {
    stream::unfold((context, progress), |(mut context, progress)| async move {
        match context.next().await {
            Some(chunk) => {
                match &chunk {
                    Ok(bytes) => progress.send_modify(|upload| upload.sent += bytes.len()),
                    Err(e) => {
                        let message = e.to_string();
                        progress.send_modify(|upload| upload.error = Some(message));
                    }
                }
                Some((chunk, (context, progress)))
            }
            None => {
                context.close().await;
                progress.send_modify(|upload| upload.done = true);
                None
            }
        }
    })
    .boxed()
}

fn upload_error(progress: &watch::Receiver<Upload>) -> Option<BuildError> {
    progress
        .borrow()
        .error
        .clone()
        .map(BuildError::ContextArchive)
}

/// 10進単位での表示（docker CLI と同じ）
fn sending_line(size: usize) -> String {
    format!(
        "Sending build context to Docker daemon  {}",
        DecimalBytes(size as u64)
    )
}
