//! イメージプッシュ処理
//!
//! ビルドしたイメージをコンテナレジストリにプッシュします。
//! ネットワーク起因の失敗に備えて一定間隔で再試行し、
//! 再試行を終えた後でアクセス拒否かどうかを判定します。

use crate::config::EngineConfig;
use crate::daemon::{DaemonClient, PushProgress};
use crate::error::{BuildError, BuildResult};
use crate::progress::{ProgressEvent, ProgressRenderer};
use bollard::auth::DockerCredentials;
use futures_util::StreamExt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// レジストリがアクセス拒否を返したときのメッセージの接頭辞
const ACCESS_DENIED_PREFIX: &str = "denied:";

type RetryHook<'a> = Box<dyn Fn(u32, &BuildError) + Send + Sync + 'a>;

/// 一定間隔でプッシュを再試行するハンドラ
pub struct PushRetrier<'a> {
    daemon: &'a dyn DaemonClient,
    delay: Duration,
    /// 0 は無制限
    max_attempts: u32,
    renderer: Option<&'a mut ProgressRenderer>,
    on_retry: Option<RetryHook<'a>>,
}

impl<'a> PushRetrier<'a> {
    pub fn new(daemon: &'a dyn DaemonClient, config: &EngineConfig) -> Self {
        Self {
            daemon,
            delay: config.push_retry_delay(),
            max_attempts: config.push_max_attempts,
            renderer: None,
            on_retry: None,
        }
    }

    pub fn with_renderer(mut self, renderer: &'a mut ProgressRenderer) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// 失敗した試行ごとに、次の試行の前に呼ばれる
    pub fn on_retry(mut self, hook: impl Fn(u32, &BuildError) + Send + Sync + 'a) -> Self {
        self.on_retry = Some(Box::new(hook));
        self
    }

    /// イメージをレジストリにプッシュ
    ///
    /// 呼び出し側のキャンセルで即座に打ち切る。打ち切り前に失敗していれば
    /// その失敗を判定して返す。
    pub async fn push_with_retry(
        &mut self,
        tag: &str,
        credentials: Option<DockerCredentials>,
        cancel: &CancellationToken,
    ) -> BuildResult<()> {
        let (_, image_tag) = split_image_tag(tag);
        validate_tag(&image_tag)?;

        let mut attempt: u32 = 0;
        let mut last_error = None;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(BuildError::Cancelled),
                result = self.push_once(tag, credentials.clone()) => result,
            };

            let err = match result {
                Ok(()) => {
                    tracing::info!("Pushed {} after {} attempt(s)", tag, attempt);
                    return Ok(());
                }
                Err(BuildError::Cancelled) => break,
                Err(e) => e,
            };

            if self.max_attempts > 0 && attempt >= self.max_attempts {
                last_error = Some(err);
                break;
            }

            tracing::warn!("retrying push because of err={}", err);
            if let Some(hook) = &self.on_retry {
                hook(attempt, &err);
            }
            last_error = Some(err);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.delay) => {}
            }
        }

        match last_error {
            Some(err) => Err(classify_push_error(tag, err)),
            None => Err(BuildError::Cancelled),
        }
    }

    async fn push_once(
        &mut self,
        tag: &str,
        credentials: Option<DockerCredentials>,
    ) -> BuildResult<()> {
        let daemon = self.daemon;
        let mut stream = daemon.push_image(tag, credentials).await?;

        let mut last_status = String::new();
        let mut error_message: Option<String> = None;

        while let Some(result) = stream.next().await {
            let info = result?;
            match info.error {
                Some(err) => error_message = Some(err),
                None => self.handle_progress(&info, &mut last_status),
            }
        }

        if let Some(err) = error_message {
            return Err(BuildError::PushFailed { message: err });
        }
        Ok(())
    }

    /// プッシュ進捗を表示
    fn handle_progress(&mut self, info: &PushProgress, last_status: &mut String) {
        let Some(status) = &info.status else {
            return;
        };
        let progress = info.progress.as_deref().unwrap_or("");

        // 状態に応じた表示
        let event = match status.as_str() {
            "Pushing" => ProgressEvent::partial(format!("  ↑ {} {}", status, progress)),
            "Pushed" => ProgressEvent::text("  ✓ Pushed"),
            "Layer already exists" => ProgressEvent::text("  ✓ Layer already exists"),
            // 準備中は表示をスキップ（ノイズ軽減）
            "Preparing" | "Waiting" => return,
            _ => {
                if status == last_status {
                    return;
                }
                *last_status = status.clone();
                ProgressEvent::text(format!("  ℹ {}", status))
            }
        };

        if let Some(renderer) = self.renderer.as_deref_mut()
            && let Err(e) = renderer.render(&event)
        {
            tracing::warn!("failed to render push progress: {}", e);
        }
    }
}

/// 再試行を終えた後のエラー判定
///
/// アクセス拒否なら `RegistryUnauthorized`、それ以外はそのまま返す。
/// デーモンがステータス接頭辞を付けて返すこともあるため、本文のどこにあっても拒否とみなす。
pub fn classify_push_error(tag: &str, err: BuildError) -> BuildError {
    match &err {
        BuildError::PushFailed { message } if message.contains(ACCESS_DENIED_PREFIX) => {
            BuildError::RegistryUnauthorized {
                tag: tag.to_string(),
            }
        }
        _ => err,
    }
}

/// タグのバリデーション
pub fn validate_tag(tag: &str) -> BuildResult<()> {
    // Docker タグの制約:
    // - 128文字以下
    // - 英数字、ピリオド、ハイフン、アンダースコアのみ
    // - 先頭はピリオドまたはハイフンではない

    if tag.is_empty() {
        return Err(BuildError::InvalidTag {
            tag: "(empty)".to_string(),
        });
    }

    if tag.len() > 128 {
        return Err(BuildError::InvalidTag {
            tag: format!("Tag too long ({} characters, max 128)", tag.len()),
        });
    }

    if tag.starts_with('.') || tag.starts_with('-') {
        return Err(BuildError::InvalidTag {
            tag: tag.to_string(),
        });
    }

    for c in tag.chars() {
        if !c.is_ascii_alphanumeric() && c != '.' && c != '-' && c != '_' {
            return Err(BuildError::InvalidTag {
                tag: format!("Invalid character '{}' in tag: {}", c, tag),
            });
        }
    }

    Ok(())
}

/// イメージ名とタグを分離
///
/// 最後の `/` より後ろの `:` だけをタグの区切りとみなす。
///
/// # Examples
/// - `ghcr.io/org/app:v1.0` -> `("ghcr.io/org/app", "v1.0")`
/// - `ghcr.io/org/app` -> `("ghcr.io/org/app", "latest")`
/// - `localhost:5000/app:dev` -> `("localhost:5000/app", "dev")`
/// - `app:1` -> `("app", "1")`
pub fn split_image_tag(image: &str) -> (String, String) {
    let name_start = image.rfind('/').map_or(0, |slash| slash + 1);
    match image[name_start..].rfind(':') {
        Some(pos) => {
            let split = name_start + pos;
            (image[..split].to_string(), image[split + 1..].to_string())
        }
        None => (image.to_string(), "latest".to_string()),
    }
}
