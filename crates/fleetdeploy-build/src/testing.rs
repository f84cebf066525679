//! ユニットテスト用のインメモリデーモン

use crate::daemon::{
    BuildMessage, BuilderKind, ClassicBuildRequest, DaemonClient, DaemonInfo, ImageDetails,
    PushProgress, SolveRequest, SolveResponse, SolveStatus,
};
use crate::error::{BuildError, Result};
use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub(crate) struct FakeDaemon {
    pub remote: bool,
    pub reachable: bool,
    pub ping_hangs: bool,
    pub builder: BuilderKind,
    pub builder_error: Option<String>,
    pub info_error: Option<String>,
    pub inspect_error: Option<String>,
    pub image_tags_hang: bool,
    pub build_messages: Vec<BuildMessage>,
    pub solve_events: Vec<SolveStatus>,
    pub solve_error: Option<String>,
    pub solve_hangs: bool,
    pub solve_digest: Option<String>,
    /// プッシュ1回ごとの結果（空になったら成功）
    pub push_errors: Mutex<VecDeque<String>>,
    pub push_always_fails: Option<String>,
    pub push_times: Mutex<Vec<Instant>>,
    pub classic_requests: Mutex<Vec<ClassicBuildRequest>>,
    pub classic_contexts: Mutex<Vec<Bytes>>,
    pub solve_requests: Mutex<Vec<SolveRequest>>,
    pub removed: Mutex<Vec<String>>,
}

impl FakeDaemon {
    pub fn new() -> Self {
        Self {
            remote: false,
            reachable: true,
            ping_hangs: false,
            builder: BuilderKind::Classic,
            builder_error: None,
            info_error: None,
            inspect_error: None,
            image_tags_hang: false,
            build_messages: Vec::new(),
            solve_events: Vec::new(),
            solve_error: None,
            solve_hangs: false,
            solve_digest: Some("sha256:abc".to_string()),
            push_errors: Mutex::new(VecDeque::new()),
            push_always_fails: None,
            push_times: Mutex::new(Vec::new()),
            classic_requests: Mutex::new(Vec::new()),
            classic_contexts: Mutex::new(Vec::new()),
            solve_requests: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        }
    }

    pub fn push_attempts(&self) -> usize {
        self.push_times.lock().unwrap().len()
    }
}

#[async_trait]
impl DaemonClient for FakeDaemon {
    fn is_remote(&self) -> bool {
        self.remote
    }

    async fn ping(&self) -> Result<()> {
        if self.ping_hangs {
            std::future::pending::<()>().await;
        }
        if self.reachable {
            Ok(())
        } else {
            Err(BuildError::BuildFailed("connection refused".to_string()))
        }
    }

    async fn builder_kind(&self) -> Result<BuilderKind> {
        match &self.builder_error {
            Some(error) => Err(BuildError::BuildFailed(error.clone())),
            None => Ok(self.builder),
        }
    }

    async fn info(&self) -> Result<DaemonInfo> {
        if let Some(error) = &self.info_error {
            return Err(BuildError::BuildFailed(error.clone()));
        }
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
    ) -> Result<BoxStream<'a, Result<BuildMessage>>> {
        // デーモンと同じく本体を読み切ってから応答を返す
        let mut context = std::mem::replace(&mut request.context, stream::empty().boxed());
        let mut body = BytesMut::new();
        while let Some(chunk) = context.next().await {
            body.extend_from_slice(&chunk?);
        }
        self.classic_contexts.lock().unwrap().push(body.freeze());
        self.classic_requests.lock().unwrap().push(request);
        let messages: Vec<Result<BuildMessage>> =
            self.build_messages.iter().cloned().map(Ok).collect();
        Ok(stream::iter(messages).boxed())
    }

    async fn solve(
        &self,
        request: SolveRequest,
        status: mpsc::Sender<SolveStatus>,
    ) -> Result<SolveResponse> {
        self.solve_requests.lock().unwrap().push(request);
        for event in &self.solve_events {
            if status.send(event.clone()).await.is_err() {
                break;
            }
        }
        if self.solve_hangs {
            std::future::pending::<()>().await;
        }
        if let Some(error) = &self.solve_error {
            return Err(BuildError::BuildFailed(error.clone()));
        }

        let mut response = SolveResponse::default();
        if let Some(digest) = &self.solve_digest {
            response
                .exporter_response
                .insert("containerimage.digest".to_string(), digest.clone());
        }
        Ok(response)
    }

    async fn push_image<'a>(
        &'a self,
        _tag: &str,
        _credentials: Option<DockerCredentials>,
    ) -> Result<BoxStream<'a, Result<PushProgress>>> {
        self.push_times.lock().unwrap().push(Instant::now());

        let error = match &self.push_always_fails {
            Some(error) => Some(error.clone()),
            None => self.push_errors.lock().unwrap().pop_front(),
        };
        let mut messages = vec![PushProgress {
            status: Some("Preparing".to_string()),
            ..Default::default()
        }];
        match error {
            Some(error) => messages.push(PushProgress {
                error: Some(error),
                ..Default::default()
            }),
            None => messages.push(PushProgress {
                status: Some("Pushed".to_string()),
                ..Default::default()
            }),
        }
        Ok(stream::iter(messages.into_iter().map(Ok)).boxed())
    }

    async fn inspect_image(&self, _reference: &str) -> Result<ImageDetails> {
        if let Some(error) = &self.inspect_error {
            return Err(BuildError::BuildFailed(error.clone()));
        }
        Ok(ImageDetails {
            id: "sha256:abc".to_string(),
            size: 1024,
            raw: serde_json::json!({"Id": "sha256:abc", "Size": 1024}),
        })
    }

    async fn image_tags(&self, reference: &str) -> Result<Vec<String>> {
        if self.image_tags_hang {
            std::future::pending::<()>().await;
        }
        Ok(vec![reference.to_string()])
    }

    async fn remove_image(&self, tag: &str) -> Result<()> {
        self.removed.lock().unwrap().push(tag.to_string());
        Ok(())
    }
}
