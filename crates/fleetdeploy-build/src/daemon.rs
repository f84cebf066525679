//! Dockerデーモンとのやり取りを抽象化するトレイト
//!
//! 本番では [`crate::docker::BollardDaemon`] が実装し、テストではインメモリの
//! フェイクに差し替えます。ドライバーとオーケストレーターはこのトレイトだけに依存します。

use crate::error::Result;
use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// デーモンが既定で使うビルダー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderKind {
    Classic,
    BuildKit,
}

/// デーモン情報（`docker info` 相当の抜粋）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonInfo {
    pub server_version: String,
    pub os_type: String,
    pub architecture: String,
    pub os_version: String,
}

impl DaemonInfo {
    /// `os/arch/os_version`
    pub fn platform(&self) -> String {
        format!("{}/{}/{}", self.os_type, self.architecture, self.os_version)
    }
}

/// 送信しながら読み出されるビルドコンテキスト
pub type ContextBody = BoxStream<'static, std::io::Result<Bytes>>;

/// クラシックビルドAPIへのリクエスト
pub struct ClassicBuildRequest {
    pub tag: String,
    /// コンテキスト内のDockerfileパス
    pub dockerfile: String,
    pub build_args: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub target: Option<String>,
    pub no_cache: bool,
    pub platform: String,
    /// レジストリ名 → 認証情報
    pub credentials: HashMap<String, DockerCredentials>,
    /// tar（リモートならgzip）のストリーム。リクエスト本体として順に送られる
    pub context: ContextBody,
}

impl fmt::Debug for ClassicBuildRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassicBuildRequest")
            .field("tag", &self.tag)
            .field("dockerfile", &self.dockerfile)
            .field("target", &self.target)
            .field("no_cache", &self.no_cache)
            .field("platform", &self.platform)
            .finish_non_exhaustive()
    }
}

/// クラシックビルドのJSONメッセージ1件
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildMessage {
    pub stream: Option<String>,
    pub status: Option<String>,
    pub progress: Option<String>,
    pub error: Option<String>,
    /// 生の aux ペイロード（最終メッセージではイメージID）
    pub aux: Option<serde_json::Value>,
}

/// セッションビルドの solve 要求
#[derive(Debug, Clone, Default)]
pub struct SolveRequest {
    pub frontend: String,
    pub frontend_attrs: HashMap<String, String>,
    /// ローカルディレクトリ名 → ホスト上のパス
    pub local_dirs: HashMap<String, String>,
    pub exports: Vec<SolveExport>,
    pub credentials: HashMap<String, DockerCredentials>,
    pub secrets: HashMap<String, Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolveExport {
    pub kind: String,
    pub attrs: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SolveResponse {
    pub exporter_response: HashMap<String, String>,
}

/// solve 中に流れる頂点（ビルドステップ）の状態
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VertexStatus {
    pub digest: String,
    pub name: String,
    pub cached: bool,
    pub started: bool,
    pub completed: bool,
    pub current: u64,
    pub total: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VertexLog {
    pub vertex: String,
    pub message: String,
}

/// solve のステータスイベント
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SolveStatus {
    pub vertexes: Vec<VertexStatus>,
    pub logs: Vec<VertexLog>,
}

/// プッシュ進捗メッセージ1件
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushProgress {
    pub status: Option<String>,
    pub progress: Option<String>,
    pub error: Option<String>,
}

/// イメージの検査結果
#[derive(Debug, Clone, PartialEq)]
pub struct ImageDetails {
    pub id: String,
    pub size: i64,
    pub raw: serde_json::Value,
}

#[async_trait]
pub trait DaemonClient: Send + Sync {
    /// リモートデーモンかどうか
    fn is_remote(&self) -> bool;

    async fn ping(&self) -> Result<()>;

    /// デーモンが既定で使うビルダー
    async fn builder_kind(&self) -> Result<BuilderKind>;

    async fn info(&self) -> Result<DaemonInfo>;

    /// クラシックビルドを開始し、JSONメッセージのストリームを返す
    async fn build_classic<'a>(
        &'a self,
        request: ClassicBuildRequest,
    ) -> Result<BoxStream<'a, Result<BuildMessage>>>;

    /// セッションを確立して solve を実行する
    ///
    /// ステータスイベントは `status` に送る。戻り値を返す時点で `status` は破棄される。
    async fn solve(
        &self,
        request: SolveRequest,
        status: mpsc::Sender<SolveStatus>,
    ) -> Result<SolveResponse>;

    async fn push_image<'a>(
        &'a self,
        tag: &str,
        credentials: Option<DockerCredentials>,
    ) -> Result<BoxStream<'a, Result<PushProgress>>>;

    async fn inspect_image(&self, reference: &str) -> Result<ImageDetails>;

    /// 参照に一致するイメージに付いているタグ
    async fn image_tags(&self, reference: &str) -> Result<Vec<String>>;

    async fn remove_image(&self, tag: &str) -> Result<()>;
}

/// 共有された接続もそのままデーモンとして使えるようにする
#[async_trait]
impl<T: DaemonClient + ?Sized> DaemonClient for Arc<T> {
    fn is_remote(&self) -> bool {
        (**self).is_remote()
    }

    async fn ping(&self) -> Result<()> {
        (**self).ping().await
    }

    async fn builder_kind(&self) -> Result<BuilderKind> {
        (**self).builder_kind().await
    }

    async fn info(&self) -> Result<DaemonInfo> {
        (**self).info().await
    }

    async fn build_classic<'a>(
        &'a self,
        request: ClassicBuildRequest,
    ) -> Result<BoxStream<'a, Result<BuildMessage>>> {
        (**self).build_classic(request).await
    }

    async fn solve(
        &self,
        request: SolveRequest,
        status: mpsc::Sender<SolveStatus>,
    ) -> Result<SolveResponse> {
        (**self).solve(request, status).await
    }

    async fn push_image<'a>(
        &'a self,
        tag: &str,
        credentials: Option<DockerCredentials>,
    ) -> Result<BoxStream<'a, Result<PushProgress>>> {
        (**self).push_image(tag, credentials).await
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageDetails> {
        (**self).inspect_image(reference).await
    }

    async fn image_tags(&self, reference: &str) -> Result<Vec<String>> {
        (**self).image_tags(reference).await
    }

    async fn remove_image(&self, tag: &str) -> Result<()> {
        (**self).remove_image(tag).await
    }
}
