use crate::lifecycle::Phase;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Dockerfile not found: {0}")]
    DockerfileNotFound(PathBuf),

    #[error("Error checking for buildkit support: {0}")]
    CapabilityDetection(String),

    #[error("Docker connection error: {0}")]
    DockerConnection(#[from] bollard::errors::Error),

    #[error("Build failed: {0}")]
    BuildFailed(String),

    #[error("Build finished without reporting an image id")]
    MissingImageId,

    #[error("Error archiving build context: {0}")]
    ContextArchive(String),

    #[error("Push failed: {message}")]
    PushFailed { message: String },

    #[error("Registry denied access while pushing {tag}")]
    RegistryUnauthorized { tag: String },

    #[error("Authentication failed for {registry}: {message}")]
    AuthFailed { registry: String, message: String },

    #[error("Invalid tag: {tag}")]
    InvalidTag { tag: String },

    #[error("Invalid build configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{phase}: {source}")]
    Phase {
        phase: Phase,
        #[source]
        source: Box<BuildError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// エラーの分類
///
/// 呼び出し側はこの分類で再試行やメッセージを切り替える。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    CapabilityDetection,
    BuildExecution,
    PushTransient,
    PushAuthorization,
    Cancelled,
}

impl BuildError {
    /// フェーズ名を付与する（既に付与済みなら何もしない）
    pub fn in_phase(self, phase: Phase) -> Self {
        match self {
            BuildError::Phase { .. } => self,
            other => BuildError::Phase {
                phase,
                source: Box::new(other),
            },
        }
    }

    /// 失敗したフェーズ
    pub fn phase(&self) -> Option<Phase> {
        match self {
            BuildError::Phase { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// フェーズ情報を剥がした元のエラー
    pub fn root(&self) -> &BuildError {
        match self {
            BuildError::Phase { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            BuildError::DockerfileNotFound(_)
            | BuildError::InvalidConfig(_)
            | BuildError::InvalidTag { .. } => ErrorKind::Configuration,
            BuildError::CapabilityDetection(_) => ErrorKind::CapabilityDetection,
            BuildError::PushFailed { .. } => ErrorKind::PushTransient,
            BuildError::RegistryUnauthorized { .. } => ErrorKind::PushAuthorization,
            BuildError::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::BuildExecution,
        }
    }

    /// ユーザー向けの分かりやすいエラーメッセージ
    pub fn user_message(&self) -> String {
        match self.root() {
            BuildError::DockerfileNotFound(path) => {
                format!(
                    "Dockerfileが見つかりません: {}\n\
                     \n\
                     解決方法:\n\
                     1. Dockerfileのパスを確認してください\n\
                     2. パスを省略すると作業ディレクトリの Dockerfile を使用します",
                    path.display()
                )
            }
            BuildError::BuildFailed(msg) => {
                format!(
                    "ビルドに失敗しました: {}\n\
                     \n\
                     Dockerfileの内容を確認してください。",
                    msg
                )
            }
            BuildError::RegistryUnauthorized { tag } => {
                format!(
                    "レジストリへのプッシュが拒否されました: {}\n\
                     \n\
                     レジストリの認証情報とイメージ名の権限を確認してください。",
                    tag
                )
            }
            BuildError::CapabilityDetection(msg) => {
                format!(
                    "Dockerデーモンのビルド機能を判定できませんでした: {}\n\
                     \n\
                     DOCKER_BUILDKIT 環境変数の値を確認してください。",
                    msg
                )
            }
            other => format!("{}", other),
        }
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;
pub type BuildResult<T> = Result<T>;
