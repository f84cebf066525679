//! ビルド要求と結果の型

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// ビルド要求
///
/// 設定ファイルとCLIフラグから上流で組み立てられ、ビルド中は読み取り専用。
#[derive(Debug, Clone, Default)]
pub struct BuildSpec {
    /// 作業ディレクトリ（ビルドコンテキストのルート）
    pub working_dir: PathBuf,
    /// Dockerfileの明示的な指定
    pub dockerfile: Option<PathBuf>,
    /// .dockerignore の明示的な指定
    pub ignorefile: Option<PathBuf>,
    /// イメージタグ
    pub tag: String,
    /// マルチステージビルドのターゲット
    pub target: Option<String>,
    pub build_args: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    /// ビルドシークレット（id → 値）
    pub secrets: HashMap<String, Vec<u8>>,
    pub no_cache: bool,
    /// ビルド後にレジストリへプッシュする
    pub publish: bool,
}

impl BuildSpec {
    pub fn new(working_dir: impl Into<PathBuf>, tag: impl Into<String>) -> Self {
        Self {
            working_dir: working_dir.into(),
            tag: tag.into(),
            ..Default::default()
        }
    }
}

/// ビルド済みイメージ
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageHandle {
    pub id: String,
    pub tag: String,
    pub size: i64,
}

/// ドライバーが報告したイメージと、検査で得たサイズ・生メタデータ
#[derive(Debug, Clone, PartialEq)]
pub struct SolveOutcome {
    pub image_id: String,
    pub size: i64,
    pub raw: serde_json::Value,
}

impl SolveOutcome {
    pub fn into_handle(self, tag: impl Into<String>) -> ImageHandle {
        ImageHandle {
            id: self.image_id,
            tag: tag.into(),
            size: self.size,
        }
    }
}

/// スキップの理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    DaemonUnavailable,
    DockerfileNotFound,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::DaemonUnavailable => f.write_str("docker daemon not available"),
            SkipReason::DockerfileNotFound => f.write_str("dockerfile not found"),
        }
    }
}

/// ビルドの結果
///
/// `Skipped` はエラーではない。呼び出し側は別のビルド方式を試せばよい。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Skipped(SkipReason),
    Built {
        image: ImageHandle,
        warning: Option<String>,
    },
}

impl BuildOutcome {
    pub fn image(&self) -> Option<&ImageHandle> {
        match self {
            BuildOutcome::Built { image, .. } => Some(image),
            BuildOutcome::Skipped(_) => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, BuildOutcome::Skipped(_))
    }
}
