use crate::error::{BuildError, Result};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

/// 作業ディレクトリで探すDockerfile名（優先順）
const DOCKERFILE_CANDIDATES: [&str; 2] = ["Dockerfile", "dockerfile"];

pub struct BuildResolver {
    working_dir: PathBuf,
}

impl BuildResolver {
    pub fn new(working_dir: PathBuf) -> Self {
        Self { working_dir }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Dockerfileのパスを解決
    ///
    /// 検索順序:
    /// 1. 明示的な指定（相対パスは作業ディレクトリ基準）。存在しなければエラー
    /// 2. 規約ベース:
    ///    - ./Dockerfile
    ///    - ./dockerfile
    ///
    /// どちらも無ければ `None`（ビルドをスキップ）
    pub fn resolve_dockerfile(&self, explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(dockerfile) = explicit {
            let path = if dockerfile.is_absolute() {
                dockerfile.to_path_buf()
            } else {
                self.working_dir.join(dockerfile)
            };
            if path.is_file() {
                return Ok(Some(path));
            } else {
                return Err(BuildError::DockerfileNotFound(path));
            }
        }

        for candidate in DOCKERFILE_CANDIDATES {
            let path = self.working_dir.join(candidate);
            if path.is_file() {
                tracing::debug!("Found Dockerfile at: {}", path.display());
                return Ok(Some(path));
            }
        }

        Ok(None)
    }

    /// 作業ディレクトリからの相対パス（`/` 区切り）
    ///
    /// Dockerfileが作業ディレクトリの外にある場合は `None`
    pub fn relative_dockerfile(&self, dockerfile: &Path) -> Option<String> {
        relative_to_root(dockerfile, &self.working_dir)
    }

    /// ビルド引数の検証（機密情報の警告）
    ///
    /// 警告メッセージを返す。
    pub fn validate_build_args(&self, build_args: &HashMap<String, String>) -> Vec<String> {
        let sensitive_patterns = ["password", "token", "secret", "api_key", "private_key"];

        let mut keys: Vec<&String> = build_args.keys().collect();
        keys.sort();

        let mut warnings = Vec::new();
        for key in keys {
            let key_lower = key.to_lowercase();
            if sensitive_patterns.iter().any(|p| key_lower.contains(p)) {
                tracing::warn!(
                    "警告: ビルド引数 '{}' は機密情報を含む可能性があります。\n\
                     ビルド引数はイメージ履歴に記録されます。\n\
                     機密情報はビルド引数ではなく、ビルドシークレットを使用してください。",
                    key
                );
                warnings.push(format!(
                    "build argument '{}' may contain a secret; it is recorded in the image history",
                    key
                ));
            }
        }
        warnings
    }
}

/// `root` の内側にあれば `/` 区切りの相対パス（字句的に判定）
fn relative_to_root(path: &Path, root: &Path) -> Option<String> {
    let path = normalize(path);
    let root = normalize(root);
    let relative = path.strip_prefix(&root).ok()?;

    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// `.` と `..` を字句的に取り除く
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push("..");
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
