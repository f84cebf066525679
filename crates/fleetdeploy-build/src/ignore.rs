//! .dockerignore の解釈
//!
//! パターンは作業ディレクトリからの相対パスに対して評価され、
//! 後に書かれたパターンが優先されます。`!` で始まるパターンは再包含です。

use crate::error::{BuildError, Result};
use glob::{MatchOptions, Pattern};
use std::path::Path;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
struct IgnorePattern {
    source: String,
    pattern: Pattern,
    negated: bool,
}

/// 除外ルールの集合
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    patterns: Vec<IgnorePattern>,
}

impl IgnoreRules {
    /// .dockerignore の内容を解析
    pub fn parse(content: &str) -> Result<Self> {
        let mut rules = Self::default();
        for line in content.lines() {
            if line.starts_with('#') {
                continue;
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            rules.push(line)?;
        }
        Ok(rules)
    }

    /// 除外ファイルを読み込む
    ///
    /// `ignorefile` 未指定時は `<working_dir>/.dockerignore` を使う。ファイルが無ければ空。
    /// `.dockerignore` 自身と Dockerfile が除外対象なら再包含する。
    pub fn load(
        working_dir: &Path,
        ignorefile: Option<&Path>,
        relative_dockerfile: Option<&str>,
    ) -> Result<Self> {
        let path = match ignorefile {
            Some(path) if path.is_absolute() => path.to_path_buf(),
            Some(path) => working_dir.join(path),
            None => working_dir.join(".dockerignore"),
        };

        let mut rules = match std::fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No ignore file at {}", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(BuildError::Io(e)),
        };

        if rules.is_excluded(".dockerignore") {
            rules.push("!.dockerignore")?;
        }
        if let Some(dockerfile) = relative_dockerfile
            && rules.is_excluded(dockerfile)
        {
            rules.push(&format!("!{}", dockerfile))?;
        }

        Ok(rules)
    }

    fn push(&mut self, raw: &str) -> Result<()> {
        let (negated, body) = match raw.strip_prefix('!') {
            Some(rest) => (true, rest.trim()),
            None => (false, raw),
        };
        let cleaned = clean_pattern(body);
        let pattern = Pattern::new(&cleaned).map_err(|e| {
            BuildError::InvalidConfig(format!("Invalid ignore pattern '{}': {}", raw, e))
        })?;

        self.patterns.push(IgnorePattern {
            source: if negated {
                format!("!{}", cleaned)
            } else {
                cleaned
            },
            pattern,
            negated,
        });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// 除外されたディレクトリ `dir` の配下に、再包含パターンで戻るパスがあり得るか
    ///
    /// 偽ならディレクトリごと読み飛ばしてよい。パターンのワイルドカード手前までの
    /// 固定部分だけで判定するため、真は「あり得る」の意味にとどまる。
    pub fn may_reinclude_under(&self, dir: &str) -> bool {
        let dir = dir.trim_start_matches("./").trim_matches('/');
        let prefix = format!("{}/", dir);
        self.patterns.iter().filter(|p| p.negated).any(|p| {
            let source = p.pattern.as_str();
            match source.find(['*', '?', '[']) {
                Some(at) => {
                    let literal = &source[..at];
                    literal.starts_with(&prefix) || prefix.starts_with(literal)
                }
                None => source.starts_with(&prefix),
            }
        })
    }

    /// 正規化済みのパターン一覧
    pub fn patterns(&self) -> Vec<String> {
        self.patterns.iter().map(|p| p.source.clone()).collect()
    }

    /// 相対パス（`/` 区切り）が除外されるか
    ///
    /// パターンがパス自身または親ディレクトリのいずれかに一致すれば一致とみなす。
    pub fn is_excluded(&self, relative_path: &str) -> bool {
        let path = relative_path.trim_start_matches("./").trim_matches('/');
        if path.is_empty() {
            return false;
        }

        let mut excluded = false;
        for entry in &self.patterns {
            if matches_self_or_parent(&entry.pattern, path) {
                excluded = !entry.negated;
            }
        }
        excluded
    }
}

fn matches_self_or_parent(pattern: &Pattern, path: &str) -> bool {
    if pattern.matches_with(path, MATCH_OPTIONS) {
        return true;
    }
    let components: Vec<&str> = path.split('/').collect();
    (1..components.len()).any(|n| pattern.matches_with(&components[..n].join("/"), MATCH_OPTIONS))
}

/// `./`・重複スラッシュ・`..`・先頭と末尾の `/` を取り除く
fn clean_pattern(pattern: &str) -> String {
    let normalized = pattern.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else {
                    parts.push(part);
                }
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}
