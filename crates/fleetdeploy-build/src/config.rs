//! ビルドエンジンの設定
//!
//! 既定値は serde の `default` で与え、環境変数で上書きできます。

use serde::Deserialize;
use std::time::Duration;

/// ビルドエンジン設定
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// リモートDockerデーモンのアドレス（例: tcp://builder:2375）
    pub daemon_host: Option<String>,
    /// デーモン疎通確認のタイムアウト（ミリ秒）
    pub probe_timeout_ms: u64,
    /// デーモン情報取得のタイムアウト（ミリ秒）
    pub info_timeout_ms: u64,
    /// プッシュ再試行の間隔（ミリ秒）
    pub push_retry_delay_ms: u64,
    /// プッシュの最大試行回数（0 は無制限）
    pub push_max_attempts: u32,
    /// ビルド対象プラットフォーム
    pub platform: String,
    /// DOCKER_BUILDKIT の値（未解析のまま保持）
    pub buildkit: Option<String>,
}

fn default_probe_timeout() -> u64 {
    5000 // 5秒
}
fn default_info_timeout() -> u64 {
    10000 // 10秒
}
fn default_push_retry_delay() -> u64 {
    3000 // 3秒
}
fn default_platform() -> String {
    "linux/amd64".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            daemon_host: None,
            probe_timeout_ms: default_probe_timeout(),
            info_timeout_ms: default_info_timeout(),
            push_retry_delay_ms: default_push_retry_delay(),
            push_max_attempts: 0,
            platform: default_platform(),
            buildkit: None,
        }
    }
}

impl EngineConfig {
    /// 既定値に環境変数を重ねて設定を作成
    ///
    /// 参照する環境変数:
    /// - `FLEET_BUILD_DAEMON_HOST`
    /// - `FLEET_BUILD_PROBE_TIMEOUT_MS`
    /// - `FLEET_BUILD_INFO_TIMEOUT_MS`
    /// - `FLEET_BUILD_PUSH_RETRY_DELAY_MS`
    /// - `FLEET_BUILD_PUSH_MAX_ATTEMPTS`
    /// - `FLEET_BUILD_PLATFORM`
    /// - `DOCKER_BUILDKIT`
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(host) = env_string("FLEET_BUILD_DAEMON_HOST") {
            self.daemon_host = Some(host);
        }
        if let Some(ms) = env_parse("FLEET_BUILD_PROBE_TIMEOUT_MS") {
            self.probe_timeout_ms = ms;
        }
        if let Some(ms) = env_parse("FLEET_BUILD_INFO_TIMEOUT_MS") {
            self.info_timeout_ms = ms;
        }
        if let Some(ms) = env_parse("FLEET_BUILD_PUSH_RETRY_DELAY_MS") {
            self.push_retry_delay_ms = ms;
        }
        if let Some(attempts) = env_parse("FLEET_BUILD_PUSH_MAX_ATTEMPTS") {
            self.push_max_attempts = attempts;
        }
        if let Some(platform) = env_string("FLEET_BUILD_PLATFORM") {
            self.platform = platform;
        }
        if let Some(buildkit) = env_string("DOCKER_BUILDKIT") {
            self.buildkit = Some(buildkit);
        }
        self
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn info_timeout(&self) -> Duration {
        Duration::from_millis(self.info_timeout_ms)
    }

    pub fn push_retry_delay(&self) -> Duration {
        Duration::from_millis(self.push_retry_delay_ms)
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring invalid value for {}: {:?}", key, raw);
            None
        }
    }
}
