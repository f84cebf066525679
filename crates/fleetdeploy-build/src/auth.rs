//! レジストリ認証
//!
//! ローカルのDocker認証ストア（`config.json` と credential helper）を読み、
//! bollard の [`DockerCredentials`] に変換します。ビルド時のベースイメージ取得と
//! プッシュの両方が [`CredentialProvider`] 経由で参照します。

use crate::error::{BuildError, BuildResult};
use base64::Engine;
use bollard::auth::DockerCredentials;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// config.json で Docker Hub に使われる旧来のキー
const DOCKER_HUB_LEGACY_KEY: &str = "https://index.docker.io/v1/";
const DOCKER_HUB: &str = "docker.io";

/// credential helper がトークン認証を返すときのユーザー名
const IDENTITY_TOKEN_USER: &str = "<token>";

/// レジストリ認証情報の提供元
pub trait CredentialProvider: Send + Sync {
    /// イメージ名に対応するレジストリの認証情報
    fn credentials_for(&self, image: &str) -> BuildResult<Option<DockerCredentials>>;

    /// 既知のすべてのレジストリの認証情報（レジストリ名 → 認証情報）
    fn all_credentials(&self) -> BuildResult<HashMap<String, DockerCredentials>>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialStore {
    #[serde(default)]
    auths: HashMap<String, StoredAuth>,
    /// 既定の credential helper（例: "osxkeychain", "desktop"）
    #[serde(default)]
    creds_store: Option<String>,
    /// レジストリごとの credential helper
    #[serde(default)]
    cred_helpers: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct StoredAuth {
    /// Base64 の "username:password"
    auth: Option<String>,
    identitytoken: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HelperResponse {
    username: String,
    secret: String,
}

impl CredentialStore {
    /// ファイルが無ければ `None`
    fn load(path: &Path) -> BuildResult<Option<Self>> {
        if !path.exists() {
            tracing::debug!("Docker config.json not found at {:?}", path);
            return Ok(None);
        }

        let content = std::fs::read_to_string(path).map_err(|e| BuildError::AuthFailed {
            registry: path.display().to_string(),
            message: format!("Failed to read config.json: {}", e),
        })?;
        let store = serde_json::from_str(&content).map_err(|e| BuildError::AuthFailed {
            registry: path.display().to_string(),
            message: format!("Failed to parse config.json: {}", e),
        })?;
        Ok(Some(store))
    }

    fn stored_auth(&self, registry: &str) -> Option<&StoredAuth> {
        self.auths.get(registry).or_else(|| {
            (registry == DOCKER_HUB)
                .then(|| self.auths.get(DOCKER_HUB_LEGACY_KEY))
                .flatten()
        })
    }

    fn helper_for(&self, registry: &str) -> Option<&str> {
        self.cred_helpers
            .get(registry)
            .or(self.creds_store.as_ref())
            .map(String::as_str)
    }

    fn lookup(&self, registry: &str) -> BuildResult<Option<DockerCredentials>> {
        if let Some(stored) = self.stored_auth(registry)
            && let Some(creds) = stored.decode(registry)?
        {
            tracing::debug!("Found credentials in auths for {}", registry);
            return Ok(Some(creds));
        }

        if let Some(helper) = self.helper_for(registry) {
            tracing::debug!("Trying credential helper: {}", helper);
            match run_helper(helper, registry) {
                Ok(found) => return Ok(found),
                Err(e) => tracing::debug!("Credential helper {} failed: {}", helper, e),
            }
        }

        Ok(None)
    }
}

impl StoredAuth {
    fn decode(&self, registry: &str) -> BuildResult<Option<DockerCredentials>> {
        let address = Some(canonical_registry(registry));

        if let Some(token) = self.identitytoken.as_deref().filter(|t| !t.is_empty()) {
            return Ok(Some(DockerCredentials {
                identitytoken: Some(token.to_string()),
                serveraddress: address,
                ..Default::default()
            }));
        }

        let Some(encoded) = self.auth.as_deref().filter(|a| !a.is_empty()) else {
            return Ok(None);
        };
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| BuildError::AuthFailed {
                registry: registry.to_string(),
                message: format!("Failed to decode auth: {}", e),
            })?;
        let pair = String::from_utf8(decoded).map_err(|e| BuildError::AuthFailed {
            registry: registry.to_string(),
            message: format!("Invalid UTF-8 in auth: {}", e),
        })?;

        Ok(pair
            .split_once(':')
            .map(|(username, password)| DockerCredentials {
                username: Some(username.to_string()),
                password: Some(password.to_string()),
                serveraddress: address,
                ..Default::default()
            }))
    }
}

/// `docker-credential-<helper> get` を実行する
///
/// helper が認証情報を持たない（非ゼロ終了）場合は `None`。
fn run_helper(helper: &str, registry: &str) -> BuildResult<Option<DockerCredentials>> {
    let program = format!("docker-credential-{}", helper);
    let failed = |message: String| BuildError::AuthFailed {
        registry: registry.to_string(),
        message,
    };

    let mut child = Command::new(&program)
        .arg("get")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| failed(format!("Failed to run {}: {}", program, e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(registry.as_bytes())
            .map_err(|e| failed(format!("Failed to write to {}: {}", program, e)))?;
    }

    let output = child
        .wait_with_output()
        .map_err(|e| failed(format!("Credential helper failed: {}", e)))?;
    if !output.status.success() {
        tracing::debug!(
            "Credential helper returned error for {}: {}",
            registry,
            String::from_utf8_lossy(&output.stderr)
        );
        return Ok(None);
    }

    let response: HelperResponse = serde_json::from_slice(&output.stdout)
        .map_err(|e| failed(format!("Failed to parse credential helper response: {}", e)))?;

    let address = Some(canonical_registry(registry));
    if response.username == IDENTITY_TOKEN_USER {
        return Ok(Some(DockerCredentials {
            identitytoken: Some(response.secret),
            serveraddress: address,
            ..Default::default()
        }));
    }
    Ok(Some(DockerCredentials {
        username: Some(response.username),
        password: Some(response.secret),
        serveraddress: address,
        ..Default::default()
    }))
}

/// 認証ストアのキーをレジストリ名にそろえる
fn canonical_registry(key: &str) -> String {
    if key == DOCKER_HUB_LEGACY_KEY {
        DOCKER_HUB.to_string()
    } else {
        key.trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string()
    }
}

/// イメージ名のレジストリ部分
///
/// 先頭要素が `.` か `:` を含むか `localhost` のときだけレジストリとみなし、
/// それ以外は Docker Hub。
pub fn registry_of(image: &str) -> String {
    match image.split_once('/') {
        Some((first, _)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            first.to_string()
        }
        _ => DOCKER_HUB.to_string(),
    }
}

/// ローカルのDocker認証ストアを読む認証情報の提供元
#[derive(Debug)]
pub struct RegistryAuth {
    config_path: PathBuf,
}

impl Default for RegistryAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryAuth {
    /// `$DOCKER_CONFIG/config.json`、未設定なら `~/.docker/config.json` を使う
    pub fn new() -> Self {
        let config_dir = std::env::var_os("DOCKER_CONFIG")
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|home| home.join(".docker")))
            .unwrap_or_else(|| PathBuf::from(".docker"));

        Self {
            config_path: config_dir.join("config.json"),
        }
    }

    pub fn with_config_path(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

impl CredentialProvider for RegistryAuth {
    fn credentials_for(&self, image: &str) -> BuildResult<Option<DockerCredentials>> {
        let registry = registry_of(image);
        let Some(store) = CredentialStore::load(&self.config_path)? else {
            return Ok(None);
        };

        let found = store.lookup(&registry)?;
        if found.is_none() {
            tracing::debug!("No credentials found for {}", registry);
        }
        Ok(found)
    }

    /// `auths` に保存された分と、レジストリ別 helper が返す分を集める
    fn all_credentials(&self) -> BuildResult<HashMap<String, DockerCredentials>> {
        let Some(store) = CredentialStore::load(&self.config_path)? else {
            return Ok(HashMap::new());
        };

        let mut credentials = HashMap::new();
        for (key, stored) in &store.auths {
            match stored.decode(key) {
                Ok(Some(creds)) => {
                    let registry = canonical_registry(key);
                    // デーモンのビルダーは Docker Hub を旧来のキーで引く
                    if registry == DOCKER_HUB {
                        credentials.insert(DOCKER_HUB_LEGACY_KEY.to_string(), creds.clone());
                    }
                    credentials.insert(registry, creds);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping credentials for {}: {}", key, e),
            }
        }
        for (registry, helper) in &store.cred_helpers {
            if credentials.contains_key(registry) {
                continue;
            }
            match run_helper(helper, registry) {
                Ok(Some(creds)) => {
                    credentials.insert(registry.clone(), creds);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping credentials for {}: {}", registry, e),
            }
        }
        Ok(credentials)
    }
}

/// 呼び出し側が取得済みのトークンなどをそのまま渡すための認証情報
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    credentials: HashMap<String, DockerCredentials>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(
        mut self,
        registry: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        let registry = registry.into();
        self.credentials.insert(
            registry.clone(),
            DockerCredentials {
                username: Some(username.into()),
                password: Some(password.into()),
                serveraddress: Some(registry),
                ..Default::default()
            },
        );
        self
    }
}

impl CredentialProvider for StaticCredentials {
    fn credentials_for(&self, image: &str) -> BuildResult<Option<DockerCredentials>> {
        Ok(self.credentials.get(&registry_of(image)).cloned())
    }

    fn all_credentials(&self) -> BuildResult<HashMap<String, DockerCredentials>> {
        Ok(self.credentials.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    // "deployer:s3cret"
    const DEPLOYER: &str = "ZGVwbG95ZXI6czNjcmV0";

    fn auth_with(content: &str) -> (tempfile::TempDir, RegistryAuth) {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(&path, content).unwrap();
        (temp_dir, RegistryAuth::with_config_path(path))
    }

    #[test]
    fn test_credentials_from_auths() {
        let (_dir, auth) = auth_with(&format!(
            r#"{{"auths": {{"registry.example.com": {{"auth": "{}"}}}}}}"#,
            DEPLOYER
        ));

        let creds = auth
            .credentials_for("registry.example.com/app:deployment-1")
            .unwrap()
            .unwrap();
        assert_eq!(creds.username.as_deref(), Some("deployer"));
        assert_eq!(creds.password.as_deref(), Some("s3cret"));
        assert_eq!(creds.serveraddress.as_deref(), Some("registry.example.com"));
    }

    #[test]
    fn test_docker_hub_legacy_key() {
        let (_dir, auth) = auth_with(&format!(
            r#"{{"auths": {{"https://index.docker.io/v1/": {{"auth": "{}"}}}}}}"#,
            DEPLOYER
        ));

        let creds = auth.credentials_for("myuser/app:v1").unwrap().unwrap();
        assert_eq!(creds.serveraddress.as_deref(), Some("docker.io"));
        let all = auth.all_credentials().unwrap();
        assert!(all.contains_key("docker.io"));
        assert_eq!(
            all.get("https://index.docker.io/v1/")
                .and_then(|creds| creds.username.as_deref()),
            Some("deployer")
        );
    }

    #[test]
    fn test_all_credentials_keeps_legacy_key_for_short_hub_name() {
        let (_dir, auth) = auth_with(&format!(
            r#"{{"auths": {{"docker.io": {{"auth": "{}"}}, "ghcr.io": {{"auth": "{}"}}}}}}"#,
            DEPLOYER, DEPLOYER
        ));

        let all = auth.all_credentials().unwrap();
        assert!(all.contains_key("docker.io"));
        assert!(all.contains_key(DOCKER_HUB_LEGACY_KEY));
        assert!(all.contains_key("ghcr.io"));
        assert!(!all.contains_key("https://ghcr.io/v1/"));
    }

    #[test]
    fn test_identity_token_preferred() {
        let (_dir, auth) = auth_with(
            r#"{"auths": {"registry.example.com": {"auth": "", "identitytoken": "tok"}}}"#,
        );

        let creds = auth
            .credentials_for("registry.example.com/app")
            .unwrap()
            .unwrap();
        assert_eq!(creds.identitytoken.as_deref(), Some("tok"));
        assert!(creds.username.is_none());
    }

    #[test]
    fn test_missing_config_has_no_credentials() {
        let temp_dir = tempdir().unwrap();
        let auth = RegistryAuth::with_config_path(temp_dir.path().join("config.json"));

        assert!(auth.credentials_for("ghcr.io/org/app").unwrap().is_none());
        assert!(auth.all_credentials().unwrap().is_empty());
    }

    #[test]
    fn test_unparseable_config_is_auth_error() {
        let (_dir, auth) = auth_with("{ not json");

        assert!(matches!(
            auth.credentials_for("ghcr.io/org/app"),
            Err(BuildError::AuthFailed { .. })
        ));
    }

    #[test]
    fn test_all_credentials_skips_broken_entries() {
        let (_dir, auth) = auth_with(&format!(
            r#"{{"auths": {{
                "registry.example.com": {{"auth": "{}"}},
                "broken.example.com": {{"auth": "not base64!"}},
                "empty.example.com": {{}}
            }}}}"#,
            DEPLOYER
        ));

        let all = auth.all_credentials().unwrap();
        assert_eq!(all.len(), 1);
        assert!(all.contains_key("registry.example.com"));
    }

    #[test]
    fn test_missing_helper_binary_is_not_fatal() {
        let (_dir, auth) = auth_with(
            r#"{"credHelpers": {"registry.example.com": "fleetdeploy-test-missing"}}"#,
        );

        assert!(
            auth.credentials_for("registry.example.com/app")
                .unwrap()
                .is_none()
        );
        assert!(auth.all_credentials().unwrap().is_empty());
    }

    #[test]
    fn test_static_credentials() {
        let provider = StaticCredentials::new().with_registry("registry.example.com", "x", "token");

        assert!(
            provider
                .credentials_for("registry.example.com/app:v1")
                .unwrap()
                .is_some()
        );
        assert!(provider.credentials_for("nginx:alpine").unwrap().is_none());
    }

    #[test]
    fn test_registry_of() {
        let cases = [
            ("ghcr.io/org/app:v1.0", "ghcr.io"),
            ("myuser/app:latest", "docker.io"),
            ("nginx:alpine", "docker.io"),
            ("localhost:5000/myapp", "localhost:5000"),
            ("localhost/myapp", "localhost"),
            ("asia.gcr.io/project/app", "asia.gcr.io"),
            (
                "123456789.dkr.ecr.ap-northeast-1.amazonaws.com/app",
                "123456789.dkr.ecr.ap-northeast-1.amazonaws.com",
            ),
        ];
        for (image, registry) in cases {
            assert_eq!(registry_of(image), registry, "{}", image);
        }
    }

    #[test]
    fn test_canonical_registry() {
        assert_eq!(canonical_registry(DOCKER_HUB_LEGACY_KEY), "docker.io");
        assert_eq!(canonical_registry("https://ghcr.io/"), "ghcr.io");
        assert_eq!(canonical_registry("registry.example.com"), "registry.example.com");
    }
}
