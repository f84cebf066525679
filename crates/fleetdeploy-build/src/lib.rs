//! FleetDeploy Dockerfile Image Build
//!
//! Dockerfile からイメージをビルドし、必要ならレジストリへプッシュします。
//! デーモンの判定、ビルドコンテキストの作成、クラシック/セッション方式の
//! ビルド、リトライ付きプッシュ、フェーズごとの計測を提供します。

pub mod auth;
pub mod builder;
pub mod classic;
pub mod config;
pub mod context;
pub mod daemon;
pub mod docker;
pub mod error;
pub mod ignore;
pub mod lifecycle;
pub mod progress;
pub mod pusher;
pub mod resolver;
pub mod selector;
pub mod session;
pub mod spec;

#[cfg(test)]
mod testing;

pub use auth::{CredentialProvider, RegistryAuth, StaticCredentials};
pub use builder::DockerfileBuilder;
pub use config::EngineConfig;
pub use context::{BuildContext, ContextBuilder};
pub use daemon::DaemonClient;
pub use docker::BollardDaemon;
pub use error::{BuildError, BuildResult, ErrorKind};
pub use lifecycle::{BuildLifecycleRecorder, BuilderMeta, Phase};
pub use progress::{ProgressEvent, ProgressMode, ProgressRenderer};
pub use pusher::{PushRetrier, split_image_tag};
pub use resolver::BuildResolver;
pub use selector::{BuildEngine, BuildEngineSelector, EngineCapability};
pub use spec::{BuildOutcome, BuildSpec, ImageHandle, SkipReason, SolveOutcome};
