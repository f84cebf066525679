//! ビルドコンテキストの作成
//!
//! 作業ディレクトリをtarアーカイブにまとめ、遅延ストリームとして返します。
//! アーカイブ処理はブロッキングスレッドで行われ、読み出しに合わせて進みます。
//! ストリームを閉じる（または破棄する）とアーカイブ処理は中断されます。

use crate::error::{BuildError, BuildResult};
use crate::ignore::IgnoreRules;
use crate::resolver::BuildResolver;
use crate::spec::BuildSpec;
use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use futures_util::Stream;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use tar::Builder;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use walkdir::WalkDir;

/// 作業ディレクトリ外のDockerfileを注入するときの名前
pub const INJECTED_DOCKERFILE: &str = "Dockerfile";

const CHUNK_SIZE: usize = 64 * 1024;
const CHANNEL_CAPACITY: usize = 4;

/// 遅延生成されるビルドコンテキスト
pub struct BuildContext {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    worker: Option<JoinHandle<()>>,
    excludes: Vec<String>,
    relative_dockerfile: Option<String>,
    injected_dockerfile: bool,
    compressed: bool,
}

impl BuildContext {
    /// 適用された除外パターン
    pub fn excludes(&self) -> &[String] {
        &self.excludes
    }

    /// バックエンドに渡すDockerfileの相対パス
    pub fn relative_dockerfile(&self) -> Option<&str> {
        self.relative_dockerfile.as_deref()
    }

    pub fn injected_dockerfile(&self) -> bool {
        self.injected_dockerfile
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// 読み出しを打ち切り、アーカイブ処理の終了を待つ
    pub async fn close(mut self) {
        self.rx.close();
        if let Some(worker) = self.worker.take()
            && let Err(e) = worker.await
        {
            tracing::warn!("Build context worker failed: {}", e);
        }
    }
}

impl Stream for BuildContext {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

pub struct ContextBuilder;

impl ContextBuilder {
    /// ビルドコンテキストを作成
    ///
    /// - Dockerfileが作業ディレクトリ内なら相対パスをそのまま使う
    /// - 外にあれば内容を読み込み `Dockerfile` としてアーカイブに注入する
    /// - リモートデーモン向けにはgzip圧縮する
    pub fn package(dockerfile: &Path, spec: &BuildSpec, remote: bool) -> BuildResult<BuildContext> {
        let resolver = BuildResolver::new(spec.working_dir.clone());
        tracing::debug!("Creating build context from: {}", spec.working_dir.display());

        let mut additions = BTreeMap::new();
        let relative_dockerfile = resolver.relative_dockerfile(dockerfile);
        if relative_dockerfile.is_none() {
            let content = std::fs::read(dockerfile).map_err(|e| {
                BuildError::ContextArchive(format!(
                    "error reading Dockerfile {}: {}",
                    dockerfile.display(),
                    e
                ))
            })?;
            additions.insert(INJECTED_DOCKERFILE.to_string(), content);
        }

        let rules = IgnoreRules::load(
            &spec.working_dir,
            spec.ignorefile.as_deref(),
            relative_dockerfile.as_deref(),
        )
        .map_err(|e| BuildError::ContextArchive(format!("error reading .dockerignore: {}", e)))?;

        let handle = tokio::runtime::Handle::try_current().map_err(|e| {
            BuildError::ContextArchive(format!("no async runtime to archive on: {}", e))
        })?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let excludes = rules.patterns();
        let injected_dockerfile = !additions.is_empty();
        let root = spec.working_dir.clone();

        let worker = handle.spawn_blocking(move || {
            let mut writer = ChannelWriter::new(tx.clone());
            let result = write_archive(&mut writer, &root, &rules, &additions, remote)
                .and_then(|_| writer.flush());
            match result {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    tracing::debug!("Build context reader closed, archiving aborted");
                }
                Err(e) => {
                    tx.blocking_send(Err(e)).ok();
                }
            }
        });

        Ok(BuildContext {
            rx,
            worker: Some(worker),
            excludes,
            relative_dockerfile,
            injected_dockerfile,
            compressed: remote,
        })
    }

    /// コンテキストサイズのチェックと警告
    pub fn check_context_size(size: usize) -> Option<String> {
        const MAX_CONTEXT_SIZE: usize = 500 * 1024 * 1024; // 500MB

        if size > MAX_CONTEXT_SIZE {
            tracing::warn!(
                "警告: ビルドコンテキストが大きすぎます（{}MB）\n\
                 .dockerignoreファイルで不要なファイルを除外することを推奨します。",
                size / 1024 / 1024
            );
            return Some(format!(
                "build context is {}MB; consider excluding files with .dockerignore",
                size / 1024 / 1024
            ));
        }
        None
    }
}

fn write_archive<W: Write>(
    out: W,
    root: &Path,
    rules: &IgnoreRules,
    additions: &BTreeMap<String, Vec<u8>>,
    compressed: bool,
) -> io::Result<()> {
    if compressed {
        let encoder = GzEncoder::new(out, Compression::default());
        let encoder = append_tree(encoder, root, rules, additions)?;
        encoder.finish()?.flush()
    } else {
        append_tree(out, root, rules, additions)?.flush()
    }
}

fn append_tree<W: Write>(
    out: W,
    root: &Path,
    rules: &IgnoreRules,
    additions: &BTreeMap<String, Vec<u8>>,
) -> io::Result<W> {
    let mut tar = Builder::new(out);
    tar.follow_symlinks(false);

    let mut walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = entry.map_err(io::Error::from)?;
        let relative = slash_path(entry.path().strip_prefix(root).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
        })?);

        if additions.contains_key(&relative) {
            continue;
        }

        if rules.is_excluded(&relative) {
            // 配下に再包含され得るパスが無ければディレクトリごと飛ばせる
            if entry.file_type().is_dir() && !rules.may_reinclude_under(&relative) {
                walker.skip_current_dir();
            }
            continue;
        }

        tar.append_path_with_name(entry.path(), &relative)?;
    }

    for (name, content) in additions {
        let mut header = tar::Header::new_gnu();
        header.set_path(name)?;
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append(&header, &content[..])?;
    }

    tar.into_inner()
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// 書き込まれたバイト列をチャンク単位でチャネルに送る
struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
    buf: Vec<u8>,
}

impl ChannelWriter {
    fn new(tx: mpsc::Sender<io::Result<Bytes>>) -> Self {
        Self {
            tx,
            buf: Vec::with_capacity(CHUNK_SIZE),
        }
    }

    fn send_chunk(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = Bytes::from(std::mem::replace(
            &mut self.buf,
            Vec::with_capacity(CHUNK_SIZE),
        ));
        self.tx
            .blocking_send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "build context reader closed"))
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= CHUNK_SIZE {
            self.send_chunk()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_chunk()
    }
}
