//! ビルド進捗の表示
//!
//! 対話端末ではすべての更新をスピナー付きで表示し、
//! 非対話の出力先では各項目の最終更新のみを書き出します。

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, IsTerminal, Write};

/// 構造化されたビルドステップ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepProgress {
    pub id: String,
    pub name: String,
    pub current: u64,
    pub total: Option<u64>,
    pub cached: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressKind {
    Text(String),
    Step(StepProgress),
}

/// 進捗イベント（永続化しない）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    /// この項目の最終更新かどうか
    pub last_update: bool,
}

impl ProgressEvent {
    /// 完結した1行のテキスト
    pub fn text(line: impl Into<String>) -> Self {
        Self {
            kind: ProgressKind::Text(line.into()),
            last_update: true,
        }
    }

    /// 途中経過のテキスト（転送量など）
    pub fn partial(line: impl Into<String>) -> Self {
        Self {
            kind: ProgressKind::Text(line.into()),
            last_update: false,
        }
    }

    pub fn step(step: StepProgress, done: bool) -> Self {
        Self {
            kind: ProgressKind::Step(step),
            last_update: done,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    /// すべての更新を表示
    Full,
    /// 最終更新のみ表示
    LastUpdateOnly,
}

pub struct ProgressRenderer {
    mode: ProgressMode,
    out: Box<dyn Write + Send>,
    spinner: Option<ProgressBar>,
}

impl ProgressRenderer {
    /// 標準エラー出力向けのレンダラー
    ///
    /// 端末ならスピナー付きの全更新表示、そうでなければ最終更新のみ。
    pub fn stderr() -> Self {
        if io::stderr().is_terminal() {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} [{elapsed_precise}] {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            Self {
                mode: ProgressMode::Full,
                out: Box::new(io::stderr()),
                spinner: Some(pb),
            }
        } else {
            Self::with_writer(Box::new(io::stderr()), ProgressMode::LastUpdateOnly)
        }
    }

    pub fn with_writer(out: Box<dyn Write + Send>, mode: ProgressMode) -> Self {
        Self {
            mode,
            out,
            spinner: None,
        }
    }

    pub fn mode(&self) -> ProgressMode {
        self.mode
    }

    pub fn is_interactive(&self) -> bool {
        self.spinner.is_some()
    }

    pub fn render(&mut self, event: &ProgressEvent) -> io::Result<()> {
        if self.mode == ProgressMode::LastUpdateOnly && !event.last_update {
            return Ok(());
        }

        let line = match &event.kind {
            ProgressKind::Text(text) => text.trim_end_matches('\n').to_string(),
            ProgressKind::Step(step) => format_step(step, event.last_update),
        };

        match &self.spinner {
            Some(pb) if event.last_update => pb.println(line),
            Some(pb) => pb.set_message(line),
            None => writeln!(self.out, "{}", line)?,
        }
        Ok(())
    }

    pub fn set_message(&self, msg: &str) {
        if let Some(pb) = &self.spinner {
            pb.set_message(msg.to_string());
        }
    }

    pub fn finish_success(&mut self, message: &str) {
        match &self.spinner {
            Some(pb) => pb.finish_with_message(format!("{} {}", "✓".green(), message)),
            None => {
                writeln!(self.out, "{} {}", "✓".green(), message).ok();
            }
        }
    }

    pub fn finish_error(&mut self, error: &str) {
        match &self.spinner {
            Some(pb) => pb.abandon_with_message(format!("{} {}", "✗".red(), error)),
            None => {
                writeln!(self.out, "{} {}", "✗".red(), error).ok();
            }
        }
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

fn format_step(step: &StepProgress, done: bool) -> String {
    let id: String = step
        .id
        .trim_start_matches("sha256:")
        .chars()
        .take(12)
        .collect();
    let prefix = format!("#{} {}", id, step.name);

    if let Some(error) = &step.error {
        return format!("{} {} {}", prefix, "ERROR:".red().bold(), error);
    }
    if step.cached {
        return format!("{} {}", prefix, "CACHED".cyan());
    }
    if done {
        return format!("{} {}", prefix, "DONE".green());
    }
    match step.total {
        Some(total) if total > 0 => format!("{} {}/{}", prefix, step.current, total),
        _ => prefix,
    }
}
