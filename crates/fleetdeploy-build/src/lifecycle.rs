//! ビルドライフサイクルの記録
//!
//! 各フェーズの開始・終了時刻を単調時計で記録します。
//! フェーズは [`PhaseGuard`] で開始し、ガードが破棄された時点で必ず終了します。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// ビルドのフェーズ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// ビルド全体
    Build,
    ContextBuild,
    BuilderInit,
    ImageBuild,
    Push,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Build => "build",
            Phase::ContextBuild => "context-build",
            Phase::BuilderInit => "builder-init",
            Phase::ImageBuild => "image-build",
            Phase::Push => "push",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 1フェーズ分の計測結果
#[derive(Debug, Clone)]
pub struct PhaseTiming {
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    started: Instant,
    finished: Option<Instant>,
}

impl PhaseTiming {
    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    /// 終了済みフェーズの所要時間
    pub fn duration(&self) -> Option<Duration> {
        self.finished.map(|end| end.duration_since(self.started))
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn finished(&self) -> Option<Instant> {
        self.finished
    }
}

/// ビルダーのメタ情報
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuilderMeta {
    pub buildkit_enabled: bool,
    pub remote: bool,
    pub server_version: String,
    /// `os/arch/os_version`
    pub platform: String,
}

#[derive(Debug, Serialize)]
pub struct PhaseReport {
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub duration_ms: Option<u64>,
}

/// 観測用にシリアライズできるビルドの記録
#[derive(Debug, Serialize)]
pub struct BuildReport {
    pub phases: Vec<PhaseReport>,
    pub builder: Option<BuilderMeta>,
}

#[derive(Debug, Default)]
struct RecorderState {
    timings: Vec<PhaseTiming>,
    starts: usize,
    finishes: usize,
    builder: Option<BuilderMeta>,
}

#[derive(Debug, Default)]
pub struct BuildLifecycleRecorder {
    state: Mutex<RecorderState>,
}

impl BuildLifecycleRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// フェーズを開始する
    ///
    /// 返されたガードを破棄するとフェーズが終了する。
    pub fn start(&self, phase: Phase) -> PhaseGuard<'_> {
        let mut state = self.lock();
        state.starts += 1;
        state.timings.push(PhaseTiming {
            phase,
            started_at: Utc::now(),
            started: Instant::now(),
            finished: None,
        });
        let index = state.timings.len() - 1;
        tracing::debug!(phase = %phase, "phase started");

        PhaseGuard {
            recorder: self,
            index,
            phase,
        }
    }

    fn finish(&self, index: usize) {
        let mut state = self.lock();
        state.finishes += 1;
        if let Some(timing) = state.timings.get_mut(index) {
            timing.finished = Some(Instant::now());
            tracing::debug!(
                phase = %timing.phase,
                elapsed_ms = timing.duration().map(|d| d.as_millis() as u64),
                "phase finished"
            );
        }
    }

    pub fn set_builder_meta(&self, meta: BuilderMeta) {
        self.lock().builder = Some(meta);
    }

    pub fn builder_meta(&self) -> Option<BuilderMeta> {
        self.lock().builder.clone()
    }

    pub fn timings(&self) -> Vec<PhaseTiming> {
        self.lock().timings.clone()
    }

    pub fn timing(&self, phase: Phase) -> Option<PhaseTiming> {
        self.lock()
            .timings
            .iter()
            .find(|timing| timing.phase == phase)
            .cloned()
    }

    pub fn start_count(&self) -> usize {
        self.lock().starts
    }

    pub fn finish_count(&self) -> usize {
        self.lock().finishes
    }

    /// まだ終了していないフェーズ
    pub fn open_phases(&self) -> Vec<Phase> {
        self.lock()
            .timings
            .iter()
            .filter(|timing| !timing.is_finished())
            .map(|timing| timing.phase)
            .collect()
    }

    pub fn report(&self) -> BuildReport {
        let state = self.lock();
        BuildReport {
            phases: state
                .timings
                .iter()
                .map(|timing| PhaseReport {
                    phase: timing.phase,
                    started_at: timing.started_at,
                    duration_ms: timing.duration().map(|d| d.as_millis() as u64),
                })
                .collect(),
            builder: state.builder.clone(),
        }
    }
}

/// 開始済みフェーズ。破棄時にフェーズを終了する。
#[must_use = "dropping the guard finishes the phase immediately"]
pub struct PhaseGuard<'a> {
    recorder: &'a BuildLifecycleRecorder,
    index: usize,
    phase: Phase,
}

impl PhaseGuard<'_> {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// 明示的にフェーズを終了する
    pub fn finish(self) {}
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.recorder.finish(self.index);
    }
}
