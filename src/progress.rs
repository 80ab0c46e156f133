//! Progress reporting.
//!
//! Child work reports progress on its own 0-100 scale. [`MappedProgress`]
//! rescales it into a slice of the parent's scale with
//! [`map_child_progress`], which never yields 100: only the orchestrator's
//! own final update reaches completion.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Highest percentage an interior mapping may produce.
pub const INTERIOR_PROGRESS_CEILING: u8 = 99;

/// Rescale a child's 0-100 progress into `[base, base + span]`, capped at 99.
pub fn map_child_progress(child_pct: f64, base: f64, span: f64) -> u8 {
    let child = if child_pct.is_finite() {
        child_pct.clamp(0.0, 100.0)
    } else {
        0.0
    };
    let mapped = (base + (child / 100.0) * span).round();
    mapped.clamp(0.0, f64::from(INTERIOR_PROGRESS_CEILING)) as u8
}

/// A progress update: percentage, message and kind-specific extras.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub pct: u8,
    #[serde(default)]
    pub message: String,
    #[serde(flatten)]
    pub extras: Map<String, Value>,
}

impl JobProgress {
    pub fn new(pct: u8, message: impl Into<String>) -> Self {
        Self {
            pct,
            message: message.into(),
            extras: Map::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extras.insert(key.into(), value);
        self
    }
}

/// Receives progress updates. Fire-and-forget: sinks swallow their own errors.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn update(&self, progress: JobProgress);
}

/// Forwards child progress to a parent sink, rescaled into `[base, base + span]`.
///
/// With a title, messages become `"{title}: {message}"`, and an empty child
/// message is replaced by the title. Reported percentages never fall below
/// the highest one this mapper has already forwarded.
pub struct MappedProgress {
    parent: Arc<dyn ProgressSink>,
    base: f64,
    span: f64,
    title: Option<String>,
    high_water: AtomicU8,
}

impl MappedProgress {
    pub fn new(parent: Arc<dyn ProgressSink>, base: f64, span: f64) -> Self {
        Self {
            parent,
            base,
            span,
            title: None,
            high_water: AtomicU8::new(0),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn into_sink(self) -> Arc<dyn ProgressSink> {
        Arc::new(self)
    }
}

#[async_trait]
impl ProgressSink for MappedProgress {
    async fn update(&self, progress: JobProgress) {
        let mapped = map_child_progress(f64::from(progress.pct), self.base, self.span);
        let pct = self.high_water.fetch_max(mapped, Ordering::SeqCst).max(mapped);
        let message = match &self.title {
            Some(title) if progress.message.is_empty() => title.clone(),
            Some(title) => format!("{}: {}", title, progress.message),
            None => progress.message,
        };
        self.parent
            .update(JobProgress {
                pct,
                message,
                extras: progress.extras,
            })
            .await;
    }
}

/// Forwards updates unchanged except that the percentage never drops below
/// the highest one already forwarded.
pub struct HighWaterProgress {
    parent: Arc<dyn ProgressSink>,
    high_water: AtomicU8,
}

impl HighWaterProgress {
    pub fn new(parent: Arc<dyn ProgressSink>) -> Self {
        Self {
            parent,
            high_water: AtomicU8::new(0),
        }
    }

    /// Highest percentage forwarded so far.
    pub fn current(&self) -> u8 {
        self.high_water.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProgressSink for HighWaterProgress {
    async fn update(&self, mut progress: JobProgress) {
        progress.pct = self
            .high_water
            .fetch_max(progress.pct, Ordering::SeqCst)
            .max(progress.pct);
        self.parent.update(progress).await;
    }
}

/// Logs every update through `tracing`.
#[derive(Debug, Clone, Default)]
pub struct TracingProgressSink {
    label: String,
}

impl TracingProgressSink {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

#[async_trait]
impl ProgressSink for TracingProgressSink {
    async fn update(&self, progress: JobProgress) {
        tracing::info!(
            target: "progress",
            label = %self.label,
            pct = progress.pct,
            extras = progress.extras.len(),
            "{}",
            progress.message
        );
    }
}

/// Discards updates.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgressSink;

#[async_trait]
impl ProgressSink for NoopProgressSink {
    async fn update(&self, _progress: JobProgress) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        updates: Mutex<Vec<JobProgress>>,
    }

    #[async_trait]
    impl ProgressSink for Recorder {
        async fn update(&self, progress: JobProgress) {
            self.updates.lock().expect("lock").push(progress);
        }
    }

    #[test]
    fn test_map_child_progress_bounds() {
        assert_eq!(map_child_progress(0.0, 60.0, 20.0), 60);
        assert_eq!(map_child_progress(50.0, 60.0, 20.0), 70);
        assert_eq!(map_child_progress(100.0, 60.0, 20.0), 80);
        assert_eq!(map_child_progress(250.0, 60.0, 20.0), 80);
        assert_eq!(map_child_progress(-5.0, 60.0, 20.0), 60);
        assert_eq!(map_child_progress(f64::NAN, 12.0, 16.0), 12);
    }

    #[test]
    fn test_map_child_progress_never_reaches_100() {
        assert_eq!(map_child_progress(100.0, 80.0, 20.0), 99);
        assert_eq!(map_child_progress(100.0, 0.0, 100.0), 99);
    }

    #[test]
    fn test_map_child_progress_monotonic() {
        let (base, span) = (28.0, 16.0);
        let mut last = 0;
        for child in 0..=100 {
            let mapped = map_child_progress(f64::from(child), base, span);
            assert!(mapped >= last);
            assert!((28..=44).contains(&mapped));
            last = mapped;
        }
    }

    #[test]
    fn test_job_progress_extras_flatten() {
        let progress = JobProgress::new(40, "working")
            .with_extra("sceneChildStats", serde_json::json!({"total": 2}));
        let value = serde_json::to_value(&progress).expect("serializes");
        assert_eq!(value["pct"], 40);
        assert_eq!(value["sceneChildStats"]["total"], 2);
    }

    #[tokio::test]
    async fn test_mapped_progress_nests_and_titles() {
        let recorder = Arc::new(Recorder::default());
        let stage = MappedProgress::new(recorder.clone(), 60.0, 20.0)
            .with_title("refine")
            .into_sink();
        let lane = MappedProgress::new(stage, 50.0, 50.0).into_sink();

        lane.update(JobProgress::new(100, "scene #2").with_extra("k", Value::Bool(true)))
            .await;
        lane.update(JobProgress::new(0, "")).await;

        let updates = recorder.updates.lock().expect("lock");
        assert_eq!(updates[0].pct, 80);
        assert_eq!(updates[0].message, "refine: scene #2");
        assert_eq!(updates[0].extras["k"], true);
        assert_eq!(updates[1].pct, 80);
        assert_eq!(updates[1].message, "refine");
    }

    #[tokio::test]
    async fn test_high_water_holds_peak() {
        let recorder = Arc::new(Recorder::default());
        let sink = HighWaterProgress::new(recorder.clone());

        sink.update(JobProgress::new(26, "working")).await;
        sink.update(JobProgress::new(12, "failed")).await;

        assert_eq!(sink.current(), 26);
        let updates = recorder.updates.lock().expect("lock");
        assert_eq!(updates[1].pct, 26);
        assert_eq!(updates[1].message, "failed");
    }

    #[tokio::test]
    async fn test_mapped_progress_never_decreases() {
        let recorder = Arc::new(Recorder::default());
        let sink = MappedProgress::new(recorder.clone(), 44.0, 16.0).into_sink();

        for child in [10, 60, 30, 0, 100, 90] {
            sink.update(JobProgress::new(child, "")).await;
        }

        let pcts: Vec<u8> = recorder
            .updates
            .lock()
            .expect("lock")
            .iter()
            .map(|u| u.pct)
            .collect();
        assert_eq!(pcts, vec![46, 54, 54, 54, 60, 60]);
    }
}
