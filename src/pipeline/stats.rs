//! Per-request response logs and extractor-wide statistics.
//!
//! [`ResponseLog`] records how often each stage called its model and how long it
//! took for one request. [`StatsManager`] accumulates outcomes across requests.

use crate::core::errors::{FailureKind, OCRError, OcrResult};
use serde::Serialize;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Stage name of the boundary locator.
pub const STAGE_BOUNDARY: &str = "boundary";
/// Stage name of the field detector.
pub const STAGE_KEY_VALUE: &str = "key_value";
/// Stage name of the text recognizer.
pub const STAGE_RECOGNITION: &str = "recognition";
/// Stage name of the field assembler.
pub const STAGE_ASSEMBLY: &str = "assembly";

/// Call count and elapsed time of one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageTiming {
    /// Stage name.
    pub stage: String,
    /// Model invocations made by the stage.
    pub calls: usize,
    /// Wall time spent in the stage.
    pub elapsed_ms: f64,
}

/// Stage timings of one request, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResponseLog {
    stages: Vec<StageTiming>,
    total_ms: f64,
}

impl ResponseLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `calls` and `elapsed` to `stage`, creating the entry on first use.
    pub fn record(&mut self, stage: &str, calls: usize, elapsed: Duration) {
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        match self.stages.iter_mut().find(|s| s.stage == stage) {
            Some(entry) => {
                entry.calls += calls;
                entry.elapsed_ms += elapsed_ms;
            }
            None => self.stages.push(StageTiming {
                stage: stage.to_string(),
                calls,
                elapsed_ms,
            }),
        }
    }

    /// Sets the end-to-end time.
    pub fn set_total(&mut self, elapsed: Duration) {
        self.total_ms = elapsed.as_secs_f64() * 1000.0;
    }

    /// End-to-end time in milliseconds.
    pub fn total_ms(&self) -> f64 {
        self.total_ms
    }

    /// Model calls made by `stage`; zero for unknown stages.
    pub fn calls(&self, stage: &str) -> usize {
        self.stage(stage).map_or(0, |s| s.calls)
    }

    /// Entry of one stage.
    pub fn stage(&self, stage: &str) -> Option<&StageTiming> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    /// All entries in execution order.
    pub fn stages(&self) -> &[StageTiming] {
        &self.stages
    }
}

/// Optional per-request time budget, checked between stages.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Option<Duration>,
}

impl Deadline {
    /// Starts the clock with an optional budget.
    pub fn start(budget: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    /// A deadline that never expires.
    pub fn unbounded() -> Self {
        Self::start(None)
    }

    /// Time since the request started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Fails with [`OCRError::DeadlineExceeded`] once the budget is spent.
    pub fn check(&self, next_stage: &str) -> OcrResult<()> {
        match self.budget {
            Some(budget) if self.started.elapsed() > budget => Err(OCRError::DeadlineExceeded {
                budget_ms: budget.as_millis() as u64,
                stage: next_stage.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// Outcomes accumulated across requests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionStats {
    /// Requests handled.
    pub total_processed: usize,
    /// Requests that produced a record.
    pub successful: usize,
    /// Requests that ended in [`FailureKind::NoFieldsDetected`].
    pub no_fields: usize,
    /// Requests that failed for any other reason.
    pub failed: usize,
    /// Successful requests whose frame came from a retry strategy.
    pub retried: usize,
    /// Successful requests that fell back to the whole image.
    pub whole_image: usize,
    /// Mean end-to-end time in milliseconds.
    pub average_time_ms: f64,
}

impl ExtractionStats {
    /// Share of requests that produced a record, in percent.
    pub fn success_rate(&self) -> f64 {
        if self.total_processed == 0 {
            0.0
        } else {
            (self.successful as f64 / self.total_processed as f64) * 100.0
        }
    }
}

impl fmt::Display for ExtractionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Extraction Statistics:")?;
        writeln!(f, "  Total processed: {}", self.total_processed)?;
        writeln!(
            f,
            "  Successful: {} ({:.1}%)",
            self.successful,
            self.success_rate()
        )?;
        writeln!(f, "  No fields detected: {}", self.no_fields)?;
        writeln!(f, "  Failed: {}", self.failed)?;
        writeln!(f, "  Retried frames: {}", self.retried)?;
        writeln!(f, "  Whole-image frames: {}", self.whole_image)?;
        writeln!(f, "  Average time: {:.2} ms", self.average_time_ms)?;
        Ok(())
    }
}

/// How a request ended, as far as statistics are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A record was produced from the first attempt.
    Extracted,
    /// A record was produced from a retried frame.
    ExtractedAfterRetry,
    /// A record was produced from the whole image.
    ExtractedWholeImage,
    /// The request failed.
    Failed(FailureKind),
}

/// Thread-safe accumulator for [`ExtractionStats`].
#[derive(Debug, Default)]
pub struct StatsManager {
    stats: Mutex<ExtractionStats>,
}

impl StatsManager {
    /// Creates a manager with zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ExtractionStats> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns a copy of the current statistics.
    pub fn get_stats(&self) -> ExtractionStats {
        self.lock().clone()
    }

    /// Records one finished request.
    pub fn update(&self, outcome: RequestOutcome, elapsed: Duration) {
        let mut stats = self.lock();
        let previous_total = stats.total_processed;
        stats.total_processed += 1;
        match outcome {
            RequestOutcome::Extracted => stats.successful += 1,
            RequestOutcome::ExtractedAfterRetry => {
                stats.successful += 1;
                stats.retried += 1;
            }
            RequestOutcome::ExtractedWholeImage => {
                stats.successful += 1;
                stats.whole_image += 1;
            }
            RequestOutcome::Failed(FailureKind::NoFieldsDetected) => stats.no_fields += 1,
            RequestOutcome::Failed(_) => stats.failed += 1,
        }
        let accumulated = stats.average_time_ms * previous_total as f64;
        stats.average_time_ms =
            (accumulated + elapsed.as_secs_f64() * 1000.0) / stats.total_processed as f64;
    }

    /// Resets the statistics.
    pub fn reset(&self) {
        *self.lock() = ExtractionStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_log_accumulates_per_stage() {
        let mut log = ResponseLog::new();
        log.record(STAGE_BOUNDARY, 1, Duration::from_millis(4));
        log.record(STAGE_KEY_VALUE, 1, Duration::from_millis(2));
        log.record(STAGE_BOUNDARY, 2, Duration::from_millis(6));
        assert_eq!(log.calls(STAGE_BOUNDARY), 3);
        assert_eq!(log.calls(STAGE_RECOGNITION), 0);
        assert_eq!(log.stages()[0].stage, STAGE_BOUNDARY);
        assert!((log.stage(STAGE_BOUNDARY).unwrap().elapsed_ms - 10.0).abs() < 1e-6);
    }

    #[test]
    fn deadline_expires() {
        assert!(Deadline::unbounded().check(STAGE_KEY_VALUE).is_ok());
        let deadline = Deadline::start(Some(Duration::ZERO));
        std::thread::sleep(Duration::from_millis(2));
        let err = deadline.check(STAGE_KEY_VALUE).unwrap_err();
        assert!(matches!(err, OCRError::DeadlineExceeded { ref stage, .. } if stage == STAGE_KEY_VALUE));
    }

    #[test]
    fn stats_manager_counts_outcomes() {
        let manager = StatsManager::new();
        manager.update(RequestOutcome::Extracted, Duration::from_millis(100));
        manager.update(RequestOutcome::ExtractedAfterRetry, Duration::from_millis(200));
        manager.update(
            RequestOutcome::Failed(FailureKind::NoFieldsDetected),
            Duration::from_millis(300),
        );
        let stats = manager.get_stats();
        assert_eq!(stats.total_processed, 3);
        assert_eq!(stats.successful, 2);
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.no_fields, 1);
        assert!((stats.average_time_ms - 200.0).abs() < 1e-6);
        assert!(stats.to_string().contains("Successful: 2 (66.7%)"));

        manager.reset();
        assert_eq!(manager.get_stats(), ExtractionStats::default());
    }
}
