//! Run summary
//!
//! The structured record of one pipeline run, rendered as a table for humans
//! or as JSON for schedulers.

use chrono::{DateTime, Utc};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::RunState;
use crate::config::FailurePolicy;
use crate::loader::{FailureInfo, LoadResult, LoadStatus};
use crate::schema::SchemaOutcome;

/// Exit code of a run that completed
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code of a run that failed at any stage
pub const EXIT_FAILURE: i32 = 1;
/// Exit code of a cancelled run (128 + SIGINT)
pub const EXIT_CANCELLED: i32 = 130;

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: RunState,
    pub failure_policy: FailurePolicy,
    pub schema: Option<SchemaOutcome>,
    /// One entry per attempted, skipped or blocked dataset, in load order
    pub results: Vec<LoadResult>,
    /// Datasets never reached because the run stopped early
    pub pending: Vec<String>,
    /// The error that first failed the run
    pub error: Option<FailureInfo>,
}

impl RunSummary {
    pub(crate) fn new(failure_policy: FailurePolicy) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            state: RunState::NotStarted,
            failure_policy,
            schema: None,
            results: Vec::new(),
            pending: Vec::new(),
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.state, RunState::Completed)
    }

    pub fn exit_code(&self) -> i32 {
        match self.state {
            RunState::Completed => EXIT_SUCCESS,
            RunState::Cancelled => EXIT_CANCELLED,
            _ => EXIT_FAILURE,
        }
    }

    /// Result recorded for `dataset`, if it was reached
    pub fn result(&self, dataset: &str) -> Option<&LoadResult> {
        self.results.iter().find(|r| r.dataset == dataset)
    }

    pub fn count(&self, status: LoadStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn rows_loaded(&self) -> u64 {
        self.results.iter().map(|r| r.rows_loaded).sum()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn render_text(&self) -> String {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec![
                "Dataset", "Table", "Decision", "Status", "Source rows", "Loaded", "Duplicates", "Duration",
                "Details",
            ]);

        for result in &self.results {
            let details = match (&result.error, &result.note) {
                (Some(error), _) => error.message.clone(),
                (None, Some(note)) => note.clone(),
                (None, None) => "-".to_string(),
            };
            table.add_row(vec![
                result.dataset.clone(),
                result.table.clone(),
                optional(result.decision),
                result.status.to_string(),
                optional(result.source_rows),
                result.rows_loaded.to_string(),
                result.duplicates_dropped.to_string(),
                format!("{:.1}s", result.duration.as_secs_f64()),
                details,
            ]);
        }

        for dataset in &self.pending {
            table.add_row(vec![
                dataset.clone(),
                "-".to_string(),
                "-".to_string(),
                "pending".to_string(),
                "-".to_string(),
                "0".to_string(),
                "0".to_string(),
                "-".to_string(),
                "not attempted".to_string(),
            ]);
        }

        let mut out = format!("Run {} ({})\n", self.run_id, self.failure_policy);
        if let Some(schema) = self.schema {
            out.push_str(&format!("Schema: {}\n", schema));
        }
        out.push_str(&format!("{}\n", table));
        out.push_str(&format!(
            "State: {}. {} succeeded, {} skipped, {} failed, {} blocked, {} pending; {} rows loaded\n",
            self.state,
            self.count(LoadStatus::Succeeded),
            self.count(LoadStatus::Skipped),
            self.count(LoadStatus::Failed),
            self.count(LoadStatus::Blocked),
            self.pending.len(),
            self.rows_loaded(),
        ));
        if let Some(error) = &self.error {
            out.push_str(&format!("Error: {}\n", error.message));
        }
        out
    }

    /// Emit the outcome through `tracing`
    pub fn log(&self) {
        let duration_ms = self
            .finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
            .unwrap_or_default();

        match &self.state {
            RunState::Completed => info!(
                run_id = %self.run_id,
                succeeded = self.count(LoadStatus::Succeeded),
                skipped = self.count(LoadStatus::Skipped),
                rows = self.rows_loaded(),
                duration_ms,
                "Run completed"
            ),
            RunState::Cancelled => warn!(
                run_id = %self.run_id,
                pending = self.pending.len(),
                duration_ms,
                "Run cancelled"
            ),
            state => error!(
                run_id = %self.run_id,
                %state,
                error = self.error.as_ref().map(|e| e.message.as_str()).unwrap_or("-"),
                failed = self.count(LoadStatus::Failed),
                blocked = self.count(LoadStatus::Blocked),
                pending = self.pending.len(),
                duration_ms,
                "Run failed"
            ),
        }
    }
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}
