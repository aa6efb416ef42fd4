//! Per-run migration statistics. Not persisted.

use chrono::{DateTime, Duration, Utc};
use std::{collections::BTreeSet, fmt};

/// Identifiers collected during one batch run.
///
/// Every item pulled from the source cursor lands in `processed` exactly
/// once; `uploaded` and `skipped` never both hold the same item.
#[derive(Clone, Debug)]
pub struct RunStats {
    pub processed: Vec<String>,
    pub skipped: Vec<String>,
    pub uploaded: Vec<String>,
    pub errored: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunStats {
    pub fn start() -> Self {
        Self {
            processed: Vec::new(),
            skipped: Vec::new(),
            uploaded: Vec::new(),
            errored: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn duration(&self) -> Option<Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }

    /// Errored identifiers with duplicates removed.
    pub fn distinct_errored(&self) -> BTreeSet<&str> {
        self.errored.iter().map(String::as_str).collect()
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Processed: {}", self.processed.len())?;
        writeln!(f, "Uploaded: {}", self.uploaded.len())?;
        writeln!(f, "Skipped: {}", self.skipped.len())?;
        write!(f, "Errored: {}", self.errored.len())?;
        if !self.errored.is_empty() {
            let ids: Vec<&str> = self.distinct_errored().into_iter().collect();
            write!(f, " [{}]", ids.join(", "))?;
        }
        if let Some(duration) = self.duration() {
            write!(
                f,
                "\nStarted: {}\nFinished: {}\nDuration: {}s",
                self.started_at.to_rfc3339(),
                self.finished_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
                duration.num_milliseconds() as f64 / 1000.0
            )?;
        }
        Ok(())
    }
}
