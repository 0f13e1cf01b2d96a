//! Checkpoint and resume.
//!
//! A [`Checkpoint`] holds everything needed to continue a run after an
//! interruption: the conversation window, summary state, retrieval entries,
//! loop-guard counters, budget, and task state. [`CheckpointStore`] keeps one
//! directory per run with one file per step:
//!
//! ```text
//! checkpoint_dir/
//!   run-18c3f0a2b-0000/
//!     step-001.json
//!     step-002.json
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::done::EvidenceTracker;
use super::guards::GuardState;
use super::state::RunStatus;
use super::task::TaskState;
use crate::context::budget::BudgetState;
use crate::context::retrieval::RetrievalMemory;
use crate::context::summarizer::HistorySummary;
use crate::context::window::ConversationWindow;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed checkpoint {path}: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    /// Last completed step.
    pub step: u32,
    pub status: RunStatus,
    pub window: ConversationWindow,
    pub summary: HistorySummary,
    pub retrieval: RetrievalMemory,
    pub guards: GuardState,
    pub budget: BudgetState,
    pub task: TaskState,
    #[serde(default)]
    pub evidence: EvidenceTracker,
    /// Domains where scripts were allowed.
    #[serde(default)]
    pub granted_domains: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// One-paragraph description for the CLI.
    pub fn describe(&self) -> String {
        let mut out = format!(
            "run {} at step {} ({})\ngoal: {}\nwindow: {} head + {} body message(s), ~{} tokens\n\
             summary: {} chars, {} pending chunk(s), {} message(s) summarized\n\
             retrieval: {} entr{}\ntokens used: {}/{}\nsaved: {}",
            self.run_id,
            self.step,
            self.status,
            self.task.goal,
            self.window.head().len(),
            self.window.body_len(),
            self.window.estimated_tokens(),
            self.summary.running.chars().count(),
            self.summary.pending.len(),
            self.summary.summarized_messages,
            self.retrieval.len(),
            if self.retrieval.len() == 1 { "y" } else { "ies" },
            self.budget.used_tokens,
            self.budget.token_limit,
            self.created_at.to_rfc3339(),
        );
        if !self.task.scratch.is_empty() {
            out.push_str("\nscratch:");
            for (k, v) in &self.task.scratch {
                out.push_str(&format!("\n  {k} = {v}"));
            }
        }
        out
    }
}

pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Create the store, ensuring the root directory exists.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.dir.join(run_id)
    }

    fn step_filename(step: u32) -> String {
        format!("step-{step:03}.json")
    }

    /// Atomic write: serialize to a temp file, then rename into place.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf, CheckpointError> {
        let dir = self.run_dir(&checkpoint.run_id);
        std::fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let final_path = dir.join(Self::step_filename(checkpoint.step));
        let tmp_path = dir.join(format!(".{}.tmp", Self::step_filename(checkpoint.step)));

        let json = serde_json::to_string_pretty(checkpoint).map_err(|source| CheckpointError::Serde {
            path: final_path.clone(),
            source,
        })?;
        std::fs::write(&tmp_path, json).map_err(io_err(&tmp_path))?;
        std::fs::rename(&tmp_path, &final_path).map_err(io_err(&final_path))?;
        debug!("checkpoint saved: {}", final_path.display());
        Ok(final_path)
    }

    /// Load a checkpoint file.
    pub fn load(path: &Path) -> Result<Checkpoint, CheckpointError> {
        let json = std::fs::read_to_string(path).map_err(io_err(path))?;
        serde_json::from_str(&json).map_err(|source| CheckpointError::Serde {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load the highest-step checkpoint of a run.
    pub fn load_latest(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let dir = self.run_dir(run_id);
        if !dir.exists() {
            return Ok(None);
        }
        let mut latest: Option<(u32, PathBuf)> = None;
        for entry in std::fs::read_dir(&dir).map_err(io_err(&dir))? {
            let entry = entry.map_err(io_err(&dir))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(step) = name
                .strip_prefix("step-")
                .and_then(|s| s.strip_suffix(".json"))
                .and_then(|s| s.parse::<u32>().ok())
                && latest.as_ref().is_none_or(|(s, _)| step > *s)
            {
                latest = Some((step, entry.path()));
            }
        }
        match latest {
            Some((_, path)) => Self::load(&path).map(Some),
            None => Ok(None),
        }
    }

    /// Delete every checkpoint of a run.
    pub fn remove_run(&self, run_id: &str) -> Result<(), CheckpointError> {
        let dir = self.run_dir(run_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(io_err(&dir))?;
        } else {
            warn!("no checkpoints for run {run_id}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Message;
    use crate::context::budget::BudgetConfig;
    use crate::context::retrieval::{EntrySource, RetrievalConfig};
    use crate::context::window::WindowConfig;

    fn sample(run_id: &str, step: u32) -> Checkpoint {
        let mut window = ConversationWindow::new(WindowConfig::default(), 100_000);
        window.set_head(vec![Message::system("sys"), Message::user("goal")]);
        window.append(Message::assistant_text("thinking"), Some(step));
        let mut retrieval = RetrievalMemory::new(RetrievalConfig::default());
        retrieval.index("clicked the cart button", Some(1), EntrySource::EvictedTurn);
        let mut task = TaskState::new("buy a kettle");
        task.remember("color", "blue");
        Checkpoint {
            run_id: run_id.into(),
            step,
            status: RunStatus::Running,
            window,
            summary: HistorySummary::default(),
            retrieval,
            guards: GuardState::default(),
            budget: BudgetState::new(&BudgetConfig::default(), None),
            task,
            evidence: EvidenceTracker::default(),
            granted_domains: vec!["shop.example.com".into()],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn save_and_load_latest() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(tmp.path().join("checkpoints")).unwrap();
        store.save(&sample("run-a", 1)).unwrap();
        store.save(&sample("run-a", 12)).unwrap();
        let path = store.save(&sample("run-a", 3)).unwrap();
        assert!(path.ends_with("run-a/step-003.json"));

        let latest = store.load_latest("run-a").unwrap().unwrap();
        assert_eq!(latest.step, 12);
        assert_eq!(latest.window.body_len(), 1);
        assert_eq!(latest.retrieval.len(), 1);
        assert_eq!(latest.task.scratch.get("color").map(String::as_str), Some("blue"));
        assert!(store.load_latest("run-b").unwrap().is_none());
    }

    #[test]
    fn no_temp_files_left_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(tmp.path()).unwrap();
        store.save(&sample("run-x", 2)).unwrap();
        let names: Vec<String> = std::fs::read_dir(tmp.path().join("run-x"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["step-002.json".to_string()]);
    }

    #[test]
    fn malformed_file_is_a_serde_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(CheckpointStore::load(&path), Err(CheckpointError::Serde { .. })));
        assert!(matches!(
            CheckpointStore::load(&tmp.path().join("missing.json")),
            Err(CheckpointError::Io { .. })
        ));
    }

    #[test]
    fn describe_mentions_goal_and_scratch() {
        let text = sample("run-d", 4).describe();
        assert!(text.contains("run run-d at step 4 (running)"));
        assert!(text.contains("goal: buy a kettle"));
        assert!(text.contains("color = blue"));
        assert!(text.contains("1 entry"));
    }

    #[test]
    fn remove_run_deletes_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(tmp.path()).unwrap();
        store.save(&sample("run-r", 1)).unwrap();
        store.remove_run("run-r").unwrap();
        assert!(store.load_latest("run-r").unwrap().is_none());
    }
}
