//! Task record - one job submission plus its execution state

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Exit code recorded when the process could not be started
pub const SPAWN_FAILED_EXIT_CODE: i32 = -1;

/// OS scheduling hint for the spawned process (does not affect queue order)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    AboveNormal,
    #[default]
    Normal,
    BelowNormal,
    Low,
}

impl Priority {
    /// Unix nice value for this priority
    pub fn nice_value(self) -> i32 {
        match self {
            Self::High => -10,
            Self::AboveNormal => -5,
            Self::Normal => 0,
            Self::BelowNormal => 5,
            Self::Low => 10,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::AboveNormal => write!(f, "above-normal"),
            Self::Normal => write!(f, "normal"),
            Self::BelowNormal => write!(f, "below-normal"),
            Self::Low => write!(f, "low"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Pending,
    Running,
    Done,
}

/// What a client submits
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSpec {
    pub work_dir: String,
    pub exec_name: String,
    pub args: Vec<String>,
    pub priority: Priority,
    pub save_output: bool,
    /// Destination of the saved output; a per-queue default is used when empty
    pub output_path: String,
    /// Plugin invoked after the process exits; empty means none
    pub post_handler_path: String,
    /// Remove the output file once the post-handler returns
    pub have_to_delete: bool,
}

impl TaskSpec {
    pub fn new(exec_name: impl Into<String>) -> Self {
        Self {
            exec_name: exec_name.into(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<String>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_saved_output(mut self, output_path: impl Into<String>) -> Self {
        self.save_output = true;
        self.output_path = output_path.into();
        self
    }

    pub fn with_post_handler(mut self, path: impl Into<String>, have_to_delete: bool) -> Self {
        self.post_handler_path = path.into();
        self.have_to_delete = have_to_delete;
        self
    }

    /// Reject specs that can never run
    pub fn validate(&self) -> Result<()> {
        if self.exec_name.trim().is_empty() {
            return Err(Error::ValidationFailed("exec_name is empty".to_string()));
        }
        if self.work_dir.is_empty() {
            return Err(Error::ValidationFailed("work_dir is empty".to_string()));
        }
        if !Path::new(&self.work_dir).is_dir() {
            return Err(Error::ValidationFailed(format!(
                "work_dir is not a directory: {}",
                self.work_dir
            )));
        }
        Ok(())
    }
}

/// A job plus its execution state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: u32,
    #[serde(flatten)]
    pub spec: TaskSpec,
    pub state: TaskState,
    /// Valid once `state` is `Done`
    pub exit_code: Option<i32>,
    pub is_success: bool,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub spawn_error: Option<String>,
    pub output_error: Option<String>,
    pub post_handler_error: Option<String>,
}

impl Task {
    pub fn new(id: u32, spec: TaskSpec) -> Self {
        Self {
            id,
            spec,
            state: TaskState::Pending,
            exit_code: None,
            is_success: false,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            spawn_error: None,
            output_error: None,
            post_handler_error: None,
        }
    }

    /// Pending -> Running
    pub fn mark_running(&mut self) {
        self.state = TaskState::Running;
        self.started_at = Some(Utc::now());
    }

    /// Running -> Done
    pub fn mark_done(&mut self, exit_code: i32) {
        self.state = TaskState::Done;
        self.exit_code = Some(exit_code);
        self.is_success = self.spawn_error.is_none() && exit_code == 0;
        self.finished_at = Some(Utc::now());
    }

    /// Where captured output goes, if anything is saved
    pub fn output_file(&self) -> Option<PathBuf> {
        if self.spec.save_output && !self.spec.output_path.is_empty() {
            Some(PathBuf::from(&self.spec.output_path))
        } else {
            None
        }
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id,
            exec_name: self.spec.exec_name.clone(),
            exit_code: self.exit_code,
            is_success: self.is_success,
        }
    }

    pub fn descriptor(&self) -> TaskDescriptor {
        TaskDescriptor {
            dst: self.spec.output_path.clone(),
            work_dir: self.spec.work_dir.clone(),
            program_name: self.spec.exec_name.clone(),
            priority: self.spec.priority,
            args: self.spec.args.clone(),
            save_output: self.spec.save_output,
            exit_code: self.exit_code.unwrap_or(SPAWN_FAILED_EXIT_CODE),
            post_handler: self.spec.post_handler_path.clone(),
            have_to_delete: self.spec.have_to_delete,
        }
    }
}

/// Short listing entry for a finished task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: u32,
    pub exec_name: String,
    pub exit_code: Option<i32>,
    pub is_success: bool,
}

/// What a post-handler receives after a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub dst: String,
    pub work_dir: String,
    pub program_name: String,
    pub priority: Priority,
    pub args: Vec<String>,
    pub save_output: bool,
    pub exit_code: i32,
    pub post_handler: String,
    pub have_to_delete: bool,
}
