use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::errors::GenerationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoStatus {
    #[default]
    Queued,
    Processing,
    Done,
    Error,
}

impl VideoStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    fn can_transition_to(self, next: VideoStatus) -> bool {
        match self {
            Self::Queued => true,
            Self::Processing => next != Self::Queued,
            Self::Done | Self::Error => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoTask {
    pub source_url: String,
    pub task_id: Option<String>,
    pub status: VideoStatus,
    pub result_url: Option<String>,
    pub error: Option<String>,
    pub progress: u8,
}

/// Video jobs keyed by the image they animate.
#[derive(Debug, Clone, Default)]
pub struct VideoTaskBoard {
    tasks: IndexMap<String, VideoTask>,
}

impl VideoTaskBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a queued job for `source_url`. A finished job for the same
    /// image is replaced; a running one is left alone.
    pub fn enqueue(&mut self, source_url: &str) -> Result<(), GenerationError> {
        if let Some(existing) = self.tasks.get(source_url) {
            if !existing.status.is_terminal() {
                return Err(GenerationError::Validation(format!(
                    "a video is already being generated for {source_url}"
                )));
            }
        }
        self.tasks.insert(
            source_url.to_string(),
            VideoTask {
                source_url: source_url.to_string(),
                task_id: None,
                status: VideoStatus::Queued,
                result_url: None,
                error: None,
                progress: 0,
            },
        );
        Ok(())
    }

    pub fn attach_task_id(&mut self, source_url: &str, task_id: &str) {
        if let Some(task) = self.tasks.get_mut(source_url) {
            task.task_id = Some(task_id.to_string());
        }
    }

    /// Records a poll tick. Terminal tasks never move again.
    pub fn mark_progress(&mut self, source_url: &str, status: VideoStatus, progress: u8) -> bool {
        let Some(task) = self.tasks.get_mut(source_url) else {
            return false;
        };
        if !task.status.can_transition_to(status) || status.is_terminal() {
            return false;
        }
        task.status = status;
        task.progress = progress.min(100).max(task.progress);
        true
    }

    pub fn complete(&mut self, source_url: &str, result_url: &str) -> bool {
        let Some(task) = self.tasks.get_mut(source_url) else {
            return false;
        };
        if task.status.is_terminal() {
            return false;
        }
        task.status = VideoStatus::Done;
        task.result_url = Some(result_url.to_string());
        task.progress = 100;
        true
    }

    pub fn fail(&mut self, source_url: &str, error: &str) -> bool {
        let Some(task) = self.tasks.get_mut(source_url) else {
            return false;
        };
        if task.status.is_terminal() {
            return false;
        }
        task.status = VideoStatus::Error;
        task.error = Some(error.to_string());
        true
    }

    pub fn get(&self, source_url: &str) -> Option<&VideoTask> {
        self.tasks.get(source_url)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &VideoTask> {
        self.tasks.values()
    }

    pub fn active_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|task| !task.status.is_terminal())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_walks_queued_processing_done() {
        let mut board = VideoTaskBoard::new();
        assert!(board.enqueue("https://cdn/a.png").is_ok());
        board.attach_task_id("https://cdn/a.png", "task-1");
        assert!(board.mark_progress("https://cdn/a.png", VideoStatus::Processing, 40));
        assert!(!board.mark_progress("https://cdn/a.png", VideoStatus::Queued, 0));
        assert!(board.complete("https://cdn/a.png", "https://cdn/a.mp4"));

        let task = board.get("https://cdn/a.png").cloned();
        let task = task.unwrap_or_else(|| panic!("task missing"));
        assert_eq!(task.status, VideoStatus::Done);
        assert_eq!(task.task_id.as_deref(), Some("task-1"));
        assert_eq!(task.progress, 100);
        assert!(!board.fail("https://cdn/a.png", "late"));
    }

    #[test]
    fn running_task_blocks_duplicate_enqueue() {
        let mut board = VideoTaskBoard::new();
        assert!(board.enqueue("s").is_ok());
        assert!(board.enqueue("s").is_err());
        assert!(board.fail("s", "boom"));
        assert!(board.enqueue("s").is_ok());
        assert_eq!(board.active_count(), 1);
    }
}
