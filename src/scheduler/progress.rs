use std::collections::BTreeMap;

use serde::Serialize;

/// Answers collected for one assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionProgress {
    /// Equal to the assigned item's id.
    pub session_id: String,
    pub answers: BTreeMap<u32, String>,
    /// Step the next answer is recorded at. Starts at 1.
    pub current_step: u32,
    pub total_steps: u32,
    pub completed: bool,
}

/// What recording one answer did to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub step: u32,
    pub total: u32,
    pub completed: bool,
}

impl SessionProgress {
    pub fn new(session_id: impl Into<String>, total_steps: u32) -> Self {
        Self {
            session_id: session_id.into(),
            answers: BTreeMap::new(),
            current_step: 1,
            total_steps: total_steps.max(1),
            completed: false,
        }
    }

    /// Record an answer at the current step and advance.
    ///
    /// Returns `None` once the session has completed.
    pub fn record(&mut self, answer: impl Into<String>) -> Option<StepOutcome> {
        if self.completed {
            return None;
        }

        let step = self.current_step;
        self.answers.insert(step, answer.into());
        self.current_step += 1;
        if self.answers.len() as u32 >= self.total_steps {
            self.completed = true;
        }

        Some(StepOutcome {
            step,
            total: self.total_steps,
            completed: self.completed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_step_one() {
        let progress = SessionProgress::new("item-1", 3);
        assert_eq!(progress.current_step, 1);
        assert!(progress.answers.is_empty());
        assert!(!progress.completed);
    }

    #[test]
    fn completes_after_total_steps() {
        let mut progress = SessionProgress::new("item-1", 2);

        let first = progress.record("left").unwrap();
        assert_eq!(first.step, 1);
        assert!(!first.completed);

        let second = progress.record("right").unwrap();
        assert_eq!(second.step, 2);
        assert!(second.completed);

        assert_eq!(progress.answers.get(&1).map(String::as_str), Some("left"));
        assert_eq!(progress.answers.get(&2).map(String::as_str), Some("right"));
        assert!(progress.record("extra").is_none());
    }

    #[test]
    fn zero_steps_is_treated_as_one() {
        let mut progress = SessionProgress::new("item-1", 0);
        assert!(progress.record("only").unwrap().completed);
    }
}
