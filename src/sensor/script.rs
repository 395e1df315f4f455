use crate::common::Result;
use crate::sensor::{Frame, FrameSource};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// A step in a scripted capture sequence.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Finger on the sensor: capture yields this frame, `is_clear` is false.
    Touch(Frame),
    /// Empty sensor: capture yields nothing, `is_clear` is true.
    Clear,
}

/// In-memory `FrameSource` that replays a fixed sequence of touches and
/// clear polls, then stays clear. Drives the scan loops in tests and demos.
pub struct FrameScript {
    steps: Mutex<VecDeque<ScriptStep>>,
}

impl FrameScript {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
        }
    }

    /// A script that presents each frame once, separated by enough clear
    /// polls to satisfy a debounce of `clear_polls`.
    pub fn touches(frames: impl IntoIterator<Item = Frame>, clear_polls: u32) -> Self {
        let mut steps = Vec::new();
        for frame in frames {
            for _ in 0..clear_polls.max(1) {
                steps.push(ScriptStep::Clear);
            }
            steps.push(ScriptStep::Touch(frame));
        }
        Self::new(steps)
    }

    fn advance(&self) -> Option<ScriptStep> {
        self.steps.lock().expect("script poisoned").pop_front()
    }
}

impl FrameSource for FrameScript {
    fn capture_frame(&self, _timeout: Duration) -> Result<Option<Frame>> {
        match self.advance() {
            Some(ScriptStep::Touch(frame)) => Ok(Some(frame)),
            Some(ScriptStep::Clear) | None => Ok(None),
        }
    }

    fn is_clear(&self) -> Result<bool> {
        let mut steps = self.steps.lock().expect("script poisoned");
        match steps.front() {
            Some(ScriptStep::Clear) => {
                steps.pop_front();
                Ok(true)
            }
            Some(ScriptStep::Touch(_)) => Ok(false),
            None => Ok(true),
        }
    }
}
