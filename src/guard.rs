//! Safety reaction to inbound frames.
use log::warn;

use crate::{RobotCommand, protocol::Frame};

const DEFAULT_KEYWORD: &str = "proximity";

/// Stops the robot when it reports an obstacle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProximityGuard {
    keyword: String,
}

impl ProximityGuard {
    pub fn new(keyword: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
        }
    }

    /// The stop frame if `frame` mentions the keyword.
    pub fn react(&self, frame: &Frame) -> Option<Frame> {
        if !frame.payload().contains(&self.keyword) {
            return None;
        }
        warn!("robot reported '{frame}'; stopping");
        Some(RobotCommand::Stop.into())
    }
}

impl Default for ProximityGuard {
    fn default() -> Self {
        Self::new(DEFAULT_KEYWORD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_on_keyword() {
        let guard = ProximityGuard::default();
        let reaction = guard.react(&Frame::from_payload("proximity detected"));

        assert_eq!(reaction, Some(Frame::tag_only('S')));
    }

    #[test]
    fn ignores_other_frames() {
        let guard = ProximityGuard::default();

        assert_eq!(guard.react(&Frame::from_payload("battery 80")), None);
    }

    #[test]
    fn custom_keyword() {
        let guard = ProximityGuard::new("bump");

        assert!(guard.react(&Frame::from_payload("bump left")).is_some());
        assert!(guard.react(&Frame::from_payload("proximity")).is_none());
    }
}
