pub mod http;
pub mod keyboard;

pub use http::{HttpTrigger, TriggerState};
pub use keyboard::KeyboardTrigger;

use chrono::{DateTime, Utc};

/// Which cameras a clip request addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClipTarget {
    All,
    Camera(String),
}

impl ClipTarget {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            None => ClipTarget::All,
            Some(s) if s.eq_ignore_ascii_case("all") => ClipTarget::All,
            Some(s) => ClipTarget::Camera(s.to_string()),
        }
    }
}

/// A single-shot clip request delivered to the assembler. Created by a
/// trigger front-end, consumed once, discarded.
#[derive(Debug, Clone)]
pub struct ClipRequest {
    pub target: ClipTarget,
    pub duration_s: Option<u32>,
    pub request_time: DateTime<Utc>,
}

impl ClipRequest {
    pub fn for_all() -> Self {
        Self {
            target: ClipTarget::All,
            duration_s: None,
            request_time: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_parsing() {
        assert_eq!(ClipTarget::parse(None), ClipTarget::All);
        assert_eq!(ClipTarget::parse(Some("all")), ClipTarget::All);
        assert_eq!(ClipTarget::parse(Some("ALL")), ClipTarget::All);
        assert_eq!(
            ClipTarget::parse(Some("camera_2")),
            ClipTarget::Camera("camera_2".to_string())
        );
    }

    #[test]
    fn test_request_defaults() {
        let request = ClipRequest::for_all();
        assert_eq!(request.target, ClipTarget::All);
        assert!(request.duration_s.is_none());
    }
}
