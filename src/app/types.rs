/// Component lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl ComponentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentState::Stopped => "stopped",
            ComponentState::Starting => "starting",
            ComponentState::Running => "running",
            ComponentState::Stopping => "stopping",
            ComponentState::Failed => "failed",
        }
    }
}

/// Why the system is shutting down
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    Signal(String),
    UserRequest(String),
    SupervisorGaveUp,
    Error(String),
}

impl ShutdownReason {
    /// Process exit code for this shutdown
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownReason::SupervisorGaveUp => 2,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ShutdownReason::Signal("SIGTERM".to_string()).exit_code(), 0);
        assert_eq!(
            ShutdownReason::UserRequest("keyboard".to_string()).exit_code(),
            0
        );
        assert_eq!(ShutdownReason::SupervisorGaveUp.exit_code(), 2);
    }

    #[test]
    fn test_component_state_strings() {
        assert_eq!(ComponentState::Running.as_str(), "running");
        assert_eq!(ComponentState::Stopping.as_str(), "stopping");
    }
}
