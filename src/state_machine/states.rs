use serde::{Deserialize, Serialize};
use std::fmt;

/// Deployment lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentStatus {
    /// Initial state when the deployment is created
    #[default]
    Pending,
    /// Pre-deployment checks are running
    Validating,
    /// Strategy is shifting traffic or replacing instances
    Executing,
    /// Execution suspended by an operator or a manual canary gate
    Paused,
    /// Deployment finished successfully
    Completed,
    /// Deployment stopped; manual rollback is still possible
    Failed,
    /// Applied changes were reverted
    RolledBack,
}

impl DeploymentStatus {
    /// Check if this is a terminal state (no further automatic progress)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }

    /// Check if the deployment is being worked on
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Validating | Self::Executing | Self::Paused)
    }

    /// States from which a rollback may be started
    pub fn can_roll_back(&self) -> bool {
        matches!(
            self,
            Self::Validating | Self::Executing | Self::Paused | Self::Completed | Self::Failed
        )
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Validating => write!(f, "validating"),
            Self::Executing => write!(f, "executing"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::RolledBack => write!(f, "rolled-back"),
        }
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "validating" => Ok(Self::Validating),
            "executing" => Ok(Self::Executing),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "rolled-back" => Ok(Self::RolledBack),
            _ => Err(format!("Invalid deployment status: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(DeploymentStatus::Completed.is_terminal());
        assert!(DeploymentStatus::Failed.is_terminal());
        assert!(DeploymentStatus::RolledBack.is_terminal());
        assert!(!DeploymentStatus::Paused.is_terminal());
        assert!(!DeploymentStatus::Pending.is_terminal());
    }

    #[test]
    fn test_display_round_trips_through_from_str() {
        for status in [
            DeploymentStatus::Pending,
            DeploymentStatus::Validating,
            DeploymentStatus::Executing,
            DeploymentStatus::Paused,
            DeploymentStatus::Completed,
            DeploymentStatus::Failed,
            DeploymentStatus::RolledBack,
        ] {
            assert_eq!(status.to_string().parse::<DeploymentStatus>(), Ok(status));
        }
        assert_eq!(
            serde_json::to_string(&DeploymentStatus::RolledBack).unwrap(),
            "\"rolled-back\""
        );
    }
}
