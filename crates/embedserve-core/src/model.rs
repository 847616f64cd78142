use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Loading lifecycle state of a registered model.
///
/// Transitions are `Unloaded -> Loading -> {Ready, Failed}`; `Failed` is
/// terminal for the handle that reached it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    /// Handle exists but loading has not started.
    #[default]
    Unloaded,
    /// Backend is being loaded in the background.
    Loading,
    /// Backend is loaded and may serve inference.
    Ready,
    /// Backend failed to load.
    Failed,
}

impl ModelStatus {
    /// Returns the canonical lowercase label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    /// Compact encoding for atomic storage.
    #[must_use]
    pub const fn as_u8(&self) -> u8 {
        match self {
            Self::Unloaded => 0,
            Self::Loading => 1,
            Self::Ready => 2,
            Self::Failed => 3,
        }
    }

    /// Inverse of [`ModelStatus::as_u8`]; unknown values decode as `Failed`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Unloaded,
            1 => Self::Loading,
            2 => Self::Ready,
            _ => Self::Failed,
        }
    }

    /// Whether `self -> next` is a legal lifecycle transition.
    #[must_use]
    pub const fn can_transition_to(&self, next: ModelStatus) -> bool {
        matches!(
            (self, next),
            (Self::Unloaded, Self::Loading)
                | (Self::Loading, Self::Ready)
                | (Self::Loading, Self::Failed)
        )
    }
}

impl std::fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unloaded" => Ok(Self::Unloaded),
            "loading" => Ok(Self::Loading),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            _ => Err(()),
        }
    }
}

/// Public metadata of a model handle.
///
/// Limits are only known once the backend has loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Registered model name.
    pub name: String,
    /// Additional names resolving to this model.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    /// Lifecycle status.
    pub status: ModelStatus,
    /// Maximum tokens per chunk.
    pub max_sequence_length: Option<usize>,
    /// Output vector dimension.
    pub embedding_dim: Option<usize>,
    /// Load failure reason, present only when `status` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_u8() {
        for status in [
            ModelStatus::Unloaded,
            ModelStatus::Loading,
            ModelStatus::Ready,
            ModelStatus::Failed,
        ] {
            assert_eq!(ModelStatus::from_u8(status.as_u8()), status);
            assert_eq!(status.as_str().parse::<ModelStatus>(), Ok(status));
        }
    }

    #[test]
    fn test_transitions() {
        assert_eq!(ModelStatus::default(), ModelStatus::Unloaded);
        assert!(ModelStatus::default().can_transition_to(ModelStatus::Loading));
        assert!(ModelStatus::Loading.can_transition_to(ModelStatus::Ready));
        assert!(ModelStatus::Loading.can_transition_to(ModelStatus::Failed));
        assert!(!ModelStatus::Failed.can_transition_to(ModelStatus::Loading));
        assert!(!ModelStatus::Failed.can_transition_to(ModelStatus::Ready));
        assert!(!ModelStatus::Ready.can_transition_to(ModelStatus::Loading));
    }
}
