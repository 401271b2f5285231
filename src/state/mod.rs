
use std::fmt;

use serde::Serialize;

/// Per-component connectivity state, advanced by gathering and the
/// check-list engine. Transitions are monotonic: once `Ready`, the only
/// exit is `Failed` through an agent restart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ComponentState {
    /// No activity has taken place on the component yet.
    #[serde(rename = "disconnected")]
    Disconnected,

    /// Local candidates are being gathered.
    #[serde(rename = "gathering")]
    Gathering,

    /// Connectivity checks are in progress but nothing has succeeded.
    #[serde(rename = "connecting")]
    Connecting,

    /// At least one pair validated; checks may still be running.
    #[serde(rename = "connected")]
    Connected,

    /// A pair is nominated and no check remains in progress.
    #[serde(rename = "ready")]
    Ready,

    /// All timers ran out with remote candidates present but no
    /// succeeded pair.
    #[serde(rename = "failed")]
    Failed,
}

impl Default for ComponentState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Disconnected => "disconnected",
            Self::Gathering => "gathering",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl ComponentState {
    /// Whether moving from `self` to `next` is a legal transition.
    /// States only advance; `Ready` never falls back to `Connected` and
    /// `Failed` is terminal outside of a restart.
    #[must_use]
    pub fn can_transition_to(self, next: ComponentState) -> bool {
        if self == next {
            return false;
        }
        match self {
            Self::Ready => next == Self::Failed,
            Self::Failed => false,
            _ => next > self,
        }
    }
}

/// Candidate pair check state, RFC 5245 5.7.4.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CandidatePairState {
    /// A check for this pair is blocked on another pair with the same
    /// foundation.
    #[serde(rename = "frozen")]
    Frozen,

    /// The pair is queued for checking.
    #[serde(rename = "waiting")]
    Waiting,

    /// A check has been sent and the transaction is outstanding.
    #[serde(rename = "in-progress")]
    InProgress,

    /// A check produced a successful response and a valid pair.
    #[serde(rename = "succeeded")]
    Succeeded,

    /// The check timed out or produced an unrecoverable error response.
    #[serde(rename = "failed")]
    Failed,

    /// The pair was pruned after nomination and will never be checked.
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl Default for CandidatePairState {
    fn default() -> Self {
        Self::Frozen
    }
}

impl fmt::Display for CandidatePairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Frozen => "frozen",
            Self::Waiting => "waiting",
            Self::InProgress => "in-progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}
