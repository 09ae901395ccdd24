//! Relay policy
//!
//! Decides which local callers may use a tunnel. A tunnel's loopback port is
//! reachable by every process on the machine, so each accepted connection is
//! attributed to a process and user before any relay traffic happens.

use std::fmt;
use std::str::FromStr;

use crate::peer::{current_uid, LocalPeer};

/// Which local callers may use a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPolicy {
    /// Only connections opened by the given process
    SameProcess { pid: u32 },

    /// Only connections opened by processes of the given user
    CurrentUser { uid: u32 },

    /// Any local caller
    AnyLocalUser,
}

/// Outcome of evaluating a policy against a caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny,
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }
}

impl RelayPolicy {
    /// Restrict a tunnel to the calling process
    pub fn same_process() -> Self {
        RelayPolicy::SameProcess {
            pid: std::process::id(),
        }
    }

    /// Restrict a tunnel to the user running this process
    ///
    /// `None` when the current user cannot be determined on this platform.
    pub fn current_user() -> Option<Self> {
        current_uid().map(|uid| RelayPolicy::CurrentUser { uid })
    }

    /// Whether evaluating this policy needs the caller's pid or uid
    pub fn requires_identity(&self) -> bool {
        !matches!(self, RelayPolicy::AnyLocalUser)
    }

    /// Evaluate the policy for a caller
    ///
    /// Callers that are not on a loopback address are always denied, as are
    /// callers whose identity could not be resolved.
    pub fn evaluate(&self, peer: &LocalPeer) -> PolicyDecision {
        if !peer.is_loopback() {
            return PolicyDecision::Deny;
        }

        let allowed = match self {
            RelayPolicy::SameProcess { pid } => peer.pid == Some(*pid),
            RelayPolicy::CurrentUser { uid } => peer.uid == Some(*uid),
            RelayPolicy::AnyLocalUser => true,
        };

        if allowed {
            PolicyDecision::Allow
        } else {
            PolicyDecision::Deny
        }
    }
}

impl fmt::Display for RelayPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayPolicy::SameProcess { pid } => write!(f, "same-process (pid {})", pid),
            RelayPolicy::CurrentUser { uid } => write!(f, "current-user (uid {})", uid),
            RelayPolicy::AnyLocalUser => write!(f, "any-local-user"),
        }
    }
}

impl FromStr for RelayPolicy {
    type Err = String;

    /// Parse a policy name, binding it to this process or user
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "same-process" => Ok(RelayPolicy::same_process()),
            "current-user" => RelayPolicy::current_user()
                .ok_or_else(|| "Cannot determine the current user on this platform".to_string()),
            "any-local-user" | "any" => Ok(RelayPolicy::AnyLocalUser),
            other => Err(format!(
                "Unknown relay policy '{}' (expected same-process, current-user or any-local-user)",
                other
            )),
        }
    }
}
