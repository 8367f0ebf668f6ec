//! Class session recognition states and their transitions.
//!
//! A session accepts recognition attempts only while `Active`. The machine
//! is strictly linear: `Pending → Active → Closed`, no skips, and `Closed`
//! never reopens. The durable row in the store is the authority; this
//! module only defines the states and which moves are legal.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Active,
    Closed,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("invalid session transition: {from} → {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
    #[error("unknown session state in store: {0}")]
    UnknownState(String),
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, SessionError> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "closed" => Ok(Self::Closed),
            other => Err(SessionError::UnknownState(other.to_string())),
        }
    }

    pub fn can_transition_to(self, to: SessionState) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Active) | (Self::Active, Self::Closed)
        )
    }

    pub fn transition_error(self, to: SessionState) -> SessionError {
        SessionError::InvalidTransition {
            from: self.as_str(),
            to: to.as_str(),
        }
    }
}
