//! Explicit lifecycle stages and the transition table between them.
//!
//! `Delivered` is terminal and never persisted: reaching it means the entry
//! is deleted in the same change set that acknowledges the callback.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Queued,
    AwaitingRemote,
    ReadyForDownload,
    ReadyForCallback,
    Delivered,
}

impl Stage {
    pub const PERSISTED: [Stage; 4] = [
        Stage::Queued,
        Stage::AwaitingRemote,
        Stage::ReadyForDownload,
        Stage::ReadyForCallback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Queued => "queued",
            Stage::AwaitingRemote => "awaiting_remote",
            Stage::ReadyForDownload => "ready_for_download",
            Stage::ReadyForCallback => "ready_for_callback",
            Stage::Delivered => "delivered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "queued" => Some(Stage::Queued),
            "awaiting_remote" => Some(Stage::AwaitingRemote),
            "ready_for_download" => Some(Stage::ReadyForDownload),
            "ready_for_callback" => Some(Stage::ReadyForCallback),
            "delivered" => Some(Stage::Delivered),
            _ => None,
        }
    }
}

/// Every legal `(from, to)` pair. Staying in place is not a transition.
pub const TRANSITIONS: &[(Stage, Stage)] = &[
    (Stage::Queued, Stage::AwaitingRemote),
    (Stage::AwaitingRemote, Stage::ReadyForDownload),
    // remote cancelled the job
    (Stage::AwaitingRemote, Stage::Queued),
    (Stage::ReadyForDownload, Stage::ReadyForCallback),
    (Stage::ReadyForCallback, Stage::Delivered),
];

pub fn can_transition(from: Stage, to: Stage) -> bool {
    TRANSITIONS.iter().any(|&(f, t)| f == from && t == to)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("illegal transition {} -> {}", from.as_str(), to.as_str())]
    Illegal { from: Stage, to: Stage },

    #[error("remote service returned an empty id")]
    EmptyRemoteId,

    #[error("remote id {0} was already used by a cancelled attempt")]
    IdReused(String),

    #[error("{field} is write-once: have {existing}, got {attempted}")]
    IdRewrite {
        field: &'static str,
        existing: String,
        attempted: String,
    },
}

pub fn ensure_transition(from: Stage, to: Stage) -> Result<(), TransitionError> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(TransitionError::Illegal { from, to })
    }
}

/// A set id must be carried forward unchanged.
pub(crate) fn ensure_same_id(
    field: &'static str,
    current: Option<&str>,
    next: Option<&str>,
) -> Result<(), TransitionError> {
    match current {
        Some(existing) if next != Some(existing) => Err(TransitionError::IdRewrite {
            field,
            existing: existing.to_string(),
            attempted: next.unwrap_or("<none>").to_string(),
        }),
        _ => Ok(()),
    }
}
