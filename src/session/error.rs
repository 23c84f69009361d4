//! Session error taxonomy
//!
//! Validation and authorization failures are rejected synchronously and
//! never mutate state; conflicts tell the caller to re-fetch; store
//! failures surface only from lifecycle operations (turn-state writes are
//! retried/logged in the runtime instead, so the live session never
//! blocks on row durability).

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found")]
    NotFound,

    #[error("Participant not found")]
    ParticipantNotFound,

    #[error("Session is not joinable")]
    NotJoinable,

    #[error("Session is full")]
    Full,

    #[error("Forbidden")]
    Forbidden,

    #[error("Already joined")]
    AlreadyJoined,

    #[error("Character level outside the session's level band")]
    LevelOutOfRange,

    #[error("Not every participant is ready")]
    NotReady,

    #[error("Session already started")]
    AlreadyStarted,

    #[error("Not your turn")]
    NotYourTurn,

    #[error("Not enough action points")]
    NotEnoughAp,

    #[error("Target out of range")]
    OutOfRange,

    #[error("Dead participants cannot act")]
    Dead,

    #[error("No combat in progress")]
    NotInCombat,

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Session is shutting down")]
    Closed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SessionError {
    /// Stable wire code for the error envelope
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::NotFound => "not_found",
            SessionError::ParticipantNotFound => "participant_not_found",
            SessionError::NotJoinable => "not_joinable",
            SessionError::Full => "full",
            SessionError::Forbidden => "forbidden",
            SessionError::AlreadyJoined => "already_joined",
            SessionError::LevelOutOfRange => "level_out_of_range",
            SessionError::NotReady => "not_ready",
            SessionError::AlreadyStarted => "already_started",
            SessionError::NotYourTurn => "not_your_turn",
            SessionError::NotEnoughAp => "not_enough_ap",
            SessionError::OutOfRange => "out_of_range",
            SessionError::Dead => "dead",
            SessionError::NotInCombat => "not_in_combat",
            SessionError::Validation(_) => "validation",
            SessionError::Closed => "closed",
            SessionError::Store(_) => "store_error",
        }
    }
}
