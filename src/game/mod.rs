//! Turn & combat controller
//!
//! The controller functions mutate the in-memory session state and return
//! an ordered list of effects; the owning session runtime applies them
//! (cache writes, store writes, timer arming, broadcasts) in order, so
//! every mutation reaches the change log and the subscribers before the
//! command that caused it completes.

pub mod actions;
pub mod initiative;
pub mod turns;

use uuid::Uuid;

use crate::cache::{TurnRecord, TurnTimer};
use crate::sync::ChangeRecord;
use crate::ws::protocol::ServerMsg;

/// Why a turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEndReason {
    /// The turn holder ended it explicitly
    Manual,
    /// The turn clock expired
    Timeout,
}

/// One side effect of a state transition, applied in order by the runtime
#[derive(Debug, Clone)]
pub enum Effect {
    /// Fan out an event to the session's subscribers
    Broadcast(ServerMsg),
    /// Funnel a mutation through record-and-broadcast
    Record(ChangeRecord),
    /// Rewrite the cache-resident turn record
    WriteTurn(TurnRecord),
    /// Delete the cache-resident turn record
    ClearTurn,
    /// Cancel any pending timer, then arm this one
    ArmTimer(TurnTimer),
    /// Cancel the pending timer and delete its cache record
    ClearTimer,
    /// Advisory store write of the session row
    PersistSession,
    /// Insert a brand-new participant row
    InsertParticipant(Uuid),
    /// Advisory store write of one participant row
    PersistParticipant(Uuid),
    /// Remove one participant row
    DeleteParticipant(Uuid),
    /// Atomic host transfer in the store (user ids)
    TransferHost { from: Uuid, to: Uuid },
    /// Bump the winner's win/play counters (user id)
    BumpWinner(Uuid),
    /// The session reached Finished; the runtime winds down after this
    SessionFinished,
}
