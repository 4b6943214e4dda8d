//! Sessions: conversation state, the confirmation handshake and the per-session
//! actor that drives model turns, policy checks and executions.
//!
//! Each live session is one tokio task ([`SessionHandle`] is its address).
//! The registry, policy engine and executor are shared by all sessions; all
//! mutable session state stays inside the task.

pub mod a2a;
mod actor;
mod attempt;
mod confirmation;
mod manager;
pub mod protocol;
pub mod store;
mod turn;

pub use self::actor::{SessionHandle, SessionState};
pub use self::attempt::{Attempt, SessionIdentity, split_tool_name};
pub use self::confirmation::{
    ConfirmationSlot, PendingConfirmation, Resolution, RetiredConfirmations, Retirement,
};
pub use self::manager::{Connection, SessionManager, SessionServices};
pub use self::protocol::{Inbound, Outbound, OutboundFrame};
pub use self::store::{FileSessionStore, MemorySessionStore, SessionRecord, SessionStore, SessionSummary};
pub use self::turn::{ToolCallRecord, Turn, TurnRole, history_window};
