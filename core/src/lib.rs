//! Conversation synchronization core: the conversation aggregate, receipts,
//! presence, typing and call signaling, plus the fan-out hub that pushes
//! committed mutations to live sessions.

pub mod calls;
pub mod clock;
pub mod error;
pub mod fanout;
pub mod journal;
pub mod presence;
pub mod preview;
pub mod receipts;
pub mod replica;
pub mod store;
pub mod typing;

pub use calls::{CallCoordinator, MediaTokenIssuer, OpaqueTokenIssuer};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ErrorKind, Result, SyncError};
pub use fanout::{Broadcaster, Delivery, FanoutStats, Hub, NullBroadcaster, SessionQueue};
pub use journal::{Journal, NullJournal, Snapshot};
pub use presence::{Heartbeat, PresenceService};
pub use receipts::{ConversationUnread, UnreadSummary};
pub use replica::Replica;
pub use store::{
    direct_conversation_id, Actor, AppendOutcome, ConversationFilter, ConversationPatch,
    ConversationStore, Cursor, ForwardReport, ListFilter, NewGroup, NewMessage, NewParticipant,
};
pub use typing::{TypingChange, TypingExpired, TypingTracker};
