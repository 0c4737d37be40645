use crate::error::Result;
use chat_proto::{CallSession, Conversation, Message};

/// Durable sink for committed state.
///
/// The store writes through the journal before touching memory, so an error
/// here leaves the in-memory aggregate exactly as it was.
pub trait Journal: Send + Sync {
    fn save_conversation(&self, conversation: &Conversation) -> Result<()>;

    /// Persist changed messages, plus the owning conversation when its derived
    /// fields (preview, unread counters) changed with them.
    fn save_messages(&self, messages: &[Message], conversation: Option<&Conversation>)
        -> Result<()>;

    fn save_call(&self, call: &CallSession) -> Result<()>;
}

/// Journal for replicas and tests that keep state in memory only.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullJournal;

impl Journal for NullJournal {
    fn save_conversation(&self, _conversation: &Conversation) -> Result<()> {
        Ok(())
    }

    fn save_messages(
        &self,
        _messages: &[Message],
        _conversation: Option<&Conversation>,
    ) -> Result<()> {
        Ok(())
    }

    fn save_call(&self, _call: &CallSession) -> Result<()> {
        Ok(())
    }
}

/// Everything a journal holds, used to rebuild the store on startup.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub conversations: Vec<Conversation>,
    pub messages: Vec<Message>,
    pub calls: Vec<CallSession>,
}
