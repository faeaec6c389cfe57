//! Conversation-related types.

use market_agent_model::{ModelMessage, Role};

/// An ordered, append-only list of messages.
///
/// A conversation holds at most one system message, and it is always the
/// first one.
#[derive(Clone, Default, Debug, PartialEq)]
pub struct Conversation {
    messages: Vec<ModelMessage>,
}

impl Conversation {
    /// Creates an empty conversation.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all messages, oldest first.
    #[inline]
    pub fn messages(&self) -> &[ModelMessage] {
        &self.messages
    }

    /// Returns the number of messages.
    #[inline]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns `true` if there are no messages yet.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Returns `true` if a system message exists.
    #[inline]
    pub fn has_system(&self) -> bool {
        self.messages
            .first()
            .is_some_and(|msg| msg.role() == Role::System)
    }

    /// Prepends a system message built by `make_prompt` if there is none.
    ///
    /// Returns `true` if a message was inserted.
    pub fn ensure_system<F>(&mut self, make_prompt: F) -> bool
    where
        F: FnOnce() -> String,
    {
        if self.has_system() {
            return false;
        }
        self.messages.insert(0, ModelMessage::system(make_prompt()));
        true
    }

    /// Appends a message.
    ///
    /// Additional system messages are ignored so that the conversation
    /// keeps a single set of instructions.
    pub fn push(&mut self, msg: ModelMessage) {
        if msg.role() == Role::System {
            if self.has_system() {
                warn!("ignoring a second system message");
                return;
            }
            self.messages.insert(0, msg);
            return;
        }
        self.messages.push(msg);
    }

    pub(crate) fn extend<I>(&mut self, msgs: I)
    where
        I: IntoIterator<Item = ModelMessage>,
    {
        for msg in msgs {
            self.push(msg);
        }
    }
}
