//! Reconstructs transcript messages from streamed fragments.
//!
//! Each speaker has an independent lane holding a text buffer and at most one
//! open (streaming) message. Fragments accumulate into the open message until
//! a completion closes it.
//!
//! The user's transcription often completes only after the assistant has
//! started answering. When an assistant message opens while the user lane is
//! empty and no user message was finalized this turn, it is remembered as
//! pending; a user message that appears before the next user completion is
//! placed ahead of it.

use chrono::{DateTime, Utc};
use ringvox_types::Speaker;
use serde::Serialize;

pub type MessageId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Streaming,
    Final,
}

/// One line of the transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: MessageId,
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
}

/// A change to the visible transcript. `position` is the index in
/// [`TranscriptAggregator::messages`] after the change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TranscriptUpdate {
    /// A new message was appended.
    Opened { message: Message, position: usize },
    /// A new message was placed ahead of an already visible one.
    Inserted { message: Message, position: usize },
    /// The open message's text changed.
    Updated { message: Message },
    /// The message was closed; its text is now fixed.
    Finalized { message: Message },
    /// Speech restarted; the open user message was emptied.
    Reset { id: MessageId },
    /// The message was dropped to respect the retention bound.
    Evicted { id: MessageId },
}

#[derive(Debug, Default)]
struct Lane {
    buffer: String,
    open: Option<MessageId>,
}

impl Lane {
    fn clear(&mut self) {
        self.buffer.clear();
        self.open = None;
    }
}

#[derive(Debug, Default)]
pub struct TranscriptAggregator {
    messages: Vec<Message>,
    user: Lane,
    assistant: Lane,
    pending_assistant: Option<MessageId>,
    /// A user message was finalized since the last assistant completion or
    /// speech start.
    user_finalized: bool,
    next_id: MessageId,
    max_messages: usize,
}

impl TranscriptAggregator {
    /// `max_messages == 0` keeps every message.
    pub fn new(max_messages: usize) -> Self {
        Self {
            max_messages,
            ..Self::default()
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn open_message(&self, speaker: Speaker) -> Option<&Message> {
        self.lane(speaker).open.and_then(|id| self.find(id))
    }

    /// Forgets open lanes and the pending reorder, keeping finished messages.
    pub fn reset_lanes(&mut self) {
        self.user.clear();
        self.assistant.clear();
        self.pending_assistant = None;
        self.user_finalized = false;
    }

    fn lane(&self, speaker: Speaker) -> &Lane {
        match speaker {
            Speaker::User => &self.user,
            Speaker::Assistant => &self.assistant,
        }
    }

    fn lane_mut(&mut self, speaker: Speaker) -> &mut Lane {
        match speaker {
            Speaker::User => &mut self.user,
            Speaker::Assistant => &mut self.assistant,
        }
    }

    fn position(&self, id: MessageId) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }

    fn find(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    fn find_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// Creates a message, placing a user message ahead of the pending
    /// assistant message when there is one.
    fn create(
        &mut self,
        speaker: Speaker,
        text: String,
        status: MessageStatus,
    ) -> (MessageId, TranscriptUpdate) {
        let id = self.next_id;
        let message = Message {
            id,
            speaker,
            text,
            timestamp: Utc::now(),
            status,
        };
        self.next_id += 1;

        let before = match speaker {
            Speaker::User => self.pending_assistant.and_then(|id| self.position(id)),
            Speaker::Assistant => None,
        };
        let update = match before {
            Some(position) => {
                self.messages.insert(position, message.clone());
                TranscriptUpdate::Inserted { message, position }
            }
            None => {
                self.messages.push(message.clone());
                TranscriptUpdate::Opened {
                    message,
                    position: self.messages.len() - 1,
                }
            }
        };
        (id, update)
    }

    /// Appends a fragment for `speaker`, opening a message if none is open.
    pub fn delta(&mut self, speaker: Speaker, text: &str) -> Vec<TranscriptUpdate> {
        let awaiting_user =
            self.user.open.is_none() && self.user.buffer.is_empty() && !self.user_finalized;
        let lane = self.lane_mut(speaker);
        lane.buffer.push_str(text);
        let buffer = lane.buffer.clone();
        let open = lane.open;

        let mut updates = Vec::new();
        match open {
            Some(id) => {
                if let Some(message) = self.find_mut(id) {
                    message.text = buffer;
                    updates.push(TranscriptUpdate::Updated {
                        message: message.clone(),
                    });
                }
            }
            None => {
                let (id, update) = self.create(speaker, buffer, MessageStatus::Streaming);
                self.lane_mut(speaker).open = Some(id);
                if speaker == Speaker::Assistant && awaiting_user {
                    self.pending_assistant = Some(id);
                }
                updates.push(update);
            }
        }
        updates.extend(self.enforce_bound());
        updates
    }

    /// Closes `speaker`'s open message. Provided text is authoritative;
    /// otherwise the accumulated buffer stands.
    pub fn completed(&mut self, speaker: Speaker, final_text: Option<&str>) -> Vec<TranscriptUpdate> {
        let lane = self.lane_mut(speaker);
        let text = final_text.map_or_else(|| lane.buffer.clone(), str::to_owned);
        let open = lane.open;
        lane.clear();

        let mut updates = Vec::new();
        match open {
            Some(id) => {
                if let Some(message) = self.find_mut(id) {
                    message.text = text;
                    message.status = MessageStatus::Final;
                    updates.push(TranscriptUpdate::Finalized {
                        message: message.clone(),
                    });
                }
            }
            None if !text.is_empty() => {
                let (_, update) = self.create(speaker, text, MessageStatus::Final);
                updates.push(update);
            }
            None => {}
        }
        match speaker {
            Speaker::User => {
                self.pending_assistant = None;
                self.user_finalized = !updates.is_empty();
            }
            Speaker::Assistant => self.user_finalized = false,
        }
        updates.extend(self.enforce_bound());
        updates
    }

    /// The user started a new utterance: discard the unflushed user buffer
    /// and empty the open user message.
    pub fn speech_started(&mut self) -> Vec<TranscriptUpdate> {
        self.user.buffer.clear();
        // New turn: earlier assistant messages are not reordered anymore.
        self.pending_assistant = None;
        self.user_finalized = false;
        let Some(id) = self.user.open else {
            return Vec::new();
        };
        match self.find_mut(id) {
            Some(message) => {
                message.text.clear();
                vec![TranscriptUpdate::Reset { id }]
            }
            None => Vec::new(),
        }
    }

    /// Drops the oldest finalized messages beyond the retention bound.
    fn enforce_bound(&mut self) -> Vec<TranscriptUpdate> {
        let mut evicted = Vec::new();
        if self.max_messages == 0 {
            return evicted;
        }
        while self.messages.len() > self.max_messages {
            let Some(index) = self
                .messages
                .iter()
                .position(|m| m.status == MessageStatus::Final)
            else {
                break;
            };
            let removed = self.messages.remove(index);
            if self.pending_assistant == Some(removed.id) {
                self.pending_assistant = None;
            }
            evicted.push(TranscriptUpdate::Evicted { id: removed.id });
        }
        evicted
    }
}
