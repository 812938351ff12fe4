use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone)]
pub struct ReaderIdentity {
    pub serial: String,
    pub label: Option<String>,
}

impl ReaderIdentity {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            label: None,
        }
    }

    pub fn labelled(serial: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            label: Some(label.into()),
        }
    }

    /// Two identities refer to the same hardware when their serials match.
    pub fn same_reader(&self, other: &ReaderIdentity) -> bool {
        self.serial == other.serial
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    NotConnected,
    Discovering,
    Connecting,
    Connected,
}

/// What the reader asks the customer to do while a card is being read.
#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum ReaderPrompt {
    InsertCard,
    InsertOrSwipeCard,
    SwipeCard,
    RemoveCard,
    RetryCard,
    TryAnotherCard,
    TryAnotherReadMethod,
    MultipleContactlessCardsDetected,
}

impl fmt::Display for ReaderPrompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InsertCard => "Insert card",
            Self::InsertOrSwipeCard => "Insert or swipe card",
            Self::SwipeCard => "Swipe card",
            Self::RemoveCard => "Please remove card",
            Self::RetryCard => "Retry card",
            Self::TryAnotherCard => "Try another card",
            Self::TryAnotherReadMethod => "Try another read method",
            Self::MultipleContactlessCardsDetected => "Multiple cards detected",
        })
    }
}

/// The driver's link to a physical reader, shared by every request of a
/// session. Only the connectivity controller changes it.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct ReaderConnection {
    pub reader: Option<ReaderIdentity>,
    pub status: ConnectionStatus,
    /// Reader from a prior session that reconnection should prefer.
    pub remembered: Option<ReaderIdentity>,
}

impl ReaderConnection {
    pub fn connected(reader: ReaderIdentity) -> Self {
        Self {
            reader: Some(reader.clone()),
            status: ConnectionStatus::Connected,
            remembered: Some(reader),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}
