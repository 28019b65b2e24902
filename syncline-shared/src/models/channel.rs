use std::fmt;

/// A fan-out topic: conversation content under `channel:<id>`, presence diffs
/// under `presence:<id>`. The relay treats names opaquely; these helpers keep
/// the two namespaces from colliding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Live updates for a conversation.
    Content(String),
    /// Presence diffs for a channel id.
    Presence(String),
}

impl Channel {
    /// Content channel for a conversation id.
    #[must_use]
    pub fn content(id: impl Into<String>) -> Self {
        Self::Content(id.into())
    }

    /// Presence channel for a channel id.
    #[must_use]
    pub fn presence(id: impl Into<String>) -> Self {
        Self::Presence(id.into())
    }

    /// Parses a wire channel name; `None` for unknown namespaces.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        if let Some(id) = name.strip_prefix("channel:") {
            Some(Self::content(id))
        } else {
            name.strip_prefix("presence:").map(Self::presence)
        }
    }

    /// The wire name, e.g. `channel:room-1`.
    #[must_use]
    pub fn name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Content(id) => write!(f, "channel:{id}"),
            Self::Presence(id) => write!(f, "presence:{id}"),
        }
    }
}
