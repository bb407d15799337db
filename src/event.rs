use std::fmt;

/// One generated event: when it should arrive and what it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Intended arrival time, ms since the UNIX epoch.
    pub wallclock_timestamp: i64,
    pub payload: String,
}

impl Event {
    pub fn new(wallclock_timestamp: i64, payload: impl Into<String>) -> Self {
        Self {
            wallclock_timestamp,
            payload: payload.into(),
        }
    }
}

/// Named broker destination. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("topic name must not be empty")]
pub struct EmptyTopic;

impl Topic {
    pub fn new(name: impl Into<String>) -> Result<Self, EmptyTopic> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(EmptyTopic);
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered payloads destined for one topic. Handed to the worker pool by value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageBatch {
    messages: Vec<String>,
}

impl MessageBatch {
    pub fn new(messages: Vec<String>) -> Self {
        Self { messages }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<String> {
        self.messages
    }
}

impl From<Vec<String>> for MessageBatch {
    fn from(messages: Vec<String>) -> Self {
        Self::new(messages)
    }
}

impl FromIterator<String> for MessageBatch {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
