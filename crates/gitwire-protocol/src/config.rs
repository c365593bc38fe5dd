//! Conversation configuration.

use crate::capabilities::CapabilityPreferences;
use serde::{Deserialize, Serialize};

/// Default size of a single transport read.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;

/// Configuration shared by fetch and push conversations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Local capability preferences.
    pub capabilities: CapabilityPreferences,
    /// Maximum history depth for fetches (`deepen <N>`).
    pub depth: Option<u32>,
    /// Size of a single read from the transport.
    pub read_chunk_size: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            capabilities: CapabilityPreferences::default(),
            depth: None,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

impl ConversationConfig {
    /// Limits fetched history to `depth` commits.
    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = Some(depth);
        self
    }
}
