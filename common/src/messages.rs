//! Definition of mirror node bus messages

use crate::record_file::RecordFile;
use crate::stream::StreamType;

/// A stream file passed verification and is ready for persistence
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct RecordFileVerifiedMessage {
    pub record_file: RecordFile,
}

/// Stream types permitted after a cutover decision changed configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CutoverCompletedMessage {
    pub network: String,
    pub enabled: StreamType,
}

// === Global message enum ===
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Message {
    None(()), // Just so we have a simple default

    // Generic messages, get of jail free cards
    String(String),          // Simple string
    JSON(serde_json::Value), // JSON object

    // Importer messages
    RecordFileVerified(RecordFileVerifiedMessage), // Verified stream file
    CutoverCompleted(CutoverCompletedMessage),     // Network finished migrating to blocks
}

impl Default for Message {
    fn default() -> Self {
        Self::None(())
    }
}

// Casts from specific messages
impl From<RecordFileVerifiedMessage> for Message {
    fn from(msg: RecordFileVerifiedMessage) -> Self {
        Message::RecordFileVerified(msg)
    }
}

impl From<CutoverCompletedMessage> for Message {
    fn from(msg: CutoverCompletedMessage) -> Self {
        Message::CutoverCompleted(msg)
    }
}
