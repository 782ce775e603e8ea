//! Streaming chunk types: the client-facing chunk shape and the
//! provider-facing event it is derived from.

use serde::{Deserialize, Serialize};

use super::response::{FinishReason, Usage};

/// Incremental content attached to one choice of a [`StreamChunk`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// One choice within a [`StreamChunk`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

/// Client-facing streaming chunk.
///
/// One instance is produced per consumed upstream event; ownership
/// transfers to the caller on yield.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub id: String,
    pub created: u64,
    pub model: String,
    pub provider: String,
    pub choices: Vec<ChunkChoice>,
}

impl StreamChunk {
    /// First finish reason carried by any choice, if one is present.
    ///
    /// A chunk carrying a finish reason is the last chunk of its stream.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.choices.iter().find_map(|c| c.finish_reason)
    }
}

/// Raw event produced by a provider-level token stream.
///
/// This is the shape the [`CompletionClient`](crate::traits::CompletionClient)
/// stream contract yields; the streaming transform maps it to
/// [`StreamChunk`]. Fields are optional because providers omit them freely,
/// especially on usage-only trailer frames.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<ProviderChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// One choice within a [`ProviderEvent`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderChoice {
    pub index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Raw provider finish reason; mapped via
    /// [`FinishReason::from_provider`] during the transform.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl ProviderEvent {
    /// Convenience constructor for a single-choice content event.
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            choices: vec![ProviderChoice {
                index: 0,
                content: Some(text.into()),
                ..ProviderChoice::default()
            }],
            ..ProviderEvent::default()
        }
    }
}
