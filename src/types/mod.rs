//! Public types for the heimdall API.

mod batch;
mod chunk;
mod request;
mod response;

pub use batch::{BatchItem, BatchResult};
pub use chunk::{ChunkChoice, ChunkDelta, ProviderChoice, ProviderEvent, StreamChunk};
pub use request::{CompletionRequest, Message, Role};
pub use response::{CompletionResponse, FinishReason, Usage};
