//! Wire framing/selective decoding and the correlation manager that rewrites
//! request/response ids across the downstream/upstream boundary.

pub mod correlation;
pub mod wire;

pub use correlation::{CorrelationEntry, CorrelationManager};
pub use wire::{RequestFrameCodec, ResponseFrameCodec, SUPPORTED_API_KEYS};
