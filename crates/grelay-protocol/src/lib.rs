//! Wire-level types for grelay.
//!
//! Nothing here performs IO: the line splitter works on byte chunks handed to it,
//! and the Gemini/error types are plain serde structs.

pub mod error;
pub mod gemini;
pub mod lines;
pub mod sse;
