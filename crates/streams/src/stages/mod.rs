//! Built-in pipeline stages

pub mod aggregate;
pub mod json;
pub mod transform;

// Re-export stage implementations
pub use aggregate::*;
pub use json::*;
pub use transform::*;
