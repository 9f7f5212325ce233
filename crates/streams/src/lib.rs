//! Composable item-at-a-time stream pipelines.
//!
//! A chain is built from a producer by repeatedly connecting stages. Every stage
//! consumes one item at a time, may transform or drop it, and emits zero or more
//! items downstream through a small bounded buffer. Two specialised stages cover
//! most uses: [`IterationStage`] (map, multimap, filter, each) and
//! [`ReductionStage`] (count, sum, stats, generic folds).
//!
//! ```ignore
//! let evens = Pipeline::from_iter(1..=10)
//!     .filter(|x: &i32| x % 2 == 0)
//!     .map(|x: &i32| x * 10)
//!     .collect()
//!     .await?;
//! ```

#[macro_use]
mod macros;

pub mod config;
pub mod error;
pub mod iteration;
pub mod pipeline;
pub mod reduction;
pub mod registry;
pub mod split;
pub mod stage;
pub mod stages;


// Re-export commonly used types
pub use config::*;
pub use error::*;
pub use iteration::*;
pub use pipeline::*;
pub use reduction::*;
pub use registry::*;
pub use split::*;
pub use stage::*;
pub use stages::*;
