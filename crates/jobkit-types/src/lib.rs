//! Core types and traits for the jobkit ML-platform client.
//!
//! Wire DTOs align with the platform's PascalCase JSON API; the task state
//! machine and trait seams are shared by the monitor, client, and notifier
//! crates.

mod dto;
mod task;
mod traits;

pub use dto::*;
pub use task::*;
pub use traits::*;
