//! Signed HTTP client for the ML platform.
//!
//! Wraps the platform's `?Action=...` POST API: request signing, response
//! envelope handling, the task submission pipeline, and the status probe the
//! monitor polls.

mod client;
mod service;
mod sign;

pub use client::{ClientConfig, PlatformClient, TaskSubmission};
pub use service::{ClientError, PlatformService};
pub use sign::Credentials;
