//! Chat-bot notification sender for task lifecycle events.

mod chatbot;
#[cfg(feature = "test-util")]
pub mod mock;

pub use chatbot::ChatBotNotifier;
pub use jobkit_types::{Notifier, NotifyError};

#[cfg(feature = "test-util")]
pub use mock::RecordingNotifier;
