pub mod message_dispatcher;

pub use message_dispatcher::{resolution_failure_reason, MessageDispatcher};
