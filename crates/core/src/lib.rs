pub mod config;
pub mod errors;
pub mod models;
pub mod shutdown;
pub mod traits;

pub use errors::*;
pub use models::{ActionRequest, ActionType, DeadLetterReason, Disposition, IdentityType};
pub use shutdown::ShutdownToken;
pub use traits::{Directory, InboundMessage, MessageHandler, Principal, Settlement, Transport};

/// 统一的Result类型
pub type IdentityResult<T> = std::result::Result<T, IdentityError>;
