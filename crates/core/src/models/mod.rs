pub mod action;
pub mod disposition;

pub use action::{ActionRequest, ActionType, IdentityType};
pub use disposition::{DeadLetterReason, Disposition};
