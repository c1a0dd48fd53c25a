pub mod directory;
pub mod transport;

pub use directory::*;
pub use transport::*;
