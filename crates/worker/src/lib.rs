pub mod service;

pub use service::{WorkerService, WorkerServiceBuilder, WorkerServiceTrait};
