pub mod in_memory_directory;
pub mod in_memory_transport;
pub mod processor;
pub mod rabbitmq_transport;
pub mod transport_factory;

pub use in_memory_directory::{InMemoryDirectory, UserRecord};
pub use in_memory_transport::{DeadLetteredMessage, InMemoryTransport, QueuedMessage};
pub use processor::DeliveryProcessor;
pub use rabbitmq_transport::{
    RabbitMqPublisher, RabbitMqTransport, ReconnectBackoff, DEAD_LETTER_REASON_HEADER,
};
pub use transport_factory::{create_directory, TransportFactory};
