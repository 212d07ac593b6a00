//! Message broker adapter: durable at-least-once queues with priority
//! routing.
pub mod adapter;
pub mod message;
pub mod queue;

pub use adapter::{BrokerAdapter, CrawlDelivery};
pub use message::{CrawlJob, Delivery, DeliveryTag, ParseJob, QueueName};
pub use queue::{DurableQueue, QueueDepth, QueueOptions, QueueState};
