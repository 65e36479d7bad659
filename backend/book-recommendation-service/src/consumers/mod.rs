pub mod event_consumer;

pub use event_consumer::{ConsumerError, ConsumerStats, EventConsumer, Handled, InboundEvent};
