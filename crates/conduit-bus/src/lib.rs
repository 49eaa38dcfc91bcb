pub mod adapter;
pub mod memory_bus;
pub mod redis_bus;

pub use adapter::{BrokerTime, BusAdapter, MessageHandler, SubscriptionToken};
pub use memory_bus::InMemoryBus;
pub use redis_bus::RedisBus;
