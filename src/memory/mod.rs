//! Process-local backend for development and tests.

pub mod adapter;
pub mod broker;

pub use adapter::InMemoryBrokerAdapter;
pub use broker::InMemoryBroker;
