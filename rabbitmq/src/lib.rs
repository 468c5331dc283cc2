mod lapin_transport;
mod otel;

pub mod config;
pub mod connection;
pub mod consumer;
pub mod datasource;
#[cfg(any(test, feature = "mocks"))]
pub mod memory;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod transport;
pub mod wire;

pub use lapin_transport::LapinTransport;

#[cfg(any(test, feature = "mocks"))]
pub use transport::{MockAmqpChannel, MockAmqpConnection, MockAmqpTransport};
