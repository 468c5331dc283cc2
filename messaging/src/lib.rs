pub mod datasource;
pub mod errors;
pub mod handler;
pub mod message;
pub mod publisher;

#[cfg(any(test, feature = "mocks"))]
pub use datasource::MockDataSource;
#[cfg(any(test, feature = "mocks"))]
pub use handler::MockConsumerHandler;
#[cfg(any(test, feature = "mocks"))]
pub use publisher::MockPublisher;
