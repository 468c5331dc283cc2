mod app;
mod configs;
mod environment;
mod rabbitmq;
mod traces;

pub use app::AppConfigs;
pub use configs::{Configs, DynamicConfigs, Empty};
pub use environment::Environment;
pub use rabbitmq::{DeliveryModeKind, RabbitMQConfigs};
pub use traces::{TraceConfigs, TraceExporterKind};
