pub const LOCAL_ENV_FILE_NAME: &str = ".env.local";
pub const DEV_ENV_FILE_NAME: &str = ".env.develop";
pub const STAGING_FILE_NAME: &str = ".env.staging";
pub const PROD_FILE_NAME: &str = ".env";

pub const APP_NAME_ENV_KEY: &str = "APP_NAME";
pub const HOST_NAME_ENV_KEY: &str = "HOST_NAME";
pub const APP_PORT_ENV_KEY: &str = "APP_PORT";
pub const LOG_LEVEL_ENV_KEY: &str = "LOG_LEVEL";
pub const ENABLE_EXTERNAL_CRATES_LOGGING_ENV_KEY: &str = "ENABLE_EXTERNAL_CRATES_LOGGING";

pub const RABBITMQ_HOST_ENV_KEY: &str = "RABBITMQ_HOST";
pub const RABBITMQ_PORT_ENV_KEY: &str = "RABBITMQ_PORT";
pub const RABBITMQ_USER_ENV_KEY: &str = "RABBITMQ_USER";
pub const RABBITMQ_PASSWORD_ENV_KEY: &str = "RABBITMQ_PASSWORD";
pub const RABBITMQ_VHOST_ENV_KEY: &str = "RABBITMQ_VHOST";
pub const RABBITMQ_URI_ENV_KEY: &str = "RABBITMQ_URI";
pub const RABBITMQ_HEARTBEAT_ENV_KEY: &str = "RABBITMQ_HEARTBEAT";
pub const RABBITMQ_CONNECTION_TIMEOUT_ENV_KEY: &str = "RABBITMQ_CONNECTION_TIMEOUT";
pub const RABBITMQ_QUEUE_DURABLE_ENV_KEY: &str = "RABBITMQ_QUEUE_DURABLE";
pub const RABBITMQ_QUEUE_EXCLUSIVE_ENV_KEY: &str = "RABBITMQ_QUEUE_EXCLUSIVE";
pub const RABBITMQ_QUEUE_AUTO_DELETE_ENV_KEY: &str = "RABBITMQ_QUEUE_AUTO_DELETE";
pub const RABBITMQ_PREFETCH_COUNT_ENV_KEY: &str = "RABBITMQ_PREFETCH_COUNT";
pub const RABBITMQ_PUBLISHER_CONFIRMS_ENV_KEY: &str = "RABBITMQ_PUBLISHER_CONFIRMS";
pub const RABBITMQ_CONTENT_TYPE_ENV_KEY: &str = "RABBITMQ_CONTENT_TYPE";
pub const RABBITMQ_DELIVERY_MODE_ENV_KEY: &str = "RABBITMQ_DELIVERY_MODE";

pub const TRACES_ENABLE_ENV_KEY: &str = "TRACES_ENABLE";
pub const TRACES_EXPORTER_ENV_KEY: &str = "TRACES_EXPORTER";
pub const TRACES_SERVICE_TYPE_ENV_KEY: &str = "TRACES_SERVICE_TYPE";
pub const TRACES_EXPORT_RATE_BASE_ENV_KEY: &str = "TRACES_EXPORT_RATE_BASE";
