use crate::{
    env_keys::{
        APP_NAME_ENV_KEY, APP_PORT_ENV_KEY, DEV_ENV_FILE_NAME,
        ENABLE_EXTERNAL_CRATES_LOGGING_ENV_KEY, HOST_NAME_ENV_KEY, LOCAL_ENV_FILE_NAME,
        LOG_LEVEL_ENV_KEY, PROD_FILE_NAME, RABBITMQ_CONNECTION_TIMEOUT_ENV_KEY,
        RABBITMQ_CONTENT_TYPE_ENV_KEY, RABBITMQ_DELIVERY_MODE_ENV_KEY, RABBITMQ_HEARTBEAT_ENV_KEY,
        RABBITMQ_HOST_ENV_KEY, RABBITMQ_PASSWORD_ENV_KEY, RABBITMQ_PORT_ENV_KEY,
        RABBITMQ_PREFETCH_COUNT_ENV_KEY, RABBITMQ_PUBLISHER_CONFIRMS_ENV_KEY,
        RABBITMQ_QUEUE_AUTO_DELETE_ENV_KEY, RABBITMQ_QUEUE_DURABLE_ENV_KEY,
        RABBITMQ_QUEUE_EXCLUSIVE_ENV_KEY, RABBITMQ_URI_ENV_KEY, RABBITMQ_USER_ENV_KEY,
        RABBITMQ_VHOST_ENV_KEY, STAGING_FILE_NAME, TRACES_ENABLE_ENV_KEY,
        TRACES_EXPORTER_ENV_KEY, TRACES_EXPORT_RATE_BASE_ENV_KEY, TRACES_SERVICE_TYPE_ENV_KEY,
    },
    errors::ConfigsError,
};
use configs::{AppConfigs, Configs, DynamicConfigs, Environment};
use dotenvy::from_filename;
use std::{env, str::FromStr};
use tracing::{error, warn};

#[derive(Default)]
pub struct ConfigBuilder {
    rabbitmq: bool,
    traces: bool,
    skip_logging: bool,
}

impl ConfigBuilder {
    pub fn new() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn rabbitmq(mut self) -> Self {
        self.rabbitmq = true;
        self
    }

    pub fn traces(mut self) -> Self {
        self.traces = true;
        self
    }

    /// Leaves the global tracing subscriber untouched, for hosts that install their own.
    pub fn skip_logging(mut self) -> Self {
        self.skip_logging = true;
        self
    }

    pub fn build<T>(&self) -> Result<Configs<T>, ConfigsError>
    where
        T: DynamicConfigs,
    {
        let env = Environment::from_rust_env();
        match env {
            Environment::Prod => {
                from_filename(PROD_FILE_NAME).ok();
            }
            Environment::Staging => {
                from_filename(STAGING_FILE_NAME).ok();
            }
            Environment::Dev => {
                from_filename(DEV_ENV_FILE_NAME).ok();
            }
            _ => {
                from_filename(LOCAL_ENV_FILE_NAME).ok();
            }
        }

        let mut cfg = Configs::<T>::default();
        cfg.app = self.app_from_env(env);

        if !self.skip_logging {
            logging::setup(&cfg.app).map_err(|err| {
                error!(error = err.to_string(), "failure to setup the logger");
                ConfigsError::LoggingSetupError(err.to_string())
            })?;
        }

        for (key, value) in env::vars() {
            if self.fill_rabbitmq(&mut cfg, &key, &value) {
                continue;
            };
            if self.fill_traces(&mut cfg, &key, &value) {
                continue;
            };
        }

        cfg.dynamic.load();

        Ok(cfg)
    }
}

impl ConfigBuilder {
    fn app_from_env(&self, env: Environment) -> AppConfigs {
        let defaults = AppConfigs::default();

        AppConfigs {
            name: env::var(APP_NAME_ENV_KEY).unwrap_or(defaults.name),
            env,
            host: env::var(HOST_NAME_ENV_KEY).unwrap_or(defaults.host),
            port: parse_or(env::var(APP_PORT_ENV_KEY).ok(), defaults.port),
            log_level: env::var(LOG_LEVEL_ENV_KEY).unwrap_or(defaults.log_level),
            enable_external_crates_logging: parse_or(
                env::var(ENABLE_EXTERNAL_CRATES_LOGGING_ENV_KEY).ok(),
                defaults.enable_external_crates_logging,
            ),
        }
    }

    fn fill_rabbitmq<T>(&self, cfg: &mut Configs<T>, key: &str, value: &str) -> bool
    where
        T: DynamicConfigs,
    {
        if !self.rabbitmq {
            return false;
        }

        let rabbitmq = &mut cfg.rabbitmq;

        match key {
            RABBITMQ_HOST_ENV_KEY => rabbitmq.host = value.to_owned(),
            RABBITMQ_PORT_ENV_KEY => rabbitmq.port = parse_or(Some(value), rabbitmq.port),
            RABBITMQ_USER_ENV_KEY => rabbitmq.user = value.to_owned(),
            RABBITMQ_PASSWORD_ENV_KEY => rabbitmq.password = value.to_owned(),
            RABBITMQ_VHOST_ENV_KEY => rabbitmq.vhost = value.to_owned(),
            RABBITMQ_URI_ENV_KEY => {
                rabbitmq.uri = Some(value.to_owned()).filter(|uri| !uri.is_empty())
            }
            RABBITMQ_HEARTBEAT_ENV_KEY => rabbitmq.heartbeat = value.parse().ok(),
            RABBITMQ_CONNECTION_TIMEOUT_ENV_KEY => rabbitmq.connection_timeout = value.parse().ok(),
            RABBITMQ_QUEUE_DURABLE_ENV_KEY => {
                rabbitmq.queue_durable = parse_or(Some(value), rabbitmq.queue_durable)
            }
            RABBITMQ_QUEUE_EXCLUSIVE_ENV_KEY => {
                rabbitmq.queue_exclusive = parse_or(Some(value), rabbitmq.queue_exclusive)
            }
            RABBITMQ_QUEUE_AUTO_DELETE_ENV_KEY => {
                rabbitmq.queue_auto_delete = parse_or(Some(value), rabbitmq.queue_auto_delete)
            }
            RABBITMQ_PREFETCH_COUNT_ENV_KEY => {
                rabbitmq.prefetch_count = parse_or(Some(value), rabbitmq.prefetch_count)
            }
            RABBITMQ_PUBLISHER_CONFIRMS_ENV_KEY => {
                rabbitmq.publisher_confirms = parse_or(Some(value), rabbitmq.publisher_confirms)
            }
            RABBITMQ_CONTENT_TYPE_ENV_KEY => rabbitmq.content_type = value.to_owned(),
            RABBITMQ_DELIVERY_MODE_ENV_KEY => {
                rabbitmq.delivery_mode = parse_or(Some(value), rabbitmq.delivery_mode)
            }
            _ => return false,
        }

        true
    }

    fn fill_traces<T>(&self, cfg: &mut Configs<T>, key: &str, value: &str) -> bool
    where
        T: DynamicConfigs,
    {
        if !self.traces {
            return false;
        }

        let trace = &mut cfg.trace;

        match key {
            TRACES_ENABLE_ENV_KEY => trace.enable = parse_or(Some(value), trace.enable),
            TRACES_EXPORTER_ENV_KEY => {
                trace.exporter = parse_or(Some(value), trace.exporter.clone())
            }
            TRACES_SERVICE_TYPE_ENV_KEY => trace.service_type = value.to_owned(),
            TRACES_EXPORT_RATE_BASE_ENV_KEY => {
                trace.export_rate_base = parse_or(Some(value), trace.export_rate_base)
            }
            _ => return false,
        }

        true
    }
}

fn parse_or<V, S>(value: Option<S>, default: V) -> V
where
    V: FromStr,
    S: AsRef<str>,
{
    let Some(value) = value else {
        return default;
    };

    match value.as_ref().parse::<V>() {
        Ok(parsed) => parsed,
        Err(_) => {
            warn!(value = value.as_ref(), "unparseable config value, using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use configs::{DeliveryModeKind, Empty};

    #[test]
    fn should_fill_rabbitmq_configs() {
        let builder = ConfigBuilder::new().rabbitmq();
        let mut cfg = Configs::<Empty>::default();

        assert!(builder.fill_rabbitmq(&mut cfg, RABBITMQ_HOST_ENV_KEY, "broker"));
        assert!(builder.fill_rabbitmq(&mut cfg, RABBITMQ_PORT_ENV_KEY, "5673"));
        assert!(builder.fill_rabbitmq(&mut cfg, RABBITMQ_VHOST_ENV_KEY, "orders"));
        assert!(builder.fill_rabbitmq(&mut cfg, RABBITMQ_QUEUE_DURABLE_ENV_KEY, "true"));
        assert!(builder.fill_rabbitmq(&mut cfg, RABBITMQ_PREFETCH_COUNT_ENV_KEY, "20"));
        assert!(builder.fill_rabbitmq(&mut cfg, RABBITMQ_DELIVERY_MODE_ENV_KEY, "persistent"));
        assert!(!builder.fill_rabbitmq(&mut cfg, "SOMETHING_ELSE", "value"));

        assert_eq!(cfg.rabbitmq.host, "broker");
        assert_eq!(cfg.rabbitmq.port, 5673);
        assert_eq!(cfg.rabbitmq.vhost, "orders");
        assert!(cfg.rabbitmq.queue_durable);
        assert_eq!(cfg.rabbitmq.prefetch_count, 20);
        assert_eq!(cfg.rabbitmq.delivery_mode, DeliveryModeKind::Persistent);
    }

    #[test]
    fn should_keep_defaults_for_unparseable_values() {
        let builder = ConfigBuilder::new().rabbitmq();
        let mut cfg = Configs::<Empty>::default();

        builder.fill_rabbitmq(&mut cfg, RABBITMQ_PORT_ENV_KEY, "not-a-port");
        builder.fill_rabbitmq(&mut cfg, RABBITMQ_DELIVERY_MODE_ENV_KEY, "sometimes");
        builder.fill_rabbitmq(&mut cfg, RABBITMQ_HEARTBEAT_ENV_KEY, "soon");

        assert_eq!(cfg.rabbitmq.port, 5672);
        assert_eq!(
            cfg.rabbitmq.delivery_mode,
            DeliveryModeKind::PersistentWhenPrioritized
        );
        assert_eq!(cfg.rabbitmq.heartbeat, None);
    }

    #[test]
    fn should_ignore_empty_uri() {
        let builder = ConfigBuilder::new().rabbitmq();
        let mut cfg = Configs::<Empty>::default();

        builder.fill_rabbitmq(&mut cfg, RABBITMQ_URI_ENV_KEY, "");
        assert_eq!(cfg.rabbitmq.uri, None);

        builder.fill_rabbitmq(&mut cfg, RABBITMQ_URI_ENV_KEY, "amqp://u:p@h:1/v");
        assert_eq!(cfg.rabbitmq.uri.as_deref(), Some("amqp://u:p@h:1/v"));
    }

    #[test]
    fn should_skip_disabled_sections() {
        let builder = ConfigBuilder::new();
        let mut cfg = Configs::<Empty>::default();

        assert!(!builder.fill_rabbitmq(&mut cfg, RABBITMQ_HOST_ENV_KEY, "broker"));
        assert!(!builder.fill_traces(&mut cfg, TRACES_ENABLE_ENV_KEY, "true"));
        assert_eq!(cfg.rabbitmq.host, "localhost");
        assert!(!cfg.trace.enable);
    }

    #[test]
    fn should_fill_traces_configs() {
        let builder = ConfigBuilder::new().traces();
        let mut cfg = Configs::<Empty>::default();

        assert!(builder.fill_traces(&mut cfg, TRACES_ENABLE_ENV_KEY, "true"));
        assert!(builder.fill_traces(&mut cfg, TRACES_EXPORT_RATE_BASE_ENV_KEY, "0.5"));

        assert!(cfg.trace.enable);
        assert_eq!(cfg.trace.export_rate_base, 0.5);
    }
}
