use crate::errors::LoggingError;
use configs::{AppConfigs, Environment};
use tracing::warn;
use tracing_bunyan_formatter::BunyanFormattingLayer;
use tracing_log::LogTracer;
use tracing_subscriber::{
    filter::{LevelFilter, Targets},
    fmt::{
        format::{Format, Pretty},
        Layer,
    },
    layer::SubscriberExt,
};

/// Crates whose chatter is capped at WARN unless `enable_external_crates_logging` is set.
const BROKER_CLIENT_TARGETS: [&str; 5] = [
    "lapin",
    "amq_protocol",
    "pinky_swear",
    "async_io",
    "polling",
];

pub fn setup(cfg: &AppConfigs) -> Result<(), LoggingError> {
    if let Err(err) = LogTracer::init() {
        warn!(
            error = err.to_string(),
            "failure to initialize log bridge, probably it was already initialized"
        );
    }

    let target_filters = targets(cfg);

    let mut fmt_pretty: Option<Layer<_, Pretty, Format<Pretty>>> = None;
    let mut fmt_json = None;

    if cfg.env == Environment::Local {
        fmt_pretty = Some(Layer::new().pretty());
    } else {
        fmt_json = Some(BunyanFormattingLayer::new(
            cfg.name.to_owned(),
            std::io::stdout,
        ));
    }

    tracing::subscriber::set_global_default(
        tracing_subscriber::registry()
            .with(fmt_json)
            .with(fmt_pretty)
            .with(target_filters),
    )
    .map_err(|err| {
        warn!(error = err.to_string(), "failure to set tracing subscriber");
        LoggingError::SubscriberError(err.to_string())
    })
}

fn targets(cfg: &AppConfigs) -> Targets {
    let level_filter = get_log_level_filter(&cfg.log_level);
    let targets = Targets::new().with_default(level_filter);

    if cfg.enable_external_crates_logging {
        return targets;
    }

    BROKER_CLIENT_TARGETS
        .iter()
        .fold(targets, |targets, target| {
            targets.with_target(*target, LevelFilter::WARN.min(level_filter))
        })
}

fn get_log_level_filter(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "trace" => LevelFilter::TRACE,
        _ => LevelFilter::OFF,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_only_once() {
        let res = setup(&AppConfigs::default());
        assert!(res.is_ok());

        let res = setup(&AppConfigs::default());
        assert!(matches!(res, Err(LoggingError::SubscriberError(_))));
    }

    #[test]
    fn get_log_level_successfully() {
        assert_eq!(get_log_level_filter("debug"), LevelFilter::DEBUG);
        assert_eq!(get_log_level_filter("Debug"), LevelFilter::DEBUG);
        assert_eq!(get_log_level_filter("INFO"), LevelFilter::INFO);
        assert_eq!(get_log_level_filter("Warn"), LevelFilter::WARN);
        assert_eq!(get_log_level_filter("error"), LevelFilter::ERROR);
        assert_eq!(get_log_level_filter("TRACE"), LevelFilter::TRACE);
        assert_eq!(get_log_level_filter("UNKNOWN"), LevelFilter::OFF);
    }

    #[test]
    fn should_cap_broker_client_targets() {
        let cfg = AppConfigs::default();
        let filters = targets(&cfg);

        assert!(filters.would_enable("lapin::channel", &tracing::Level::WARN));
        assert!(!filters.would_enable("lapin::channel", &tracing::Level::DEBUG));
        assert!(filters.would_enable("rabbitmq::consumer", &tracing::Level::DEBUG));
    }

    #[test]
    fn should_not_cap_targets_sharing_a_prefix_with_log() {
        let filters = targets(&AppConfigs::default());

        assert!(filters.would_enable("logistics::orders", &tracing::Level::DEBUG));
    }

    #[test]
    fn should_not_cap_when_external_crates_logging_is_enabled() {
        let cfg = AppConfigs {
            enable_external_crates_logging: true,
            ..AppConfigs::default()
        };
        let filters = targets(&cfg);

        assert!(filters.would_enable("lapin::channel", &tracing::Level::DEBUG));
    }
}
