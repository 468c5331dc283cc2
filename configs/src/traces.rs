use std::str::FromStr;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TraceExporterKind {
    #[default]
    Stdout,
}

impl FromStr for TraceExporterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stdout" | "" => Ok(TraceExporterKind::Stdout),
            other => Err(format!("unsupported trace exporter `{}`", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TraceConfigs {
    ///Default: false
    pub enable: bool,
    ///Default: TraceExporterKind::Stdout
    pub exporter: TraceExporterKind,
    pub service_type: String,
    ///Default: 0.8
    pub export_rate_base: f64,
}

impl Default for TraceConfigs {
    fn default() -> Self {
        Self {
            enable: false,
            exporter: Default::default(),
            service_type: Default::default(),
            export_rate_base: 0.8,
        }
    }
}
