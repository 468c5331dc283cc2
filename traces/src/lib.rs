mod exporters;

pub mod errors;
pub mod provider;

pub use provider::init;

use configs::{Configs, DynamicConfigs, Environment};
use opentelemetry::{
    global::BoxedTracer,
    trace::{SpanKind, TraceContextExt, Tracer},
    Context,
};
use opentelemetry_sdk::trace::Sampler;
use std::borrow::Cow;

fn get_sampler<T>(cfg: &Configs<T>) -> Sampler
where
    T: DynamicConfigs,
{
    if cfg.app.env == Environment::Local {
        return Sampler::AlwaysOn;
    }

    let sampler = Sampler::TraceIdRatioBased(cfg.trace.export_rate_base);
    Sampler::ParentBased(Box::new(sampler))
}

/// Starts a span of `kind` as a child of `parent` and returns the context carrying it.
pub fn span_ctx_with_parent(
    tracer: &BoxedTracer,
    kind: SpanKind,
    name: &str,
    parent: &Context,
) -> Context {
    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(kind)
        .start_with_context(tracer, parent);

    parent.with_span(span)
}

pub fn trace_id(ctx: &Context) -> String {
    let span = ctx.span();

    if span.is_recording() {
        return span.span_context().trace_id().to_string();
    }

    String::new()
}

pub fn span_id(ctx: &Context) -> String {
    let span = ctx.span();

    if span.is_recording() {
        return span.span_context().span_id().to_string();
    }

    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use configs::Empty;
    use opentelemetry::global;

    #[test]
    fn should_return_empty_ids_without_recording_span() {
        let ctx = Context::new();

        assert_eq!(trace_id(&ctx), "");
        assert_eq!(span_id(&ctx), "");
    }

    #[test]
    fn should_build_span_ctx_with_noop_tracer() {
        let tracer = global::tracer("test");
        let ctx = span_ctx_with_parent(&tracer, SpanKind::Consumer, "orders", &Context::new());

        assert!(!ctx.span().is_recording());
    }

    #[test]
    fn should_sample_everything_locally() {
        let cfg = Configs::<Empty>::default();

        assert!(matches!(get_sampler(&cfg), Sampler::AlwaysOn));
    }
}
