use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, LongString, ShortString},
};
use opentelemetry::{
    global::{self, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::SpanKind,
    Context,
};
use std::collections::BTreeMap;
use tracing::error;

pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> RabbitMQTracePropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl<'a> Injector for RabbitMQTracePropagator<'a> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(LongString::from(value)),
        );
    }
}

pub(crate) struct RabbitMQHeaderExtractor<'a> {
    headers: &'a BTreeMap<ShortString, AMQPValue>,
}

impl<'a> Extractor for RabbitMQHeaderExtractor<'a> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Injects `ctx` into `headers` using the globally registered propagator.
pub(crate) fn inject(ctx: &Context, headers: &mut BTreeMap<ShortString, AMQPValue>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut RabbitMQTracePropagator::new(headers))
    });
}

/// Opens a consumer span named after the queue, child of the context carried
/// by the delivery headers.
pub(crate) fn consumer_ctx(props: &AMQPProperties, tracer: &BoxedTracer, queue: &str) -> Context {
    let empty = BTreeMap::new();
    let headers = props
        .headers()
        .as_ref()
        .map(|table| table.inner())
        .unwrap_or(&empty);

    let parent = global::get_text_map_propagator(|propagator| {
        propagator.extract(&RabbitMQHeaderExtractor { headers })
    });

    traces::span_ctx_with_parent(tracer, SpanKind::Consumer, queue, &parent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::{
        propagation::TextMapPropagator,
        trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState},
    };
    use opentelemetry_sdk::propagation::TraceContextPropagator;

    #[test]
    fn should_inject_and_extract_trace_context() {
        let propagator = TraceContextPropagator::new();
        let span_ctx = SpanContext::new(
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
            SpanId::from_hex("00f067aa0ba902b7").unwrap(),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        );
        let ctx = Context::new().with_remote_span_context(span_ctx.clone());

        let mut headers = BTreeMap::new();
        propagator.inject_context(&ctx, &mut RabbitMQTracePropagator::new(&mut headers));

        assert!(headers.contains_key(&ShortString::from("traceparent")));

        let extracted = propagator.extract(&RabbitMQHeaderExtractor { headers: &headers });
        assert_eq!(extracted.span().span_context().trace_id(), span_ctx.trace_id());
    }

    #[test]
    fn should_ignore_non_string_headers() {
        let mut headers = BTreeMap::new();
        headers.insert(ShortString::from("traceparent"), AMQPValue::LongInt(1));

        let extractor = RabbitMQHeaderExtractor { headers: &headers };

        assert_eq!(extractor.get("traceparent"), None);
        assert_eq!(extractor.keys(), vec!["traceparent"]);
    }
}
