use crate::{config::PublishSettings, transport::WireDelivery};
use chrono::{DateTime, Utc};
use configs::DeliveryModeKind;
use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use messaging::message::{DeliveryTag, Message};
use serde_json::{Map, Number, Value};
use std::collections::{BTreeMap, HashMap};

pub const GROUP_ID_HEADER: &str = "x-group-id";
pub const DEDUPLICATION_ID_HEADER: &str = "x-deduplication-id";

pub const TRANSIENT_DELIVERY_MODE: u8 = 1;
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Wire properties and body of an outbound message.
pub fn to_wire<'m>(msg: &'m Message, settings: &PublishSettings) -> (AMQPProperties, &'m [u8]) {
    to_wire_with(msg, settings, |_| {})
}

/// Like [`to_wire`], letting `decorate` add headers (trace context, for
/// instance) on top of the ones carried by `msg`.
pub fn to_wire_with<'m, F>(
    msg: &'m Message,
    settings: &PublishSettings,
    decorate: F,
) -> (AMQPProperties, &'m [u8])
where
    F: FnOnce(&mut BTreeMap<ShortString, AMQPValue>),
{
    let mut headers = headers(msg);
    decorate(&mut headers);

    let props = properties(msg, settings).with_headers(FieldTable::from(headers));

    (props, &msg.payload)
}

/// Rebuilds a message from a delivery; `delivery` is set only for deliveries
/// that still wait for an ack.
pub fn from_wire(queue: &str, wire: &WireDelivery, delivery: Option<DeliveryTag>) -> Message {
    let props = &wire.properties;
    let mut metadata = HashMap::new();
    let mut group_id = None;
    let mut deduplication_id = None;

    if let Some(headers) = props.headers() {
        for (key, value) in headers.inner() {
            match key.as_str() {
                GROUP_ID_HEADER => group_id = Some(stringify(value)),
                DEDUPLICATION_ID_HEADER => deduplication_id = Some(stringify(value)),
                key => {
                    metadata.insert(key.to_owned(), stringify(value));
                }
            }
        }
    }

    Message {
        entity_name: queue.to_owned(),
        payload: wire.body.as_slice().into(),
        metadata,
        timestamp: props
            .timestamp()
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts as i64, 0)),
        message_id: props.message_id().as_ref().map(|v| v.as_str().to_owned()),
        correlation_id: props.correlation_id().as_ref().map(|v| v.as_str().to_owned()),
        msg_type: props.kind().as_ref().map(|v| v.as_str().to_owned()),
        content_type: props.content_type().as_ref().map(|v| v.as_str().to_owned()),
        priority: *props.priority(),
        group_id,
        deduplication_id,
        persistent: props
            .delivery_mode()
            .map(|mode| mode == PERSISTENT_DELIVERY_MODE),
        redelivered: wire.redelivered,
        delivery,
    }
}

/// Header table of `msg`, reserved headers included.
fn headers(msg: &Message) -> BTreeMap<ShortString, AMQPValue> {
    let mut headers = BTreeMap::new();

    for (key, value) in &msg.metadata {
        headers.insert(
            ShortString::from(key.as_str()),
            AMQPValue::LongString(LongString::from(value.as_str())),
        );
    }

    if let Some(group_id) = &msg.group_id {
        headers.insert(
            ShortString::from(GROUP_ID_HEADER),
            AMQPValue::LongString(LongString::from(group_id.as_str())),
        );
    }

    if let Some(deduplication_id) = &msg.deduplication_id {
        headers.insert(
            ShortString::from(DEDUPLICATION_ID_HEADER),
            AMQPValue::LongString(LongString::from(deduplication_id.as_str())),
        );
    }

    headers
}

/// Every property but the header table.
fn properties(msg: &Message, settings: &PublishSettings) -> AMQPProperties {
    let content_type = msg
        .content_type
        .clone()
        .unwrap_or_else(|| settings.content_type.clone());

    let mut props = AMQPProperties::default()
        .with_content_type(ShortString::from(content_type))
        .with_delivery_mode(delivery_mode(msg, settings.delivery_mode));

    if let Some(id) = &msg.message_id {
        props = props.with_message_id(ShortString::from(id.as_str()));
    }
    if let Some(id) = &msg.correlation_id {
        props = props.with_correlation_id(ShortString::from(id.as_str()));
    }
    if let Some(kind) = &msg.msg_type {
        props = props.with_kind(ShortString::from(kind.as_str()));
    }
    if let Some(timestamp) = msg.timestamp {
        props = props.with_timestamp(timestamp.timestamp().max(0) as u64);
    }
    if let Some(priority) = msg.priority {
        props = props.with_priority(priority);
    }

    props
}

fn delivery_mode(msg: &Message, kind: DeliveryModeKind) -> u8 {
    let persistent = msg.persistent.unwrap_or(match kind {
        DeliveryModeKind::Transient => false,
        DeliveryModeKind::Persistent => true,
        DeliveryModeKind::PersistentWhenPrioritized => msg.priority.is_some(),
    });

    if persistent {
        PERSISTENT_DELIVERY_MODE
    } else {
        TRANSIENT_DELIVERY_MODE
    }
}

/// Strings are kept verbatim, everything else is rendered as JSON text.
pub(crate) fn stringify(value: &AMQPValue) -> String {
    match value {
        AMQPValue::LongString(v) => String::from_utf8_lossy(v.as_bytes()).into_owned(),
        AMQPValue::ShortString(v) => v.as_str().to_owned(),
        AMQPValue::Void => String::new(),
        other => to_json(other).to_string(),
    }
}

fn to_json(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(v) => Value::Bool(*v),
        AMQPValue::ShortShortInt(v) => Value::from(*v),
        AMQPValue::ShortShortUInt(v) => Value::from(*v),
        AMQPValue::ShortInt(v) => Value::from(*v),
        AMQPValue::ShortUInt(v) => Value::from(*v),
        AMQPValue::LongInt(v) => Value::from(*v),
        AMQPValue::LongUInt(v) => Value::from(*v),
        AMQPValue::LongLongInt(v) => Value::from(*v),
        AMQPValue::Float(v) => float(f64::from(*v)),
        AMQPValue::Double(v) => float(*v),
        AMQPValue::DecimalValue(v) => {
            float(f64::from(v.value) / 10f64.powi(i32::from(v.scale)))
        }
        AMQPValue::ShortString(v) => Value::String(v.as_str().to_owned()),
        AMQPValue::LongString(v) => {
            Value::String(String::from_utf8_lossy(v.as_bytes()).into_owned())
        }
        AMQPValue::FieldArray(v) => Value::Array(v.as_slice().iter().map(to_json).collect()),
        AMQPValue::Timestamp(v) => Value::from(*v),
        AMQPValue::FieldTable(v) => Value::Object(
            v.inner()
                .iter()
                .map(|(key, value)| (key.as_str().to_owned(), to_json(value)))
                .collect::<Map<String, Value>>(),
        ),
        AMQPValue::ByteArray(v) => {
            Value::Array(v.as_slice().iter().map(|b| Value::from(*b)).collect())
        }
        AMQPValue::Void => Value::Null,
    }
}

fn float(v: f64) -> Value {
    Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::FieldArray;

    fn delivery(properties: AMQPProperties, body: &[u8]) -> WireDelivery {
        WireDelivery {
            delivery_tag: 1,
            redelivered: false,
            routing_key: "orders".to_owned(),
            properties,
            body: body.to_vec(),
        }
    }

    fn loopback(msg: &Message) -> Message {
        let (props, body) = to_wire(msg, &PublishSettings::default());
        from_wire(&msg.entity_name, &delivery(props, body), None)
    }

    #[test]
    fn should_round_trip_message() {
        let msg = Message::new("orders", br#"{"id":1}"#)
            .with_metadata("type", "order")
            .with_metadata("tenant", "acme")
            .with_message_id("m-1")
            .with_correlation_id("c-1")
            .with_msg_type("order.created")
            .with_content_type("application/json")
            .with_timestamp(Utc::now())
            .with_priority(4)
            .with_group_id("g-1")
            .with_deduplication_id("d-1")
            .persistent(true);

        assert_eq!(loopback(&msg), msg);
    }

    #[test]
    fn should_leave_absent_properties_unset() {
        let msg = Message::new("orders", b"A").with_content_type("text/plain");

        let back = loopback(&msg);

        assert_eq!(back.message_id, None);
        assert_eq!(back.correlation_id, None);
        assert_eq!(back.timestamp, None);
        assert_eq!(back.priority, None);
        assert_eq!(back.group_id, None);
        assert!(back.metadata.is_empty());
    }

    #[test]
    fn should_keep_reserved_headers_out_of_metadata() {
        let msg = Message::new("orders", b"A").with_group_id("g-1");

        let (props, _) = to_wire(&msg, &PublishSettings::default());
        let headers = props.headers().clone().unwrap_or_default();

        assert!(headers.inner().contains_key(GROUP_ID_HEADER));
        assert!(loopback(&msg).metadata.is_empty());
    }

    #[test]
    fn should_add_decorated_headers_next_to_metadata() {
        let msg = Message::new("orders", b"A")
            .with_metadata("tenant", "acme")
            .with_group_id("g-1");

        let (props, body) = to_wire_with(&msg, &PublishSettings::default(), |headers| {
            headers.insert(
                ShortString::from("traceparent"),
                AMQPValue::LongString(LongString::from("00-abc-def-01")),
            );
        });
        let back = from_wire("orders", &delivery(props, body), None);

        assert_eq!(back.metadata["tenant"], "acme");
        assert_eq!(back.metadata["traceparent"], "00-abc-def-01");
        assert_eq!(back.group_id, Some("g-1".to_owned()));
    }

    #[test]
    fn should_use_configured_content_type() {
        let msg = Message::new("orders", b"A");

        let (props, _) = to_wire(&msg, &PublishSettings::default());

        assert_eq!(
            props.content_type().as_ref().map(|v| v.as_str().to_owned()),
            Some("application/json".to_owned())
        );
    }

    #[test]
    fn should_pick_delivery_mode() {
        let prioritized = PublishSettings::default();
        let msg = Message::new("orders", b"A");

        assert_eq!(delivery_mode(&msg, prioritized.delivery_mode), 1);
        assert_eq!(
            delivery_mode(&msg.clone().with_priority(1), prioritized.delivery_mode),
            2
        );
        assert_eq!(delivery_mode(&msg, DeliveryModeKind::Persistent), 2);
        assert_eq!(
            delivery_mode(&msg.clone().persistent(false), DeliveryModeKind::Persistent),
            1
        );
        assert_eq!(
            delivery_mode(&msg.clone().with_priority(9), DeliveryModeKind::Transient),
            1
        );
    }

    #[test]
    fn should_stringify_non_string_headers() {
        let mut table = BTreeMap::new();
        table.insert(ShortString::from("retries"), AMQPValue::LongInt(3));
        table.insert(ShortString::from("final"), AMQPValue::Boolean(true));
        table.insert(
            ShortString::from("tags"),
            AMQPValue::FieldArray(FieldArray::from(vec![
                AMQPValue::LongString(LongString::from("a")),
                AMQPValue::LongLongInt(2),
            ])),
        );
        table.insert(
            ShortString::from("source"),
            AMQPValue::ShortString(ShortString::from("billing")),
        );

        let props = AMQPProperties::default().with_headers(FieldTable::from(table));
        let msg = from_wire("orders", &delivery(props, b""), None);

        assert_eq!(msg.metadata["retries"], "3");
        assert_eq!(msg.metadata["final"], "true");
        assert_eq!(msg.metadata["tags"], r#"["a",2]"#);
        assert_eq!(msg.metadata["source"], "billing");
    }

    #[test]
    fn should_carry_delivery_tag_and_redelivered_flag() {
        let mut wire = delivery(AMQPProperties::default(), b"A");
        wire.redelivered = true;
        let tag = DeliveryTag {
            channel_serial: 3,
            tag: 1,
        };

        let msg = from_wire("orders", &wire, Some(tag));

        assert_eq!(msg.delivery, Some(tag));
        assert!(msg.redelivered);
        assert_eq!(msg.entity_name, "orders");
    }
}
