//! Outgoing record construction, stamping, and validation.
//!
//! Every public operation on the client funnels through one of the builders
//! here, which coerce the distinct id to its canonical string form, stamp the
//! library tag and timestamp, and enforce the per-message size limit before
//! anything reaches the queue. Records are immutable once built.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::MAX_MESSAGE_SIZE;
use crate::error::ValidationError;
use crate::version::{LIB_NAME, VERSION};

/// Dynamic string-keyed property bag carried by records and flag queries.
pub type Properties = Map<String, Value>;

/// Caller-supplied identifier, coerced to a canonical string on the wire.
///
/// Numeric identifiers render in full-precision decimal form; integers up to
/// 64 bits never lose digits the way float-typed JSON consumers can.
#[derive(Clone, Debug)]
pub enum DistinctId {
    Text(String),
    Int(i128),
    Float(f64),
}

impl DistinctId {
    pub(crate) fn canonical(&self) -> Result<String, ValidationError> {
        let rendered = match self {
            DistinctId::Text(value) => value.clone(),
            DistinctId::Int(value) => value.to_string(),
            DistinctId::Float(value) => value.to_string(),
        };
        if rendered.is_empty() {
            return Err(ValidationError::EmptyDistinctId);
        }
        Ok(rendered)
    }
}

impl From<&str> for DistinctId {
    fn from(value: &str) -> Self {
        DistinctId::Text(value.to_owned())
    }
}

impl From<String> for DistinctId {
    fn from(value: String) -> Self {
        DistinctId::Text(value)
    }
}

impl From<i32> for DistinctId {
    fn from(value: i32) -> Self {
        DistinctId::Int(value.into())
    }
}

impl From<i64> for DistinctId {
    fn from(value: i64) -> Self {
        DistinctId::Int(value.into())
    }
}

impl From<u64> for DistinctId {
    fn from(value: u64) -> Self {
        DistinctId::Int(value.into())
    }
}

impl From<f64> for DistinctId {
    fn from(value: f64) -> Self {
        DistinctId::Float(value)
    }
}

/// Optional fields shared by every message kind.
#[derive(Clone, Debug, Default)]
pub struct MessageOptions {
    /// Transport-level context (e.g. `ip`), kept apart from properties.
    pub context: Option<Properties>,
    /// Event time; defaults to the wall clock at build time. Rendered as
    /// RFC 3339 with an explicit `+00:00` offset.
    pub timestamp: Option<DateTime<Utc>>,
    /// Idempotency id, passed through verbatim. Absent when not supplied.
    pub uuid: Option<String>,
}

/// A normalized outgoing record, ready for the queue.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Event {
    pub event: String,
    pub distinct_id: String,
    pub properties: Properties,
    pub context: Properties,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(rename = "$set", skip_serializing_if = "Option::is_none")]
    pub set: Option<Properties>,
    #[serde(rename = "$set_once", skip_serializing_if = "Option::is_none")]
    pub set_once: Option<Properties>,
}

impl Event {
    pub(crate) fn serialized_size(&self) -> usize {
        serde_json::to_vec(self).map(|body| body.len()).unwrap_or(0)
    }
}

pub(crate) fn capture_event(
    distinct_id: &DistinctId,
    event: &str,
    mut properties: Properties,
    groups: Option<&HashMap<String, String>>,
    options: MessageOptions,
) -> Result<Event, ValidationError> {
    if let Some(groups) = groups.filter(|groups| !groups.is_empty()) {
        let rendered = groups
            .iter()
            .map(|(group_type, group_key)| (group_type.clone(), Value::String(group_key.clone())))
            .collect();
        properties.insert("$groups".to_owned(), Value::Object(rendered));
    }
    finalize(event, distinct_id, properties, None, None, options)
}

pub(crate) fn identify_event(
    distinct_id: &DistinctId,
    properties: Properties,
    options: MessageOptions,
) -> Result<Event, ValidationError> {
    finalize(
        "$identify",
        distinct_id,
        Properties::new(),
        Some(properties),
        None,
        options,
    )
}

pub(crate) fn set_event(
    distinct_id: &DistinctId,
    properties: Properties,
    options: MessageOptions,
) -> Result<Event, ValidationError> {
    finalize(
        "$set",
        distinct_id,
        Properties::new(),
        Some(properties),
        None,
        options,
    )
}

pub(crate) fn set_once_event(
    distinct_id: &DistinctId,
    properties: Properties,
    options: MessageOptions,
) -> Result<Event, ValidationError> {
    finalize(
        "$set_once",
        distinct_id,
        Properties::new(),
        None,
        Some(properties),
        options,
    )
}

pub(crate) fn alias_event(
    previous_id: &DistinctId,
    distinct_id: &DistinctId,
    options: MessageOptions,
) -> Result<Event, ValidationError> {
    let previous = previous_id.canonical()?;
    let current = distinct_id.canonical()?;
    let mut properties = Properties::new();
    properties.insert("distinct_id".to_owned(), Value::String(previous.clone()));
    properties.insert("alias".to_owned(), Value::String(current));
    finalize(
        "$create_alias",
        &DistinctId::Text(previous),
        properties,
        None,
        None,
        options,
    )
}

pub(crate) fn group_identify_event(
    group_type: &str,
    group_key: &str,
    properties: Properties,
    options: MessageOptions,
) -> Result<Event, ValidationError> {
    let mut stamped = Properties::new();
    stamped.insert("$group_type".to_owned(), Value::String(group_type.to_owned()));
    stamped.insert("$group_key".to_owned(), Value::String(group_key.to_owned()));
    stamped.insert("$group_set".to_owned(), Value::Object(properties));
    let distinct_id = DistinctId::Text(format!("${group_type}_{group_key}"));
    finalize("$groupidentify", &distinct_id, stamped, None, None, options)
}

pub(crate) fn page_event(
    distinct_id: &DistinctId,
    url: &str,
    mut properties: Properties,
    options: MessageOptions,
) -> Result<Event, ValidationError> {
    properties.insert("$current_url".to_owned(), Value::String(url.to_owned()));
    finalize("$pageview", distinct_id, properties, None, None, options)
}

pub(crate) fn screen_event(
    distinct_id: &DistinctId,
    name: &str,
    mut properties: Properties,
    options: MessageOptions,
) -> Result<Event, ValidationError> {
    properties.insert("$screen_name".to_owned(), Value::String(name.to_owned()));
    finalize("$screen", distinct_id, properties, None, None, options)
}

/// Stamp library fields and the timestamp, then run the size check.
fn finalize(
    event: &str,
    distinct_id: &DistinctId,
    mut properties: Properties,
    set: Option<Properties>,
    set_once: Option<Properties>,
    options: MessageOptions,
) -> Result<Event, ValidationError> {
    let distinct_id = distinct_id.canonical()?;
    properties.insert("$lib".to_owned(), Value::String(LIB_NAME.to_owned()));
    properties.insert("$lib_version".to_owned(), Value::String(VERSION.to_owned()));
    let timestamp = options
        .timestamp
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::AutoSi, false);
    let record = Event {
        event: event.to_owned(),
        distinct_id,
        properties,
        context: options.context.unwrap_or_default(),
        timestamp,
        uuid: options.uuid,
        set,
        set_once,
    };
    let size = serde_json::to_vec(&record)
        .map_err(|_| ValidationError::NotSerializable)?
        .len();
    if size > MAX_MESSAGE_SIZE {
        return Err(ValidationError::Oversized { size });
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;
    use serde_json::json;

    fn props(value: Value) -> Properties {
        value.as_object().expect("object literal").clone()
    }

    #[rstest]
    #[case(DistinctId::from("distinct_id"), "distinct_id")]
    #[case(DistinctId::from(1234i64), "1234")]
    #[case(DistinctId::from(157_963_456_373_623_802i64), "157963456373623802")]
    #[case(DistinctId::from(u64::MAX), "18446744073709551615")]
    #[case(DistinctId::from(-42i32), "-42")]
    #[case(DistinctId::from(1.5f64), "1.5")]
    fn distinct_id_renders_canonically(#[case] id: DistinctId, #[case] expected: &str) {
        assert_eq!(id.canonical().expect("valid id"), expected);
    }

    #[test]
    fn large_floats_render_without_exponent() {
        let id = DistinctId::from(1e20);
        assert_eq!(id.canonical().expect("valid id"), "100000000000000000000");
    }

    #[test]
    fn empty_distinct_id_is_rejected() {
        let err = capture_event(
            &DistinctId::from(""),
            "event",
            Properties::new(),
            None,
            MessageOptions::default(),
        )
        .expect_err("empty id must fail");
        assert_eq!(err, ValidationError::EmptyDistinctId);
    }

    #[test]
    fn capture_stamps_library_fields() {
        let record = capture_event(
            &DistinctId::from("u"),
            "movie played",
            props(json!({"id": "7"})),
            None,
            MessageOptions::default(),
        )
        .expect("valid record");
        assert_eq!(record.event, "movie played");
        assert_eq!(record.distinct_id, "u");
        assert_eq!(record.properties["id"], json!("7"));
        assert_eq!(record.properties["$lib"], json!(LIB_NAME));
        assert_eq!(record.properties["$lib_version"], json!(VERSION));
        assert!(record.uuid.is_none());
        assert!(record.set.is_none());
    }

    #[test]
    fn default_timestamp_is_current_utc_with_offset() {
        let before = Utc::now();
        let record = capture_event(
            &DistinctId::from("u"),
            "e",
            Properties::new(),
            None,
            MessageOptions::default(),
        )
        .expect("valid record");
        assert!(record.timestamp.ends_with("+00:00"));
        let parsed = DateTime::parse_from_rfc3339(&record.timestamp).expect("rfc3339");
        let skew = (parsed.with_timezone(&Utc) - before).num_milliseconds().abs();
        assert!(skew < 1_000, "timestamp {skew} ms away from wall clock");
    }

    #[test]
    fn explicit_timestamp_round_trips() {
        let timestamp = Utc.with_ymd_and_hms(2014, 9, 3, 0, 0, 0).unwrap();
        let record = capture_event(
            &DistinctId::from("u"),
            "e",
            Properties::new(),
            None,
            MessageOptions {
                timestamp: Some(timestamp),
                ..Default::default()
            },
        )
        .expect("valid record");
        assert_eq!(record.timestamp, "2014-09-03T00:00:00+00:00");
    }

    #[test]
    fn uuid_passes_through_and_is_absent_otherwise() {
        let with_uuid = capture_event(
            &DistinctId::from("u"),
            "e",
            Properties::new(),
            None,
            MessageOptions {
                uuid: Some("new-uuid".to_owned()),
                ..Default::default()
            },
        )
        .expect("valid record");
        assert_eq!(with_uuid.uuid.as_deref(), Some("new-uuid"));

        let body = serde_json::to_value(&with_uuid).expect("serialize");
        assert_eq!(body["uuid"], json!("new-uuid"));

        let without = capture_event(
            &DistinctId::from("u"),
            "e",
            Properties::new(),
            None,
            MessageOptions::default(),
        )
        .expect("valid record");
        let body = serde_json::to_value(&without).expect("serialize");
        assert!(body.get("uuid").is_none());
    }

    #[test]
    fn groups_stamp_only_when_supplied() {
        let groups = HashMap::from([
            ("company".to_owned(), "id:5".to_owned()),
            ("instance".to_owned(), "app.posthog.com".to_owned()),
        ]);
        let record = capture_event(
            &DistinctId::from("u"),
            "e",
            Properties::new(),
            Some(&groups),
            MessageOptions::default(),
        )
        .expect("valid record");
        assert_eq!(
            record.properties["$groups"],
            json!({"company": "id:5", "instance": "app.posthog.com"})
        );

        let plain = capture_event(
            &DistinctId::from("u"),
            "e",
            Properties::new(),
            None,
            MessageOptions::default(),
        )
        .expect("valid record");
        assert!(!plain.properties.contains_key("$groups"));
    }

    #[test]
    fn identify_carries_set_payload() {
        let record = identify_event(
            &DistinctId::from("u"),
            props(json!({"trait": "value"})),
            MessageOptions::default(),
        )
        .expect("valid record");
        assert_eq!(record.event, "$identify");
        assert_eq!(record.set.as_ref().expect("$set")["trait"], json!("value"));
        assert_eq!(record.properties["$lib"], json!(LIB_NAME));
    }

    #[test]
    fn set_once_uses_its_own_payload_slot() {
        let record = set_once_event(
            &DistinctId::from("u"),
            props(json!({"referred_by": "friend"})),
            MessageOptions::default(),
        )
        .expect("valid record");
        assert_eq!(record.event, "$set_once");
        assert!(record.set.is_none());
        assert_eq!(
            record.set_once.as_ref().expect("$set_once")["referred_by"],
            json!("friend")
        );
    }

    #[test]
    fn alias_links_both_identifiers() {
        let record = alias_event(
            &DistinctId::from("anon"),
            &DistinctId::from("u"),
            MessageOptions::default(),
        )
        .expect("valid record");
        assert_eq!(record.event, "$create_alias");
        assert_eq!(record.distinct_id, "anon");
        assert_eq!(record.properties["distinct_id"], json!("anon"));
        assert_eq!(record.properties["alias"], json!("u"));
    }

    #[test]
    fn group_identify_synthesizes_distinct_id() {
        let record = group_identify_event(
            "organization",
            "id:5",
            props(json!({"employees": 11})),
            MessageOptions::default(),
        )
        .expect("valid record");
        assert_eq!(record.event, "$groupidentify");
        assert_eq!(record.distinct_id, "$organization_id:5");
        assert_eq!(record.properties["$group_type"], json!("organization"));
        assert_eq!(record.properties["$group_key"], json!("id:5"));
        assert_eq!(record.properties["$group_set"], json!({"employees": 11}));
    }

    #[test]
    fn page_and_screen_stamp_their_fields() {
        let page = page_event(
            &DistinctId::from("u"),
            "https://posthog.com/contact",
            Properties::new(),
            MessageOptions::default(),
        )
        .expect("valid record");
        assert_eq!(page.event, "$pageview");
        assert_eq!(
            page.properties["$current_url"],
            json!("https://posthog.com/contact")
        );

        let screen = screen_event(
            &DistinctId::from("u"),
            "Home",
            Properties::new(),
            MessageOptions::default(),
        )
        .expect("valid record");
        assert_eq!(screen.event, "$screen");
        assert_eq!(screen.properties["$screen_name"], json!("Home"));
    }

    #[test]
    fn oversized_messages_are_rejected() {
        let mut properties = Properties::new();
        properties.insert("blob".to_owned(), json!("x".repeat(MAX_MESSAGE_SIZE)));
        let err = capture_event(
            &DistinctId::from("u"),
            "e",
            properties,
            None,
            MessageOptions::default(),
        )
        .expect_err("must exceed the size limit");
        assert!(matches!(err, ValidationError::Oversized { size } if size > MAX_MESSAGE_SIZE));
    }

    #[test]
    fn context_defaults_to_an_empty_map_on_the_wire() {
        let record = capture_event(
            &DistinctId::from("u"),
            "e",
            Properties::new(),
            None,
            MessageOptions::default(),
        )
        .expect("valid record");
        let body = serde_json::to_value(&record).expect("serialize");
        assert_eq!(body["context"], json!({}));
    }
}
