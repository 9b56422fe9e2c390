//! Envelope validation: schema-tag selection by (kind, sub), version
//! gating, timestamp skew checks, and typed deserialization.

use serde_json::Value;
use types::wire::{AttrMsg, CmdAckMsg, CmdResMsg, EvtMsg, LwtMsg, SchemaTag, StateMsg};
use types::{events::BusEvent, ids::DeviceId};

use crate::error::ProtocolError;
use crate::topic::{ParsedTopic, TopicKind};

/// 2001-01-01T00:00:00Z in milliseconds. Anything older is a device with
/// a dead clock.
const MIN_TS_MS: i64 = 978_307_200_000;
/// Maximum tolerated clock skew into the future.
const MAX_FUTURE_SKEW_MS: i64 = 5 * 60 * 1000;

pub fn check_timestamp(ts: i64, now_ms: i64) -> Result<(), ProtocolError> {
    if ts < MIN_TS_MS || ts > now_ms + MAX_FUTURE_SKEW_MS {
        return Err(ProtocolError::BadTimestamp(ts));
    }
    Ok(())
}

fn parse_json(payload: &[u8]) -> Result<Value, ProtocolError> {
    serde_json::from_slice(payload).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
}

fn schema_tag(value: &Value) -> Result<SchemaTag, ProtocolError> {
    let raw = value
        .get("schema")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::BadSchemaTag("<missing>".to_string()))?;
    let tag: SchemaTag = raw
        .parse()
        .map_err(|_| ProtocolError::BadSchemaTag(raw.to_string()))?;
    // Unknown minors are accepted; unknown majors are not.
    if tag.major != 1 {
        return Err(ProtocolError::UnsupportedSchemaMajor(tag.major));
    }
    Ok(tag)
}

fn expect_kind(tag: &SchemaTag, want: &str) -> Result<(), ProtocolError> {
    if tag.kind != want {
        return Err(ProtocolError::SchemaMismatch {
            want: want.to_string(),
            got: tag.to_string(),
        });
    }
    Ok(())
}

fn typed<T: serde::de::DeserializeOwned>(
    value: Value,
    tag: &SchemaTag,
) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|e| ProtocolError::PayloadInvalid {
        schema: tag.to_string(),
        details: e.to_string(),
    })
}

/// Validate one raw publish against the schema selected by its topic and
/// turn it into the bus event the owning component consumes.
///
/// Returns `Ok(None)` for traffic that is valid but not for us (our own
/// command requests echoing back, the controller's own topics).
pub fn classify(
    topic: &ParsedTopic,
    raw_topic: &str,
    payload: &[u8],
    now_ms: i64,
) -> Result<Option<BusEvent>, ProtocolError> {
    if topic.device == "controller" {
        return Ok(None);
    }
    let device = DeviceId::new(topic.tenant.clone(), topic.site.clone(), &topic.device);

    let value = parse_json(payload)?;
    let tag = schema_tag(&value)?;
    let ts = value.get("ts").and_then(Value::as_i64).unwrap_or(-1);
    check_timestamp(ts, now_ms)?;

    let event = match topic.kind {
        TopicKind::State => {
            expect_kind(&tag, "state")?;
            let msg: StateMsg = typed(value, &tag)?;
            Some(BusEvent::StateReceived {
                device,
                topic: raw_topic.to_string(),
                msg,
            })
        }
        TopicKind::Attr => {
            expect_kind(&tag, "attr")?;
            let msg: AttrMsg = typed(value, &tag)?;
            Some(BusEvent::AttrReceived {
                device,
                topic: raw_topic.to_string(),
                msg,
            })
        }
        TopicKind::Lwt => {
            expect_kind(&tag, "lwt")?;
            let msg: LwtMsg = typed(value, &tag)?;
            Some(BusEvent::LwtReceived {
                device,
                topic: raw_topic.to_string(),
                msg,
            })
        }
        TopicKind::Evt => {
            expect_kind(&tag, "evt")?;
            let msg: EvtMsg = typed(value, &tag)?;
            Some(BusEvent::EventReceived {
                device,
                topic: raw_topic.to_string(),
                msg,
            })
        }
        TopicKind::Telemetry => {
            expect_kind(&tag, "telemetry")?;
            // Telemetry bodies are free-form numeric maps; only the common
            // header is validated here.
            Some(BusEvent::TelemetryReceived {
                device,
                topic: raw_topic.to_string(),
                name: topic.sub.clone().or_else(|| tag.detail.clone()),
                ts,
                payload: value,
            })
        }
        TopicKind::Topology => Some(BusEvent::TopologyReport {
            device,
            sub: topic.sub.clone(),
            ts,
            payload: value,
        }),
        TopicKind::Cmd => match topic.sub.as_deref() {
            Some("ack") => {
                expect_kind(&tag, "cmd")?;
                if tag.detail.as_deref() != Some("ack") {
                    return Err(ProtocolError::SchemaMismatch {
                        want: "cmd.ack".to_string(),
                        got: tag.to_string(),
                    });
                }
                let msg: CmdAckMsg = typed(value, &tag)?;
                Some(BusEvent::CommandAck { device, msg })
            }
            Some("res") => {
                expect_kind(&tag, "cmd")?;
                let is_result = tag
                    .detail
                    .as_deref()
                    .is_some_and(|d| d == "result" || d.ends_with(".result"));
                if !is_result {
                    return Err(ProtocolError::SchemaMismatch {
                        want: "cmd.<op>.result".to_string(),
                        got: tag.to_string(),
                    });
                }
                let msg: CmdResMsg = typed(value, &tag)?;
                Some(BusEvent::CommandResult { device, msg })
            }
            // Requests are controller-originated; nothing to do inbound.
            _ => None,
        },
    };
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::parse_topic;

    const NOW: i64 = 1_700_000_000_000;

    fn classify_str(topic: &str, payload: &str) -> Result<Option<BusEvent>, ProtocolError> {
        let parsed = parse_topic(topic).unwrap();
        classify(&parsed, topic, payload.as_bytes(), NOW)
    }

    #[test]
    fn accepts_valid_state() {
        let out = classify_str(
            "rtk/v1/home/main/aabbccddeeff/state",
            r#"{"schema":"state/1.0","ts":1700000000000,"health":"ok","uptime_s":3600}"#,
        )
        .unwrap();
        assert!(matches!(out, Some(BusEvent::StateReceived { .. })));
    }

    #[test]
    fn accepts_unknown_minor() {
        let out = classify_str(
            "rtk/v1/home/main/aabbccddeeff/state",
            r#"{"schema":"state/1.7","ts":1700000000000,"health":"ok"}"#,
        )
        .unwrap();
        assert!(out.is_some());
    }

    #[test]
    fn rejects_unknown_major() {
        let err = classify_str(
            "rtk/v1/home/main/aabbccddeeff/state",
            r#"{"schema":"state/2.0","ts":1700000000000,"health":"ok"}"#,
        )
        .unwrap_err();
        assert_eq!(err, ProtocolError::UnsupportedSchemaMajor(2));
    }

    #[test]
    fn rejects_kind_mismatch() {
        let err = classify_str(
            "rtk/v1/home/main/aabbccddeeff/state",
            r#"{"schema":"attr/1.0","ts":1700000000000,"health":"ok"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::SchemaMismatch { .. }));
    }

    #[test]
    fn rejects_stale_and_future_timestamps() {
        assert!(matches!(
            classify_str(
                "rtk/v1/home/main/aabbccddeeff/state",
                r#"{"schema":"state/1.0","ts":100,"health":"ok"}"#,
            ),
            Err(ProtocolError::BadTimestamp(100))
        ));
        let future = NOW + 6 * 60 * 1000;
        let payload =
            format!(r#"{{"schema":"state/1.0","ts":{future},"health":"ok"}}"#);
        assert!(matches!(
            classify_str("rtk/v1/home/main/aabbccddeeff/state", &payload),
            Err(ProtocolError::BadTimestamp(_))
        ));
    }

    #[test]
    fn command_result_schema_detail_must_be_result() {
        let err = classify_str(
            "rtk/v1/home/main/aabbccddeeff/cmd/res",
            r#"{"schema":"cmd.speed_test/1.0","ts":1700000000000,"id":"C1","status":"completed"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::SchemaMismatch { .. }));

        let ok = classify_str(
            "rtk/v1/home/main/aabbccddeeff/cmd/res",
            r#"{"schema":"cmd.speed_test.result/1.0","ts":1700000000000,"id":"C1","status":"completed","result":{}}"#,
        )
        .unwrap();
        assert!(matches!(ok, Some(BusEvent::CommandResult { .. })));
    }

    #[test]
    fn telemetry_accepts_unknown_sub() {
        let out = classify_str(
            "rtk/v1/home/main/aabbccddeeff/telemetry/airquality",
            r#"{"schema":"telemetry.airquality/1.0","ts":1700000000000,"pm25":12.5}"#,
        )
        .unwrap();
        match out {
            Some(BusEvent::TelemetryReceived { name, .. }) => {
                assert_eq!(name.as_deref(), Some("airquality"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn controller_traffic_is_skipped() {
        let out = classify_str(
            "rtk/v1/home/main/controller/state",
            r#"{"schema":"state/1.0","ts":1700000000000,"health":"ok"}"#,
        )
        .unwrap();
        assert!(out.is_none());
    }
}
