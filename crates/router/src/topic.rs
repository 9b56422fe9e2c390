use once_cell::sync::Lazy;
use regex::Regex;
use strum_macros::{Display, EnumString};

use crate::error::ProtocolError;

/// `rtk/v<ver>/<tenant>/<site>/<device_id>/<kind>(/<sub>)?`
static TOPIC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^rtk/v(?P<ver>\d+)/(?P<tenant>[A-Za-z0-9_]{3,32})/(?P<site>[A-Za-z0-9_]{3,32})/(?P<device>[A-Za-z0-9:_.\-]{6,64})/(?P<kind>state|telemetry|evt|attr|cmd|lwt|topology)(?:/(?P<sub>.+))?$",
    )
    .expect("topic grammar regex is valid")
});

#[derive(Debug, Clone, Copy, Display, EnumString, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum TopicKind {
    State,
    Telemetry,
    Evt,
    Attr,
    Cmd,
    Lwt,
    Topology,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTopic {
    pub tenant: String,
    pub site: String,
    pub device: String,
    pub kind: TopicKind,
    pub sub: Option<String>,
}

pub fn parse_topic(topic: &str) -> Result<ParsedTopic, ProtocolError> {
    let caps = TOPIC_RE
        .captures(topic)
        .ok_or_else(|| ProtocolError::MalformedTopic(topic.to_string()))?;

    let ver: u32 = caps["ver"]
        .parse()
        .map_err(|_| ProtocolError::MalformedTopic(topic.to_string()))?;
    if ver != 1 {
        return Err(ProtocolError::UnsupportedVersion(ver));
    }

    let kind: TopicKind = caps["kind"]
        .parse()
        .map_err(|_| ProtocolError::MalformedTopic(topic.to_string()))?;
    let sub = caps.name("sub").map(|m| m.as_str().to_string());

    match (kind, sub.as_deref()) {
        // cmd requires a known direction.
        (TopicKind::Cmd, Some("req" | "ack" | "res")) => {}
        (TopicKind::Cmd, other) => {
            return Err(ProtocolError::UnexpectedSub {
                kind: kind.to_string(),
                sub: other.unwrap_or("<none>").to_string(),
            });
        }
        // state/attr/lwt are leaf topics.
        (TopicKind::State | TopicKind::Attr | TopicKind::Lwt, Some(s)) => {
            return Err(ProtocolError::UnexpectedSub {
                kind: kind.to_string(),
                sub: s.to_string(),
            });
        }
        // telemetry/evt/topology accept any sub (extensible).
        _ => {}
    }

    Ok(ParsedTopic {
        tenant: caps["tenant"].to_string(),
        site: caps["site"].to_string(),
        device: caps["device"].to_string(),
        kind,
        sub,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_state_topic() {
        let t = parse_topic("rtk/v1/home/main/aabbccddeeff/state").unwrap();
        assert_eq!(t.tenant, "home");
        assert_eq!(t.kind, TopicKind::State);
        assert!(t.sub.is_none());
    }

    #[test]
    fn parses_telemetry_with_sub() {
        let t = parse_topic("rtk/v1/home/main/aabbccddeeff/telemetry/wifi/radio0").unwrap();
        assert_eq!(t.kind, TopicKind::Telemetry);
        assert_eq!(t.sub.as_deref(), Some("wifi/radio0"));
    }

    #[test]
    fn rejects_bad_version() {
        assert_eq!(
            parse_topic("rtk/v2/home/main/aabbccddeeff/state"),
            Err(ProtocolError::UnsupportedVersion(2))
        );
    }

    #[test]
    fn rejects_short_tenant() {
        assert!(matches!(
            parse_topic("rtk/v1/ab/main/aabbccddeeff/state"),
            Err(ProtocolError::MalformedTopic(_))
        ));
    }

    #[test]
    fn rejects_cmd_without_direction() {
        assert!(matches!(
            parse_topic("rtk/v1/home/main/aabbccddeeff/cmd"),
            Err(ProtocolError::UnexpectedSub { .. })
        ));
        assert!(matches!(
            parse_topic("rtk/v1/home/main/aabbccddeeff/cmd/launch"),
            Err(ProtocolError::UnexpectedSub { .. })
        ));
    }

    #[test]
    fn rejects_sub_on_leaf_kinds() {
        assert!(matches!(
            parse_topic("rtk/v1/home/main/aabbccddeeff/state/extra"),
            Err(ProtocolError::UnexpectedSub { .. })
        ));
    }

    #[test]
    fn accepts_device_ids_with_separators() {
        let t = parse_topic("rtk/v1/home/main/aa:bb:cc:dd:ee:ff/state").unwrap();
        assert_eq!(t.device, "aa:bb:cc:dd:ee:ff");
    }
}
