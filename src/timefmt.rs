use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub fn format_millis(ms: i64) -> String {
    let st = UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64);
    humantime::format_rfc3339_millis(st).to_string()
}

/// Parses an RFC 3339 timestamp (`T` or space separator, UTC only) into epoch
/// milliseconds.
pub fn parse_millis(text: &str) -> Option<i64> {
    let st = humantime::parse_rfc3339_weak(text.trim()).ok()?;
    match st.duration_since(UNIX_EPOCH) {
        Ok(d) => Some(d.as_millis() as i64),
        Err(err) => Some(-(err.duration().as_millis() as i64)),
    }
}

/// Timestamps coming from external tools show up either as ISO strings or as
/// epoch milliseconds.
pub fn millis_from_json(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        serde_json::Value::String(s) => parse_millis(s),
        _ => None,
    }
}

pub fn format_relative(ms: i64, now_ms: i64) -> String {
    let diff_min = now_ms.saturating_sub(ms) / 60_000;
    let diff_hr = now_ms.saturating_sub(ms) / 3_600_000;
    if diff_min < 1 {
        "just now".to_string()
    } else if diff_min < 60 {
        format!("{diff_min}m ago")
    } else if diff_hr < 24 {
        format!("{diff_hr}h ago")
    } else {
        format!("{}d ago", diff_hr / 24)
    }
}

/// Serde adapter: epoch millis in memory, RFC 3339 on the wire.
pub mod rfc3339 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ms: &i64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_millis(*ms))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        let value = serde_json::Value::deserialize(d)?;
        super::millis_from_json(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {value}")))
    }
}

pub mod rfc3339_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ms: &Option<i64>, s: S) -> Result<S::Ok, S::Error> {
        match ms {
            Some(ms) => s.serialize_str(&super::format_millis(*ms)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        let value = Option::<serde_json::Value>::deserialize(d)?;
        Ok(value.as_ref().and_then(super::millis_from_json))
    }
}
