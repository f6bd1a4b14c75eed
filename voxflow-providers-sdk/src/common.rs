//! Shared helpers used across the SDK.

/// Serde support for human-readable durations ("30s", "5m", "250ms", "2h")
/// in configuration documents. Plain structs `{secs, nanos}` are accepted
/// too so round-tripping through JSON keeps working.
pub mod duration_serde {
    use serde::{Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        use serde::Deserialize;
        use serde_json::Value;

        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(s) => parse_duration(&s).map_err(Error::custom),
            Value::Number(n) => {
                let secs = n
                    .as_u64()
                    .ok_or_else(|| Error::custom("negative duration"))?;
                Ok(Duration::from_secs(secs))
            }
            Value::Object(obj) => {
                let secs = obj
                    .get("secs")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| Error::custom("missing 'secs' field"))?;
                let nanos = obj.get("nanos").and_then(|v| v.as_u64()).unwrap_or(0);
                Ok(Duration::new(secs, nanos as u32))
            }
            _ => Err(Error::custom("invalid duration format")),
        }
    }

    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty duration string".to_string());
        }
        if let Some(stripped) = s.strip_suffix("ms") {
            let num: u64 = stripped
                .parse()
                .map_err(|_| format!("invalid number: {stripped}"))?;
            return Ok(Duration::from_millis(num));
        }
        if let Some(stripped) = s.strip_suffix('s') {
            if !stripped.ends_with('m') && !stripped.ends_with('h') {
                let num: f64 = stripped
                    .parse()
                    .map_err(|_| format!("invalid number: {stripped}"))?;
                let secs = num.trunc() as u64;
                let nanos = ((num.fract() * 1_000_000_000.0).round()) as u32;
                return Ok(Duration::new(secs, nanos));
            }
        }
        if let Some(stripped) = s.strip_suffix('m') {
            let num: u64 = stripped
                .parse()
                .map_err(|_| format!("invalid number: {stripped}"))?;
            return Ok(Duration::from_secs(num * 60));
        }
        if let Some(stripped) = s.strip_suffix('h') {
            let num: u64 = stripped
                .parse()
                .map_err(|_| format!("invalid number: {stripped}"))?;
            return Ok(Duration::from_secs(num * 3600));
        }
        Err(format!("unknown duration unit: {s}"))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_parse_duration_units() {
            assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
            assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
            assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
            assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
            assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
            assert!(parse_duration("").is_err());
            assert!(parse_duration("5 parsecs").is_err());
        }
    }
}
