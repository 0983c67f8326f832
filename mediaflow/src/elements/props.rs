//! Property value helpers shared by the built-in stages.

use crate::caps::Capability;
use crate::errors::PropertyError;
use serde_json::Value;

pub(crate) fn string(value: &Value) -> Result<String, PropertyError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| PropertyError::InvalidValue(format!("expected a string, got {value}")))
}

pub(crate) fn uint(value: &Value, min: u64, max: u64) -> Result<u64, PropertyError> {
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    match parsed {
        Some(v) if (min..=max).contains(&v) => Ok(v),
        Some(v) => Err(PropertyError::InvalidValue(format!(
            "{v} is out of range [{min}, {max}]"
        ))),
        None => Err(PropertyError::InvalidValue(format!(
            "expected an unsigned integer, got {value}"
        ))),
    }
}

pub(crate) fn port(value: &Value) -> Result<u16, PropertyError> {
    // range checked above, the cast cannot truncate
    uint(value, 0, u64::from(u16::MAX)).map(|v| v as u16)
}

pub(crate) fn caps(value: &Value) -> Result<Capability, PropertyError> {
    let raw = string(value)?;
    Capability::parse(&raw).map_err(|e| PropertyError::InvalidValue(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_uint_accepts_numbers_and_strings() {
        assert_eq!(uint(&json!(3000), 1, 10_000), Ok(3000));
        assert_eq!(uint(&json!("96"), 96, 127), Ok(96));
        assert!(uint(&json!(0), 1, 10).is_err());
        assert!(uint(&json!(-4), 0, 10).is_err());
        assert!(uint(&json!(true), 0, 10).is_err());
    }

    #[test]
    fn test_port_range() {
        assert_eq!(port(&json!(5000)), Ok(5000));
        assert!(port(&json!(70000)).is_err());
    }

    #[test]
    fn test_caps_property() {
        let caps = caps(&json!("video/x-raw, width=1280, height=720")).unwrap();
        assert_eq!(caps.get_int("width"), Some(1280));
        assert!(super::caps(&json!(12)).is_err());
    }
}
