//! Logjoin CLI library - testable functions and modules

pub mod config;
pub mod logging;
pub mod replay;

use anyhow::Result;
use logjoin_runtime::decode;

/// Decode a single pixel line and render the typed event as JSON.
pub fn check_line(tenant: &str, line: &str) -> Result<String> {
    match decode(tenant, line, None) {
        Ok(event) => Ok(serde_json::to_string_pretty(&event)?),
        Err(e) => Err(anyhow::anyhow!("Invalid line: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_line_valid() {
        let json = check_line("shop", "c=u1~v1&e=v&i=s~a").unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["uid"], "u1");
        assert_eq!(value["event_id"], "v1");
        assert_eq!(value["tenant"], "shop");
    }

    #[test]
    fn test_check_line_invalid() {
        let err = check_line("shop", "c=u1~v1&e=z").unwrap_err();
        assert!(err.to_string().contains("unsupported event type 'z'"));
    }
}
