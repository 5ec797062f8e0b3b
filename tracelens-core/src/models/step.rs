use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// One entry of a captured call chain, as the console's detail endpoint
/// returns it. All fields are optional on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChainStep {
    pub app_name: Option<String>,
    pub operation: Option<String>,
    pub app_id: Option<String>,
    pub log_type: Option<String>,
    pub request_time: Option<String>,
    pub log_time: Option<String>,
    /// Duration in milliseconds.
    pub intervals: Option<f64>,
    /// Numeric result code; 0 means success.
    pub result: Option<f64>,
    /// Raw request payload, often itself JSON.
    pub request: Option<String>,
    /// Raw response payload, often itself JSON.
    pub response: Option<String>,
}

impl ChainStep {
    /// Sort key: `requestTime` if present, else `logTime`, parsed to epoch
    /// milliseconds. `None` when both are absent or unparsable; such steps
    /// keep their original relative order under a stable sort.
    pub fn ordering_key(&self) -> Option<i64> {
        self.request_time
            .as_deref()
            .or(self.log_time.as_deref())
            .and_then(parse_timestamp_millis)
    }

    /// Timestamp used for display: `requestTime` falling back to `logTime`.
    pub fn display_time(&self) -> Option<&str> {
        self.request_time.as_deref().or(self.log_time.as_deref())
    }
}

/// Parse the console's timestamp strings. The console emits either RFC 3339
/// or a space-separated local form ("2024-05-01 12:30:45.123").
fn parse_timestamp_millis(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }

    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }

    None
}
