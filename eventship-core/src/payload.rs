//! Text-level helpers for batch payloads
//!
//! A batch on disk is `{"batch":[<event>,<event>,...],"sentAt":"<placeholder>"}`.
//! Nothing here parses JSON; the uploader rewrites `sentAt` and reads
//! `anonymousId` by scanning the text.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};

/// Opening of a batch envelope, written when a batch file is created
pub const BATCH_PREFIX: &str = "{\"batch\":[";

/// Literal stored as the `sentAt` value until an upload attempt rewrites it
pub const SENT_AT_PLACEHOLDER: &str = "{{ RSA_DEF_SENT_AT_TS }}";

const SENT_AT_KEY: &str = "\"sentAt\":\"";
const ANONYMOUS_ID_KEY: &str = "\"anonymousId\"";

/// Closing of a batch envelope, appended on rollover
pub fn batch_suffix() -> String {
    format!("],{}{}\"}}", SENT_AT_KEY, SENT_AT_PLACEHOLDER)
}

/// Format a send time the way the data plane expects it
pub fn format_sent_at(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Replace the value of the last `"sentAt":"..."` field with `now`
///
/// Works on both the stored placeholder and a previously stamped value, so
/// the same batch text can be restamped for every attempt. Payloads without
/// a `sentAt` field are returned unchanged.
pub fn update_sent_at(payload: &str, now: DateTime<Utc>) -> String {
    let Some(key_start) = payload.rfind(SENT_AT_KEY) else {
        return payload.to_string();
    };
    let value_start = key_start + SENT_AT_KEY.len();
    let Some(value_len) = payload[value_start..].find('"') else {
        return payload.to_string();
    };

    let stamp = format_sent_at(now);
    let mut out = String::with_capacity(payload.len() + stamp.len());
    out.push_str(&payload[..value_start]);
    out.push_str(&stamp);
    out.push_str(&payload[value_start + value_len..]);
    out
}

/// Find the first non-empty `"anonymousId": "<value>"` in the text
pub fn extract_anonymous_id(payload: &str) -> Option<&str> {
    let mut search_from = 0;

    while let Some(offset) = payload[search_from..].find(ANONYMOUS_ID_KEY) {
        let after_key = search_from + offset + ANONYMOUS_ID_KEY.len();
        search_from = after_key;

        let rest = payload[after_key..].trim_start();
        let Some(rest) = rest.strip_prefix(':') else {
            continue;
        };
        let Some(rest) = rest.trim_start().strip_prefix('"') else {
            continue;
        };
        let Some(end) = rest.find('"') else {
            continue;
        };
        if end > 0 {
            return Some(&rest[..end]);
        }
    }

    None
}

/// Base64 of `"<value>:"`, the basic-auth style encoding used for headers
pub fn encode_header_value(value: &str) -> String {
    STANDARD.encode(format!("{}:", value))
}
