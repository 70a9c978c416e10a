/*!
Wire-level types shared between the host protocol and the components.

Option structs accept the field spellings the UI sends (PascalCase for server
and request options, camelCase for exec options) and fall back to defaults for
anything missing.
*/
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Uniform success/failure-with-message result returned by every operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagResult {
    pub flag: bool,
    pub data: String,
}

impl FlagResult {
    pub fn ok(data: impl Into<String>) -> Self {
        FlagResult {
            flag: true,
            data: data.into(),
        }
    }

    pub fn fail(data: impl Into<String>) -> Self {
        FlagResult {
            flag: false,
            data: data.into(),
        }
    }
}

/// Multi-valued header map as seen on the wire (`{"Content-Type": ["text/plain"]}`).
pub type WireHeaders = BTreeMap<String, Vec<String>>;

/// Result of an outbound call. `flag` is false only for transport-level failures;
/// HTTP error statuses are reported with `flag: true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResult {
    pub flag: bool,
    pub status: u16,
    pub headers: WireHeaders,
    pub body: String,
}

impl HttpResult {
    pub fn failure(msg: impl Into<String>) -> Self {
        HttpResult {
            flag: false,
            status: 500,
            headers: WireHeaders::new(),
            body: msg.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServerOptions {
    pub cert: String,
    pub key: String,
    pub static_path: String,
    pub static_route: String,
    pub static_headers: BTreeMap<String, String>,
    pub upload_path: String,
    pub upload_route: String,
    pub upload_headers: BTreeMap<String, String>,
    pub max_upload_size: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RequestOptions {
    pub proxy: String,
    pub insecure: bool,
    pub redirect: bool,
    /// Seconds; `<= 0` selects the configured default.
    pub timeout: i64,
    pub cancel_id: String,
    pub file_field: String,
}

impl Default for RequestOptions {
    fn default() -> Self {
        RequestOptions {
            proxy: String::new(),
            insecure: false,
            redirect: true,
            timeout: 0,
            cancel_id: String::new(),
            file_field: "file".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecOptions {
    #[serde(alias = "StopOutputKeyword")]
    pub stop_output_keyword: String,
    /// Keep emitting output after the keyword matched (only `started` is recorded).
    #[serde(alias = "KeepOutputAfterKeyword")]
    pub keep_output_after_keyword: bool,
    /// Decode process output as GB18030 instead of UTF-8.
    #[serde(alias = "Convert")]
    pub convert: bool,
    #[serde(alias = "Env")]
    pub env: BTreeMap<String, String>,
    #[serde(alias = "PidFile")]
    pub pid_file: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum BodyMode {
    #[default]
    Text,
    Binary,
}

/// Reply options sent alongside a bridged response body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IoOptions {
    #[serde(alias = "Mode")]
    pub mode: BodyMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_options_defaults_and_pascal_case() {
        let o: RequestOptions =
            serde_json::from_str(r#"{"Proxy":"127.0.0.1:7890","Timeout":3}"#).unwrap();
        assert_eq!(o.proxy, "127.0.0.1:7890");
        assert_eq!(o.timeout, 3);
        assert!(o.redirect);
        assert_eq!(o.file_field, "file");
    }

    #[test]
    fn test_exec_options_accepts_both_spellings() {
        let a: ExecOptions = serde_json::from_str(r#"{"stopOutputKeyword":"started"}"#).unwrap();
        let b: ExecOptions = serde_json::from_str(r#"{"StopOutputKeyword":"started"}"#).unwrap();
        assert_eq!(a.stop_output_keyword, "started");
        assert_eq!(b.stop_output_keyword, "started");
    }

    #[test]
    fn test_io_options_mode() {
        let o: IoOptions = serde_json::from_str(r#"{"mode":"Binary"}"#).unwrap();
        assert_eq!(o.mode, BodyMode::Binary);
        let o: IoOptions = serde_json::from_str(r#"{"Mode":"Text"}"#).unwrap();
        assert_eq!(o.mode, BodyMode::Text);
    }
}
