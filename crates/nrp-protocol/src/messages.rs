use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

/// Wire protocol revision spoken on one tunnel connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolRevision {
    /// WebSocket traffic rides in HEADERS/DATA frames
    Legacy,
    /// Dedicated WS_HEADERS/WS_DATA frames
    #[default]
    Extended,
}

/// One exposed local service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpSetting {
    /// Subdomain under `subdomain_host`
    pub subdomain: String,
    /// Port of the local service on 127.0.0.1
    pub local_port: u16,
}

/// Reconnect backoff, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    pub min: u64,
    pub max: u64,
    pub factor: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            min: 1000,
            max: 30_000,
            factor: 2.0,
        }
    }
}

/// Client configuration, sent verbatim as the SETTINGS payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Tunnel server port
    pub bind_port: u16,
    /// Tunnel server host
    pub bind_host: String,
    /// Parent domain of every exposed subdomain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain_host: Option<String>,
    /// Connect timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Maximum consecutive reconnect attempts (0 or absent = unlimited)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
    #[serde(default)]
    pub protocol: ProtocolRevision,
    /// Exposed services by arbitrary name
    #[serde(default)]
    pub http: BTreeMap<String, HttpSetting>,
}

impl ClientSettings {
    /// Every public domain these settings expose, with its local port
    ///
    /// `fallback_host` is used when the settings carry no `subdomain_host`.
    pub fn domains(&self, fallback_host: Option<&str>) -> Vec<(String, u16)> {
        let Some(parent) = self.subdomain_host.as_deref().or(fallback_host) else {
            return Vec::new();
        };

        self.http
            .values()
            .map(|s| {
                (
                    format!("{}.{}", s.subdomain, parent).to_ascii_lowercase(),
                    s.local_port,
                )
            })
            .collect()
    }
}

/// Server reply to a SETTINGS frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsAck {
    pub id: u64,
}

/// Ordered header list, encoded as a JSON object
///
/// Repeated names are written as a JSON array, the same shape node-style
/// header objects use for `set-cookie`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList(pub Vec<(String, String)>);

impl HeaderList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for a case-insensitive name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Drop every value for a case-insensitive name
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when the headers form a complete WebSocket upgrade request
    ///
    /// Needs `Upgrade: websocket`, an `upgrade` token in `Connection` and a
    /// `Sec-WebSocket-Key`. A lone `Upgrade` header is plain HTTP.
    pub fn is_websocket_upgrade(&self) -> bool {
        let upgrade = self
            .get("upgrade")
            .map(|v| v.trim().eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        let connection = self
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("connection"))
            .any(|(_, v)| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")));
        upgrade && connection && self.get("sec-websocket-key").is_some()
    }
}

impl FromIterator<(String, String)> for HeaderList {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Serialize for HeaderList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // Group repeated names, keeping first-seen order
        let mut grouped: Vec<(&str, Vec<&str>)> = Vec::new();
        for (name, value) in &self.0 {
            match grouped.iter_mut().find(|(n, _)| *n == name.as_str()) {
                Some((_, values)) => values.push(value.as_str()),
                None => grouped.push((name.as_str(), vec![value.as_str()])),
            }
        }

        let mut map = serializer.serialize_map(Some(grouped.len()))?;
        for (name, values) in grouped {
            if let [single] = values.as_slice() {
                map.serialize_entry(name, single)?;
            } else {
                map.serialize_entry(name, &values)?;
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for HeaderList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Map::<String, serde_json::Value>::deserialize(deserializer)?;
        let mut headers = HeaderList::new();
        for (name, value) in raw {
            match value {
                serde_json::Value::Array(values) => {
                    for v in values {
                        headers.push(name.clone(), json_scalar(v));
                    }
                }
                serde_json::Value::Null => {}
                other => headers.push(name, json_scalar(other)),
            }
        }
        Ok(headers)
    }
}

fn json_scalar(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

/// HEADERS payload opening an exchange (edge → relay)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHead {
    /// Absent for WebSocket upgrades
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Path and query
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default)]
    pub headers: HeaderList,
}

fn default_path() -> String {
    "/".to_string()
}

/// HEADERS payload answering an exchange (relay → edge)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHead {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    #[serde(default)]
    pub headers: HeaderList,
}

/// Hop-by-hop headers that never cross the tunnel boundary
pub fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Wrap a WebSocket message for a WS data frame: 1-byte binary flag + body
pub fn encode_ws_message(binary: bool, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + data.len());
    buf.put_u8(u8::from(binary));
    buf.put_slice(data);
    buf.freeze()
}

/// Split a WS data payload into its binary flag and message body
///
/// An empty payload reads as an empty text message.
pub fn decode_ws_message(payload: &Bytes) -> (bool, Bytes) {
    match payload.first() {
        Some(flag) => (*flag == 1, payload.slice(1..)),
        None => (false, Bytes::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_handshake_json() {
        let json = r#"{
            "bind_port": 7000,
            "bind_host": "tunnel.example.com",
            "subdomain_host": "t.test",
            "backoff": {"min": 500, "max": 8000, "factor": 1.5},
            "http": {"a": {"subdomain": "a", "local_port": 8080}}
        }"#;
        let settings: ClientSettings = serde_json::from_str(json).unwrap();

        assert_eq!(settings.bind_port, 7000);
        assert_eq!(settings.protocol, ProtocolRevision::Extended);
        assert_eq!(settings.backoff.unwrap().min, 500);
        assert_eq!(
            settings.domains(None),
            vec![("a.t.test".to_string(), 8080)]
        );
    }

    #[test]
    fn test_domains_use_fallback_host() {
        let settings: ClientSettings = serde_json::from_str(
            r#"{"bind_port":1,"bind_host":"h","http":{"x":{"subdomain":"Web","local_port":3000}}}"#,
        )
        .unwrap();

        assert!(settings.domains(None).is_empty());
        assert_eq!(
            settings.domains(Some("example.com")),
            vec![("web.example.com".to_string(), 3000)]
        );
    }

    #[test]
    fn test_settings_ack_shape() {
        let json = serde_json::to_string(&SettingsAck { id: 3 }).unwrap();
        assert_eq!(json, r#"{"id":3}"#);
    }

    #[test]
    fn test_header_list_repeated_names() {
        let mut headers = HeaderList::new();
        headers.push("set-cookie", "a=1");
        headers.push("content-type", "text/plain");
        headers.push("set-cookie", "b=2");

        let json = serde_json::to_value(&headers).unwrap();
        assert_eq!(json["set-cookie"], serde_json::json!(["a=1", "b=2"]));
        assert_eq!(json["content-type"], "text/plain");

        let back: HeaderList = serde_json::from_value(json).unwrap();
        assert_eq!(back.len(), 3);
        assert_eq!(back.get("Content-Type"), Some("text/plain"));
    }

    #[test]
    fn test_header_list_accepts_numbers() {
        let headers: HeaderList =
            serde_json::from_str(r#"{"content-length": 12, "x-null": null}"#).unwrap();
        assert_eq!(headers.get("content-length"), Some("12"));
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_response_head_uses_status_code_key() {
        let head: ResponseHead =
            serde_json::from_str(r#"{"statusCode":201,"headers":{"x-a":"1"}}"#).unwrap();
        assert_eq!(head.status_code, 201);
        assert_eq!(head.headers.get("x-a"), Some("1"));
    }

    #[test]
    fn test_request_head_websocket_detection() {
        let head: RequestHead = serde_json::from_str(
            r#"{"path":"/ws","host":"a.t.test","headers":{"Upgrade":"WebSocket",
                "Connection":"keep-alive, Upgrade","Sec-WebSocket-Key":"dGhlIHNhbXBsZSBub25jZQ=="}}"#,
        )
        .unwrap();
        assert!(head.method.is_none());
        assert!(head.headers.is_websocket_upgrade());

        let lone: HeaderList = serde_json::from_str(r#"{"upgrade":"websocket"}"#).unwrap();
        assert!(!lone.is_websocket_upgrade());
    }

    #[test]
    fn test_ws_message_prefix() {
        let payload = encode_ws_message(true, &[9, 8]);
        assert_eq!(payload.as_ref(), &[1, 9, 8]);
        assert_eq!(decode_ws_message(&payload), (true, Bytes::from_static(&[9, 8])));

        let text = encode_ws_message(false, b"hi");
        assert_eq!(decode_ws_message(&text), (false, Bytes::from_static(b"hi")));
    }

    #[test]
    fn test_hop_by_hop() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("content-length"));
    }
}
