//! HTTP-like request and response shapes

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// Request body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestBody {
    /// Raw bytes (preferred)
    Bytes(Vec<u8>),

    /// Legacy text body, passed to the engine NUL-terminated
    Text(String),
}

impl RequestBody {
    /// Length of the buffer handed to the engine
    ///
    /// Text bodies carry a terminator byte.
    pub fn engine_len(&self) -> usize {
        match self {
            Self::Bytes(bytes) => bytes.len(),
            Self::Text(text) => text.len() + 1,
        }
    }

    /// Bytes written into engine memory
    pub fn to_engine_bytes(&self) -> Cow<'_, [u8]> {
        match self {
            Self::Bytes(bytes) => Cow::Borrowed(bytes),
            Self::Text(text) => {
                let mut bytes = Vec::with_capacity(text.len() + 1);
                bytes.extend_from_slice(text.as_bytes());
                bytes.push(0);
                Cow::Owned(bytes)
            }
        }
    }

    /// Length of the payload itself, as advertised in `content_length`
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Bytes(bytes) => bytes.len(),
            Self::Text(text) => text.len(),
        }
    }
}

/// Execution request
///
/// Exactly one of `code` and `script_path` must be set; the host rejects
/// anything else before touching engine state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "default_method")]
    pub method: String,

    /// URI relative to the document root, with optional query string
    #[serde(default = "default_uri")]
    pub relative_uri: String,

    /// URL scheme ("http" or "https")
    #[serde(default)]
    pub protocol: Option<String>,

    /// Header names are matched case-insensitively
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub body: Option<RequestBody>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Overrides merged over the synthesized server context
    #[serde(default)]
    pub server: BTreeMap<String, String>,

    /// Inline source to execute
    #[serde(default)]
    pub code: Option<String>,

    /// Path of a script inside the virtual filesystem
    #[serde(default)]
    pub script_path: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_uri() -> String {
    "/".to_string()
}

impl Default for Request {
    fn default() -> Self {
        Self {
            method: default_method(),
            relative_uri: default_uri(),
            protocol: None,
            headers: BTreeMap::new(),
            body: None,
            env: BTreeMap::new(),
            server: BTreeMap::new(),
            code: None,
            script_path: None,
        }
    }
}

impl Request {
    /// Create a request with the given method and URI
    pub fn new(method: impl Into<String>, relative_uri: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            relative_uri: relative_uri.into(),
            ..Default::default()
        }
    }

    /// Create a request that executes inline source
    pub fn with_code(code: impl Into<String>) -> Self {
        Self::default().code(code)
    }

    /// Create a request that executes a script from the virtual filesystem
    pub fn with_script(path: impl Into<String>) -> Self {
        Self::default().script_path(path)
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn uri(mut self, relative_uri: impl Into<String>) -> Self {
        self.relative_uri = relative_uri.into();
        self
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    /// Set a header, replacing any existing one that differs only in case
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.headers
            .retain(|existing, _| !existing.eq_ignore_ascii_case(&name));
        self.headers.insert(name, value.into());
        self
    }

    pub fn body(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.body = Some(RequestBody::Bytes(bytes.into()));
        self
    }

    /// Set a legacy text body
    pub fn text_body(mut self, text: impl Into<String>) -> Self {
        self.body = Some(RequestBody::Text(text.into()));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn server_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.server.insert(key.into(), value.into());
        self
    }

    pub fn code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn script_path(mut self, path: impl Into<String>) -> Self {
        self.script_path = Some(path.into());
        self
    }

    /// Look up a header value ignoring case
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Status and header lines written by the engine after a request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeadersRecord {
    #[serde(default = "default_status")]
    pub status: u16,

    /// Raw `Name: value` lines in emission order
    #[serde(default)]
    pub headers: Vec<String>,
}

fn default_status() -> u16 {
    200
}

impl HeadersRecord {
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Group header lines by lower-cased name, keeping repeated values in order
    pub fn header_map(&self) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for line in &self.headers {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim().to_ascii_lowercase();
            if name.is_empty() {
                continue;
            }
            map.entry(name).or_default().push(value.trim().to_string());
        }
        map
    }
}

/// Execution response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,

    /// Lower-cased header name to values in emission order
    pub headers: BTreeMap<String, Vec<String>>,

    pub body: Vec<u8>,

    /// Captured diagnostic stream
    pub errors: String,

    /// Raw engine exit code
    pub exit_code: i32,
}

impl Response {
    /// Status forced on any non-zero exit code
    pub const FAILURE_STATUS: u16 = 500;

    /// Assemble a response from what the engine left behind
    ///
    /// A non-zero exit code always yields status 500, whatever the program
    /// tried to set.
    pub fn from_parts(
        record: Option<HeadersRecord>,
        body: Vec<u8>,
        errors: String,
        exit_code: i32,
    ) -> Self {
        let record = record.unwrap_or_else(|| HeadersRecord {
            status: default_status(),
            headers: Vec::new(),
        });
        let status = if exit_code == 0 {
            record.status
        } else {
            Self::FAILURE_STATUS
        };
        Self {
            status,
            headers: record.header_map(),
            body,
            errors,
            exit_code,
        }
    }

    /// Body decoded as UTF-8, lossily
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Body parsed as JSON
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    /// First value of a header
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && (200..400).contains(&self.status)
    }
}
