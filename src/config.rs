//! The "URL / configuration carrier" external collaborator.
//!
//! `spec.md` treats this as read-only from the core's perspective: host,
//! port, group, and a bag of named timeout/int parameters. `MotanUrl` is a
//! concrete, minimal implementation so the rest of the crate has something to
//! construct and test against; a real deployment would build one of these
//! from whatever service-discovery layer it uses.

use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 1000;
const DEFAULT_GZIP_SIZE: i64 = 0;

#[derive(Clone, Debug, Default)]
pub struct MotanUrl {
    host: String,
    port: u16,
    group: Option<String>,
    params: HashMap<String, String>,
}

impl MotanUrl {
    pub fn new(host: impl Into<String>, port: u16) -> MotanUrl {
        MotanUrl {
            host: host.into(),
            port,
            group: None,
            params: HashMap::new(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> MotanUrl {
        self.group = Some(group.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> MotanUrl {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    fn duration_param_ms(&self, key: &str, default_ms: u64) -> Duration {
        let ms = self
            .param(key)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(default_ms);
        Duration::from_millis(ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        self.duration_param_ms("connectTimeout", DEFAULT_CONNECT_TIMEOUT_MS)
    }

    pub fn request_timeout(&self) -> Duration {
        self.duration_param_ms("requestTimeout", DEFAULT_REQUEST_TIMEOUT_MS)
    }

    pub fn gzip_size(&self) -> i64 {
        self.param("gzipSize")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(DEFAULT_GZIP_SIZE)
    }
}
