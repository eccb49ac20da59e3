//! Session configuration
//!
//! Controls the acceptor's advertised service name, the worker's read buffer,
//! unit thread naming, and whether a failed write ends the session.

use serde::{Deserialize, Serialize};

use crate::session::error::SessionError;

/// Default read buffer size for the duplex worker
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

/// Largest accepted read buffer size
pub const MAX_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Default service name the acceptor is advertised under
pub const DEFAULT_SERVICE_NAME: &str = "LinkwireSession";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Name passed to `Transport::bind`
    pub service_name: String,
    /// Bytes requested per blocking read (default 1024)
    pub read_buffer_size: usize,
    /// Unit threads are named `<prefix>-accept`, `<prefix>-connect`, `<prefix>-read`
    pub thread_name_prefix: String,
    /// Treat a failed write like a failed read and drop the connection
    pub end_session_on_write_failure: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            thread_name_prefix: "linkwire".to_string(),
            end_session_on_write_failure: false,
        }
    }
}

impl SessionConfig {
    /// Set the advertised service name
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Set the read buffer size
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set the thread name prefix
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// End the session when a write fails
    pub fn with_end_session_on_write_failure(mut self, enabled: bool) -> Self {
        self.end_session_on_write_failure = enabled;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.service_name.trim().is_empty() {
            return Err(SessionError::InvalidConfig(
                "service_name must not be empty".to_string(),
            ));
        }
        if self.read_buffer_size == 0 || self.read_buffer_size > MAX_READ_BUFFER_SIZE {
            return Err(SessionError::InvalidConfig(format!(
                "read_buffer_size must be within 1..={}, got {}",
                MAX_READ_BUFFER_SIZE, self.read_buffer_size
            )));
        }
        if self.thread_name_prefix.contains('\0') {
            return Err(SessionError::InvalidConfig(
                "thread_name_prefix must not contain NUL".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn thread_name(&self, role: &str) -> String {
        format!("{}-{}", self.thread_name_prefix, role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = SessionConfig::default();
        assert_eq!(config.read_buffer_size, 1024);
        assert_eq!(config.service_name, DEFAULT_SERVICE_NAME);
        assert!(!config.end_session_on_write_failure);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = SessionConfig::default()
            .with_service_name("BluetoothChat")
            .with_read_buffer_size(4096)
            .with_thread_name_prefix("bt")
            .with_end_session_on_write_failure(true);

        assert_eq!(config.service_name, "BluetoothChat");
        assert_eq!(config.read_buffer_size, 4096);
        assert_eq!(config.thread_name("read"), "bt-read");
        assert!(config.end_session_on_write_failure);
    }

    #[test]
    fn test_config_validation_buffer_size() {
        assert!(SessionConfig::default()
            .with_read_buffer_size(0)
            .validate()
            .is_err());
        assert!(SessionConfig::default()
            .with_read_buffer_size(MAX_READ_BUFFER_SIZE + 1)
            .validate()
            .is_err());
        assert!(SessionConfig::default()
            .with_read_buffer_size(MAX_READ_BUFFER_SIZE)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_config_validation_service_name() {
        let result = SessionConfig::default().with_service_name(" ").validate();
        assert!(matches!(result, Err(SessionError::InvalidConfig(_))));
    }

    #[test]
    fn test_config_partial_json_uses_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"read_buffer_size": 2048}"#).expect("parse");
        assert_eq!(config.read_buffer_size, 2048);
        assert_eq!(config.service_name, DEFAULT_SERVICE_NAME);
    }
}
