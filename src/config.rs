//! Session configuration.

use crate::error::{Error, Result};
use crate::protocol::v4::Will;
use crate::protocol::MAX_PACKET_SIZE;

/// Default capacity of the outbound frame queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;

/// Session configuration.
///
/// Immutable once the session is established.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Broker address (host:port).
    pub addr: String,
    /// Client ID.
    pub client_id: String,
    /// Keep alive interval in seconds. 0 disables keep-alive pings.
    pub keep_alive: u16,
    /// Clean session flag.
    pub clean_session: bool,
    /// Last Will and Testament.
    pub will: Option<Will>,
    /// Username for authentication.
    pub username: Option<String>,
    /// Password for authentication.
    pub password: Option<Vec<u8>>,
    /// Maximum packet size.
    pub max_packet_size: usize,
    /// Capacity of the outbound frame queue. Producers block when full.
    pub queue_capacity: usize,
}

impl SessionConfig {
    /// Create a new session config.
    pub fn new(addr: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            client_id: client_id.into(),
            keep_alive: 60,
            clean_session: true,
            will: None,
            username: None,
            password: None,
            max_packet_size: MAX_PACKET_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Set credentials.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<Vec<u8>>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set keep alive interval.
    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set clean session flag.
    pub fn with_clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    /// Set the Last Will and Testament.
    pub fn with_will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }

    /// Set maximum packet size.
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Set the outbound frame queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() {
            return Err(Error::InvalidConfig("client_id must not be empty".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::InvalidConfig("queue_capacity must be positive".to_string()));
        }
        Ok(())
    }
}
