use chrono::{DateTime, Utc};
use std::{fmt, net::IpAddr, time::Duration};

/// Bucket shared by every request whose identity cannot be determined
pub const SHARED_BUCKET: &str = "anonymous";

/// Time utilities for event timestamps
pub struct TimeSource {
    _private: (),
}

impl TimeSource {
    pub fn new() -> Self {
        Self { _private: () }
    }

    /// Get the current time as a DateTime<Utc>
    pub fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl Default for TimeSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity a request is limited under
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(String);

impl ClientKey {
    /// Authenticated user id, else the first `X-Forwarded-For` hop, else the
    /// peer address. Blank candidates are skipped; if none remain the
    /// request falls into the shared bucket.
    pub fn resolve(
        user_id: Option<&str>,
        forwarded_for: Option<&str>,
        peer: Option<IpAddr>,
    ) -> Self {
        let user = user_id.map(str::trim).filter(|u| !u.is_empty());
        let forwarded = forwarded_for
            .and_then(|chain| chain.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty());

        match (user, forwarded, peer) {
            (Some(user), _, _) => Self(user.to_string()),
            (None, Some(hop), _) => Self(hop.to_string()),
            (None, None, Some(ip)) => Self(ip.to_string()),
            (None, None, None) => Self::shared(),
        }
    }

    pub fn shared() -> Self {
        Self(SHARED_BUCKET.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientKey {
    fn from(value: &str) -> Self {
        Self::resolve(Some(value), None, None)
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whole seconds a client should wait, rounded up and never zero
pub fn retry_after_secs(remaining: Duration) -> u64 {
    let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
    secs.max(1)
}
