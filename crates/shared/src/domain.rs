use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(TenantId);
id_newtype!(ChannelId);

/// Composite tenant+channel identifier scoping all session state.
///
/// Never reused across tenants; every registry, cache, and durable row is
/// keyed by this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub tenant_id: TenantId,
    pub channel_id: ChannelId,
}

impl SessionKey {
    pub fn new(tenant_id: TenantId, channel_id: ChannelId) -> Self {
        Self {
            tenant_id,
            channel_id,
        }
    }

    /// Canonical string form used as the durable primary key.
    pub fn storage_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tenant_id.0, self.channel_id.0)
    }
}

#[derive(Debug, Error)]
#[error("invalid session key '{0}': expected '<tenant>:<channel>'")]
pub struct ParseSessionKeyError(String);

impl FromStr for SessionKey {
    type Err = ParseSessionKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tenant, channel) = s
            .split_once(':')
            .ok_or_else(|| ParseSessionKeyError(s.to_string()))?;
        let tenant_id = tenant
            .parse::<i64>()
            .map_err(|_| ParseSessionKeyError(s.to_string()))?;
        let channel_id = channel
            .parse::<i64>()
            .map_err(|_| ParseSessionKeyError(s.to_string()))?;
        Ok(Self::new(TenantId(tenant_id), ChannelId(channel_id)))
    }
}

/// Categories of protocol key material held in the per-session cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyKind {
    PreKey,
    Session,
    SenderKey,
    AppStateSyncKey,
    AppStateSyncVersion,
    SenderKeyMemory,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::PreKey => "pre-key",
            KeyKind::Session => "session",
            KeyKind::SenderKey => "sender-key",
            KeyKind::AppStateSyncKey => "app-state-sync-key",
            KeyKind::AppStateSyncVersion => "app-state-sync-version",
            KeyKind::SenderKeyMemory => "sender-key-memory",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    QrPending,
    Connected,
    Closing,
    Reconnecting,
    LoggedOut,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::QrPending => "qr_pending",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::LoggedOut => "logged_out",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the protocol layer reported a connection closed.
///
/// `LoggedOut` is the only terminal cause; everything else feeds the
/// reconnect budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseCause {
    LoggedOut,
    ConnectionLost,
    StreamError,
    Replaced,
    TimedOut,
}

impl CloseCause {
    pub fn is_logged_out(&self) -> bool {
        matches!(self, CloseCause::LoggedOut)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CloseCause::LoggedOut => "logged_out",
            CloseCause::ConnectionLost => "connection_lost",
            CloseCause::StreamError => "stream_error",
            CloseCause::Replaced => "replaced",
            CloseCause::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
