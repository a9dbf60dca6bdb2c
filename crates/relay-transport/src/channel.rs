use std::fmt;
use std::str::FromStr;

use relay_settings::EndpointSettings;

use crate::error::TransportError;

/// The logical channels carried by the transport. Each has its own address.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum Channel {
    /// Job and ad-hoc command events from running jobs.
    Callbacks,
    /// Host facts gathered during a run.
    FactCache,
    /// Packets for live browser clients.
    Notifications,
}

impl Channel {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Callbacks => "callbacks",
            Self::FactCache => "fact_cache",
            Self::Notifications => "websocket-notifications",
        }
    }

    /// The configured address for this channel.
    pub fn endpoint(self, endpoints: &EndpointSettings) -> &str {
        match self {
            Self::Callbacks => &endpoints.callbacks,
            Self::FactCache => &endpoints.fact_cache,
            Self::Notifications => &endpoints.notifications,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Channel {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "callbacks" => Ok(Self::Callbacks),
            "fact_cache" => Ok(Self::FactCache),
            "websocket-notifications" => Ok(Self::Notifications),
            other => Err(TransportError::UnknownChannel(other.to_string())),
        }
    }
}
