//! Audio session discovery.
//!
//! A session is one controllable endpoint on the host sound server: the
//! master output or input, an application's playback stream, or (under the
//! extended policy) a hardware device.

pub mod pulse;

use thiserror::Error;

use crate::targets::{INPUT_TARGET, MASTER_TARGET};

/// One controllable audio endpoint.
///
/// Identity is the server-assigned index plus channel count, and it is only
/// meaningful within the enumeration call that produced it - sessions come
/// and go with the applications behind them, so callers never retain these
/// across calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Session {
    /// The system-wide output (`output: true`) or input endpoint.
    Master {
        output: bool,
        index: u32,
        channels: u8,
    },
    /// One application's playback stream.
    Application {
        name: String,
        index: u32,
        channels: u8,
    },
    /// A hardware endpoint, addressable under the extended policy.
    Device {
        name: String,
        index: u32,
        channels: u8,
    },
}

impl Session {
    /// Display name used for target matching.
    pub fn display_name(&self) -> &str {
        match self {
            Session::Master { output: true, .. } => MASTER_TARGET,
            Session::Master { output: false, .. } => INPUT_TARGET,
            Session::Application { name, .. } | Session::Device { name, .. } => name,
        }
    }

    pub fn index(&self) -> u32 {
        match self {
            Session::Master { index, .. }
            | Session::Application { index, .. }
            | Session::Device { index, .. } => *index,
        }
    }

    pub fn channels(&self) -> u8 {
        match self {
            Session::Master { channels, .. }
            | Session::Application { channels, .. }
            | Session::Device { channels, .. } => *channels,
        }
    }
}

/// How discovered streams and endpoints are named for target matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchingPolicy {
    /// Streams are named after their process binary; hardware endpoints are
    /// not exposed.
    #[default]
    Legacy,
    /// Streams get composite media/application names and hardware endpoints
    /// become addressable targets of their own.
    Extended,
}

impl MatchingPolicy {
    /// Parse the configured policy string: "default" selects the legacy
    /// naming, anything else opts into the extended behavior.
    pub fn from_config(value: &str) -> Self {
        if value.is_empty() || value == "default" {
            Self::Legacy
        } else {
            Self::Extended
        }
    }
}

/// Errors from the session directory.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The connect-and-register handshake with the sound server failed.
    #[error("failed to establish audio server connection: {0}")]
    Connect(String),

    /// A request/reply round trip failed.
    #[error("audio server request failed: {0}")]
    Request(String),

    /// The structurally required stream enumeration failed.
    #[error("failed to enumerate audio streams: {0}")]
    Enumerate(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_string_selects_matching() {
        assert_eq!(MatchingPolicy::from_config("default"), MatchingPolicy::Legacy);
        assert_eq!(MatchingPolicy::from_config(""), MatchingPolicy::Legacy);
        assert_eq!(
            MatchingPolicy::from_config("extended"),
            MatchingPolicy::Extended
        );
        assert_eq!(
            MatchingPolicy::from_config("anything-else"),
            MatchingPolicy::Extended
        );
    }

    #[test]
    fn master_sessions_use_reserved_names() {
        let output = Session::Master {
            output: true,
            index: 0,
            channels: 2,
        };
        let input = Session::Master {
            output: false,
            index: 1,
            channels: 1,
        };

        assert_eq!(output.display_name(), "master");
        assert_eq!(input.display_name(), "mic");
        assert_eq!(output.channels(), 2);
        assert_eq!(input.index(), 1);
    }
}
