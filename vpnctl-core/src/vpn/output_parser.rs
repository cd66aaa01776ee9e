//! Pattern-based parser for transport output
//!
//! Turns lines printed by the tunnel transport (OpenVPN by default) into
//! [`TransportEvent`]s the process watcher acts on.

use regex::Regex;

/// Default pattern signalling the tunnel is fully up
pub const DEFAULT_UP_PATTERN: &str = r"Initialization Sequence Completed";

/// Something the transport reported on stdout/stderr
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Tunnel is routing traffic
    Up,
    /// TUN/TAP device opened
    DeviceOpened { device: String },
    /// Control channel established with the remote
    PeerConnected { remote: String },
    /// Credentials rejected
    AuthenticationFailed,
    /// Unrecoverable error; the transport is about to exit
    Fatal { message: String },
    /// Anything else
    Output { line: String },
}

/// Parser for transport output
pub struct OutputParser {
    /// Pattern for the "tunnel is up" line
    up_pattern: Regex,
    /// Pattern for "TUN/TAP device tun0 opened"
    device_pattern: Regex,
    /// Pattern for "Peer Connection Initiated with [AF_INET]1.2.3.4:1194"
    peer_pattern: Regex,
    /// Pattern for authentication failures
    auth_failed_pattern: Regex,
    /// Pattern for errors the transport does not recover from
    fatal_pattern: Regex,
}

impl OutputParser {
    /// Create a parser with the default OpenVPN patterns
    pub fn new() -> Self {
        Self::with_up_pattern(DEFAULT_UP_PATTERN).expect("Failed to compile up pattern")
    }

    /// Create a parser recognising a custom "tunnel is up" line
    pub fn with_up_pattern(up_pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            up_pattern: Regex::new(up_pattern)?,
            device_pattern: Regex::new(r"TUN/TAP device (\S+) opened")
                .expect("Failed to compile device pattern"),
            peer_pattern: Regex::new(r"Peer Connection Initiated with (?:\[AF_INET6?\])?(\S+)")
                .expect("Failed to compile peer pattern"),
            auth_failed_pattern: Regex::new(r"(?i)auth_failed|authentication failed")
                .expect("Failed to compile auth_failed pattern"),
            fatal_pattern: Regex::new(
                r"(?i)(exiting due to fatal error|cannot resolve host address|options error|cannot open tun/tap|cannot allocate tun/tap).*",
            )
            .expect("Failed to compile fatal pattern"),
        })
    }

    /// Parse a single output line
    pub fn parse_line(&self, line: &str) -> TransportEvent {
        let line = line.trim();

        if self.up_pattern.is_match(line) {
            return TransportEvent::Up;
        }

        if self.auth_failed_pattern.is_match(line) {
            return TransportEvent::AuthenticationFailed;
        }

        if let Some(m) = self.fatal_pattern.find(line) {
            return TransportEvent::Fatal {
                message: m.as_str().to_string(),
            };
        }

        if let Some(captures) = self.device_pattern.captures(line) {
            return TransportEvent::DeviceOpened {
                device: captures[1].to_string(),
            };
        }

        if let Some(captures) = self.peer_pattern.captures(line) {
            return TransportEvent::PeerConnected {
                remote: captures[1].to_string(),
            };
        }

        TransportEvent::Output {
            line: line.to_string(),
        }
    }
}

impl Default for OutputParser {
    fn default() -> Self {
        Self::new()
    }
}
