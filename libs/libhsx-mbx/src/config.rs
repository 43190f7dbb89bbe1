//! Engine resource limits

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::abi::DEFAULT_RING_CAPACITY;

/// Mailbox engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxConfig {
    /// Maximum number of live mailboxes
    #[serde(default = "default_max_descriptors")]
    pub max_descriptors: usize,

    /// Maximum open handles per task
    #[serde(default = "default_handle_limit")]
    pub handle_limit_per_pid: usize,

    /// Ring capacity for implicitly bound mailboxes (bytes)
    #[serde(default = "default_capacity")]
    pub default_capacity: u16,

    /// Largest capacity BIND accepts (bytes)
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u16,

    /// Buffered events per subscriber before slow listeners lag
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Profile::Desktop.config()
    }
}

impl MailboxConfig {
    /// Clamp inconsistent limits into a usable configuration
    pub fn normalized(mut self) -> Self {
        self.max_descriptors = self.max_descriptors.max(1);
        self.handle_limit_per_pid = self.handle_limit_per_pid.max(1);
        self.event_capacity = self.event_capacity.max(1);
        self.max_capacity = self.max_capacity.max(1);
        if self.default_capacity == 0 || self.default_capacity > self.max_capacity {
            self.default_capacity = DEFAULT_RING_CAPACITY.min(self.max_capacity);
        }
        self
    }
}

/// Named resource profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    #[default]
    Desktop,
    Embedded,
}

impl Profile {
    pub fn config(self) -> MailboxConfig {
        match self {
            Self::Desktop => MailboxConfig {
                max_descriptors: 256,
                handle_limit_per_pid: 64,
                default_capacity: DEFAULT_RING_CAPACITY,
                max_capacity: 16384,
                event_capacity: default_event_capacity(),
            },
            Self::Embedded => MailboxConfig {
                max_descriptors: 16,
                handle_limit_per_pid: 8,
                default_capacity: DEFAULT_RING_CAPACITY,
                max_capacity: 1024,
                event_capacity: 64,
            },
        }
    }
}

impl FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "desktop" => Ok(Self::Desktop),
            "embedded" => Ok(Self::Embedded),
            other => Err(format!("unknown mailbox profile: {}", other)),
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Desktop => "desktop",
            Self::Embedded => "embedded",
        })
    }
}

// Default value functions
fn default_max_descriptors() -> usize {
    256
}

fn default_handle_limit() -> usize {
    64
}

fn default_capacity() -> u16 {
    DEFAULT_RING_CAPACITY
}

fn default_max_capacity() -> u16 {
    16384
}

fn default_event_capacity() -> usize {
    1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiles() {
        let embedded: Profile = "Embedded".parse().unwrap();
        let cfg = embedded.config();
        assert_eq!(cfg.max_descriptors, 16);
        assert_eq!(cfg.handle_limit_per_pid, 8);
        assert_eq!(cfg.max_capacity, 1024);
        assert_eq!(MailboxConfig::default(), Profile::Desktop.config());
        assert!("tiny".parse::<Profile>().is_err());
    }

    #[test]
    fn test_normalized() {
        let cfg = MailboxConfig {
            max_descriptors: 0,
            handle_limit_per_pid: 0,
            default_capacity: 4096,
            max_capacity: 256,
            event_capacity: 0,
        }
        .normalized();
        assert_eq!(cfg.max_descriptors, 1);
        assert_eq!(cfg.handle_limit_per_pid, 1);
        assert_eq!(cfg.default_capacity, 64);
        assert_eq!(cfg.event_capacity, 1);
    }
}
