//! Named job queues.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// A named partition of jobs with its own polling cadence and concurrency ceiling.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Queue {
    Default,
    High,
    Low,
    Bulk,
    Screenshot,
}

impl Queue {
    /// Every queue, in the order worker loops are started.
    pub const ALL: [Queue; 5] = [
        Queue::High,
        Queue::Default,
        Queue::Screenshot,
        Queue::Low,
        Queue::Bulk,
    ];

    /// Persisted/wire name of the queue.
    pub fn as_str(&self) -> &'static str {
        match self {
            Queue::Default => "DEFAULT",
            Queue::High => "HIGH",
            Queue::Low => "LOW",
            Queue::Bulk => "BULK",
            Queue::Screenshot => "SCREENSHOT",
        }
    }
}

impl core::fmt::Display for Queue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Queue {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEFAULT" => Ok(Queue::Default),
            "HIGH" => Ok(Queue::High),
            "LOW" => Ok(Queue::Low),
            "BULK" => Ok(Queue::Bulk),
            "SCREENSHOT" => Ok(Queue::Screenshot),
            _ => Err(DomainError::UnknownQueue(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("screenshot".parse::<Queue>().unwrap(), Queue::Screenshot);
        assert_eq!(" BULK ".parse::<Queue>().unwrap(), Queue::Bulk);
    }

    #[test]
    fn unknown_queue_is_rejected() {
        assert!(matches!(
            "urgent".parse::<Queue>(),
            Err(DomainError::UnknownQueue(_))
        ));
    }

    #[test]
    fn serde_uses_wire_names() {
        for q in Queue::ALL {
            let json = serde_json::to_string(&q).unwrap();
            assert_eq!(json, format!("\"{}\"", q.as_str()));
        }
    }
}
