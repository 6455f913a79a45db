use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Network family that partitions every chain and rule key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Ipv4,
    Ipv6,
    Eb,
}

impl Family {
    pub const ALL: [Family; 3] = [Family::Ipv4, Family::Ipv6, Family::Eb];

    pub fn as_str(&self) -> &'static str {
        match self {
            Family::Ipv4 => "ipv4",
            Family::Ipv6 => "ipv6",
            Family::Eb => "eb",
        }
    }

    /// Chains the backend provides without an explicit add
    pub fn builtin_chains(&self) -> &'static [&'static str] {
        match self {
            Family::Ipv4 | Family::Ipv6 => {
                &["INPUT", "OUTPUT", "FORWARD", "PREROUTING", "POSTROUTING"]
            }
            Family::Eb => &[
                "INPUT",
                "OUTPUT",
                "FORWARD",
                "PREROUTING",
                "POSTROUTING",
                "BROUTING",
            ],
        }
    }

    pub fn is_builtin_chain(&self, chain: &str) -> bool {
        self.builtin_chains().contains(&chain)
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Family {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ipv4" => Ok(Family::Ipv4),
            "ipv6" => Ok(Family::Ipv6),
            "eb" => Ok(Family::Eb),
            other => Err(Error::InvalidArgument(format!(
                "unknown family '{}' (expected ipv4, ipv6 or eb)",
                other
            ))),
        }
    }
}
