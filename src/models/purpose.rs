use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Named role used to pick the model and endpoint that serve a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    Chat,
    Insert,
    Summary,
    Agent,
    Autocompletion,
}

impl Purpose {
    pub const ALL: [Purpose; 5] = [
        Purpose::Chat,
        Purpose::Insert,
        Purpose::Summary,
        Purpose::Agent,
        Purpose::Autocompletion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Chat => "chat",
            Purpose::Insert => "insert",
            Purpose::Summary => "summary",
            Purpose::Agent => "agent",
            Purpose::Autocompletion => "autocompletion",
        }
    }

    /// Only these paths report failures to the end user; everything else is
    /// best-effort.
    pub fn is_user_facing(&self) -> bool {
        matches!(self, Purpose::Chat | Purpose::Agent)
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Purpose {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Purpose::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| format!("unknown purpose: {value}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_names() {
        assert_eq!("Agent".parse::<Purpose>().unwrap(), Purpose::Agent);
        assert_eq!(" summary ".parse::<Purpose>().unwrap(), Purpose::Summary);
        assert!("merge".parse::<Purpose>().is_err());
    }

    #[test]
    fn test_user_facing() {
        assert!(Purpose::Chat.is_user_facing());
        assert!(!Purpose::Insert.is_user_facing());
    }
}
