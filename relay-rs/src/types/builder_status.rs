/// Builder standing as read on the submission fast path. A blacklist entry
/// always wins over high-prio.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuilderStatus {
    #[default]
    Normal,
    HighPrio,
    Blacklisted,
}

impl BuilderStatus {
    pub fn from_flags(is_high_prio: bool, is_blacklisted: bool) -> Self {
        if is_blacklisted {
            Self::Blacklisted
        } else if is_high_prio {
            Self::HighPrio
        } else {
            Self::Normal
        }
    }

    pub fn is_high_prio(&self) -> bool {
        matches!(self, Self::HighPrio)
    }

    pub fn is_blacklisted(&self) -> bool {
        matches!(self, Self::Blacklisted)
    }
}

impl std::fmt::Display for BuilderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::HighPrio => write!(f, "high-prio"),
            Self::Blacklisted => write!(f, "blacklisted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blacklist_overrides_high_prio() {
        assert_eq!(BuilderStatus::from_flags(true, true), BuilderStatus::Blacklisted);
        assert_eq!(BuilderStatus::from_flags(true, false), BuilderStatus::HighPrio);
        assert_eq!(BuilderStatus::from_flags(false, false), BuilderStatus::Normal);
    }
}
