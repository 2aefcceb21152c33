//! Envelope protocol versions.

use serde::Deserialize;
use serde::Serialize;

/// `major.minor` envelope version. Versions sharing a major are compatible;
/// the minor only adds optional fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const V1_0: ProtocolVersion = ProtocolVersion::new(1, 0);
    pub const V1_1: ProtocolVersion = ProtocolVersion::new(1, 1);
    pub const CURRENT: ProtocolVersion = ProtocolVersion::V1_1;

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn is_compatible_with(self, other: ProtocolVersion) -> bool {
        self.major == other.major
    }

    /// Highest version both sides can speak: for every shared major, the
    /// smaller of the two highest minors each side offers.
    pub fn highest_common(ours: &[ProtocolVersion], theirs: &[ProtocolVersion]) -> Option<Self> {
        let mut best: Option<ProtocolVersion> = None;
        for mine in ours {
            for other in theirs.iter().filter(|v| v.is_compatible_with(*mine)) {
                let candidate = ProtocolVersion::new(mine.major, mine.minor.min(other.minor));
                if best.is_none_or(|current| candidate > current) {
                    best = Some(candidate);
                }
            }
        }
        best
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl std::str::FromStr for ProtocolVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .trim()
            .split_once('.')
            .ok_or_else(|| format!("protocol version `{s}` is not major.minor"))?;
        let major = major
            .parse()
            .map_err(|e| format!("bad major in protocol version `{s}`: {e}"))?;
        let minor = minor
            .parse()
            .map_err(|e| format!("bad minor in protocol version `{s}`: {e}"))?;
        Ok(Self { major, minor })
    }
}

impl TryFrom<String> for ProtocolVersion {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProtocolVersion> for String {
    fn from(version: ProtocolVersion) -> Self {
        version.to_string()
    }
}
