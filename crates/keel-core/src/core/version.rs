use crate::core::error::{KeelError, KeelResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Bundle and package version: `major.minor.micro.qualifier`.
///
/// Missing numeric components default to 0. The qualifier is compared
/// lexically and an absent qualifier sorts lowest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub micro: u64,
    pub qualifier: Option<String>,
}

impl Version {
    pub fn new(major: u64, minor: u64, micro: u64) -> Self {
        Self {
            major,
            minor,
            micro,
            qualifier: None,
        }
    }

    /// Create a new version with a qualifier
    pub fn with_qualifier(major: u64, minor: u64, micro: u64, qualifier: String) -> Self {
        Self {
            major,
            minor,
            micro,
            qualifier: Some(qualifier),
        }
    }

    /// The empty version `0.0.0`, used when a header omits the version.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Parse a version string (e.g., "1", "1.2", "1.2.3", "1.2.3.v20240101")
    pub fn parse(s: &str) -> KeelResult<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::zero());
        }

        let mut parts = s.splitn(4, '.');
        let mut numbers = [0u64; 3];
        for (i, slot) in numbers.iter_mut().enumerate() {
            match parts.next() {
                Some(part) => {
                    *slot = part.parse().map_err(|_| {
                        KeelError::Version(format!("Invalid version component {} in '{}'", i, s))
                    })?;
                }
                None => break,
            }
        }

        let qualifier = match parts.next() {
            Some(q) if q.is_empty() => {
                return Err(KeelError::Version(format!("Empty qualifier in '{}'", s)))
            }
            Some(q) => {
                if !q
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
                {
                    return Err(KeelError::Version(format!("Invalid qualifier in '{}'", s)));
                }
                Some(q.to_string())
            }
            None => None,
        };

        Ok(Self {
            major: numbers[0],
            minor: numbers[1],
            micro: numbers[2],
            qualifier,
        })
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.micro)
            .cmp(&(other.major, other.minor, other.micro))
            .then_with(|| {
                let a = self.qualifier.as_deref().unwrap_or("");
                let b = other.qualifier.as_deref().unwrap_or("");
                a.cmp(b)
            })
    }
}

impl std::hash::Hash for Version {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.major.hash(state);
        self.minor.hash(state);
        self.micro.hash(state);
        self.qualifier.as_deref().unwrap_or("").hash(state);
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)?;
        if let Some(ref q) = self.qualifier {
            write!(f, ".{}", q)?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = KeelError;

    fn from_str(s: &str) -> KeelResult<Self> {
        Self::parse(s)
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.to_string()
    }
}

impl TryFrom<String> for Version {
    type Error = KeelError;

    fn try_from(s: String) -> KeelResult<Self> {
        Self::parse(&s)
    }
}

/// Version interval. `[1.0,2.0)` includes 1.0 and excludes 2.0; a bare
/// version `1.0` means "1.0 or higher".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct VersionRange {
    pub floor: Version,
    pub floor_inclusive: bool,
    pub ceiling: Option<Version>,
    pub ceiling_inclusive: bool,
}

impl VersionRange {
    /// Every version: `[0.0.0,∞)`.
    pub fn any() -> Self {
        Self::at_least(Version::zero())
    }

    pub fn at_least(floor: Version) -> Self {
        Self {
            floor,
            floor_inclusive: true,
            ceiling: None,
            ceiling_inclusive: false,
        }
    }

    /// `[v,v]`
    pub fn exact(v: Version) -> Self {
        Self {
            floor: v.clone(),
            floor_inclusive: true,
            ceiling: Some(v),
            ceiling_inclusive: true,
        }
    }

    /// `[floor,ceiling)`
    pub fn half_open(floor: Version, ceiling: Version) -> Self {
        Self {
            floor,
            floor_inclusive: true,
            ceiling: Some(ceiling),
            ceiling_inclusive: false,
        }
    }

    /// Parse a range string (e.g., "1.0", "[1.0,2.0)", "(1.0,1.5]")
    pub fn parse(s: &str) -> KeelResult<Self> {
        let s = s.trim();
        let Some(first) = s.chars().next() else {
            return Ok(Self::any());
        };

        if first != '[' && first != '(' {
            return Ok(Self::at_least(Version::parse(s)?));
        }

        let last = s.chars().last().unwrap_or(first);
        if s.len() < 2 || (last != ']' && last != ')') {
            return Err(KeelError::Version(format!("Unterminated version range '{}'", s)));
        }

        let inner = &s[1..s.len() - 1];
        let (lower, upper) = inner
            .split_once(',')
            .ok_or_else(|| KeelError::Version(format!("Version range '{}' needs two bounds", s)))?;

        let floor = Version::parse(lower)?;
        let ceiling = Version::parse(upper)?;
        let range = Self {
            floor,
            floor_inclusive: first == '[',
            ceiling: Some(ceiling),
            ceiling_inclusive: last == ']',
        };

        if let Some(ref ceiling) = range.ceiling {
            if *ceiling < range.floor {
                return Err(KeelError::Version(format!(
                    "Version range '{}' has its ceiling below its floor",
                    s
                )));
            }
        }

        Ok(range)
    }

    /// Check if a version lies inside this range
    pub fn includes(&self, version: &Version) -> bool {
        let above_floor = if self.floor_inclusive {
            *version >= self.floor
        } else {
            *version > self.floor
        };
        if !above_floor {
            return false;
        }
        match self.ceiling {
            None => true,
            Some(ref ceiling) if self.ceiling_inclusive => version <= ceiling,
            Some(ref ceiling) => version < ceiling,
        }
    }
}

impl Default for VersionRange {
    fn default() -> Self {
        Self::any()
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ceiling {
            None => write!(f, "{}", self.floor),
            Some(ref ceiling) => write!(
                f,
                "{}{},{}{}",
                if self.floor_inclusive { '[' } else { '(' },
                self.floor,
                ceiling,
                if self.ceiling_inclusive { ']' } else { ')' }
            ),
        }
    }
}

impl FromStr for VersionRange {
    type Err = KeelError;

    fn from_str(s: &str) -> KeelResult<Self> {
        Self::parse(s)
    }
}

impl From<VersionRange> for String {
    fn from(r: VersionRange) -> Self {
        r.to_string()
    }
}

impl TryFrom<String> for VersionRange {
    type Error = KeelError;

    fn try_from(s: String) -> KeelResult<Self> {
        Self::parse(&s)
    }
}
