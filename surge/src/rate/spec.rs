//! Parsing of the textual rate and duration formats.
use std::{fmt, str::FromStr, time::Duration};

use crate::error::ConfigError;

/// A count of iterations per unit of time, written `<count>/<duration>`.
///
/// The duration part may be a full duration (`100ms`, `2s`, `1m30s`), a bare
/// unit meaning one of it (`s`, `ms`, `m`, `h`), or omitted entirely, in which
/// case it defaults to one second.
///
/// ```rust
/// use std::time::Duration;
/// use surge::rate::RateSpec;
///
/// let spec: RateSpec = "10/100ms".parse().unwrap();
/// assert_eq!(spec.count, 10);
/// assert_eq!(spec.unit, Duration::from_millis(100));
///
/// let spec: RateSpec = "7".parse().unwrap();
/// assert_eq!(spec.unit, Duration::from_secs(1));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateSpec {
    pub count: u64,
    pub unit: Duration,
}

impl RateSpec {
    pub fn new(count: u64, unit: Duration) -> Self {
        Self { count, unit }
    }
}

impl FromStr for RateSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidRate(s.to_string());
        let (count, unit) = match s.trim().split_once('/') {
            Some((_, unit)) if unit.trim().is_empty() => return Err(invalid()),
            Some((count, unit)) => (count.trim(), unit.trim()),
            None => (s.trim(), ""),
        };
        let count = count.parse::<u64>().map_err(|_| invalid())?;
        let unit = if unit.is_empty() {
            Duration::from_secs(1)
        } else if unit.starts_with(|c: char| c.is_ascii_digit()) {
            parse_duration(unit).map_err(|_| invalid())?
        } else {
            parse_duration(&format!("1{unit}")).map_err(|_| invalid())?
        };
        if unit.is_zero() {
            return Err(invalid());
        }
        Ok(Self { count, unit })
    }
}

impl fmt::Display for RateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.count, humantime::format_duration(self.unit))
    }
}

/// Parse a human readable duration such as `100ms`, `10s` or `1m30s`.
pub fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value.trim()).map_err(|e| ConfigError::InvalidDuration {
        value: value.to_string(),
        reason: e.to_string(),
    })
}
