use std::ops::{Add, Mul};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Duration {
    #[serde(with = "iso8601_format")]
    delegate: std::time::Duration,
}

impl Duration {
    fn new(delegate: std::time::Duration) -> Self {
        Self { delegate }
    }

    pub fn zero() -> Self {
        Self::new(std::time::Duration::ZERO)
    }

    pub fn millis(millis: u64) -> Self {
        Self::new(std::time::Duration::from_millis(millis))
    }

    pub fn seconds(seconds: u64) -> Self {
        Self::new(std::time::Duration::from_secs(seconds))
    }

    pub fn minutes(minutes: u64) -> Self {
        Self::seconds(minutes * 60)
    }

    pub fn hours(hours: u64) -> Self {
        Self::seconds(hours * 3600)
    }

    pub fn is_zero(&self) -> bool {
        self.delegate.is_zero()
    }

    pub fn as_secs(&self) -> u64 {
        self.delegate.as_secs()
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.delegate.as_secs_f64()
    }

    pub fn as_millis(&self) -> u128 {
        self.delegate.as_millis()
    }

    pub fn saturating_mul(&self, factor: u32) -> Self {
        Self::new(self.delegate.saturating_mul(factor))
    }

    pub fn to_iso_string(&self) -> String {
        format_iso(&self.delegate)
    }
}

impl Add<Duration> for Duration {
    type Output = Duration;

    fn add(self, rhs: Duration) -> Self::Output {
        Self::new(self.delegate.saturating_add(rhs.delegate))
    }
}

impl Mul<u32> for Duration {
    type Output = Duration;

    fn mul(self, rhs: u32) -> Self::Output {
        self.saturating_mul(rhs)
    }
}

impl From<Duration> for std::time::Duration {
    fn from(val: Duration) -> Self {
        val.delegate
    }
}

impl From<std::time::Duration> for Duration {
    fn from(delegate: std::time::Duration) -> Self {
        Self::new(delegate)
    }
}

impl std::fmt::Display for Duration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_iso_string())
    }
}

fn format_iso(duration: &std::time::Duration) -> String {
    let mut total = duration.as_secs_f64();

    if total == 0.0 {
        return "PT0S".to_string();
    }

    let mut result = "PT".to_string();

    let hours = (total / 3600.0).floor();
    if hours > 0.0 {
        result.push_str(&format!("{}H", hours as u64));
        total -= hours * 3600.0;
    }

    let minutes = (total / 60.0).floor();
    if minutes > 0.0 {
        result.push_str(&format!("{}M", minutes as u64));
        total -= minutes * 60.0;
    }

    if total > 0.0 {
        if total.fract() == 0.0 {
            result.push_str(&format!("{}S", total as u64));
        } else {
            result.push_str(&format!("{}S", total));
        }
    }

    result
}

fn parse_iso(raw: &str) -> anyhow::Result<std::time::Duration> {
    let parsed = iso8601_duration::Duration::parse(raw)
        .map_err(|e| anyhow::anyhow!("Error parsing ISO-8601 duration {:?}: {:?}", raw, e))?;

    //Calendar parts use the mean Gregorian month/year lengths
    let seconds = parsed.second as f64
        + parsed.minute as f64 * 60.0
        + parsed.hour as f64 * 3600.0
        + parsed.day as f64 * 86_400.0
        + parsed.month as f64 * 2_629_800.0
        + parsed.year as f64 * 31_557_600.0;

    anyhow::ensure!(
        seconds.is_finite() && seconds >= 0.0,
        "Duration {:?} is not a non-negative amount of time",
        raw
    );

    Ok(std::time::Duration::from_secs_f64(seconds))
}

mod iso8601_format {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &std::time::Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_iso(duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<std::time::Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        super::parse_iso(&raw).map_err(serde::de::Error::custom)
    }
}
