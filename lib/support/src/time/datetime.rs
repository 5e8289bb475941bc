use std::ops::{Add, Sub};

use super::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct DateTime {
    delegate: chrono::DateTime<chrono::Utc>,
}

impl DateTime {
    fn new(delegate: chrono::DateTime<chrono::Utc>) -> Self {
        Self { delegate }
    }

    pub fn now() -> Self {
        Self::new(chrono::Utc::now())
    }

    pub fn from_iso(iso8601: &str) -> anyhow::Result<Self> {
        Ok(Self::new(
            chrono::DateTime::parse_from_rfc3339(iso8601)?.with_timezone(&chrono::Utc),
        ))
    }

    /// Time passed since this instant, zero if it lies in the future.
    pub fn elapsed(&self) -> Duration {
        DateTime::now().elapsed_since(*self)
    }

    pub fn elapsed_since(&self, earlier: DateTime) -> Duration {
        (self.delegate - earlier.delegate)
            .to_std()
            .unwrap_or_default()
            .into()
    }

    pub fn to_iso_string(&self) -> String {
        self.delegate.to_rfc3339()
    }
}

impl Add<Duration> for DateTime {
    type Output = DateTime;

    fn add(self, rhs: Duration) -> Self::Output {
        Self::new(self.delegate + to_chrono(rhs))
    }
}

impl Sub<Duration> for DateTime {
    type Output = DateTime;

    fn sub(self, rhs: Duration) -> Self::Output {
        Self::new(self.delegate - to_chrono(rhs))
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration.into()).unwrap_or(chrono::Duration::MAX)
}

impl std::fmt::Display for DateTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_iso_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_since() {
        let earlier = DateTime::from_iso("2026-01-01T10:00:00Z").unwrap();
        let later = DateTime::from_iso("2026-01-01T10:05:00Z").unwrap();

        assert_eq!(later.elapsed_since(earlier), Duration::minutes(5));
    }

    #[test]
    fn test_elapsed_since_saturates() {
        let earlier = DateTime::from_iso("2026-01-01T10:00:00Z").unwrap();
        let later = DateTime::from_iso("2026-01-01T10:05:00Z").unwrap();

        assert_eq!(earlier.elapsed_since(later), Duration::zero());
    }

    #[test]
    fn test_add_duration() {
        let start = DateTime::from_iso("2026-01-01T10:00:00Z").unwrap();
        let end = DateTime::from_iso("2026-01-01T10:00:30Z").unwrap();

        assert_eq!(start + Duration::seconds(30), end);
    }
}
