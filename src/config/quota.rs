use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A parsed rate quota: `limit` admissions per sliding `window`.
///
/// Grammar is `N/unit` where unit is a count-qualified `Ns|Nm|Nh|Nd` or a
/// bare `s|m|h|d` (single unit). `1/s` and `1/1s` are equivalent; `10/15s`
/// is a valid composite. A limit of `0` means unlimited — callers skip
/// window allocation entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateQuota {
    pub limit: u32,
    pub window: Duration,
}

impl RateQuota {
    pub fn is_unlimited(&self) -> bool {
        self.limit == 0
    }

    /// `None` when the quota disables limiting.
    pub fn enabled(self) -> Option<RateQuota> {
        if self.is_unlimited() {
            None
        } else {
            Some(self)
        }
    }
}

impl FromStr for RateQuota {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (count, unit) = s
            .split_once('/')
            .ok_or_else(|| format!("quota '{}' must be of the form N/unit", s))?;

        let limit: u32 = count
            .trim()
            .parse()
            .map_err(|_| format!("quota '{}' has a non-integer limit", s))?;

        let unit = unit.trim();
        if unit.is_empty() || !unit.is_ascii() {
            return Err(format!("quota '{}' is missing a valid time unit", s));
        }

        let (digits, suffix) = unit.split_at(unit.len() - 1);
        let per_unit_secs: u64 = match suffix {
            "s" => 1,
            "m" => 60,
            "h" => 3_600,
            "d" => 86_400,
            other => return Err(format!("quota '{}' has unknown unit '{}'", s, other)),
        };
        let multiplier: u64 = if digits.is_empty() {
            1
        } else {
            digits
                .parse()
                .map_err(|_| format!("quota '{}' has a malformed unit count", s))?
        };
        if multiplier == 0 {
            return Err(format!("quota '{}' has a zero-length window", s));
        }

        Ok(RateQuota {
            limit,
            window: Duration::from_secs(per_unit_secs * multiplier),
        })
    }
}

impl fmt::Display for RateQuota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.window.as_secs();
        let (n, unit) = match secs {
            s if s % 86_400 == 0 => (s / 86_400, "d"),
            s if s % 3_600 == 0 => (s / 3_600, "h"),
            s if s % 60 == 0 => (s / 60, "m"),
            s => (s, "s"),
        };
        if n == 1 {
            write!(f, "{}/{}", self.limit, unit)
        } else {
            write!(f, "{}/{}{}", self.limit, n, unit)
        }
    }
}

impl Serialize for RateQuota {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RateQuota {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_and_qualified_units_are_equivalent() {
        let bare: RateQuota = "1/s".parse().unwrap();
        let qualified: RateQuota = "1/1s".parse().unwrap();
        assert_eq!(bare, qualified);
        assert_eq!(bare.window, Duration::from_secs(1));
    }

    #[test]
    fn composite_windows() {
        let q: RateQuota = "10/15s".parse().unwrap();
        assert_eq!(q.limit, 10);
        assert_eq!(q.window, Duration::from_secs(15));

        let q: RateQuota = "100/2h".parse().unwrap();
        assert_eq!(q.window, Duration::from_secs(7_200));
    }

    #[test]
    fn all_units() {
        assert_eq!(
            "5/m".parse::<RateQuota>().unwrap().window,
            Duration::from_secs(60)
        );
        assert_eq!(
            "5/h".parse::<RateQuota>().unwrap().window,
            Duration::from_secs(3_600)
        );
        assert_eq!(
            "5/d".parse::<RateQuota>().unwrap().window,
            Duration::from_secs(86_400)
        );
    }

    #[test]
    fn zero_limit_means_unlimited() {
        let q: RateQuota = "0/s".parse().unwrap();
        assert!(q.is_unlimited());
        assert!(q.enabled().is_none());
    }

    #[test]
    fn rejects_malformed() {
        assert!("10".parse::<RateQuota>().is_err());
        assert!("ten/s".parse::<RateQuota>().is_err());
        assert!("10/".parse::<RateQuota>().is_err());
        assert!("10/x".parse::<RateQuota>().is_err());
        assert!("10/0s".parse::<RateQuota>().is_err());
        assert!("10/1.5s".parse::<RateQuota>().is_err());
    }

    #[test]
    fn display_round_trips() {
        for s in ["3/s", "10/15s", "100/m", "2/3h", "1/d"] {
            let q: RateQuota = s.parse().unwrap();
            assert_eq!(q.to_string(), s);
        }
    }
}
