//! Human friendly durations such as `90s`, `5m` or `1h30m` in configuration files.
use std::{fmt, str::FromStr, time::Duration as StdDuration};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration(pub StdDuration);

impl Duration {
    pub const fn from_secs(secs: u64) -> Self {
        Self(StdDuration::from_secs(secs))
    }

    pub fn as_std(&self) -> StdDuration {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<Duration> for StdDuration {
    fn from(d: Duration) -> Self {
        d.0
    }
}

impl FromStr for Duration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty duration".to_string());
        }
        if s == "0" {
            return Ok(Duration::default());
        }

        let mut total = StdDuration::ZERO;
        let mut rest = s;
        while !rest.is_empty() {
            let digits = rest
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .ok_or_else(|| format!("missing unit in duration {:?}", s))?;
            if digits == 0 {
                return Err(format!("invalid duration {:?}", s));
            }
            let value: f64 = rest[..digits]
                .parse()
                .map_err(|_| format!("invalid number in duration {:?}", s))?;
            rest = &rest[digits..];
            let unit_len = rest
                .find(|c: char| c.is_ascii_digit() || c == '.')
                .unwrap_or(rest.len());
            let secs = match &rest[..unit_len] {
                "ms" => value / 1000.0,
                "s" => value,
                "m" => value * 60.0,
                "h" => value * 3600.0,
                unit => return Err(format!("unknown unit {:?} in duration {:?}", unit, s)),
            };
            total += StdDuration::from_secs_f64(secs);
            rest = &rest[unit_len..];
        }
        Ok(Duration(total))
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.0.as_secs();
        let millis = self.0.subsec_millis();
        if total == 0 && millis > 0 {
            return write!(f, "{}ms", millis);
        }
        let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
        let mut out = String::new();
        if h > 0 {
            out.push_str(&format!("{}h", h));
        }
        if m > 0 {
            out.push_str(&format!("{}m", m));
        }
        if s > 0 || out.is_empty() {
            out.push_str(&format!("{}s", s));
        }
        f.write_str(&out)
    }
}

impl Serialize for Duration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Seconds(u64),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s.parse().map_err(de::Error::custom),
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compound_durations() {
        assert_eq!("90s".parse::<Duration>().unwrap(), Duration::from_secs(90));
        assert_eq!("5m".parse::<Duration>().unwrap(), Duration::from_secs(300));
        assert_eq!("1h30m".parse::<Duration>().unwrap(), Duration::from_secs(5400));
        assert_eq!(
            "1.5s".parse::<Duration>().unwrap().as_std(),
            StdDuration::from_millis(1500)
        );
        assert_eq!(
            "250ms".parse::<Duration>().unwrap().as_std(),
            StdDuration::from_millis(250)
        );
    }

    #[test]
    fn rejects_malformed_durations() {
        for bad in ["", "10", "m", "10x", "1h-2m"] {
            assert!(bad.parse::<Duration>().is_err(), "{bad}");
        }
    }

    #[test]
    fn displays_compactly() {
        assert_eq!(Duration::from_secs(6 * 3600).to_string(), "6h");
        assert_eq!(Duration::from_secs(3661).to_string(), "1h1m1s");
        assert_eq!(Duration::default().to_string(), "0s");
    }

    #[test]
    fn deserializes_from_yaml() {
        let d: Duration = serde_yaml::from_str("\"6h\"").unwrap();
        assert_eq!(d, Duration::from_secs(21600));
        let d: Duration = serde_yaml::from_str("30").unwrap();
        assert_eq!(d, Duration::from_secs(30));
    }
}
