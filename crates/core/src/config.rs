//! Configuration surface consumed by the core
//!
//! Loading credentials and remote definitions is the caller's business;
//! this module only covers the tunables the pacer, the token dispenser and
//! the accounting layer read. Values can be built in code or parsed from a
//! TOML document.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// A byte count which parses and displays with binary suffixes (`50M`, `1G`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SizeSuffix(pub u64);

impl SizeSuffix {
    pub const KIB: u64 = 1024;
    pub const MIB: u64 = 1024 * 1024;
    pub const GIB: u64 = 1024 * 1024 * 1024;

    pub fn bytes(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SizeSuffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.0;
        let (value, suffix) = if n != 0 && n % Self::GIB == 0 {
            (n / Self::GIB, "G")
        } else if n != 0 && n % Self::MIB == 0 {
            (n / Self::MIB, "M")
        } else if n != 0 && n % Self::KIB == 0 {
            (n / Self::KIB, "k")
        } else if n != 0 {
            (n, "b")
        } else {
            (n, "")
        };
        write!(f, "{value}{suffix}")
    }
}

impl FromStr for SizeSuffix {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("off") {
            return Ok(SizeSuffix(0));
        }
        let (digits, multiplier) = match s.char_indices().last() {
            Some((i, c)) if c.is_ascii_alphabetic() => {
                let multiplier = match c.to_ascii_lowercase() {
                    'b' => 1,
                    'k' => Self::KIB,
                    'm' => Self::MIB,
                    'g' => Self::GIB,
                    't' => Self::GIB * 1024,
                    _ => return Err(Error::Config(format!("bad size suffix in {s:?}"))),
                };
                (&s[..i], multiplier)
            }
            Some(_) => (s, Self::KIB),
            None => return Err(Error::Config("empty size".to_string())),
        };
        // Bare numbers are kilobytes, matching the command line convention
        let value: f64 = digits
            .parse()
            .map_err(|_| Error::Config(format!("bad size {s:?}")))?;
        if value < 0.0 {
            return Err(Error::Config(format!("size can't be negative: {s:?}")));
        }
        Ok(SizeSuffix((value * multiplier as f64) as u64))
    }
}

impl Serialize for SizeSuffix {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SizeSuffix {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bytes(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Bytes(n) => Ok(SizeSuffix(n)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Per-backend pacer tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacerConfig {
    /// Smallest gap enforced between two dispatched calls
    #[serde(with = "millis")]
    pub min_sleep: Duration,
    /// Largest gap the backoff may grow to
    #[serde(with = "millis")]
    pub max_sleep: Duration,
    /// Bigger for slower decay back to `min_sleep`
    pub decay_constant: u32,
    /// Attempts made by `Pacer::call` before giving up
    pub retries: u32,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            min_sleep: Duration::from_millis(10),
            max_sleep: Duration::from_secs(2),
            decay_constant: 2,
            retries: 10,
        }
    }
}

impl PacerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.decay_constant == 0 {
            return Err(Error::Config("pacer decay constant must be >= 1".to_string()));
        }
        if self.min_sleep > self.max_sleep {
            return Err(Error::Config(format!(
                "pacer min sleep {:?} exceeds max sleep {:?}",
                self.min_sleep, self.max_sleep
            )));
        }
        if self.retries == 0 {
            return Err(Error::Config("pacer retries must be >= 1".to_string()));
        }
        Ok(())
    }
}

/// Limits enforced by the accounting layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountingConfig {
    /// Abort the run once this many bytes have been transferred
    pub max_transfer: Option<SizeSuffix>,
    /// Aggregate bandwidth limit in bytes per second
    pub bwlimit: Option<SizeSuffix>,
}

impl AccountingConfig {
    /// Transfer ceiling in bytes; zero or `off` disables it
    pub fn max_transfer_bytes(&self) -> Option<u64> {
        self.max_transfer.map(SizeSuffix::bytes).filter(|&n| n > 0)
    }

    /// Bandwidth limit in bytes per second; zero or `off` disables it
    pub fn bwlimit_bytes(&self) -> Option<u64> {
        self.bwlimit.map(SizeSuffix::bytes).filter(|&n| n > 0)
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of file transfers to run in parallel
    pub transfers: usize,
    /// Attempts made for whole operations (open, upload, copy)
    pub low_level_retries: u32,
    pub pacer: PacerConfig,
    pub accounting: AccountingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transfers: 4,
            low_level_retries: 10,
            pacer: PacerConfig::default(),
            accounting: AccountingConfig::default(),
        }
    }
}

impl Config {
    /// Parse a TOML document, filling missing keys with defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.transfers == 0 {
            return Err(Error::Config("transfers must be >= 1".to_string()));
        }
        if self.low_level_retries == 0 {
            return Err(Error::Config("low_level_retries must be >= 1".to_string()));
        }
        self.pacer.validate()
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
