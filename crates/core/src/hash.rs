//! Content hash types
//!
//! Each backend declares a fixed set of the hashes it can report. Asking an
//! object for a hash outside that set is an error, never a silent fallback.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A content hash algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashType {
    Md5,
    Sha1,
}

impl HashType {
    pub const ALL: [HashType; 2] = [HashType::Md5, HashType::Sha1];

    fn bit(self) -> u8 {
        match self {
            HashType::Md5 => 1,
            HashType::Sha1 => 1 << 1,
        }
    }
}

impl fmt::Display for HashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashType::Md5 => write!(f, "MD5"),
            HashType::Sha1 => write!(f, "SHA-1"),
        }
    }
}

impl FromStr for HashType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "md5" => Ok(HashType::Md5),
            "sha1" | "sha-1" => Ok(HashType::Sha1),
            _ => Err(Error::General(format!("unknown hash type {s:?}"))),
        }
    }
}

/// An immutable set of hash types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HashSet(u8);

impl HashSet {
    pub const fn none() -> Self {
        HashSet(0)
    }

    pub fn of(types: &[HashType]) -> Self {
        HashSet(types.iter().fold(0, |bits, t| bits | t.bit()))
    }

    pub fn contains(self, t: HashType) -> bool {
        self.0 & t.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn overlap(self, other: HashSet) -> HashSet {
        HashSet(self.0 & other.0)
    }

    /// Hash types in the set, in a stable order
    pub fn types(self) -> impl Iterator<Item = HashType> {
        HashType::ALL.into_iter().filter(move |t| self.contains(*t))
    }

    /// Error out unless `t` is supported
    pub fn check(self, t: HashType) -> Result<()> {
        if self.contains(t) {
            Ok(())
        } else {
            Err(Error::HashUnsupported)
        }
    }
}

impl fmt::Display for HashSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.types().map(|t| t.to_string()).collect();
        write!(f, "[{}]", names.join(", "))
    }
}
