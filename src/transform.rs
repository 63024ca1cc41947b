use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use sha3::Sha3_256;

use crate::error::CommError;

/// Hash applied after the shift cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
    #[serde(rename = "sha3_256")]
    Sha3_256,
}

impl HashAlgorithm {
    pub const ALL: [HashAlgorithm; 3] = [
        HashAlgorithm::Sha256,
        HashAlgorithm::Sha512,
        HashAlgorithm::Sha3_256,
    ];

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
            HashAlgorithm::Sha3_256 => Sha3_256::digest(data).to_vec(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
            HashAlgorithm::Sha3_256 => "sha3_256",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = CommError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha512" => Ok(HashAlgorithm::Sha512),
            "sha3_256" | "sha3-256" => Ok(HashAlgorithm::Sha3_256),
            other => Err(CommError::Config(format!("unknown hashing algorithm `{other}`"))),
        }
    }
}

/// Per-hop processing parameters. Replaceable at runtime, never shared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingConfig {
    pub keyword: String,
    pub hashing_algorithm: HashAlgorithm,
}

impl ProcessingConfig {
    pub fn new(keyword: impl Into<String>, hashing_algorithm: HashAlgorithm) -> Self {
        Self {
            keyword: keyword.into(),
            hashing_algorithm,
        }
    }

    pub fn apply(&self, data: &[u8]) -> Vec<u8> {
        transform(data, &self.keyword, self.hashing_algorithm)
    }
}

/// Sum of the keyword's code points, reduced to a byte shift.
pub fn keyword_shift(keyword: &str) -> u8 {
    let sum: u64 = keyword.chars().map(|c| u64::from(u32::from(c))).sum();
    (sum % 256) as u8
}

pub fn shift_cipher(data: &[u8], shift: u8) -> Vec<u8> {
    data.iter().map(|b| b.wrapping_add(shift)).collect()
}

pub fn unshift_cipher(data: &[u8], shift: u8) -> Vec<u8> {
    data.iter().map(|b| b.wrapping_sub(shift)).collect()
}

/// Shift-cipher the data with the keyword's shift, then hash the result.
///
/// Deterministic and one-way: the output of one hop is opaque to the next.
pub fn transform(data: &[u8], keyword: &str, algorithm: HashAlgorithm) -> Vec<u8> {
    let shifted = shift_cipher(data, keyword_shift(keyword));
    algorithm.digest(&shifted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_shift_sums_code_points() {
        assert_eq!(keyword_shift("k"), 107);
        assert_eq!(keyword_shift(""), 0);
        // 'k'(107) + 'e'(101) + 'y'(121) = 329 -> 73
        assert_eq!(keyword_shift("key"), 73);
    }

    #[test]
    fn shift_cipher_is_reversible() {
        let data = b"Hello Ghost-Comm!\xff\x00".to_vec();
        for shift in [0u8, 1, 107, 255] {
            assert_eq!(unshift_cipher(&shift_cipher(&data, shift), shift), data);
        }
    }

    #[test]
    fn transform_is_deterministic() {
        let data = b"Hello Ghost-Comm!";
        for algo in HashAlgorithm::ALL {
            assert_eq!(transform(data, "keyword_3", algo), transform(data, "keyword_3", algo));
        }
    }

    #[test]
    fn transform_matches_manual_composition() {
        let data = b"Hello Ghost-Comm!";
        let shifted: Vec<u8> = data.iter().map(|b| b.wrapping_add(107)).collect();
        assert_eq!(
            transform(data, "k", HashAlgorithm::Sha256),
            Sha256::digest(&shifted).to_vec()
        );
    }

    #[test]
    fn candidate_pool_outputs_are_distinct() {
        let data = b"Hello Ghost-Comm!";
        let mut seen = std::collections::HashSet::new();
        for i in 0..8 {
            let keyword = format!("keyword_{i}");
            for algo in HashAlgorithm::ALL {
                assert!(seen.insert(transform(data, &keyword, algo)), "{keyword}/{algo}");
            }
        }
        assert_eq!(seen.len(), 24);
    }

    #[test]
    fn digest_lengths() {
        assert_eq!(HashAlgorithm::Sha256.digest(b"x").len(), 32);
        assert_eq!(HashAlgorithm::Sha512.digest(b"x").len(), 64);
        assert_eq!(HashAlgorithm::Sha3_256.digest(b"x").len(), 32);
    }

    #[test]
    fn algorithm_names_round_trip_through_serde() {
        let json = serde_json::to_string(&HashAlgorithm::Sha3_256).unwrap();
        assert_eq!(json, "\"sha3_256\"");
        assert_eq!("SHA512".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha512);
        assert!("md5".parse::<HashAlgorithm>().is_err());
    }
}
