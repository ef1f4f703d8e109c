//! Content digests in `<algorithm>:<hex>` form.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use sha2::Digest as _;
use tokio::io::AsyncReadExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }

    pub fn hasher(&self) -> Hasher {
        match self {
            Algorithm::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            Algorithm::Sha512 => Hasher::Sha512(sha2::Sha512::new()),
        }
    }
}

impl FromStr for Algorithm {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            other => bail!("digest algorithm {other:?} is not available"),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Compare against a computed digest.
    pub fn verify(&self, actual: &Digest) -> Result<(), DigestMismatch> {
        if self == actual {
            Ok(())
        } else {
            Err(DigestMismatch {
                expected: self.to_string(),
                actual: actual.to_string(),
            })
        }
    }

    /// Hash a file on disk with this digest's algorithm.
    pub async fn of_file(algorithm: Algorithm, path: &Path) -> Result<Digest> {
        let mut file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("open {path:?} for hashing"))?;
        let mut hasher = algorithm.hasher();
        let mut buf = vec![0u8; 1 << 20];
        loop {
            let n = file
                .read(&mut buf)
                .await
                .with_context(|| format!("read {path:?} for hashing"))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize())
    }
}

impl FromStr for Digest {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (algo, hex) = s
            .split_once(':')
            .with_context(|| format!("digest {s:?} is not of the form <algorithm>:<hex>"))?;
        let algorithm: Algorithm = algo.parse()?;
        if hex.len() != algorithm.hex_len()
            || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            bail!("invalid {algorithm} digest {hex:?}");
        }
        Ok(Digest {
            algorithm,
            hex: hex.to_string(),
        })
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

pub enum Hasher {
    Sha256(sha2::Sha256),
    Sha512(sha2::Sha512),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Digest {
        match self {
            Hasher::Sha256(h) => Digest {
                algorithm: Algorithm::Sha256,
                hex: hex::encode(h.finalize()),
            },
            Hasher::Sha512(h) => Digest {
                algorithm: Algorithm::Sha512,
                hex: hex::encode(h.finalize()),
            },
        }
    }
}

/// Downloaded or cached content does not match the expected digest.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("expected digest {expected:?}, got {actual:?}")]
pub struct DigestMismatch {
    pub expected: String,
    pub actual: String,
}

#[cfg(test)]
mod test {
    use super::*;

    const HELLO_SHA256: &str =
        "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_parse_digest() {
        let d: Digest = HELLO_SHA256.parse().unwrap();
        assert_eq!(d.algorithm(), Algorithm::Sha256);
        assert_eq!(d.to_string(), HELLO_SHA256);

        assert!("md5:abcd".parse::<Digest>().is_err());
        assert!("sha256:abcd".parse::<Digest>().is_err());
        assert!("2cf24dba".parse::<Digest>().is_err());
    }

    #[test]
    fn test_hasher_and_verify() {
        let mut h = Algorithm::Sha256.hasher();
        h.update(b"hel");
        h.update(b"lo");
        let actual = h.finalize();
        let expected: Digest = HELLO_SHA256.parse().unwrap();
        expected.verify(&actual).unwrap();

        let other = {
            let mut h = Algorithm::Sha256.hasher();
            h.update(b"world");
            h.finalize()
        };
        let err = expected.verify(&other).unwrap_err();
        assert_eq!(err.expected, HELLO_SHA256);
    }

    #[tokio::test]
    async fn test_digest_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        tokio::fs::write(&path, b"hello").await.unwrap();
        let d = Digest::of_file(Algorithm::Sha256, &path).await.unwrap();
        assert_eq!(d.to_string(), HELLO_SHA256);
    }
}
