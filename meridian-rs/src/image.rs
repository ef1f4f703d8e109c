//! Image catalog entries, pulled image records and guest-agent binaries.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::spec::{Arch, Os};

/// Where an image comes from, as declared in the `[images.<name>]` config
/// section.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSource {
    pub os: Os,
    pub arch: Arch,
    /// URL or local path.
    pub location: String,
    /// Expected digest, `<algo>:<hex>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageStatus {
    #[default]
    Pending,
    Pulling,
    Pulled,
    Error,
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Persisted record of a pulled (or pulling) image, stored as `image.json`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub name: String,
    pub source: ImageSource,
    #[serde(default)]
    pub status: ImageStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulled_at: Option<DateTime<Utc>>,
}

impl Image {
    pub fn new(name: impl Into<String>, source: ImageSource) -> Self {
        Image {
            name: name.into(),
            source,
            status: ImageStatus::Pending,
            message: String::new(),
            pulled_at: None,
        }
    }
}

/// A guest-agent binary release for one OS / architecture.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GuestBinary {
    pub version: String,
    pub os: Os,
    pub arch: Arch,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl GuestBinary {
    /// File name under a machine's `bin/` directory.
    pub fn file_name(&self) -> String {
        guest_binary_file_name(self.os, self.arch)
    }
}

pub fn guest_binary_file_name(os: Os, arch: Arch) -> String {
    format!(
        "meridian-guest.{}.{}",
        os.to_string().to_lowercase(),
        arch.go_name()
    )
}
