//! Deterministic cache keys for capture requests

use crate::CaptureRequest;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Dimension recorded for full-page requests, where the viewport does not
/// affect the output
const FULL_PAGE_DIMENSION: u32 = 0;

/// Hex encoded SHA-256 digest of a normalized capture request
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(request: &CaptureRequest) -> Self {
        let (width, height) = if request.full_page() {
            (FULL_PAGE_DIMENSION, FULL_PAGE_DIMENSION)
        } else {
            (request.width(), request.height())
        };

        let canonical = format!(
            "url={}\nfull_page={}\nwidth={}\nheight={}\nformat={}\ndelay={}",
            request.url().trim().to_lowercase(),
            request.full_page(),
            width,
            height,
            request.format().as_str(),
            request.delay_secs(),
        );

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `name` looks like a value produced by [`Fingerprint::of`]
    pub fn is_well_formed(name: &str) -> bool {
        name.len() == 64 && name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
