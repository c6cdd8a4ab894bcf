//! Box backend options

use rfs_core::{Error, PacerConfig, Result, SizeSuffix};
use serde::{Deserialize, Serialize};

pub const ROOT_URL: &str = "https://api.box.com/2.0";
pub const UPLOAD_URL: &str = "https://upload.box.com/api/2.0";
/// ID of the root folder of every Box account
pub const ROOT_ID: &str = "0";
/// Box won't accept chunked uploads smaller than this
pub const MIN_UPLOAD_CUTOFF: u64 = 50_000_000;
pub const DEFAULT_UPLOAD_CUTOFF: u64 = 50 * 1024 * 1024;
pub const LIST_CHUNK: u32 = 1000;

/// Options for one Box remote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoxOptions {
    /// OAuth bearer token
    pub access_token: String,
    /// Files at least this big use a chunked upload
    pub upload_cutoff: SizeSuffix,
    /// Concurrent chunked uploads
    pub transfers: usize,
    /// Page size for folder listings
    pub list_chunk: u32,
    /// How often to poll a chunked upload commit Box hasn't finished
    pub commit_retries: u32,
    pub root_url: String,
    pub upload_url: String,
    pub pacer: PacerConfig,
}

impl Default for BoxOptions {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            upload_cutoff: SizeSuffix(DEFAULT_UPLOAD_CUTOFF),
            transfers: 4,
            list_chunk: LIST_CHUNK,
            commit_retries: 100,
            root_url: ROOT_URL.to_string(),
            upload_url: UPLOAD_URL.to_string(),
            pacer: PacerConfig::default(),
        }
    }
}

impl BoxOptions {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.upload_cutoff.bytes() < MIN_UPLOAD_CUTOFF {
            return Err(Error::Config(format!(
                "box: upload cutoff ({}) must be greater than equal to {}",
                self.upload_cutoff,
                SizeSuffix(MIN_UPLOAD_CUTOFF)
            )));
        }
        self.validate_limits()
    }

    // Everything except the cutoff floor
    pub(crate) fn validate_limits(&self) -> Result<()> {
        if self.access_token.is_empty() {
            return Err(Error::Config("box: access token is required".to_string()));
        }
        if self.list_chunk == 0 || self.list_chunk > LIST_CHUNK {
            return Err(Error::Config(format!(
                "box: list chunk must be between 1 and {LIST_CHUNK}"
            )));
        }
        if self.transfers == 0 {
            return Err(Error::Config("box: transfers must be >= 1".to_string()));
        }
        self.pacer.validate()
    }
}
