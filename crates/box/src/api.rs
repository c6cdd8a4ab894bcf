//! Box content API wire types
//!
//! Only the fields the backend uses are modelled; everything else in the
//! responses is ignored.

use std::fmt;

use jiff::Timestamp;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Fields requested for every item so listings carry full metadata
pub const ITEM_FIELDS: &str = "type,id,sequence_id,etag,sha1,name,size,created_at,modified_at,content_created_at,content_modified_at,item_status";

pub const ITEM_TYPE_FILE: &str = "file";
pub const ITEM_TYPE_FOLDER: &str = "folder";
pub const ITEM_STATUS_ACTIVE: &str = "active";

/// A timestamp as Box reads and writes it (RFC 3339, whole seconds)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Time(pub Timestamp);

impl Serialize for Time {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0.strftime("%Y-%m-%dT%H:%M:%SZ"))
    }
}

impl<'de> Deserialize<'de> for Time {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<Timestamp>()
            .map(Time)
            .map_err(serde::de::Error::custom)
    }
}

impl From<Timestamp> for Time {
    fn from(ts: Timestamp) -> Self {
        Time(ts)
    }
}

/// A file or folder
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Item {
    #[serde(rename = "type")]
    pub item_type: String,
    pub id: String,
    pub sequence_id: Option<String>,
    pub etag: Option<String>,
    pub sha1: Option<String>,
    pub name: String,
    // Box sends very large sizes in exponent notation
    pub size: f64,
    pub created_at: Option<Time>,
    pub modified_at: Option<Time>,
    pub content_created_at: Option<Time>,
    pub content_modified_at: Option<Time>,
    pub item_status: String,
}

impl Item {
    pub fn is_file(&self) -> bool {
        self.item_type == ITEM_TYPE_FILE
    }

    pub fn is_folder(&self) -> bool {
        self.item_type == ITEM_TYPE_FOLDER
    }

    pub fn is_active(&self) -> bool {
        self.item_status.is_empty() || self.item_status == ITEM_STATUS_ACTIVE
    }

    /// Content modification time, falling back to the item's own
    pub fn mod_time(&self) -> Option<Timestamp> {
        self.content_modified_at
            .or(self.modified_at)
            .map(|t| t.0)
    }

    pub fn size(&self) -> u64 {
        if self.size.is_finite() && self.size > 0.0 {
            self.size as u64
        } else {
            0
        }
    }
}

/// One page of a folder listing
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FolderItems {
    pub total_count: u64,
    pub entries: Vec<Item>,
    pub offset: u64,
    pub limit: u64,
}

/// Reference to a parent folder
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Parent {
    pub id: String,
}

impl Parent {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Body for `POST /folders`
#[derive(Debug, Clone, Serialize)]
pub struct CreateFolder {
    pub name: String,
    pub parent: Parent,
}

/// Attributes part of a single-request upload
#[derive(Debug, Clone, Serialize)]
pub struct UploadFile {
    pub name: String,
    pub parent: Parent,
    pub content_created_at: Time,
    pub content_modified_at: Time,
}

/// Body for `POST /files/{id}/copy`
#[derive(Debug, Clone, Serialize)]
pub struct CopyFile {
    pub name: String,
    pub parent: Parent,
}

/// Body for renaming or moving a file or folder
#[derive(Debug, Clone, Serialize)]
pub struct UpdateFileMove {
    pub name: String,
    pub parent: Parent,
}

/// Body for setting a file's modification time
#[derive(Debug, Clone, Serialize)]
pub struct UpdateFileModTime {
    pub content_modified_at: Time,
}

/// Error body returned with non-2xx responses
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Error {
    #[serde(rename = "type")]
    pub error_type: String,
    pub status: u16,
    pub code: String,
    pub message: String,
    pub request_id: String,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {:?} ({})", self.code, self.status)?;
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        if !self.request_id.is_empty() {
            write!(f, " (request id {})", self.request_id)?;
        }
        Ok(())
    }
}

/// Body for creating a chunked upload session
#[derive(Debug, Clone, Serialize)]
pub struct UploadSessionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
    pub file_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

/// A chunked upload session
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UploadSessionResponse {
    pub id: String,
    pub part_size: u64,
    pub total_parts: u64,
    pub num_parts_processed: u64,
}

/// One uploaded part as Box acknowledges it
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Part {
    pub part_id: String,
    pub offset: u64,
    pub size: u64,
    pub sha1: String,
}

/// Response to uploading one part
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UploadPartResponse {
    pub part: Part,
}

/// Body for committing a chunked upload
#[derive(Debug, Clone, Serialize)]
pub struct CommitUpload {
    pub parts: Vec<Part>,
    pub attributes: CommitAttributes,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitAttributes {
    pub content_modified_at: Time,
}
