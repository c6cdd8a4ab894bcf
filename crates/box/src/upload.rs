//! Uploads: one multipart request for small files, upload sessions for big ones
//!
//! A single-request upload streams the body once and is never retried, as
//! the source can't be rewound. Chunked uploads buffer one part at a time,
//! so each part is retried on its own through the pacer. Only a limited
//! number of chunked uploads run at once; each holds an upload token from
//! session creation until commit or abort.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use jiff::Timestamp;
use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE};
use reqwest::multipart::{Form, Part as FormPart};
use reqwest::{Body, Method, StatusCode};
use rfs_core::{BoxReader, Error, Result, should_retry};
use sha1::{Digest, Sha1};
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::api::{
    CommitAttributes, CommitUpload, FolderItems, ITEM_FIELDS, Item, Parent, Part,
    UploadFile, UploadPartResponse, UploadSessionRequest, UploadSessionResponse,
};
use crate::client::{Host, retry_after, transport_error};
use crate::fs::BoxApi;
use crate::names::replace_reserved;

/// How a file is sent to Box
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStrategy {
    /// One multipart request
    Single,
    /// An upload session with one request per part
    Chunked,
}

impl UploadStrategy {
    /// Files of known size at or above `cutoff` use a chunked upload
    pub fn choose(size: Option<u64>, cutoff: u64) -> Self {
        match size {
            Some(size) if size > 0 && size >= cutoff => UploadStrategy::Chunked,
            _ => UploadStrategy::Single,
        }
    }
}

/// Where an upload lands
#[derive(Debug, Clone, Copy)]
pub(crate) struct UploadTarget<'a> {
    pub(crate) leaf: &'a str,
    pub(crate) dir_id: &'a str,
    /// Set when uploading a new version of an existing file
    pub(crate) existing_id: Option<&'a str>,
    pub(crate) mod_time: Timestamp,
}

const DEFAULT_COMMIT_DELAY: Duration = Duration::from_secs(1);

impl BoxApi {
    /// Upload `input` in a single multipart request
    pub(crate) async fn upload_single(
        &self,
        input: BoxReader,
        target: &UploadTarget<'_>,
        size: Option<u64>,
    ) -> Result<Item> {
        let name = replace_reserved(target.leaf);
        let attributes = UploadFile {
            name: name.clone(),
            parent: Parent::new(target.dir_id),
            content_created_at: target.mod_time.into(),
            content_modified_at: target.mod_time.into(),
        };
        let attributes = serde_json::to_string(&attributes)
            .map_err(|e| Error::General(format!("encoding upload attributes: {e}")))?;

        let body = Body::wrap_stream(ReaderStream::new(input));
        let file = match size {
            Some(len) => FormPart::stream_with_length(body, len),
            None => FormPart::stream(body),
        }
        .file_name(name);
        // Box wants the attributes before the file contents
        let form = Form::new().text("attributes", attributes).part("file", file);

        let path = match target.existing_id {
            Some(id) => format!("/files/{id}/content"),
            None => "/files/content".to_string(),
        };
        let request = self
            .srv
            .request(Method::POST, Host::Upload, &path)?
            .query(&[("fields", ITEM_FIELDS)])
            .multipart(form);

        let items: FolderItems = self
            .pacer
            .call_no_retry(|| async move { should_retry(self.srv.call_json(request).await) })
            .await?;
        debug!(leaf = %target.leaf, new_version = target.existing_id.is_some(), "Uploaded file");
        single_entry(items, target.leaf)
    }

    /// Upload `size` bytes of `input` through an upload session
    ///
    /// The session is aborted if any part or the commit fails.
    pub(crate) async fn upload_chunked(
        &self,
        mut input: BoxReader,
        target: &UploadTarget<'_>,
        size: u64,
    ) -> Result<Item> {
        let _token = self.upload_tokens.get().await?;

        let session = self.create_upload_session(target, size).await?;
        debug!(
            leaf = %target.leaf,
            session = %session.id,
            part_size = session.part_size,
            total_parts = session.total_parts,
            "Created upload session"
        );

        match self.upload_parts(&mut input, &session, target, size).await {
            Ok(item) => Ok(item),
            Err(e) => {
                if let Err(abort_err) = self.abort_upload_session(&session.id).await {
                    warn!(session = %session.id, error = %abort_err, "Failed to abort upload session");
                }
                Err(e)
            }
        }
    }

    async fn create_upload_session(
        &self,
        target: &UploadTarget<'_>,
        size: u64,
    ) -> Result<UploadSessionResponse> {
        let (path, folder_id) = match target.existing_id {
            Some(id) => (format!("/files/{id}/upload_sessions"), None),
            None => (
                "/files/upload_sessions".to_string(),
                Some(target.dir_id.to_string()),
            ),
        };
        let body = UploadSessionRequest {
            folder_id,
            file_size: size,
            file_name: Some(replace_reserved(target.leaf)),
        };
        let request = self
            .srv
            .request(Method::POST, Host::Upload, &path)?
            .json(&body);
        self.call_json(request)
            .await
            .map_err(|e| e.context("creating upload session"))
    }

    async fn upload_parts(
        &self,
        input: &mut BoxReader,
        session: &UploadSessionResponse,
        target: &UploadTarget<'_>,
        size: u64,
    ) -> Result<Item> {
        let part_size = session.part_size.max(1);
        let mut whole = Sha1::new();
        let mut parts = Vec::new();
        let mut offset = 0u64;

        while offset < size {
            let want = part_size.min(size - offset);
            let mut buf = Vec::with_capacity(want as usize);
            (&mut *input).take(want).read_to_end(&mut buf).await?;
            if buf.len() as u64 != want {
                return Err(Error::General(format!(
                    "upload of {:?} ended after {} of {size} bytes",
                    target.leaf,
                    offset + buf.len() as u64
                )));
            }
            whole.update(&buf);

            let part = self
                .upload_part(&session.id, offset, size, Bytes::from(buf))
                .await?;
            debug!(session = %session.id, part = parts.len() + 1, offset, "Uploaded part");
            parts.push(part);
            offset += want;
        }

        let digest = STANDARD.encode(whole.finalize());
        self.commit_upload(&session.id, parts, &digest, target).await
    }

    async fn upload_part(
        &self,
        session_id: &str,
        offset: u64,
        total: u64,
        chunk: Bytes,
    ) -> Result<Part> {
        let end = offset + chunk.len() as u64 - 1;
        let digest = STANDARD.encode(Sha1::digest(&chunk));
        let request = self
            .srv
            .request(
                Method::PUT,
                Host::Upload,
                &format!("/files/upload_sessions/{session_id}"),
            )?
            .header(CONTENT_RANGE, format!("bytes {offset}-{end}/{total}"))
            .header(CONTENT_TYPE, "application/octet-stream")
            .header("Digest", format!("sha={digest}"))
            .body(chunk);
        let response: UploadPartResponse = self
            .call_json(request)
            .await
            .map_err(|e| e.context(format!("uploading part at offset {offset}")))?;
        Ok(response.part)
    }

    // Box may still be assembling the parts, in which case it answers 202
    // and the commit is repeated after the suggested delay
    async fn commit_upload(
        &self,
        session_id: &str,
        parts: Vec<Part>,
        digest: &str,
        target: &UploadTarget<'_>,
    ) -> Result<Item> {
        let body = CommitUpload {
            parts,
            attributes: CommitAttributes {
                content_modified_at: target.mod_time.into(),
            },
        };
        let path = format!("/files/upload_sessions/{session_id}/commit");
        let tries = self.options.commit_retries.max(1);

        for attempt in 1..=tries {
            let request = self
                .srv
                .request(Method::POST, Host::Upload, &path)?
                .header("Digest", format!("sha={digest}"))
                .json(&body);
            let response = self
                .call(request)
                .await
                .map_err(|e| e.context("committing upload"))?;

            if response.status() == StatusCode::ACCEPTED {
                let delay = retry_after(response.headers()).unwrap_or(DEFAULT_COMMIT_DELAY);
                debug!(session = %session_id, attempt, delay_ms = delay.as_millis() as u64, "Upload not ready to commit");
                tokio::time::sleep(delay).await;
                continue;
            }

            let items: FolderItems = response.json().await.map_err(transport_error)?;
            return single_entry(items, target.leaf);
        }

        Err(Error::General(format!(
            "upload session {session_id} not committed after {tries} tries"
        )))
    }

    async fn abort_upload_session(&self, session_id: &str) -> Result<()> {
        let request = self.srv.request(
            Method::DELETE,
            Host::Upload,
            &format!("/files/upload_sessions/{session_id}"),
        )?;
        self.call(request).await?;
        debug!(session = %session_id, "Aborted upload session");
        Ok(())
    }
}

// Uploads answer with a one-entry listing of the new file
fn single_entry(mut items: FolderItems, leaf: &str) -> Result<Item> {
    if items.total_count != 1 || items.entries.len() != 1 {
        return Err(Error::General(format!(
            "failed to upload {leaf:?}: expected 1 entry, got {}",
            items.entries.len()
        )));
    }
    Ok(items.entries.remove(0))
}
