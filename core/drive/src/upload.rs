//! Chunked upload sessions and the write stream built on them.
//!
//! Small files go up in a single request. Larger ones use a Graph upload
//! session: chunks are sent with an explicit `Content-Range`, the offset the
//! server acknowledges must match what was sent, and the session is
//! committed explicitly at close.
//!
//! Session lifecycle: `Open -> (chunk)* -> Completing -> Committed | Aborted`.
//! Nothing leaves `Committed` or `Aborted`.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::header::CONTENT_RANGE;
use reqwest::Method;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use graphfs_common::{DrivePath, Error, Result};

use crate::backend::{DriveLocator, ItemAddress};
use crate::client::{DriveClient, Idempotency};
use crate::models::{DriveItemDto, RemoteItem, UploadSessionDto};
use crate::resolver::ItemResolver;
use crate::transport::{HttpRequest, HttpResponse};

/// State of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Open,
    Completing,
    Committed,
    Aborted,
}

impl UploadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadStatus::Committed | UploadStatus::Aborted)
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadStatus::Open => "open",
            UploadStatus::Completing => "completing",
            UploadStatus::Committed => "committed",
            UploadStatus::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Locally tracked state of a server-side upload session.
#[derive(Debug, Clone)]
pub struct UploadSessionState {
    pub upload_url: String,
    pub target: DrivePath,
    /// `None` while the final size is not yet known.
    pub total_size: Option<u64>,
    /// First byte not yet acknowledged by the server.
    pub next_offset: u64,
    pub chunk_size: usize,
    pub status: UploadStatus,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A resumable upload session.
pub struct UploadSession {
    client: Arc<DriveClient>,
    state: UploadSessionState,
    abort_timeout: Duration,
    /// Item returned early by a server that committed on the last chunk.
    completed: Option<DriveItemDto>,
}

impl UploadSession {
    /// Create a session at `create_url` (an item's `createUploadSession`).
    ///
    /// Sessions defer their commit and replace an existing file.
    pub async fn create(
        client: Arc<DriveClient>,
        create_url: &str,
        target: DrivePath,
        total_size: Option<u64>,
        chunk_size: usize,
        abort_timeout: Duration,
    ) -> Result<Self> {
        let body = serde_json::json!({
            "item": {"@microsoft.graph.conflictBehavior": "replace"},
            "deferCommit": true,
        });
        let request = HttpRequest::new(Method::POST, create_url).json(&body)?;
        let session: UploadSessionDto = client
            .send(request, Idempotency::NonIdempotent)
            .await?
            .json()?;
        let upload_url = session
            .upload_url
            .ok_or_else(|| Error::Protocol("Upload session without uploadUrl".to_string()))?;

        info!(path = %target, total_size = ?total_size, "Created upload session");

        Ok(Self {
            client,
            state: UploadSessionState {
                upload_url,
                target,
                total_size,
                next_offset: 0,
                chunk_size,
                status: UploadStatus::Open,
                expires_at: session.expiration_date_time,
            },
            abort_timeout,
            completed: None,
        })
    }

    pub fn state(&self) -> &UploadSessionState {
        &self.state
    }

    fn ensure_open(&mut self) -> Result<()> {
        if self.state.status != UploadStatus::Open {
            return Err(Error::Protocol(format!(
                "Upload session for {} is {}",
                self.state.target, self.state.status
            )));
        }
        if let Some(expires_at) = self.state.expires_at {
            if expires_at <= Utc::now() {
                self.state.status = UploadStatus::Aborted;
                return Err(self.expired());
            }
        }
        Ok(())
    }

    fn expired(&self) -> Error {
        Error::SessionExpired(format!("Upload session for {}", self.state.target))
    }

    /// Submit the next chunk.
    ///
    /// `total` is the final file size, or `None` for a non-final chunk of an
    /// upload of unknown size.
    ///
    /// # Errors
    /// - `Protocol` if the server acknowledges a different offset; the
    ///   session is aborted
    /// - `SessionExpired` if the session lapsed
    pub async fn submit_chunk(&mut self, data: Bytes, total: Option<u64>) -> Result<()> {
        self.ensure_open()?;
        if data.is_empty() {
            return Ok(());
        }
        if total.is_some() {
            self.state.total_size = total;
        }

        let start = self.state.next_offset;
        let end = start + data.len() as u64;
        let request = self.chunk_request(start, data, total)?;

        debug!(path = %self.state.target, start, end, "Submitting chunk");
        let acked = match self
            .client
            .send_anonymous(request.clone(), Idempotency::NonIdempotent)
            .await
        {
            Ok(response) => self.acknowledged(&response, end, total),
            Err(Error::NotFound(_)) => {
                self.state.status = UploadStatus::Aborted;
                return Err(self.expired());
            }
            Err(e) if e.is_transient() => {
                warn!(path = %self.state.target, start, error = %e, "Chunk outcome unknown, querying session");
                self.recover(request, start, end, total).await
            }
            Err(e) => Err(e),
        };

        let acked = match acked {
            Ok(offset) => offset,
            Err(e) => {
                self.abort().await;
                return Err(e);
            }
        };
        if acked != end {
            self.abort().await;
            return Err(Error::Protocol(format!(
                "Server acknowledged offset {} for {} but {} bytes were sent",
                acked, self.state.target, end
            )));
        }

        self.state.next_offset = end;
        Ok(())
    }

    fn chunk_request(&self, start: u64, data: Bytes, total: Option<u64>) -> Result<HttpRequest> {
        let end = start + data.len() as u64 - 1;
        let total = total.map_or_else(|| "*".to_string(), |t| t.to_string());
        HttpRequest::new(Method::PUT, self.state.upload_url.as_str())
            .header_str(CONTENT_RANGE, &format!("bytes {}-{}/{}", start, end, total))
            .map(|request| request.body(data))
    }

    /// Offset the server expects next after a chunk response.
    fn acknowledged(&mut self, response: &HttpResponse, sent: u64, total: Option<u64>) -> Result<u64> {
        if matches!(response.status, 200 | 201) {
            self.completed = Some(response.json()?);
            return Ok(sent);
        }
        let status: UploadSessionDto = response.json()?;
        if status.expiration_date_time.is_some() {
            self.state.expires_at = status.expiration_date_time;
        }
        Ok(status
            .next_expected_offset()
            .unwrap_or_else(|| total.unwrap_or(sent)))
    }

    /// Settle a chunk whose response was lost.
    async fn recover(
        &mut self,
        request: HttpRequest,
        start: u64,
        end: u64,
        total: Option<u64>,
    ) -> Result<u64> {
        let status = self.query_status().await?;
        let expected = status
            .next_expected_offset()
            .unwrap_or_else(|| total.unwrap_or(end));

        if expected == end {
            debug!(path = %self.state.target, end, "Chunk had been received");
            return Ok(end);
        }
        if expected != start {
            return Err(Error::Protocol(format!(
                "Server expects offset {} for {} after chunk {}-{}",
                expected, self.state.target, start, end
            )));
        }

        debug!(path = %self.state.target, start, "Chunk was lost, resending once");
        match self
            .client
            .send_anonymous(request, Idempotency::NonIdempotent)
            .await
        {
            Ok(response) => self.acknowledged(&response, end, total),
            Err(Error::NotFound(_)) => {
                self.state.status = UploadStatus::Aborted;
                Err(self.expired())
            }
            Err(e) => Err(e),
        }
    }

    /// Ask the server what it has received.
    pub async fn query_status(&mut self) -> Result<UploadSessionDto> {
        let request = HttpRequest::get(self.state.upload_url.as_str());
        match self
            .client
            .send_anonymous(request, Idempotency::Idempotent)
            .await
        {
            Ok(response) => response.json(),
            Err(Error::NotFound(_)) => {
                self.state.status = UploadStatus::Aborted;
                Err(self.expired())
            }
            Err(e) => Err(e),
        }
    }

    /// Finalize the session and return the written item.
    ///
    /// # Errors
    /// - `Protocol` if not all bytes were acknowledged; the session is
    ///   aborted
    pub async fn commit(&mut self) -> Result<DriveItemDto> {
        self.ensure_open()?;
        if let Some(total) = self.state.total_size {
            if self.state.next_offset != total {
                self.abort().await;
                return Err(Error::Protocol(format!(
                    "Cannot commit {}: {} of {} bytes acknowledged",
                    self.state.target, self.state.next_offset, total
                )));
            }
        }

        self.state.status = UploadStatus::Completing;
        if let Some(item) = self.completed.take() {
            self.state.status = UploadStatus::Committed;
            return Ok(item);
        }

        let request = HttpRequest::new(Method::POST, self.state.upload_url.as_str())
            .body(Bytes::new());
        let outcome = self
            .client
            .send_anonymous(request, Idempotency::NonIdempotent)
            .await
            .and_then(|response| response.json::<DriveItemDto>());

        match outcome {
            Ok(item) => {
                self.state.status = UploadStatus::Committed;
                info!(path = %self.state.target, item_id = %item.id, "Committed upload session");
                Ok(item)
            }
            Err(Error::NotFound(_)) => {
                self.state.status = UploadStatus::Aborted;
                Err(self.expired())
            }
            Err(e) => {
                self.abort().await;
                Err(e)
            }
        }
    }

    /// Cancel the session on the server, best-effort and bounded by the
    /// abort timeout. Failures are logged, not returned.
    pub async fn abort(&mut self) {
        if let Some(cancel) = self.detach_abort() {
            cancel.await;
        }
    }

    /// Mark the session aborted and return the server-side cancellation as
    /// an owned future, or `None` if the session is already terminal.
    pub(crate) fn detach_abort(&mut self) -> Option<BoxFuture<'static, ()>> {
        if self.state.status.is_terminal() {
            return None;
        }
        self.state.status = UploadStatus::Aborted;

        let client = Arc::clone(&self.client);
        let url = self.state.upload_url.clone();
        let target = self.state.target.clone();
        let timeout = self.abort_timeout;
        Some(
            async move {
                let request = HttpRequest::new(Method::DELETE, url).timeout(timeout);
                match tokio::time::timeout(
                    timeout,
                    client.send_anonymous(request, Idempotency::Idempotent),
                )
                .await
                {
                    Ok(Ok(_)) => debug!(path = %target, "Cancelled upload session"),
                    Ok(Err(e)) => {
                        warn!(path = %target, error = %e, "Failed to cancel upload session")
                    }
                    Err(_) => warn!(path = %target, "Timed out cancelling upload session"),
                }
            }
            .boxed(),
        )
    }
}

/// Sizes governing a write stream.
#[derive(Debug, Clone, Copy)]
pub struct WritePolicy {
    pub chunk_size: usize,
    pub small_file_threshold: usize,
    pub abort_timeout: Duration,
}

/// Streamed writer for one remote file.
///
/// Data is buffered and sent in chunks once an upload session exists. The
/// file only changes on the server when [`WriteStream::close`] succeeds;
/// dropping an unfinished stream cancels its session in the background.
pub struct WriteStream {
    client: Arc<DriveClient>,
    locator: Arc<DriveLocator>,
    resolver: Arc<ItemResolver>,
    target: DrivePath,
    parent_id: String,
    name: String,
    expected_size: Option<u64>,
    policy: WritePolicy,
    buffer: BytesMut,
    written: u64,
    session: Option<UploadSession>,
    finished: bool,
}

impl WriteStream {
    /// Open a writer for `name` inside folder `parent_id`.
    ///
    /// A session is created right away when `expected_size` exceeds the
    /// small-file threshold, lazily once the threshold is crossed when the
    /// size is unknown, and never otherwise.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn open(
        client: Arc<DriveClient>,
        locator: Arc<DriveLocator>,
        resolver: Arc<ItemResolver>,
        target: DrivePath,
        parent_id: String,
        name: String,
        expected_size: Option<u64>,
        policy: WritePolicy,
    ) -> Result<Self> {
        let mut stream = Self {
            client,
            locator,
            resolver,
            target,
            parent_id,
            name,
            expected_size,
            policy,
            buffer: BytesMut::new(),
            written: 0,
            session: None,
            finished: false,
        };
        if expected_size.is_some_and(|size| size > policy.small_file_threshold as u64) {
            stream.start_session().await?;
        }
        Ok(stream)
    }

    pub fn target(&self) -> &DrivePath {
        &self.target
    }

    /// Bytes accepted so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn session_state(&self) -> Option<&UploadSessionState> {
        self.session.as_ref().map(|s| s.state())
    }

    fn address(&self) -> ItemAddress {
        ItemAddress::Child {
            parent_id: self.parent_id.clone(),
            name: self.name.clone(),
        }
    }

    async fn start_session(&mut self) -> Result<()> {
        let url = self
            .locator
            .action_url(&self.address(), "createUploadSession")
            .await?;
        let session = UploadSession::create(
            Arc::clone(&self.client),
            &url,
            self.target.clone(),
            self.expected_size,
            self.policy.chunk_size,
            self.policy.abort_timeout,
        )
        .await?;
        self.session = Some(session);
        Ok(())
    }

    /// Append bytes to the file.
    ///
    /// # Errors
    /// - `Protocol` when writing past the announced size or after close;
    ///   the stream is aborted
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.finished {
            return Err(Error::Protocol(format!(
                "Write to closed stream for {}",
                self.target
            )));
        }
        if let Some(expected) = self.expected_size {
            if self.written + data.len() as u64 > expected {
                let err = Error::Protocol(format!(
                    "Write past announced size {} of {}",
                    expected, self.target
                ));
                return Err(self.fail(err).await);
            }
        }

        self.buffer.extend_from_slice(data);
        self.written += data.len() as u64;

        if self.session.is_none()
            && self.expected_size.is_none()
            && self.buffer.len() > self.policy.small_file_threshold
        {
            if let Err(e) = self.start_session().await {
                return Err(self.fail(e).await);
            }
        }

        if let Err(e) = self.flush_full_chunks().await {
            return Err(self.fail(e).await);
        }
        Ok(())
    }

    async fn flush_full_chunks(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let chunk_size = self.policy.chunk_size;
        loop {
            // with an unknown size the last chunk must carry the total, so
            // always keep something back for close
            let ready = match self.expected_size {
                Some(_) => self.buffer.len() >= chunk_size,
                None => self.buffer.len() > chunk_size,
            };
            if !ready {
                return Ok(());
            }
            let chunk = self.buffer.split_to(chunk_size).freeze();
            session.submit_chunk(chunk, self.expected_size).await?;
        }
    }

    /// Finish the upload and return the written item.
    ///
    /// The item is recorded in the path cache and the parent's listing is
    /// invalidated. On failure the session is cancelled and the target's
    /// cache entry evicted.
    pub async fn close(&mut self) -> Result<RemoteItem> {
        if self.finished {
            return Err(Error::Protocol(format!(
                "Stream for {} already closed",
                self.target
            )));
        }
        if let Some(expected) = self.expected_size {
            if expected != self.written {
                let err = Error::Protocol(format!(
                    "Closed {} after {} of {} announced bytes",
                    self.target, self.written, expected
                ));
                return Err(self.fail(err).await);
            }
        }

        let dto = match self.finish_upload().await {
            Ok(dto) => dto,
            Err(e) => return Err(self.fail(e).await),
        };
        self.finished = true;

        let path = dto.reported_path().unwrap_or_else(|| self.target.clone());
        let item = dto.into_item(path);
        self.resolver.record_item(item.clone()).await;
        info!(path = %self.target, size = item.size, "Upload complete");
        Ok(item)
    }

    async fn finish_upload(&mut self) -> Result<DriveItemDto> {
        let total = self.written;
        let remaining = self.buffer.split().freeze();
        match self.session.as_mut() {
            Some(session) => {
                session.submit_chunk(remaining, Some(total)).await?;
                session.commit().await
            }
            None => {
                let url = self.locator.action_url(&self.address(), "content").await?;
                let request = HttpRequest::new(Method::PUT, url).body(remaining);
                self.client
                    .send(request, Idempotency::NonIdempotent)
                    .await?
                    .json()
            }
        }
    }

    /// Cancel the upload. The remote file is left untouched.
    pub async fn abort(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(session) = self.session.as_mut() {
            session.abort().await;
        }
    }

    async fn fail(&mut self, err: Error) -> Error {
        self.abort().await;
        self.resolver.forget(&self.target).await;
        err
    }
}

impl Drop for WriteStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Some(cancel) = self.session.as_mut().and_then(|s| s.detach_abort()) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(cancel);
            }
            Err(_) => warn!(
                path = %self.target,
                "Upload stream dropped outside a runtime; session left to expire"
            ),
        }
    }
}
