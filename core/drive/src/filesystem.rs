//! Path-addressable filesystem over a Graph drive.

use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::LOCATION;
use reqwest::Method;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::time::{sleep, Instant};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use graphfs_common::{DrivePath, Error, Result};

use crate::auth::TokenManager;
use crate::backend::{encode_segment, resolve_url, DriveLocator, DriveTarget, ItemAddress};
use crate::client::{DriveClient, Idempotency};
use crate::config::DriveConfig;
use crate::models::{
    AsyncJobStatusDto, Collection, DriveItemDto, DriveVersionDto, ItemVersion, PreviewDto,
    RemoteItem,
};
use crate::read::{download, ReadStream};
use crate::resolver::ItemResolver;
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
use crate::upload::{WritePolicy, WriteStream};

/// A Microsoft Graph drive exposed as a filesystem.
///
/// Cheap to share behind an `Arc`: the token manager and the path cache are
/// the only shared mutable state, and both synchronize internally.
pub struct DriveFileSystem {
    config: DriveConfig,
    client: Arc<DriveClient>,
    locator: Arc<DriveLocator>,
    resolver: Arc<ItemResolver>,
}

impl DriveFileSystem {
    /// Create a filesystem on `target` talking to the real service.
    ///
    /// # Errors
    /// - `InvalidInput` for an invalid policy or missing credentials
    pub fn new(config: DriveConfig, target: DriveTarget) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new()?);
        Self::with_transport(config, target, transport)
    }

    /// Create a filesystem over an explicit transport.
    ///
    /// # Preconditions
    /// - `config` passes [`DriveConfig::validate`]
    ///
    /// # Postconditions
    /// - No request has been made; the token and drive are fetched on
    ///   first use
    pub fn with_transport(
        config: DriveConfig,
        target: DriveTarget,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self> {
        config.validate()?;
        let credential = config.auth.resolve()?;

        let tokens = Arc::new(TokenManager::new(
            credential,
            Arc::clone(&transport),
            config.token_safety_margin,
            config.transfer.request_timeout,
        ));
        let client = Arc::new(DriveClient::new(
            transport,
            tokens,
            config.retry.clone(),
            config.transfer.request_timeout,
        ));
        let locator = Arc::new(DriveLocator::new(
            config.graph_url.clone(),
            target,
            Arc::clone(&client),
        ));
        let resolver = Arc::new(ItemResolver::new(
            Arc::clone(&client),
            Arc::clone(&locator),
            config.cache.freshness,
            config.cache.page_size,
        ));

        info!(drive = ?locator.target(), "Created drive filesystem");
        Ok(Self {
            config,
            client,
            locator,
            resolver,
        })
    }

    /// Build a filesystem from a `msgd://`, `sharepoint://` or `onedrive://`
    /// URL, returning it with the path the URL names.
    pub fn from_url(url: &str, config: DriveConfig) -> Result<(Self, DrivePath)> {
        let (target, path) = resolve_url(url)?;
        Ok((Self::new(config, target)?, path))
    }

    pub fn config(&self) -> &DriveConfig {
        &self.config
    }

    pub fn target(&self) -> &DriveTarget {
        self.locator.target()
    }

    pub fn resolver(&self) -> &Arc<ItemResolver> {
        &self.resolver
    }

    pub fn client(&self) -> &Arc<DriveClient> {
        &self.client
    }

    /// List a folder. Listing a file yields the file itself.
    ///
    /// `expand` is passed to the server as `$expand` and bypasses the cache.
    pub async fn ls(&self, path: &DrivePath, expand: Option<&str>) -> Result<Vec<RemoteItem>> {
        match expand {
            Some(expand) => self.resolver.list_expanded(path, expand).await,
            None => self.resolver.list(path).await,
        }
    }

    /// Metadata of one item.
    pub async fn info(&self, path: &DrivePath, expand: Option<&str>) -> Result<RemoteItem> {
        let Some(expand) = expand else {
            return self.resolver.resolve(path).await;
        };
        let url = format!(
            "{}?$expand={}",
            self.locator.item_url(&ItemAddress::Path(path.clone())).await?,
            encode_segment(expand)
        );
        let dto: DriveItemDto = self.client.get_json(&url).await?;
        Ok(dto.into_item(path.clone()))
    }

    pub async fn exists(&self, path: &DrivePath) -> Result<bool> {
        match self.resolver.resolve(path).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Open a file for reading.
    ///
    /// # Errors
    /// - `NotFound` if the path does not exist
    /// - `InvalidInput` if it is a folder
    pub async fn open_read(&self, path: &DrivePath) -> Result<ReadStream> {
        let item = self.resolver.resolve(path).await?;
        if item.is_folder() {
            return Err(Error::InvalidInput(format!("{} is a directory", path)));
        }
        ReadStream::open(
            Arc::clone(&self.client),
            Arc::clone(&self.locator),
            Arc::clone(&self.resolver),
            item,
            self.config.transfer.read_block_size,
        )
        .await
    }

    /// Open a file for writing, replacing it on close if it exists.
    ///
    /// With `expected_size` the writer rejects any other length; without it
    /// the size is settled at close.
    ///
    /// # Errors
    /// - `NotFound` if the parent folder does not exist
    /// - `InvalidInput` for the root or a parent that is not a folder
    pub async fn open_write(
        &self,
        path: &DrivePath,
        expected_size: Option<u64>,
    ) -> Result<WriteStream> {
        let (parent, name) = self.resolve_parent(path).await?;
        let transfer = &self.config.transfer;
        WriteStream::open(
            Arc::clone(&self.client),
            Arc::clone(&self.locator),
            Arc::clone(&self.resolver),
            path.clone(),
            parent.id,
            name,
            expected_size,
            WritePolicy {
                chunk_size: transfer.chunk_size,
                small_file_threshold: transfer.small_file_threshold,
                abort_timeout: transfer.abort_timeout,
            },
        )
        .await
    }

    async fn resolve_parent(&self, path: &DrivePath) -> Result<(RemoteItem, String)> {
        let (Some(parent_path), Some(name)) = (path.parent(), path.name()) else {
            return Err(Error::InvalidInput("The root has no parent".to_string()));
        };
        let parent = self.resolver.resolve(&parent_path).await?;
        if !parent.is_folder() {
            return Err(Error::InvalidInput(format!(
                "{} is not a directory",
                parent_path
            )));
        }
        Ok((parent, name.to_string()))
    }

    /// Whole file content.
    pub async fn cat(&self, path: &DrivePath) -> Result<Bytes> {
        self.open_read(path).await?.read_to_end().await
    }

    /// Bytes `start..end` of a file. Negative offsets count from the end and
    /// out-of-range offsets are clamped, so the result is never an error
    /// for an existing file.
    pub async fn cat_range(&self, path: &DrivePath, start: i64, end: Option<i64>) -> Result<Bytes> {
        let mut stream = self.open_read(path).await?;
        let (start, end) = slice_bounds(stream.size(), start, end);
        stream.read_range(start, end).await
    }

    /// Write a whole buffer to a file.
    pub async fn pipe(&self, path: &DrivePath, data: Bytes) -> Result<RemoteItem> {
        let mut writer = self.open_write(path, Some(data.len() as u64)).await?;
        writer.write(&data).await?;
        writer.close().await
    }

    /// Create an empty file, or update the modification time of an existing
    /// one. With `truncate` an existing file is emptied instead.
    pub async fn touch(&self, path: &DrivePath, truncate: bool) -> Result<RemoteItem> {
        if truncate {
            return self.pipe(path, Bytes::new()).await;
        }
        let item = match self.resolver.resolve(path).await {
            Ok(item) => item,
            Err(Error::NotFound(_)) => return self.pipe(path, Bytes::new()).await,
            Err(e) => return Err(e),
        };

        let url = self.locator.item_url(&ItemAddress::Id(item.id)).await?;
        let body = serde_json::json!({
            "fileSystemInfo": {"lastModifiedDateTime": chrono::Utc::now().to_rfc3339()}
        });
        let request = HttpRequest::new(Method::PATCH, url).json(&body)?;
        let dto: DriveItemDto = self.mutate(path, request).await?.json()?;
        let item = dto.into_item(path.clone());
        self.resolver.record_item(item.clone()).await;
        Ok(item)
    }

    /// Download a file to a local path, returning the bytes written.
    pub async fn get_file(&self, rpath: &DrivePath, lpath: &Path) -> Result<u64> {
        let mut stream = self.open_read(rpath).await?;
        let mut file = tokio::fs::File::create(lpath).await?;
        let block = self.config.transfer.read_block_size;
        let mut written = 0u64;
        loop {
            let chunk = stream.read(block).await?;
            if chunk.is_empty() {
                break;
            }
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        debug!(path = %rpath, local = %lpath.display(), bytes = written, "Downloaded file");
        Ok(written)
    }

    /// Upload a local file.
    pub async fn put_file(&self, lpath: &Path, rpath: &DrivePath) -> Result<RemoteItem> {
        let file = tokio::fs::File::open(lpath).await?;
        let size = file.metadata().await?.len();
        let mut writer = self.open_write(rpath, Some(size)).await?;

        let mut chunks = ReaderStream::with_capacity(file, self.config.transfer.chunk_size);
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(chunk) => writer.write(&chunk).await?,
                Err(e) => {
                    writer.abort().await;
                    return Err(e.into());
                }
            }
        }
        writer.close().await
    }

    /// Create a folder.
    ///
    /// # Errors
    /// - `AlreadyExists` if something already lives at `path`
    /// - `NotFound` if the parent is missing and `create_parents` is false
    pub async fn mkdir(&self, path: &DrivePath, create_parents: bool) -> Result<RemoteItem> {
        if path.is_root() {
            return Err(Error::AlreadyExists(path.to_string_path()));
        }
        let parent_path = path.parent().unwrap_or_else(DrivePath::root);
        let parent = match self.resolver.resolve(&parent_path).await {
            Ok(parent) => parent,
            Err(Error::NotFound(_)) if create_parents => self.makedirs(&parent_path, true).await?,
            Err(e) => return Err(e),
        };
        self.create_folder(&parent, path).await
    }

    /// Create a folder and any missing ancestors.
    ///
    /// # Errors
    /// - `AlreadyExists` if `path` exists and `exist_ok` is false, or an
    ///   ancestor is a file
    pub async fn makedirs(&self, path: &DrivePath, exist_ok: bool) -> Result<RemoteItem> {
        let mut current_path = DrivePath::root();
        let mut current = self.resolver.resolve(&current_path).await?;
        let mut existed = true;

        for name in path.components() {
            let child_path = current_path.join(name)?;
            current = match self.resolver.resolve(&child_path).await {
                Ok(item) if item.is_folder() => {
                    existed = true;
                    item
                }
                Ok(_) => {
                    return Err(Error::AlreadyExists(format!(
                        "{} exists and is not a directory",
                        child_path
                    )))
                }
                Err(Error::NotFound(_)) => {
                    existed = false;
                    self.create_folder(&current, &child_path).await?
                }
                Err(e) => return Err(e),
            };
            current_path = child_path;
        }

        if existed && !exist_ok {
            return Err(Error::AlreadyExists(path.to_string_path()));
        }
        Ok(current)
    }

    async fn create_folder(&self, parent: &RemoteItem, path: &DrivePath) -> Result<RemoteItem> {
        let name = path
            .name()
            .ok_or_else(|| Error::AlreadyExists(path.to_string_path()))?;
        if !parent.is_folder() {
            return Err(Error::InvalidInput(format!(
                "{} is not a directory",
                parent.path
            )));
        }

        let url = self
            .locator
            .action_url(&ItemAddress::Id(parent.id.clone()), "children")
            .await?;
        let body = serde_json::json!({
            "name": name,
            "folder": {},
            "@microsoft.graph.conflictBehavior": "fail",
        });
        let request = HttpRequest::new(Method::POST, url).json(&body)?;
        let dto: DriveItemDto = match self.mutate(path, request).await {
            Ok(response) => response.json()?,
            Err(Error::Conflict(_)) => return Err(Error::AlreadyExists(path.to_string_path())),
            Err(e) => return Err(e),
        };

        let item = dto.into_item(path.clone());
        info!(path = %path, item_id = %item.id, "Created folder");
        self.resolver.record_item(item.clone()).await;
        Ok(item)
    }

    /// Move or rename an item.
    ///
    /// # Errors
    /// - `Conflict` if `to` exists and `overwrite` is false
    /// - `InvalidInput` when moving a folder into itself
    pub async fn mv(&self, from: &DrivePath, to: &DrivePath, overwrite: bool) -> Result<RemoteItem> {
        if from.is_root() {
            return Err(Error::InvalidInput("Cannot move the root".to_string()));
        }
        if to.starts_with(from) {
            return Err(Error::InvalidInput(format!(
                "Cannot move {} into itself",
                from
            )));
        }

        let source = self.resolver.resolve(from).await?;
        let (parent, name) = self.resolve_parent(to).await?;

        let behavior = if overwrite { "replace" } else { "fail" };
        let url = format!(
            "{}?@microsoft.graph.conflictBehavior={}",
            self.locator.item_url(&ItemAddress::Id(source.id)).await?,
            behavior
        );
        let body = serde_json::json!({
            "parentReference": {"id": parent.id},
            "name": name,
        });
        let request = HttpRequest::new(Method::PATCH, url).json(&body)?;
        let response = match self.mutate(from, request).await {
            Ok(response) => response,
            Err(e) => {
                self.resolver.invalidate(to).await;
                return Err(e);
            }
        };

        let dto: DriveItemDto = response.json()?;
        let item = dto.into_item(to.clone());
        self.resolver.record_move(from, item.clone()).await;
        info!(from = %from, to = %to, item_id = %item.id, "Moved item");
        Ok(item)
    }

    /// Copy an item on the server; folders are copied with their contents.
    ///
    /// Graph runs copies asynchronously. This waits on the job monitor until
    /// the copy lands, then returns the new item.
    ///
    /// # Errors
    /// - `Conflict` if `to` exists and `overwrite` is false
    /// - `InvalidInput` when copying a folder into itself
    /// - `Unavailable` if the copy does not finish within the copy timeout
    pub async fn copy(&self, from: &DrivePath, to: &DrivePath, overwrite: bool) -> Result<RemoteItem> {
        if to.starts_with(from) {
            return Err(Error::InvalidInput(format!(
                "Cannot copy {} into itself",
                from
            )));
        }

        let source = self.resolver.resolve(from).await?;
        let (parent, name) = self.resolve_parent(to).await?;

        let behavior = if overwrite { "replace" } else { "fail" };
        let url = format!(
            "{}?@microsoft.graph.conflictBehavior={}",
            self.locator
                .action_url(&ItemAddress::Id(source.id.clone()), "copy")
                .await?,
            behavior
        );
        let body = serde_json::json!({
            "parentReference": {"id": parent.id},
            "name": name,
        });
        let request = HttpRequest::new(Method::POST, url).json(&body)?;
        let response = self.mutate(to, request).await?;

        let monitor = response
            .header(&LOCATION)
            .ok_or_else(|| Error::Protocol(format!("Copy of {} returned no monitor", from)))?
            .to_string();
        let outcome = self.await_copy(&monitor, to).await;
        self.resolver.forget(to).await;
        outcome?;

        let item = self.resolver.resolve(to).await?;
        info!(from = %from, to = %to, item_id = %item.id, "Copied item");
        Ok(item)
    }

    /// Poll a copy monitor until the job completes, fails or times out.
    async fn await_copy(&self, monitor: &str, to: &DrivePath) -> Result<()> {
        let deadline = Instant::now() + self.config.transfer.copy_timeout;
        let mut attempt = 0u32;
        loop {
            let response = self
                .client
                .send_anonymous(HttpRequest::get(monitor), Idempotency::Idempotent)
                .await?;
            // a finished job may redirect to the new item
            if response.is_redirect() {
                return Ok(());
            }
            let status: AsyncJobStatusDto = response.json()?;
            match status.status.as_str() {
                "completed" => return Ok(()),
                "failed" => {
                    let (code, message) = status
                        .error
                        .map(|e| (e.code, e.message))
                        .unwrap_or_else(|| ("copyFailed".to_string(), String::new()));
                    warn!(to = %to, code = %code, "Copy job failed");
                    if code == "nameAlreadyExists" {
                        return Err(Error::Conflict(to.to_string_path()));
                    }
                    // the monitor reports failures with a success status
                    return Err(Error::Request {
                        status: 500,
                        code,
                        message,
                    });
                }
                other => {
                    debug!(
                        to = %to,
                        status = other,
                        percent = status.percentage_complete.unwrap_or(0.0),
                        "Copy in progress"
                    );
                }
            }
            let delay = self.config.retry.delay_for_attempt(attempt);
            if Instant::now() + delay > deadline {
                return Err(Error::Unavailable(format!(
                    "Copy to {} did not finish within {:?}",
                    to, self.config.transfer.copy_timeout
                )));
            }
            sleep(delay).await;
            attempt += 1;
        }
    }

    /// Remove a file, or a folder when `recursive` is set.
    ///
    /// Items go to the recycle bin when the configuration asks for it and
    /// are deleted permanently otherwise.
    ///
    /// # Errors
    /// - `NotEmpty` for a non-empty folder without `recursive`
    pub async fn rm(&self, path: &DrivePath, recursive: bool) -> Result<()> {
        if path.is_root() {
            return Err(Error::InvalidInput("Cannot remove the root".to_string()));
        }
        let item = self.resolver.resolve(path).await?;
        if item.is_folder() && !recursive && !self.resolver.list(path).await?.is_empty() {
            return Err(Error::NotEmpty(path.to_string_path()));
        }

        let address = ItemAddress::Id(item.id.clone());
        let request = if self.config.use_recycle_bin {
            HttpRequest::new(Method::DELETE, self.locator.item_url(&address).await?)
        } else {
            HttpRequest::new(
                Method::POST,
                self.locator.action_url(&address, "permanentDelete").await?,
            )
            .body(Bytes::new())
        };
        self.mutate(path, request).await?;

        self.resolver.evict(path).await;
        info!(path = %path, item_id = %item.id, recycle = self.config.use_recycle_bin, "Removed item");
        Ok(())
    }

    /// Remove an empty folder.
    pub async fn rmdir(&self, path: &DrivePath) -> Result<()> {
        let item = self.resolver.resolve(path).await?;
        if !item.is_folder() {
            return Err(Error::InvalidInput(format!("{} is not a directory", path)));
        }
        self.rm(path, false).await
    }

    /// Check in a checked-out file, publishing it with `comment`.
    pub async fn checkin(&self, path: &DrivePath, comment: &str) -> Result<()> {
        let url = self.item_action(path, "checkin").await?;
        let request =
            HttpRequest::new(Method::POST, url).json(&serde_json::json!({ "comment": comment }))?;
        self.mutate(path, request).await?;
        self.resolver.invalidate(path).await;
        Ok(())
    }

    /// Check out a file so only the caller can edit it.
    pub async fn checkout(&self, path: &DrivePath) -> Result<()> {
        let url = self.item_action(path, "checkout").await?;
        self.mutate(path, HttpRequest::new(Method::POST, url).body(Bytes::new()))
            .await?;
        self.resolver.invalidate(path).await;
        Ok(())
    }

    /// Stored versions of a file, newest first as reported by the server.
    pub async fn get_versions(&self, path: &DrivePath) -> Result<Vec<ItemVersion>> {
        let mut url = self.item_action(path, "versions").await?;
        let mut versions = Vec::new();
        loop {
            let page: Collection<DriveVersionDto> = self.client.get_json(&url).await?;
            versions.extend(page.value.into_iter().map(ItemVersion::from));
            match page.next_link {
                Some(next) => url = next,
                None => return Ok(versions),
            }
        }
    }

    /// Short-lived URL of an embeddable preview.
    pub async fn preview_link(&self, path: &DrivePath) -> Result<String> {
        let url = self.item_action(path, "preview").await?;
        let request = HttpRequest::new(Method::POST, url).json(&serde_json::json!({}))?;
        let preview: PreviewDto = self
            .client
            .send(request, Idempotency::Idempotent)
            .await?
            .json()?;
        preview
            .get_url
            .ok_or_else(|| Error::Protocol(format!("No preview URL returned for {}", path)))
    }

    /// File content, converted by the server when `format` is given
    /// (e.g. `pdf`).
    pub async fn get_content(&self, path: &DrivePath, format: Option<&str>) -> Result<Bytes> {
        let Some(format) = format else {
            return self.cat(path).await;
        };
        let url = format!(
            "{}?format={}",
            self.item_action(path, "content").await?,
            encode_segment(format)
        );
        Ok(download(&self.client, &url, None)
            .await?
            .map(|response| response.body)
            .unwrap_or_default())
    }

    /// Update the list-item fields (document library columns) of an item,
    /// returning the fields as stored.
    pub async fn set_properties(
        &self,
        path: &DrivePath,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Map<String, serde_json::Value>> {
        let url = self.item_action(path, "listItem/fields").await?;
        let request = HttpRequest::new(Method::PATCH, url).json(&fields)?;
        let stored = self.mutate(path, request).await?.json()?;
        self.resolver.invalidate(path).await;
        Ok(stored)
    }

    /// Forget every cached path.
    pub async fn clear_cache(&self) {
        self.resolver.clear().await;
    }

    async fn item_action(&self, path: &DrivePath, action: &str) -> Result<String> {
        let item = self.resolver.resolve(path).await?;
        self.locator
            .action_url(&ItemAddress::Id(item.id), action)
            .await
    }

    /// Send a state-changing request. When its outcome is unknown the path
    /// is evicted so the next lookup asks the server.
    async fn mutate(&self, path: &DrivePath, request: HttpRequest) -> Result<HttpResponse> {
        match self.client.send(request, Idempotency::NonIdempotent).await {
            Ok(response) => Ok(response),
            Err(e) => {
                if e.is_transient() {
                    self.resolver.forget(path).await;
                }
                Err(e)
            }
        }
    }
}

/// Clamp slice offsets the way sequence slicing does.
fn slice_bounds(size: u64, start: i64, end: Option<i64>) -> (u64, u64) {
    let clamp = |offset: i64| -> u64 {
        if offset < 0 {
            size.saturating_sub(offset.unsigned_abs())
        } else {
            (offset as u64).min(size)
        }
    };
    let start = clamp(start);
    let end = end.map_or(size, clamp);
    (start, end.max(start))
}
