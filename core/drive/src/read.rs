//! Ranged reads of remote file content.

use bytes::{Bytes, BytesMut};
use reqwest::header::{LOCATION, RANGE};
use std::io::SeekFrom;
use std::sync::Arc;
use tracing::debug;

use graphfs_common::{Error, Result};

use crate::backend::{DriveLocator, ItemAddress};
use crate::client::{DriveClient, Idempotency};
use crate::models::{DriveItemDto, RemoteItem};
use crate::resolver::ItemResolver;
use crate::transport::{HttpRequest, HttpResponse};

/// Download `url`, following a redirect to a pre-authenticated content URL.
///
/// `range` is inclusive. A 416 from the server yields `Ok(None)`.
pub(crate) async fn download(
    client: &DriveClient,
    url: &str,
    range: Option<(u64, u64)>,
) -> Result<Option<HttpResponse>> {
    let build = |url: &str| -> Result<HttpRequest> {
        let request = HttpRequest::get(url);
        match range {
            Some((start, end)) => request.header_str(RANGE, &format!("bytes={}-{}", start, end)),
            None => Ok(request),
        }
    };

    let response = match client.send(build(url)?, Idempotency::Idempotent).await {
        Ok(response) => response,
        Err(Error::Request { status: 416, .. }) => return Ok(None),
        Err(e) => return Err(e),
    };
    if !response.is_redirect() {
        return Ok(Some(response));
    }

    let location = response
        .header(&LOCATION)
        .ok_or_else(|| Error::Protocol(format!("Redirect without location from {}", url)))?
        .to_string();
    debug!(location = %location, "Following download redirect");
    match client
        .send_anonymous(build(&location)?, Idempotency::Idempotent)
        .await
    {
        Ok(response) => Ok(Some(response)),
        Err(Error::Request { status: 416, .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Position of a read stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadCursor {
    pub offset: u64,
    pub eof: bool,
}

/// A seekable reader over one version of a remote file.
///
/// The item's etag is confirmed with the server at open; before every range
/// fetch the stream checks it again and fails with `StaleRead` if the file
/// changed, so bytes of two versions are never mixed. A stale stream drops
/// the path from the cache, so reopening reads the new version.
pub struct ReadStream {
    client: Arc<DriveClient>,
    locator: Arc<DriveLocator>,
    resolver: Arc<ItemResolver>,
    item: RemoteItem,
    cursor: ReadCursor,
    buffer: Bytes,
    buffer_start: u64,
    block_size: usize,
}

impl ReadStream {
    /// Open a stream on `item`, a possibly cached snapshot.
    ///
    /// The snapshot is refreshed from the server first; a newer version is
    /// adopted and written back to the cache.
    ///
    /// # Errors
    /// - `NotFound` if the item no longer exists
    /// - `InvalidInput` if it is a folder
    pub(crate) async fn open(
        client: Arc<DriveClient>,
        locator: Arc<DriveLocator>,
        resolver: Arc<ItemResolver>,
        item: RemoteItem,
        block_size: usize,
    ) -> Result<Self> {
        let url = locator.item_url(&ItemAddress::Id(item.id.clone())).await?;
        let current = match client.get_json::<DriveItemDto>(&url).await {
            Ok(dto) => dto.into_item(item.path.clone()),
            Err(Error::NotFound(_)) => {
                resolver.forget(&item.path).await;
                return Err(Error::NotFound(item.path.to_string_path()));
            }
            Err(e) => return Err(e),
        };
        if current.etag != item.etag {
            debug!(path = %item.path, old = ?item.etag, new = ?current.etag, "Cached snapshot was outdated");
            resolver.record_item(current.clone()).await;
        }
        if current.is_folder() {
            return Err(Error::InvalidInput(format!("{} is a directory", current.path)));
        }

        let eof = current.size == 0;
        Ok(Self {
            client,
            locator,
            resolver,
            item: current,
            cursor: ReadCursor { offset: 0, eof },
            buffer: Bytes::new(),
            buffer_start: 0,
            block_size,
        })
    }

    /// The item as it was when the stream was opened.
    pub fn item(&self) -> &RemoteItem {
        &self.item
    }

    pub fn size(&self) -> u64 {
        self.item.size
    }

    pub fn cursor(&self) -> ReadCursor {
        self.cursor
    }

    pub fn position(&self) -> u64 {
        self.cursor.offset
    }

    /// Move the cursor. Seeking past the end is allowed; reads there are
    /// empty.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.item.size.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.cursor.offset.checked_add_signed(delta),
        }
        .ok_or_else(|| Error::InvalidInput(format!("Invalid seek to {:?}", pos)))?;

        self.cursor = ReadCursor {
            offset: target,
            eof: target >= self.item.size,
        };
        Ok(target)
    }

    /// Read up to `len` bytes from the cursor.
    ///
    /// Returns fewer bytes only at end of file, and an empty buffer past it.
    pub async fn read(&mut self, len: usize) -> Result<Bytes> {
        let remaining = self.item.size.saturating_sub(self.cursor.offset);
        let wanted = remaining.min(len as u64) as usize;
        if wanted == 0 {
            self.cursor.eof = self.cursor.offset >= self.item.size;
            return Ok(Bytes::new());
        }

        let mut out = BytesMut::with_capacity(wanted);
        while out.len() < wanted {
            let offset = self.cursor.offset;
            if !self.buffered(offset) {
                self.fill(offset, wanted - out.len()).await?;
                if !self.buffered(offset) {
                    // server has less than it claimed
                    self.cursor.eof = true;
                    break;
                }
            }
            let start = (offset - self.buffer_start) as usize;
            let take = (self.buffer.len() - start).min(wanted - out.len());
            out.extend_from_slice(&self.buffer[start..start + take]);
            self.cursor.offset += take as u64;
        }

        self.cursor.eof = self.cursor.offset >= self.item.size;
        Ok(out.freeze())
    }

    /// Read from the cursor to the end of the file.
    pub async fn read_to_end(&mut self) -> Result<Bytes> {
        let remaining = self.item.size.saturating_sub(self.cursor.offset);
        self.read(remaining as usize).await
    }

    /// Read the half-open byte range `[start, end)`, leaving the cursor at
    /// its end.
    pub async fn read_range(&mut self, start: u64, end: u64) -> Result<Bytes> {
        self.seek(SeekFrom::Start(start))?;
        self.read(end.saturating_sub(start) as usize).await
    }

    fn buffered(&self, offset: u64) -> bool {
        offset >= self.buffer_start && offset < self.buffer_start + self.buffer.len() as u64
    }

    async fn fill(&mut self, offset: u64, wanted: usize) -> Result<()> {
        self.ensure_unchanged().await?;

        let span = wanted.max(self.block_size) as u64;
        let end = (offset + span).min(self.item.size) - 1;
        let url = self
            .locator
            .action_url(&ItemAddress::Id(self.item.id.clone()), "content")
            .await?;

        debug!(item_id = %self.item.id, start = offset, end, "Fetching range");
        let body = match download(&self.client, &url, Some((offset, end))).await? {
            None => Bytes::new(),
            Some(response) if response.status == 206 => response.body,
            // server ignored the range and sent everything
            Some(response) => {
                let len = response.body.len() as u64;
                if offset >= len {
                    Bytes::new()
                } else {
                    response
                        .body
                        .slice(offset as usize..(end + 1).min(len) as usize)
                }
            }
        };

        self.buffer = body;
        self.buffer_start = offset;
        Ok(())
    }

    async fn ensure_unchanged(&self) -> Result<()> {
        let url = format!(
            "{}?$select=id,eTag",
            self.locator
                .item_url(&ItemAddress::Id(self.item.id.clone()))
                .await?
        );
        let current: DriveItemDto = match self.client.get_json(&url).await {
            Ok(dto) => dto,
            Err(Error::NotFound(_)) => {
                self.resolver.forget(&self.item.path).await;
                return Err(Error::StaleRead(format!(
                    "{} was deleted while being read",
                    self.item.path
                )));
            }
            Err(e) => return Err(e),
        };

        if current.e_tag != self.item.etag {
            self.resolver.invalidate(&self.item.path).await;
            return Err(Error::StaleRead(format!(
                "{} changed while being read (etag {:?} -> {:?})",
                self.item.path, self.item.etag, current.e_tag
            )));
        }
        Ok(())
    }
}
