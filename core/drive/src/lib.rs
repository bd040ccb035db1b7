//! Microsoft Graph drives as a path-addressable filesystem.
//!
//! [`DriveFileSystem`] exposes list, stat, read, write, move, copy, remove and
//! versioning operations on a OneDrive or SharePoint document library.
//! Each operation becomes one or more authenticated Graph requests.
//!
//! # Layers
//! - [`auth`]: credentials and the shared access token
//! - [`client`]: authenticated requests, retries and error classification
//! - [`resolver`]: path to item mapping with a bounded-freshness cache
//! - [`read`] / [`upload`]: ranged downloads and chunked upload sessions
//! - [`filesystem`]: the operations callers use
//!
//! All network I/O goes through the [`transport::HttpTransport`] trait.

pub mod auth;
pub mod backend;
pub mod client;
pub mod config;
pub mod filesystem;
pub mod models;
pub mod read;
pub mod resolver;
pub mod retry;
pub mod transport;
pub mod upload;

#[cfg(test)]
mod fake_graph;

pub use auth::{AccessToken, Credential, Grant, TokenManager};
pub use backend::{parse_drive_url, resolve_url, DriveTarget, DriveUrl, ItemAddress, Scheme};
pub use client::{DriveClient, Idempotency};
pub use config::{AuthParams, CachePolicy, DriveConfig, RetryConfig, TransferPolicy};
pub use filesystem::DriveFileSystem;
pub use models::{ItemKind, ItemVersion, RemoteItem};
pub use read::{ReadCursor, ReadStream};
pub use resolver::{CacheEntry, ItemResolver};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, TransportError};
pub use upload::{UploadSession, UploadSessionState, UploadStatus, WriteStream};

pub use graphfs_common::{DrivePath, Error, Result};
