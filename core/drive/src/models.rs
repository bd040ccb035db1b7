//! Graph wire types and the domain items built from them.

use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

use graphfs_common::DrivePath;

/// A `driveItem` resource as returned by Graph.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveItemDto {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub e_tag: Option<String>,
    #[serde(default)]
    pub c_tag: Option<String>,
    #[serde(default)]
    pub created_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_modified_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parent_reference: Option<ItemReferenceDto>,
    #[serde(default)]
    pub folder: Option<FolderFacet>,
    #[serde(default)]
    pub file: Option<FileFacet>,
    #[serde(default)]
    pub root: Option<serde_json::Value>,
    /// Facets not modelled above, including anything requested via `$expand`.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemReferenceDto {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub drive_id: Option<String>,
    /// e.g. `/drives/{id}/root:/docs`
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderFacet {
    #[serde(default)]
    pub child_count: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFacet {
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub hashes: Option<HashesFacet>,
}

/// Content hashes; which ones are present depends on the drive type.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashesFacet {
    #[serde(default)]
    pub quick_xor_hash: Option<String>,
    #[serde(default)]
    pub sha1_hash: Option<String>,
    #[serde(default)]
    pub sha256_hash: Option<String>,
}

impl HashesFacet {
    /// QuickXorHash where available, then SHA-256, then SHA-1.
    pub fn preferred(self) -> Option<String> {
        self.quick_xor_hash.or(self.sha256_hash).or(self.sha1_hash)
    }
}

impl DriveItemDto {
    pub fn is_folder(&self) -> bool {
        self.folder.is_some() || self.root.is_some()
    }

    /// The item's path as reported by its parent reference.
    ///
    /// `None` when the response carries no parent path (Graph omits it for
    /// some responses) or the path is not under the drive root.
    pub fn reported_path(&self) -> Option<DrivePath> {
        if self.root.is_some() {
            return Some(DrivePath::root());
        }
        let parent = self.parent_reference.as_ref()?.path.as_deref()?;
        let (_, below_root) = parent.split_once("root:")?;
        let decoded = percent_decode_str(below_root).decode_utf8().ok()?;
        let parent = DrivePath::parse(&decoded).ok()?;
        parent.join(self.name.as_deref()?).ok()
    }

    /// Convert to a domain item located at `path`.
    pub fn into_item(self, path: DrivePath) -> RemoteItem {
        let kind = if self.is_folder() {
            ItemKind::Folder
        } else if self.file.is_some() {
            ItemKind::File
        } else {
            ItemKind::Other
        };
        let name = self
            .name
            .or_else(|| path.name().map(str::to_string))
            .unwrap_or_default();
        let parent_id = self.parent_reference.and_then(|r| r.id);
        let (mime_type, content_hash) = match self.file {
            Some(file) => (file.mime_type, file.hashes.and_then(HashesFacet::preferred)),
            None => (None, None),
        };
        RemoteItem {
            id: self.id,
            name,
            path,
            kind,
            size: self.size.unwrap_or(0),
            etag: self.e_tag,
            created: self.created_date_time,
            last_modified: self.last_modified_date_time,
            parent_id,
            mime_type,
            content_hash,
            child_count: self.folder.and_then(|f| f.child_count),
            extra: self.extra,
        }
    }
}

/// One page of a children listing.
#[derive(Debug, Deserialize)]
pub struct ChildrenPage {
    #[serde(default)]
    pub value: Vec<DriveItemDto>,
    #[serde(rename = "@odata.nextLink", default)]
    pub next_link: Option<String>,
}

/// Generic `{"value": [...]}` collection.
#[derive(Debug, Deserialize)]
pub struct Collection<T> {
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,
    #[serde(rename = "@odata.nextLink", default)]
    pub next_link: Option<String>,
}

/// Response of `createUploadSession` and of a session status query.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSessionDto {
    #[serde(default)]
    pub upload_url: Option<String>,
    #[serde(default)]
    pub expiration_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_expected_ranges: Vec<String>,
}

impl UploadSessionDto {
    /// First byte the server still expects, from ranges like `"26-"` or
    /// `"0-1023"`. `None` when nothing further is expected.
    pub fn next_expected_offset(&self) -> Option<u64> {
        self.next_expected_ranges
            .iter()
            .filter_map(|range| range.split('-').next()?.trim().parse::<u64>().ok())
            .min()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveVersionDto {
    pub id: String,
    #[serde(default)]
    pub last_modified_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub last_modified_by: Option<IdentitySetDto>,
}

#[derive(Debug, Deserialize)]
pub struct IdentitySetDto {
    #[serde(default)]
    pub user: Option<IdentityDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityDto {
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewDto {
    #[serde(default)]
    pub get_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DriveDto {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteDto {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Body of an asynchronous job monitor, as returned while a copy runs.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncJobStatusDto {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub percentage_complete: Option<f64>,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub error: Option<GraphErrorDetail>,
}

/// `{"error": {"code": ..., "message": ...}}`
#[derive(Debug, Deserialize)]
pub struct GraphErrorBody {
    pub error: GraphErrorDetail,
}

#[derive(Debug, Deserialize)]
pub struct GraphErrorDetail {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Kind of a remote item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemKind {
    File,
    Folder,
    /// Packages and other items with neither facet.
    Other,
}

/// Snapshot of a remote item.
///
/// The id is stable across moves; the path is only as current as the
/// snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub id: String,
    pub name: String,
    pub path: DrivePath,
    pub kind: ItemKind,
    pub size: u64,
    pub etag: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
    pub parent_id: Option<String>,
    pub mime_type: Option<String>,
    /// Server-computed content hash (QuickXorHash when reported).
    pub content_hash: Option<String>,
    pub child_count: Option<u64>,
    /// Unmodelled facets from the server response.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RemoteItem {
    pub fn is_folder(&self) -> bool {
        self.kind == ItemKind::Folder
    }

    pub fn is_file(&self) -> bool {
        self.kind == ItemKind::File
    }

    /// Same item relocated to `path`.
    pub fn relocated(&self, path: DrivePath) -> Self {
        let mut item = self.clone();
        if let Some(name) = path.name() {
            item.name = name.to_string();
        }
        item.path = path;
        item
    }
}

/// A stored version of a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemVersion {
    pub id: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub size: Option<u64>,
    pub modified_by: Option<String>,
}

impl From<DriveVersionDto> for ItemVersion {
    fn from(dto: DriveVersionDto) -> Self {
        Self {
            id: dto.id,
            last_modified: dto.last_modified_date_time,
            size: dto.size,
            modified_by: dto
                .last_modified_by
                .and_then(|by| by.user)
                .and_then(|user| user.display_name),
        }
    }
}
