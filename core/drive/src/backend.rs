//! Drive targets and item addressing.
//!
//! A [`DriveTarget`] names which drive a filesystem works on; the
//! [`DriveLocator`] turns it into a drive URL (discovering ids when the
//! target is given by name) and builds item URLs from an [`ItemAddress`].

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

use graphfs_common::{DrivePath, Error, Result};

use crate::client::DriveClient;
use crate::models::{Collection, DriveDto, SiteDto};

/// Characters escaped inside a path segment or query value.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub(crate) fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT).to_string()
}

/// URL schemes a filesystem can be constructed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// `msgd://<site name>/<drive name>/<path>`
    Msgd,
    /// `sharepoint://<site id>[/<drive id>]/<path>`
    SharePoint,
    /// `onedrive://<path>` on the signed-in user's drive.
    OneDrive,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Msgd => "msgd",
            Scheme::SharePoint => "sharepoint",
            Scheme::OneDrive => "onedrive",
        }
    }

    /// Choose the drive a parsed URL refers to.
    ///
    /// # Errors
    /// - `InvalidInput` if a site-based scheme is missing its site
    pub fn target(&self, url: &DriveUrl) -> Result<DriveTarget> {
        match self {
            Scheme::Msgd => {
                let site_name = url.site.clone().ok_or_else(|| {
                    Error::InvalidInput("Path must include site name".to_string())
                })?;
                Ok(DriveTarget::SiteSearch {
                    site_name,
                    drive_name: url.drive.clone(),
                })
            }
            Scheme::SharePoint => match (&url.site, &url.drive) {
                (_, Some(drive_id)) => Ok(DriveTarget::Drive {
                    drive_id: drive_id.clone(),
                }),
                (Some(site_id), None) => Ok(DriveTarget::Site {
                    site_id: site_id.clone(),
                }),
                (None, None) => Err(Error::InvalidInput(
                    "Path must include a site or drive id".to_string(),
                )),
            },
            Scheme::OneDrive => Ok(DriveTarget::Me),
        }
    }
}

impl FromStr for Scheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "msgd" => Ok(Scheme::Msgd),
            "sharepoint" => Ok(Scheme::SharePoint),
            "onedrive" => Ok(Scheme::OneDrive),
            other => Err(Error::InvalidInput(format!("Unsupported scheme: {}", other))),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Components of a `scheme://site/drive/path` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveUrl {
    pub scheme: Option<Scheme>,
    pub site: Option<String>,
    pub drive: Option<String>,
    pub path: DrivePath,
}

/// Split a drive URL into scheme, site, drive and path.
///
/// Without a scheme the first segment is the drive: `Documents/a.txt`
/// names `/a.txt` on drive `Documents`. Segments are taken verbatim, no
/// percent-decoding is applied.
pub fn parse_drive_url(url: &str) -> Result<DriveUrl> {
    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (Some(scheme.parse::<Scheme>()?), rest),
        None => (None, url),
    };

    let mut segments = rest.split('/').filter(|s| !s.is_empty());
    let site = match scheme {
        Some(_) => segments.next().map(str::to_string),
        None => None,
    };
    let drive = segments.next().map(str::to_string);
    let path = DrivePath::from_components(segments.map(str::to_string).collect())?;

    Ok(DriveUrl {
        scheme,
        site,
        drive,
        path,
    })
}

/// Drive target and in-drive path named by a scheme URL.
///
/// `onedrive://` URLs carry no site or drive, so every segment belongs to
/// the path.
///
/// # Errors
/// - `InvalidInput` if the URL has no scheme or lacks a required site
pub fn resolve_url(url: &str) -> Result<(DriveTarget, DrivePath)> {
    let parsed = parse_drive_url(url)?;
    let scheme = parsed
        .scheme
        .ok_or_else(|| Error::InvalidInput(format!("URL has no scheme: {}", url)))?;

    let path = match scheme {
        Scheme::OneDrive => {
            let mut components: Vec<String> =
                parsed.site.iter().chain(parsed.drive.iter()).cloned().collect();
            components.extend(parsed.path.components().iter().cloned());
            DrivePath::from_components(components)?
        }
        Scheme::Msgd | Scheme::SharePoint => parsed.path.clone(),
    };
    Ok((scheme.target(&parsed)?, path))
}

/// Which drive a filesystem operates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveTarget {
    /// A drive by id.
    Drive { drive_id: String },
    /// The default document library of a site.
    Site { site_id: String },
    /// The signed-in user's OneDrive.
    Me,
    /// A site found by name, and optionally one of its libraries by name.
    SiteSearch {
        site_name: String,
        drive_name: Option<String>,
    },
}

/// How an item is addressed in a request URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemAddress {
    Root,
    Path(DrivePath),
    Id(String),
    /// A (possibly not yet existing) child of a known folder.
    Child { parent_id: String, name: String },
}

/// Builds request URLs for one drive.
pub struct DriveLocator {
    graph_url: String,
    target: DriveTarget,
    client: Arc<DriveClient>,
    drive_url: OnceCell<String>,
}

impl DriveLocator {
    pub fn new(graph_url: impl Into<String>, target: DriveTarget, client: Arc<DriveClient>) -> Self {
        Self {
            graph_url: graph_url.into(),
            target,
            client,
            drive_url: OnceCell::new(),
        }
    }

    pub fn target(&self) -> &DriveTarget {
        &self.target
    }

    pub fn graph_url(&self) -> &str {
        &self.graph_url
    }

    /// Base URL of the drive, discovered on first use for named targets.
    ///
    /// # Errors
    /// - `NotFound` if a named site or library does not exist
    pub async fn drive_url(&self) -> Result<&str> {
        self.drive_url
            .get_or_try_init(|| self.discover())
            .await
            .map(String::as_str)
    }

    async fn discover(&self) -> Result<String> {
        let base = &self.graph_url;
        match &self.target {
            DriveTarget::Drive { drive_id } => {
                Ok(format!("{}/drives/{}", base, encode_segment(drive_id)))
            }
            DriveTarget::Site { site_id } => {
                Ok(format!("{}/sites/{}/drive", base, encode_segment(site_id)))
            }
            DriveTarget::Me => Ok(format!("{}/me/drive", base)),
            DriveTarget::SiteSearch {
                site_name,
                drive_name,
            } => {
                let site = self.find_site(site_name).await?;
                let url = match drive_name {
                    None => format!("{}/sites/{}/drive", base, encode_segment(&site.id)),
                    Some(name) => {
                        let drive = self.find_drive(&site, name).await?;
                        format!("{}/drives/{}", base, encode_segment(&drive.id))
                    }
                };
                info!(site = %site_name, drive_url = %url, "Discovered drive");
                Ok(url)
            }
        }
    }

    async fn find_site(&self, site_name: &str) -> Result<SiteDto> {
        let url = format!("{}/sites?search={}", self.graph_url, encode_segment(site_name));
        let sites: Collection<SiteDto> = self.client.get_json(&url).await?;
        sites
            .value
            .into_iter()
            .find(|site| {
                [&site.name, &site.display_name]
                    .into_iter()
                    .flatten()
                    .any(|n| n.eq_ignore_ascii_case(site_name))
            })
            .ok_or_else(|| Error::NotFound(format!("No site found with name {}", site_name)))
    }

    async fn find_drive(&self, site: &SiteDto, drive_name: &str) -> Result<DriveDto> {
        let url = format!("{}/sites/{}/drives", self.graph_url, encode_segment(&site.id));
        let drives: Collection<DriveDto> = self.client.get_json(&url).await?;
        drives
            .value
            .into_iter()
            .find(|d| {
                d.name
                    .as_deref()
                    .is_some_and(|n| n.eq_ignore_ascii_case(drive_name))
            })
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "No drive named {} in site {}",
                    drive_name, site.id
                ))
            })
    }

    /// URL of an item resource.
    pub async fn item_url(&self, address: &ItemAddress) -> Result<String> {
        let drive = self.drive_url().await?;
        Ok(match address {
            ItemAddress::Root => format!("{}/root", drive),
            ItemAddress::Path(path) if path.is_root() => format!("{}/root", drive),
            ItemAddress::Path(path) => {
                let encoded: Vec<String> =
                    path.components().iter().map(|c| encode_segment(c)).collect();
                format!("{}/root:/{}:", drive, encoded.join("/"))
            }
            ItemAddress::Id(id) => format!("{}/items/{}", drive, encode_segment(id)),
            ItemAddress::Child { parent_id, name } => format!(
                "{}/items/{}:/{}:",
                drive,
                encode_segment(parent_id),
                encode_segment(name)
            ),
        })
    }

    /// URL of a sub-resource or action of an item, e.g. `children`.
    pub async fn action_url(&self, address: &ItemAddress, action: &str) -> Result<String> {
        Ok(format!("{}/{}", self.item_url(address).await?, action))
    }
}
