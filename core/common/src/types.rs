//! Common types used throughout graphfs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A normalized, absolute path within a remote drive.
///
/// Paths are stored as name components; the textual form always starts with
/// `/` and never ends with one (except for the root). Empty components and
/// `.` are dropped while parsing, `..` is rejected.
///
/// Serializes as its textual form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DrivePath {
    components: Vec<String>,
}

impl DrivePath {
    /// Create a root path.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Create a path from name components.
    ///
    /// # Errors
    /// - Returns error if any component is empty, `.`/`..`, or contains a
    ///   separator
    pub fn from_components(components: Vec<String>) -> crate::Result<Self> {
        for comp in &components {
            validate_component(comp)?;
        }
        Ok(Self { components })
    }

    /// Parse a path string into a DrivePath.
    ///
    /// Uses '/' as separator. Leading, trailing and repeated separators are
    /// ignored, so `"a//b/"` and `"/a/b"` are the same path.
    pub fn parse(path: &str) -> crate::Result<Self> {
        let mut components = Vec::new();
        for segment in path.split('/') {
            match segment {
                "" | "." => continue,
                ".." => {
                    return Err(crate::Error::InvalidInput(format!(
                        "Parent references are not supported: {}",
                        path
                    )))
                }
                other => {
                    validate_component(other)?;
                    components.push(other.to_string());
                }
            }
        }
        Ok(Self { components })
    }

    /// Check if this is the root path.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Get the parent path, if any.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            None
        } else {
            let mut components = self.components.clone();
            components.pop();
            Some(Self { components })
        }
    }

    /// Get the file/directory name (last component).
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }

    /// Join this path with a child component.
    pub fn join(&self, child: &str) -> crate::Result<Self> {
        validate_component(child)?;
        let mut components = self.components.clone();
        components.push(child.to_string());
        Ok(Self { components })
    }

    /// Get the path components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Number of components below the root.
    pub fn depth(&self) -> usize {
        self.components.len()
    }

    /// Whether `self` is `ancestor` or lies below it.
    pub fn starts_with(&self, ancestor: &DrivePath) -> bool {
        self.components.starts_with(&ancestor.components)
    }

    /// Re-root this path: replace the `from` prefix with `to`.
    ///
    /// Returns `None` when `self` is not below `from`.
    pub fn rebase(&self, from: &DrivePath, to: &DrivePath) -> Option<Self> {
        if !self.starts_with(from) {
            return None;
        }
        let mut components = to.components.clone();
        components.extend_from_slice(&self.components[from.components.len()..]);
        Some(Self { components })
    }

    /// Convert to a string representation.
    pub fn to_string_path(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else {
            format!("/{}", self.components.join("/"))
        }
    }
}

fn validate_component(comp: &str) -> crate::Result<()> {
    if comp.is_empty() {
        return Err(crate::Error::InvalidInput(
            "Path component cannot be empty".to_string(),
        ));
    }
    if comp == "." || comp == ".." {
        return Err(crate::Error::InvalidInput(format!(
            "Path component cannot be '{}'",
            comp
        )));
    }
    if comp.contains('/') || comp.contains('\\') {
        return Err(crate::Error::InvalidInput(
            "Path component cannot contain separators".to_string(),
        ));
    }
    Ok(())
}

impl fmt::Display for DrivePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_path())
    }
}

impl std::str::FromStr for DrivePath {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DrivePath {
    type Error = crate::Error;

    fn try_from(s: String) -> crate::Result<Self> {
        Self::parse(&s)
    }
}

impl From<DrivePath> for String {
    fn from(path: DrivePath) -> Self {
        path.to_string_path()
    }
}
