//! Dataframe identities: `dacp://host:port/dataset_name/relative/path`.
//!
//! The first path segment selects a dataset; the remainder is relative to
//! that dataset's storage root. Parsing is plain string splitting, with `..`
//! segments rejected so an identity can never name a file outside the root.

use crate::error::{validation, Error, Result};
use std::fmt;
use std::path::{Component, Path, PathBuf};

pub const SCHEME: &str = "dacp";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataframeUri {
    scheme: String,
    authority: String,
    dataset_name: String,
    /// Always starts with `/`; `/` alone is the dataset root.
    relative_path: String,
}

impl DataframeUri {
    pub fn parse(identity: &str) -> Result<Self> {
        let (scheme, rest) = identity
            .split_once("://")
            .ok_or_else(|| validation!("identity '{}' is not a scheme://host/dataset URI", identity))?;
        if scheme.is_empty() {
            return Err(validation!("identity '{}' has an empty scheme", identity));
        }
        let (authority, path) = match rest.split_once('/') {
            Some((a, p)) => (a, p),
            None => (rest, ""),
        };
        if authority.is_empty() {
            return Err(validation!("identity '{}' has no host", identity));
        }
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let (dataset_name, relative) = match path.split_once('/') {
            Some((d, r)) => (d, r),
            None => (path, ""),
        };
        if dataset_name.is_empty() {
            return Err(validation!("identity '{}' does not name a dataset", identity));
        }
        if !is_plain_segment(dataset_name) {
            return Err(validation!("identity '{}' has an invalid dataset name", identity));
        }
        let relative = relative.trim_end_matches('/');
        if relative.split('/').any(|seg| seg == "..") {
            return Err(validation!("identity '{}' escapes its dataset root", identity));
        }
        Ok(Self {
            scheme: scheme.to_string(),
            authority: authority.to_string(),
            dataset_name: dataset_name.to_string(),
            relative_path: format!("/{}", relative),
        })
    }

    pub fn new(host: &str, port: u16, dataset_name: &str, relative_path: &str) -> Self {
        Self {
            scheme: SCHEME.to_string(),
            authority: format!("{}:{}", host, port),
            dataset_name: dataset_name.to_string(),
            relative_path: format!("/{}", relative_path.trim_matches('/')),
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// `host:port` exactly as written.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn host(&self) -> &str {
        self.authority
            .rsplit_once(':')
            .map(|(h, _)| h)
            .unwrap_or(&self.authority)
    }

    pub fn port(&self) -> Option<u16> {
        self.authority
            .rsplit_once(':')
            .and_then(|(_, p)| p.parse().ok())
    }

    pub fn dataset_name(&self) -> &str {
        &self.dataset_name
    }

    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    /// True when the identity names the dataset directory itself.
    pub fn is_dataset_root(&self) -> bool {
        self.relative_path == "/"
    }

    /// `scheme://authority/dataset`, the identity of the containing dataset.
    pub fn dataset_identity(&self) -> String {
        format!("{}://{}/{}", self.scheme, self.authority, self.dataset_name)
    }

    /// Resolve against the storage root holding one directory per dataset.
    pub fn absolute_path(&self, storage_root: &Path) -> Result<PathBuf> {
        if !is_plain_segment(&self.dataset_name) {
            return Err(validation!("identity '{}' has an invalid dataset name", self));
        }
        let mut path = storage_root.join(&self.dataset_name);
        for component in Path::new(self.relative_path.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(Error::Validation(format!(
                        "identity '{}' has an invalid path component",
                        self
                    )))
                }
            }
        }
        Ok(path)
    }

    /// Extension of the last segment, lowercased; empty for directories.
    pub fn extension(&self) -> String {
        Path::new(&self.relative_path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default()
    }
}

/// A single normal path component: not empty, `.` or `..`, no separators.
pub(crate) fn is_plain_segment(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(part)), None) if part == name
    ) && !name.contains(['/', '\\'])
}

impl fmt::Display for DataframeUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.authority, self.dataset_name)?;
        if !self.is_dataset_root() {
            f.write_str(&self.relative_path)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for DataframeUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
