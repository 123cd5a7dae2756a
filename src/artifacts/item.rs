//! Artifact tree items.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata key holding the address an item's bytes are read from.
pub const DOWNLOAD_URL_KEY: &str = "downloadUrl";

/// Metadata key holding the address an item was durably written to.
pub const DESTINATION_URL_KEY: &str = "destinationUrl";

/// Metadata key set on symbolic links, holding the link target.
pub const SYMLINK_TARGET_KEY: &str = "symlinkTarget";

/// Kind of node in an artifact tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    File,
    Folder,
}

/// One file or folder in an artifact tree.
///
/// `path` is relative to the artifact root and always uses `/` separators.
/// The synthetic root item has an empty path. `metadata` carries addressing
/// that only the producing provider interprets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactItem {
    pub item_type: ItemType,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ArtifactItem {
    /// Create a folder item addressed at `download_url`.
    pub fn folder(path: impl Into<String>, download_url: impl Into<String>) -> Self {
        Self {
            item_type: ItemType::Folder,
            path: path.into(),
            file_length: None,
            last_modified: None,
            metadata: HashMap::from([(DOWNLOAD_URL_KEY.to_string(), download_url.into())]),
        }
    }

    /// Create a file item addressed at `download_url`.
    pub fn file(path: impl Into<String>, download_url: impl Into<String>) -> Self {
        Self {
            item_type: ItemType::File,
            ..Self::folder(path, download_url)
        }
    }

    pub fn is_folder(&self) -> bool {
        self.item_type == ItemType::Folder
    }

    pub fn is_file(&self) -> bool {
        self.item_type == ItemType::File
    }

    pub fn download_url(&self) -> Option<&str> {
        self.metadata.get(DOWNLOAD_URL_KEY).map(String::as_str)
    }

    pub fn destination_url(&self) -> Option<&str> {
        self.metadata.get(DESTINATION_URL_KEY).map(String::as_str)
    }

    pub fn is_symlink(&self) -> bool {
        self.metadata.contains_key(SYMLINK_TARGET_KEY)
    }

    /// Relative path of a direct child named `name`.
    pub fn child_path(&self, name: &str) -> String {
        if self.path.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.path, name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_path_has_no_leading_slash_at_root() {
        let root = ArtifactItem::folder("", "/data");
        assert_eq!(root.child_path("a.txt"), "a.txt");

        let sub = ArtifactItem::folder("b", "/data/b");
        assert_eq!(sub.child_path("c.txt"), "b/c.txt");
    }

    #[test]
    fn constructors_set_download_url() {
        let item = ArtifactItem::file("x/y.bin", "/tmp/x/y.bin");
        assert!(item.is_file());
        assert_eq!(item.download_url(), Some("/tmp/x/y.bin"));
        assert_eq!(item.destination_url(), None);
    }

    #[test]
    fn serializes_with_camel_case_keys() {
        let mut item = ArtifactItem::file("a.txt", "/r/a.txt");
        item.file_length = Some(10);
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["itemType"], "file");
        assert_eq!(json["fileLength"], 10);
        assert_eq!(json["metadata"]["downloadUrl"], "/r/a.txt");
        assert!(json.get("lastModified").is_none());
    }
}
