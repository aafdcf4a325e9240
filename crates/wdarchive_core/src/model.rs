use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

pub const LEGACY_EXTENSION: &str = "txt";
pub const NEW_EXTENSION: &str = "ftml";

/// Categorical marker the source attaches to every history row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ChangeFlag {
    New,
    Source,
    Title,
    Rename,
    Tags,
    Metadata,
    File,
    Other(String),
}

impl ChangeFlag {
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "N" => Self::New,
            "S" => Self::Source,
            "T" => Self::Title,
            "R" => Self::Rename,
            "A" => Self::Tags,
            "M" => Self::Metadata,
            "F" => Self::File,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::New => "N",
            Self::Source => "S",
            Self::Title => "T",
            Self::Rename => "R",
            Self::Tags => "A",
            Self::Metadata => "M",
            Self::File => "F",
            Self::Other(value) => value,
        }
    }
}

impl From<String> for ChangeFlag {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<ChangeFlag> for String {
    fn from(value: ChangeFlag) -> Self {
        value.as_str().to_string()
    }
}

/// One row of a page's history as reported by the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionEntry {
    pub id: i64,
    pub flag: Option<ChangeFlag>,
    pub date: i64,
    pub user: Option<String>,
    pub comment: String,
    pub attached_file: bool,
}

/// A revision placed in the global, cross-page change list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub id: i64,
    pub page_id: i64,
    /// Name of the page when the list was compiled, not at revision time.
    pub page_name: String,
    pub flag: Option<ChangeFlag>,
    pub date: i64,
    pub user: Option<String>,
    pub comment: String,
}

impl Change {
    pub fn from_revision(page_id: i64, page_name: &str, revision: RevisionEntry) -> Self {
        Self {
            id: revision.id,
            page_id,
            page_name: page_name.to_string(),
            flag: revision.flag,
            date: revision.date,
            user: revision.user,
            comment: revision.comment,
        }
    }

    pub fn is_tag_change(&self) -> bool {
        self.flag == Some(ChangeFlag::Tags)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub source_url: String,
    pub display_name: String,
    /// Relative to the repository root, always under `images/`.
    pub target_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionDetail {
    pub change_id: i64,
    pub unix_name: Option<String>,
    pub title: Option<String>,
    pub rendered_content: String,
    pub images: Vec<ImageReference>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Ratings {
    pub normal: BTreeMap<String, String>,
    pub deleted: BTreeMap<String, String>,
}

/// Page-set filter passed to the listing module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    pub category: String,
    pub tags: Option<String>,
    pub created_by: Option<String>,
}

impl Default for Selector {
    fn default() -> Self {
        Self {
            category: ".".to_string(),
            tags: None,
            created_by: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageFormat {
    Legacy,
    New,
}

impl PageFormat {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "legacy" | "txt" => Ok(Self::Legacy),
            "new" | "ftml" => Ok(Self::New),
            other => bail!("unsupported page format: {other} (expected legacy|new)"),
        }
    }

    pub fn from_flag(use_ftml: bool) -> Self {
        if use_ftml { Self::New } else { Self::Legacy }
    }

    pub fn uses_header(self) -> bool {
        self == Self::New
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Legacy => LEGACY_EXTENSION,
            Self::New => NEW_EXTENSION,
        }
    }
}

impl fmt::Display for PageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Replaces characters that are invalid in file names on common filesystems.
pub fn sanitize_unix_name(unix_name: &str) -> String {
    unix_name.replace(':', "~")
}

pub fn restore_unix_name(file_stem: &str) -> String {
    file_stem.replace('~', ":")
}

pub fn page_file_name(unix_name: &str, format: PageFormat) -> String {
    format!("{}.{}", sanitize_unix_name(unix_name), format.extension())
}
