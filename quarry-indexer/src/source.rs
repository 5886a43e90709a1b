//! Knowledge source definitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Tag identifying a kind of knowledge source. Stored alongside every state
/// row and vector so sources of different kinds never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    LocalFolders,
    Url,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::LocalFolders => "local_folders",
            SourceType::Url => "url",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local_folders" => Ok(SourceType::LocalFolders),
            "url" => Ok(SourceType::Url),
            _ => Err(format!("Unknown source type: {s}")),
        }
    }
}

/// A configured origin of content. Immutable once built; an edited source is
/// replaced wholesale.
///
/// In TOML:
///
/// ```toml
/// [[sources]]
/// type = "local_folders"
/// paths = ["docs", "notes"]
///
/// [[sources]]
/// type = "url"
/// urls = ["https://example.com/handbook.html"]
/// resource_identifier = "handbook"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KnowledgeSourceConfig {
    LocalFolders {
        paths: Vec<PathBuf>,
        #[serde(default)]
        resource_identifier: Option<String>,
    },
    Url {
        urls: Vec<String>,
        #[serde(default)]
        resource_identifier: Option<String>,
    },
}

impl KnowledgeSourceConfig {
    pub fn local_folders<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        KnowledgeSourceConfig::LocalFolders {
            paths: paths.into_iter().map(Into::into).collect(),
            resource_identifier: None,
        }
    }

    pub fn urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        KnowledgeSourceConfig::Url {
            urls: urls.into_iter().map(Into::into).collect(),
            resource_identifier: None,
        }
    }

    pub fn source_type(&self) -> SourceType {
        match self {
            KnowledgeSourceConfig::LocalFolders { .. } => SourceType::LocalFolders,
            KnowledgeSourceConfig::Url { .. } => SourceType::Url,
        }
    }

    /// The configured resources as strings (folder paths or URLs).
    pub fn resources(&self) -> Vec<String> {
        match self {
            KnowledgeSourceConfig::LocalFolders { paths, .. } => paths
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
            KnowledgeSourceConfig::Url { urls, .. } => urls.clone(),
        }
    }

    /// Identifier used to match removal events against this source. Falls back
    /// to the source type and its resources when none was configured.
    pub fn resource_identifier(&self) -> String {
        let explicit = match self {
            KnowledgeSourceConfig::LocalFolders {
                resource_identifier,
                ..
            }
            | KnowledgeSourceConfig::Url {
                resource_identifier,
                ..
            } => resource_identifier.as_deref(),
        };
        match explicit {
            Some(id) => id.to_string(),
            None => format!("{}:{}", self.source_type(), self.resources().join(",")),
        }
    }
}
