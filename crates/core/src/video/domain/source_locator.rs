use std::fmt;
use std::path::{Path, PathBuf};

use crate::shared::constants::STREAMING_SCHEMES;
use crate::shared::pipeline_error::PipelineError;

/// Where input frames come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceLocator {
    File(PathBuf),
    Directory(PathBuf),
    /// A network stream ffmpeg can open directly.
    Remote(String),
}

impl SourceLocator {
    /// Classifies a locator string.
    ///
    /// `file://` is stripped to a path. Schemes ffmpeg cannot stream from
    /// (object stores and the like) are rejected here rather than at decode
    /// time.
    pub fn parse(locator: &str) -> Result<Self, PipelineError> {
        if let Some((scheme, rest)) = locator.split_once("://") {
            let scheme = scheme.to_ascii_lowercase();
            if scheme == "file" {
                return Ok(Self::from_path(Path::new(rest)));
            }
            if STREAMING_SCHEMES.contains(&scheme.as_str()) {
                return Ok(Self::Remote(locator.to_string()));
            }
            return Err(PipelineError::Decode {
                locator: locator.to_string(),
                reason: format!("unsupported scheme '{scheme}'"),
            });
        }
        Ok(Self::from_path(Path::new(locator)))
    }

    pub fn from_path(path: &Path) -> Self {
        if path.is_dir() {
            Self::Directory(path.to_path_buf())
        } else {
            Self::File(path.to_path_buf())
        }
    }

    /// The string ffmpeg should open: a filesystem path or the URL itself.
    pub fn ffmpeg_input(&self) -> String {
        match self {
            Self::File(path) | Self::Directory(path) => path.to_string_lossy().into_owned(),
            Self::Remote(url) => url.clone(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    pub fn local_path(&self) -> Option<&Path> {
        match self {
            Self::File(path) | Self::Directory(path) => Some(path),
            Self::Remote(_) => None,
        }
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.ffmpeg_input())
    }
}
