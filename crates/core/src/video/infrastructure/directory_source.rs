use std::path::{Path, PathBuf};

use crate::shared::constants::VIDEO_EXTENSIONS;
use crate::shared::frame::SourceId;
use crate::shared::pipeline_error::PipelineError;

/// One video found in an input directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoSource {
    pub id: SourceId,
    pub path: PathBuf,
}

impl VideoSource {
    /// `<stem>.<ext>` in `output_dir`, keeping the source's stem.
    pub fn output_path(&self, output_dir: &Path, extension: &str) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("source_{}", self.id));
        output_dir.join(format!("{stem}.{extension}"))
    }
}

/// The video files in one directory, in name order.
///
/// Source ids follow that order, starting at 0. Subdirectories are not
/// descended into.
#[derive(Clone, Debug)]
pub struct DirectorySource {
    dir: PathBuf,
    sources: Vec<VideoSource>,
}

impl DirectorySource {
    pub fn scan(dir: &Path) -> Result<Self, PipelineError> {
        let entries = std::fs::read_dir(dir).map_err(|e| PipelineError::Decode {
            locator: dir.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && is_video_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let sources = paths
            .into_iter()
            .enumerate()
            .map(|(i, path)| VideoSource {
                id: i as SourceId,
                path,
            })
            .collect::<Vec<_>>();
        log::info!("Found {} video(s) in {}", sources.len(), dir.display());

        Ok(Self {
            dir: dir.to_path_buf(),
            sources,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn sources(&self) -> &[VideoSource] {
        &self.sources
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl IntoIterator for DirectorySource {
    type Item = VideoSource;
    type IntoIter = std::vec::IntoIter<VideoSource>;

    fn into_iter(self) -> Self::IntoIter {
        self.sources.into_iter()
    }
}

pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"").unwrap();
    }

    #[test]
    fn test_scan_sorts_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.mp4", "notes.txt", "a.MOV", "c.mkv", "thumb.jpg"] {
            touch(dir.path(), name);
        }
        std::fs::create_dir(dir.path().join("nested.mp4")).unwrap();

        let scanned = DirectorySource::scan(dir.path()).unwrap();
        let names: Vec<String> = scanned
            .sources()
            .iter()
            .map(|s| s.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.MOV", "b.mp4", "c.mkv"]);
        let ids: Vec<SourceId> = scanned.into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let scanned = DirectorySource::scan(dir.path()).unwrap();
        assert!(scanned.is_empty());
        assert_eq!(scanned.dir(), dir.path());
    }

    #[test]
    fn test_missing_directory_is_decode_error() {
        let err = DirectorySource::scan(Path::new("/nonexistent/videos")).unwrap_err();
        assert!(matches!(err, PipelineError::Decode { .. }));
    }

    #[test]
    fn test_output_path_keeps_stem() {
        let source = VideoSource {
            id: 4,
            path: PathBuf::from("/in/holiday.mov"),
        };
        assert_eq!(
            source.output_path(Path::new("/out"), "mp4"),
            PathBuf::from("/out/holiday.mp4")
        );
    }

    #[rstest]
    #[case("clip.mp4", true)]
    #[case("clip.WEBM", true)]
    #[case("clip.txt", false)]
    #[case("clip", false)]
    fn test_is_video_file(#[case] name: &str, #[case] expected: bool) {
        assert_eq!(is_video_file(Path::new(name)), expected);
    }
}
