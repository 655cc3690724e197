//! Scanner module for discovering pending work item folders under a channel root.
//!
//! A channel root either holds one media asset directly (single-item mode) or
//! holds one subfolder per item. Folders already carrying a completion marker
//! are never returned.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::completion_marker::has_completion_marker;
use crate::metadata::{parse_metadata, VideoMetadata};

/// Media file extensions that make a folder a work item (case-insensitive matching).
pub const MEDIA_EXTENSIONS: &[&str] = &[".mp4", ".mov", ".m4v", ".mkv", ".webm", ".mp3"];

/// Image extensions accepted as thumbnails (case-insensitive matching).
pub const THUMBNAIL_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png"];

/// Errors that stop a scan of a channel root.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The configured root does not exist or is not a directory.
    #[error("Root folder not found: {}", .0.display())]
    RootMissing(PathBuf),

    /// The root could not be listed.
    #[error("Failed to read root folder: {0}")]
    Io(#[from] io::Error),
}

/// One discovered folder representing a single publish unit.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    /// Folder holding the item.
    pub path: PathBuf,
    /// Primary media asset to upload.
    pub media_file: PathBuf,
    /// Optional thumbnail image.
    pub thumbnail_file: Option<PathBuf>,
    /// Title, description and tags taken from the sidecar file or defaults.
    pub metadata: VideoMetadata,
}

impl WorkItem {
    /// Whether a completion marker has been written for this item.
    pub fn is_completed(&self) -> bool {
        has_completion_marker(&self.path)
    }

    /// Folder name, used in logs.
    pub fn folder_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

fn has_extension(path: &Path, allowed: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            allowed.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

/// Checks if a file has a media extension (case-insensitive).
pub fn is_media_file(path: &Path) -> bool {
    has_extension(path, MEDIA_EXTENSIONS)
}

/// Checks if a file has a thumbnail extension (case-insensitive).
pub fn is_thumbnail_file(path: &Path) -> bool {
    has_extension(path, THUMBNAIL_EXTENSIONS)
}

/// Regular files directly inside `dir`, sorted by file name.
pub(crate) fn sorted_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Returns the media asset of a folder.
///
/// When several files qualify, the lexicographically smallest file name wins.
pub fn find_media_file(dir: &Path) -> io::Result<Option<PathBuf>> {
    Ok(sorted_files(dir)?.into_iter().find(|p| is_media_file(p)))
}

/// Returns the thumbnail of a folder, using the same tie-break as media files.
pub fn find_thumbnail_file(dir: &Path) -> io::Result<Option<PathBuf>> {
    Ok(sorted_files(dir)?.into_iter().find(|p| is_thumbnail_file(p)))
}

/// Builds a work item from a folder.
///
/// Returns `Ok(None)` when the folder holds no qualifying media asset.
/// Completion markers are not consulted here.
pub fn inspect_folder(dir: &Path) -> io::Result<Option<WorkItem>> {
    let files = sorted_files(dir)?;

    let Some(media_file) = files.iter().find(|p| is_media_file(p)).cloned() else {
        return Ok(None);
    };
    let thumbnail_file = files.iter().find(|p| is_thumbnail_file(p)).cloned();

    let media_name = media_file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let metadata = parse_metadata(dir, &media_name);

    Ok(Some(WorkItem {
        path: dir.to_path_buf(),
        media_file,
        thumbnail_file,
        metadata,
    }))
}

/// Lists the pending work items under a channel root, in processing order.
///
/// This function:
/// - Treats the root itself as the only item when it directly holds a media asset
/// - Otherwise evaluates each immediate subdirectory, sorted by name
/// - Skips hidden subdirectories (names starting with `.`)
/// - Skips folders without a qualifying media asset
/// - Excludes folders that already carry a completion marker
///
/// An empty result is not an error. A subdirectory that cannot be read is
/// logged and skipped.
pub fn list_pending_work(root: &Path) -> Result<Vec<WorkItem>, ScanError> {
    if !root.is_dir() {
        return Err(ScanError::RootMissing(root.to_path_buf()));
    }

    // Single-item mode
    if find_media_file(root)?.is_some() {
        if has_completion_marker(root) {
            debug!(folder = %root.display(), "single item already completed");
            return Ok(Vec::new());
        }
        return Ok(inspect_folder(root)?.into_iter().collect());
    }

    let walker = WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name();

    let mut items = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };

        if !entry.file_type().is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }

        let folder = entry.path();
        if has_completion_marker(folder) {
            continue;
        }

        match inspect_folder(folder) {
            Ok(Some(item)) => items.push(item),
            Ok(None) => debug!(folder = %folder.display(), "no media asset, not a work item"),
            Err(e) => warn!(folder = %folder.display(), error = %e, "skipping unreadable folder"),
        }
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion_marker::completion_marker_path;
    use proptest::prelude::*;
    use std::fs::{self, File};
    use tempfile::TempDir;

    fn make_item(root: &Path, name: &str, files: &[&str]) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        for file in files {
            File::create(dir.join(file)).unwrap();
        }
        dir
    }

    #[test]
    fn test_is_media_file() {
        assert!(is_media_file(Path::new("/videos/clip.mp4")));
        assert!(is_media_file(Path::new("/videos/clip.MP4"))); // case-insensitive
        assert!(is_media_file(Path::new("/videos/song.mp3")));
        assert!(is_media_file(Path::new("/videos/clip.webm")));
        assert!(!is_media_file(Path::new("/videos/info.txt")));
        assert!(!is_media_file(Path::new("/videos/thumb.jpg")));
        assert!(!is_media_file(Path::new("/videos/clip"))); // no extension
    }

    #[test]
    fn test_is_thumbnail_file() {
        assert!(is_thumbnail_file(Path::new("/videos/thumb.jpg")));
        assert!(is_thumbnail_file(Path::new("/videos/thumb.JPEG")));
        assert!(is_thumbnail_file(Path::new("/videos/thumb.png")));
        assert!(!is_thumbnail_file(Path::new("/videos/clip.mp4")));
    }

    #[test]
    fn test_subfolders_sorted_by_name() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        make_item(root, "b-second", &["clip.mp4"]);
        make_item(root, "a-first", &["clip.mp4"]);
        make_item(root, "c-third", &["song.mp3"]);

        let items = list_pending_work(root).unwrap();
        let names: Vec<String> = items.iter().map(WorkItem::folder_name).collect();
        assert_eq!(names, vec!["a-first", "b-second", "c-third"]);
    }

    #[test]
    fn test_single_item_mode() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        File::create(root.join("direct.mp4")).unwrap();
        make_item(root, "ignored", &["other.mp4"]);

        let items = list_pending_work(root).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].path, root.to_path_buf());
        assert_eq!(items[0].media_file, root.join("direct.mp4"));
    }

    #[test]
    fn test_single_item_mode_completed_root_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        File::create(root.join("direct.mp4")).unwrap();
        File::create(completion_marker_path(root)).unwrap();

        assert!(list_pending_work(root).unwrap().is_empty());
    }

    #[test]
    fn test_folder_without_media_is_not_a_work_item() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        make_item(root, "only-text", &["info.txt", "thumb.jpg"]);
        make_item(root, "real", &["clip.mp4"]);

        let items = list_pending_work(root).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].folder_name(), "real");
    }

    #[test]
    fn test_hidden_folders_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        make_item(root, ".trash", &["clip.mp4"]);
        make_item(root, "visible", &["clip.mp4"]);

        let items = list_pending_work(root).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].folder_name(), "visible");
    }

    #[test]
    fn test_empty_root_yields_empty_sequence() {
        let temp_dir = TempDir::new().unwrap();
        assert!(list_pending_work(temp_dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("nope");
        assert!(matches!(
            list_pending_work(&missing),
            Err(ScanError::RootMissing(_))
        ));
    }

    #[test]
    fn test_media_and_thumbnail_tie_break() {
        let temp_dir = TempDir::new().unwrap();
        let dir = make_item(
            temp_dir.path(),
            "item",
            &["b.mp4", "a.mp3", "z.png", "cover.jpg"],
        );

        let item = inspect_folder(&dir).unwrap().unwrap();
        assert_eq!(item.media_file, dir.join("a.mp3"));
        assert_eq!(item.thumbnail_file, Some(dir.join("cover.jpg")));
        assert_eq!(item.metadata.title, "a");
        assert!(!item.is_completed());
    }

    #[test]
    fn test_metadata_read_during_scan() {
        let temp_dir = TempDir::new().unwrap();
        let dir = make_item(temp_dir.path(), "item", &["clip.mp4"]);
        fs::write(dir.join("info.txt"), "Title: From sidecar\nTags: x, y\n").unwrap();

        let items = list_pending_work(temp_dir.path()).unwrap();
        assert_eq!(items[0].metadata.title, "From sidecar");
        assert_eq!(items[0].metadata.tags, vec!["x", "y"]);
    }

    // *For any* set of item folders where some carry a completion marker, the
    // scanner never returns a marked folder, and repeated scans without
    // filesystem changes return the same pending set.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(30))]

        #[test]
        fn prop_completion_marker_exclusion_is_stable(
            folders in proptest::collection::btree_map("[a-z0-9]{1,8}", proptest::bool::ANY, 1..8),
        ) {
            let temp_dir = TempDir::new().unwrap();
            let root = temp_dir.path();

            for (name, marked) in &folders {
                let dir = make_item(root, name, &["clip.mp4"]);
                if *marked {
                    File::create(completion_marker_path(&dir)).unwrap();
                }
            }

            let first = list_pending_work(root).unwrap();
            let second = list_pending_work(root).unwrap();
            prop_assert_eq!(&first, &second);

            let expected: Vec<&String> = folders
                .iter()
                .filter(|(_, marked)| !**marked)
                .map(|(name, _)| name)
                .collect();
            let found: Vec<String> = first.iter().map(WorkItem::folder_name).collect();
            prop_assert_eq!(found.len(), expected.len());
            for (found_name, expected_name) in found.iter().zip(expected) {
                prop_assert_eq!(found_name, expected_name);
            }
            for item in &first {
                prop_assert!(!item.is_completed());
            }
        }
    }
}
