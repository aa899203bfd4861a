use crate::error::StorageError;
use crate::segment::{encode_filename, parse_start_time};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// A segment file observed in the store, identified by its embedded start time
#[derive(Debug, Clone, PartialEq)]
pub struct ListedSegment {
    pub start_time: DateTime<Utc>,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Directory-per-camera segment store on a memory-backed filesystem.
///
/// The store deals only in paths and names; it never parses media. Filenames
/// encode the segment start time so lexicographic order equals chronological
/// order.
#[derive(Debug, Clone)]
pub struct SegmentStore {
    root: PathBuf,
}

impl SegmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one camera's segments
    pub fn camera_dir(&self, camera_id: &str) -> PathBuf {
        self.root.join(camera_id)
    }

    /// Create the camera's directory if missing
    pub async fn ensure_camera_dir(&self, camera_id: &str) -> Result<PathBuf, StorageError> {
        let dir = self.camera_dir(camera_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::DirectoryCreation {
                path: dir.display().to_string(),
                source: e,
            })?;
        Ok(dir)
    }

    /// Output filename template handed to the encoder's segment muxer.
    ///
    /// `%s` expands to epoch seconds under `-strftime 1`, matching the
    /// store's own naming scheme.
    pub fn output_template(&self, camera_id: &str) -> PathBuf {
        self.camera_dir(camera_id)
            .join(format!("%s.{}", crate::segment::SEGMENT_EXT))
    }

    /// Canonical path for a segment starting at `start_time`
    pub fn path_for(&self, camera_id: &str, start_time: DateTime<Utc>) -> PathBuf {
        self.camera_dir(camera_id).join(encode_filename(start_time))
    }

    /// Point-in-time snapshot of a camera's segment files, sorted by start
    /// time. Foreign files are ignored; the newest entry may still be
    /// growing.
    pub async fn list(&self, camera_id: &str) -> Result<Vec<ListedSegment>, StorageError> {
        let dir = self.camera_dir(camera_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StorageError::DirectoryScan {
                    path: dir.display().to_string(),
                    source: e,
                })
            }
        };

        let mut listed = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::DirectoryScan {
                path: dir.display().to_string(),
                source: e,
            })?
        {
            let path = entry.path();
            let Some(start_time) = parse_start_time(&path) else {
                trace!("Ignoring foreign file in store: {}", path.display());
                continue;
            };
            // The file can vanish between readdir and stat under concurrent
            // eviction; skip it rather than fail the snapshot.
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            listed.push(ListedSegment {
                start_time,
                path,
                size_bytes: metadata.len(),
            });
        }

        listed.sort_by_key(|s| s.start_time);
        Ok(listed)
    }

    /// Unlink a segment file. Removing a file that is already gone is not an
    /// error; eviction and assembly race by design.
    pub async fn remove(&self, path: &Path) -> Result<(), StorageError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                debug!("Removed segment file {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::FileDeletion {
                path: path.display().to_string(),
                source: e,
            }),
        }
    }

    /// Percentage of free space on the filesystem backing the store
    pub async fn free_space_percent(&self) -> Result<f64, StorageError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || statvfs_free_percent(&root))
            .await
            .map_err(|e| StorageError::SpaceCheck {
                path: "store".to_string(),
                details: e.to_string(),
            })?
    }
}

#[cfg(unix)]
fn statvfs_free_percent(path: &Path) -> Result<f64, StorageError> {
    use std::ffi::CString;

    let c_path =
        CString::new(path.to_str().unwrap_or("/")).map_err(|e| StorageError::SpaceCheck {
            path: path.display().to_string(),
            details: e.to_string(),
        })?;

    unsafe {
        let mut stat: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
            return Err(StorageError::SpaceCheck {
                path: path.display().to_string(),
                details: std::io::Error::last_os_error().to_string(),
            });
        }
        let total = stat.f_blocks as u64 * stat.f_frsize as u64;
        if total == 0 {
            return Err(StorageError::SpaceCheck {
                path: path.display().to_string(),
                details: "filesystem reports zero size".to_string(),
            });
        }
        let available = stat.f_bavail as u64 * stat.f_frsize as u64;
        Ok((available as f64 / total as f64) * 100.0)
    }
}

#[cfg(not(unix))]
fn statvfs_free_percent(_path: &Path) -> Result<f64, StorageError> {
    // No portable probe; report full so pressure eviction never fires.
    Ok(100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(epoch: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(epoch, 0).unwrap()
    }

    async fn write_file(path: &Path, len: usize) {
        tokio::fs::write(path, vec![0u8; len]).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_sorted_and_sized() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::new(dir.path());
        let cam_dir = store.ensure_camera_dir("camera_1").await.unwrap();

        write_file(&cam_dir.join("0000000010.mp4"), 300).await;
        write_file(&cam_dir.join("0000000005.mp4"), 100).await;
        write_file(&cam_dir.join("0000000015.mp4"), 200).await;

        let listed = store.list("camera_1").await.unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].start_time, at(5));
        assert_eq!(listed[1].start_time, at(10));
        assert_eq!(listed[2].start_time, at(15));
        assert_eq!(listed[0].size_bytes, 100);
    }

    #[tokio::test]
    async fn test_list_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::new(dir.path());
        let cam_dir = store.ensure_camera_dir("camera_1").await.unwrap();

        write_file(&cam_dir.join("0000000005.mp4"), 100).await;
        write_file(&cam_dir.join("notes.txt"), 10).await;
        write_file(&cam_dir.join("preview.jpg"), 10).await;
        tokio::fs::create_dir(cam_dir.join("0000000099.mp4.d"))
            .await
            .unwrap();

        let listed = store.list("camera_1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].start_time, at(5));
    }

    #[tokio::test]
    async fn test_list_missing_camera_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::new(dir.path());
        let listed = store.list("camera_9").await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::new(dir.path());
        let cam_dir = store.ensure_camera_dir("camera_1").await.unwrap();

        let path = cam_dir.join("0000000005.mp4");
        write_file(&path, 100).await;

        store.remove(&path).await.unwrap();
        assert!(!path.exists());
        // Second removal of the same path succeeds
        store.remove(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_path_for_matches_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::new(dir.path());
        let cam_dir = store.ensure_camera_dir("camera_1").await.unwrap();

        let start = at(1_700_000_000);
        let expected = store.path_for("camera_1", start);
        write_file(&expected, 64).await;
        assert_eq!(expected.parent().unwrap(), cam_dir);

        let listed = store.list("camera_1").await.unwrap();
        assert_eq!(listed[0].path, expected);
        assert_eq!(listed[0].start_time, start);
    }

    #[tokio::test]
    async fn test_output_template_shape() {
        let store = SegmentStore::new("/dev/shm/video_buffer");
        let template = store.output_template("camera_2");
        assert_eq!(
            template,
            PathBuf::from("/dev/shm/video_buffer/camera_2/%s.mp4")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_free_space_percent_in_range() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::new(dir.path());
        let free = store.free_space_percent().await.unwrap();
        assert!((0.0..=100.0).contains(&free));
    }
}
