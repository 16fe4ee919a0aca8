use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use crate::error::{Kind, Result};
use crate::model::SeriesRecord;

/// On-disk metadata cache: one JSON file per series UID under
/// `<output>/metadata/`. Writes go through a temp file and rename so a reader
/// never observes a partially written record, and a single process-wide
/// mutex serializes writers (metadata records are small and writes are rare
/// enough that a per-key lock table would be pure overhead).
///
/// Grounded in `peoci::blobcache::FileGuard`'s atomic-rename idiom, adapted
/// from a keyed blob directory to one JSON file per series.
pub struct MetadataCache {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl MetadataCache {
    pub async fn open(output_dir: &Path) -> Result<Self> {
        let dir = output_dir.join("metadata");
        tokio::fs::create_dir_all(&dir).await.map_err(Kind::from)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, series_uid: &str) -> PathBuf {
        self.dir.join(format!("{series_uid}.json"))
    }

    /// Returns the cached record for `series_uid`, if present and parseable.
    /// A missing or corrupt cache file is not an error: it just means the
    /// resolver should fetch fresh metadata.
    pub async fn get(&self, series_uid: &str) -> Option<SeriesRecord> {
        let path = self.path_for(series_uid);
        let contents = tokio::fs::read_to_string(&path).await.ok()?;
        serde_json::from_str(&contents).ok()
    }

    pub async fn contains(&self, series_uid: &str) -> bool {
        tokio::fs::metadata(self.path_for(series_uid)).await.is_ok()
    }

    /// Atomically stores `record` for its own `series_uid`.
    pub async fn put(&self, record: &SeriesRecord) -> Result<()> {
        let path = self.path_for(&record.series_uid);
        let tmp_path = self.dir.join(format!(".{}.tmp", record.series_uid));
        let encoded = serde_json::to_vec_pretty(record)
            .map_err(|e| Kind::Filesystem(format!("encoding metadata: {e}")))?;

        // Hold the lock across the write+rename pair: two concurrent writers
        // for the same series would otherwise both build the same tmp name
        // and one rename could clobber an in-progress write.
        let _guard = self.write_lock.lock().await;
        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::write(&tmp_path, &encoded).map_err(Kind::from)?;
            std::fs::rename(&tmp_path, &path).map_err(Kind::from)?;
            Ok(())
        })
        .await
        .map_err(|e| Kind::Filesystem(format!("cache write task panicked: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(uid: &str) -> SeriesRecord {
        SeriesRecord {
            series_uid: uid.to_string(),
            study_uid: "study-1".to_string(),
            subject_id: "subject-1".to_string(),
            study_date: "20240101".to_string(),
            collection: "TCGA-X".to_string(),
            file_size_uncompressed: Some(4096),
            modality: "CT".to_string(),
            series_description: "test".to_string(),
            series_number: Some(1),
            number_of_images: Some(10),
            extra: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn missing_entry_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MetadataCache::open(dir.path()).await.unwrap();
        assert!(cache.get("1.2.3").await.is_none());
        assert!(!cache.contains("1.2.3").await);
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MetadataCache::open(dir.path()).await.unwrap();
        let record = sample_record("1.2.3");
        cache.put(&record).await.unwrap();

        assert!(cache.contains("1.2.3").await);
        let fetched = cache.get("1.2.3").await.unwrap();
        assert_eq!(fetched.series_uid, "1.2.3");
        assert_eq!(fetched.collection, "TCGA-X");
    }

    #[tokio::test]
    async fn no_tmp_file_left_behind_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MetadataCache::open(dir.path()).await.unwrap();
        cache.put(&sample_record("1.2.3")).await.unwrap();

        let mut entries = tokio::fs::read_dir(dir.path().join("metadata"))
            .await
            .unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["1.2.3.json"]);
    }

    #[tokio::test]
    async fn overwrite_replaces_previous_value() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MetadataCache::open(dir.path()).await.unwrap();
        cache.put(&sample_record("1.2.3")).await.unwrap();

        let mut updated = sample_record("1.2.3");
        updated.series_description = "revised".to_string();
        cache.put(&updated).await.unwrap();

        let fetched = cache.get("1.2.3").await.unwrap();
        assert_eq!(fetched.series_description, "revised");
    }
}
