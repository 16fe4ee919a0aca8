use std::collections::HashMap;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use crate::error::{Kind, Result};

/// Name of the hash manifest entry inside an archive, when the image
/// endpoint variant includes one. Never materialized to the output tree.
const HASH_MANIFEST_ENTRY: &str = "md5hashes.csv";

/// Rejects any archive entry whose cleaned path would escape `dest_root`:
/// absolute paths, and any path containing a `..` component. Mirrors the
/// refusal style of `peoci::blobcache::BlobKey::new`, which rejects `.`/`/`
/// in a cache key before it is ever used to build a path.
fn safe_join(dest_root: &Path, entry_name: &str) -> Result<PathBuf> {
    let entry_path = Path::new(entry_name);
    if entry_path.is_absolute() {
        return Err(Kind::Integrity(format!(
            "archive entry {entry_name} has an absolute path"
        )));
    }
    for component in entry_path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Kind::Integrity(format!(
                    "archive entry {entry_name} escapes destination root"
                )));
            }
        }
    }
    Ok(dest_root.join(entry_path))
}

/// Parses a two-column `filename,md5hex` CSV into a lookup map. A header row
/// is tolerated (any row whose second column doesn't look like a hex digest
/// is skipped).
pub fn parse_hash_manifest(contents: &[u8]) -> Result<HashMap<String, String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(contents);

    let mut map = HashMap::new();
    for result in reader.records() {
        let record = result.map_err(|e| Kind::Integrity(format!("hash manifest: {e}")))?;
        if record.len() < 2 {
            continue;
        }
        let filename = record.get(0).unwrap_or_default().trim();
        let digest = record.get(1).unwrap_or_default().trim().to_lowercase();
        if filename.is_empty() || !is_hex_md5(&digest) {
            continue;
        }
        map.insert(filename.to_string(), digest);
    }
    Ok(map)
}

fn is_hex_md5(s: &str) -> bool {
    s.len() == 32 && s.chars().all(|c| c.is_ascii_hexdigit())
}

pub struct ExtractOutcome {
    pub total_bytes: u64,
    pub mismatches: Vec<String>,
}

/// Extracts `archive_bytes` into `dest_root`, hashing entries present in
/// `hash_map` (when hashing is enabled) as they're written, and returns the
/// total bytes written plus any per-file digest mismatches. Path-traversal
/// is rejected before any write, per entry.
pub fn extract_and_verify(
    archive_bytes: &[u8],
    dest_root: &Path,
    hash_map: Option<&HashMap<String, String>>,
) -> Result<ExtractOutcome> {
    let reader = std::io::Cursor::new(archive_bytes);
    let mut zip = zip::ZipArchive::new(reader)
        .map_err(|e| Kind::Integrity(format!("opening archive: {e}")))?;

    let mut total_bytes = 0u64;
    let mut mismatches = Vec::new();

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| Kind::Integrity(format!("reading archive entry {i}: {e}")))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        if name == HASH_MANIFEST_ENTRY {
            continue;
        }

        let target = safe_join(dest_root, &name)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(Kind::from)?;
        }

        let expected_digest = hash_map.and_then(|m| m.get(&name));
        let mut context = md5::Context::new();
        let mut file = std::fs::File::create(&target).map_err(Kind::from)?;
        let mut buf = [0u8; 65536];
        let mut written = 0u64;
        loop {
            let n = entry.read(&mut buf).map_err(Kind::from)?;
            if n == 0 {
                break;
            }
            if expected_digest.is_some() {
                context.consume(&buf[..n]);
            }
            std::io::Write::write_all(&mut file, &buf[..n]).map_err(Kind::from)?;
            written += n as u64;
        }
        total_bytes += written;

        if let Some(expected) = expected_digest {
            let computed = hex::encode(context.compute().0);
            if &computed != expected {
                mismatches.push(name);
            }
        }
    }

    Ok(ExtractOutcome {
        total_bytes,
        mismatches,
    })
}

/// Extracts and returns the raw bytes of the hash manifest entry, if present.
pub fn read_hash_manifest_entry(archive_bytes: &[u8]) -> Result<Option<Vec<u8>>> {
    let reader = std::io::Cursor::new(archive_bytes);
    let mut zip = zip::ZipArchive::new(reader)
        .map_err(|e| Kind::Integrity(format!("opening archive: {e}")))?;

    match zip.by_name(HASH_MANIFEST_ENTRY) {
        Ok(mut entry) => {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf).map_err(Kind::from)?;
            Ok(Some(buf))
        }
        Err(zip::result::ZipError::FileNotFound) => Ok(None),
        Err(e) => Err(Kind::Integrity(format!("locating hash manifest: {e}"))),
    }
}

/// Computes the MD5 digest of a single on-disk file, hex-encoded.
pub fn calculate_file_hash(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(Kind::from)?;
    let mut context = md5::Context::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = file.read(&mut buf).map_err(Kind::from)?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
    }
    Ok(hex::encode(context.compute().0))
}

/// Recursive total size of every regular file under `dir`.
pub fn directory_size(dir: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in walkdir::WalkDir::new(dir) {
        let entry = entry.map_err(|e| Kind::Filesystem(format!("walking {}: {e}", dir.display())))?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(|e| Kind::Filesystem(e.to_string()))?.len();
        }
    }
    Ok(total)
}
