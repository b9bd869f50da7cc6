//! Archive extraction
//!
//! Streams image entries out of a batch archive into uniquely named temp
//! files, filtering out everything that cannot become an item: directory
//! entries, hidden files, OS artifacts, disallowed extensions, and
//! filenames with no derivable key.
//!
//! Runs synchronously; the orchestrator calls it from a worker thread, so
//! blocking file I/O is fine here. Extraction order carries no meaning for
//! processing order.

use std::fs::File;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Extensions accepted as image entries
const ALLOWED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];

/// Descriptive sequence tokens accepted after the key
const SEQUENCE_VOCABULARY: &[&str] = &[
    "front", "back", "side", "top", "bottom", "detail", "label", "zoom",
];

/// One accepted archive entry, parked in the work area
#[derive(Debug, Clone)]
pub struct ExtractedEntry {
    /// Derived key parsed from the filename
    pub sku: String,
    /// Optional sequence suffix (numeric, single letter, or vocabulary token)
    pub sequence: Option<String>,
    pub original_filename: String,
    pub temp_path: PathBuf,
    /// Bytes written to the temp file
    pub size: u64,
}

/// Skip tallies by category, reported for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SkipCounts {
    pub directories: u64,
    pub hidden: u64,
    pub system: u64,
    pub extension: u64,
    pub unparseable: u64,
}

impl SkipCounts {
    pub fn total(&self) -> u64 {
        self.directories + self.hidden + self.system + self.extension + self.unparseable
    }
}

/// Result of extracting one archive
#[derive(Debug)]
pub struct ExtractionOutcome {
    pub entries: Vec<ExtractedEntry>,
    pub skipped: SkipCounts,
}

/// Extraction failure; fails the whole job
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("failed to read archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("extraction I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Extract accepted image entries from `archive_path` into `dest_dir`
///
/// Each accepted entry is copied through a bounded buffer into its own
/// uniquely named temp file; entries are never held in memory whole.
pub fn extract_archive(
    archive_path: &Path,
    dest_dir: &Path,
) -> Result<ExtractionOutcome, ExtractError> {
    std::fs::create_dir_all(dest_dir)?;

    let file = File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    let mut entries = Vec::new();
    let mut skipped = SkipCounts::default();

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;

        if entry.is_dir() {
            skipped.directories += 1;
            continue;
        }

        // Reject entries whose paths escape the destination
        let Some(entry_path) = entry.enclosed_name() else {
            skipped.system += 1;
            continue;
        };

        let Some(filename) = entry_path.file_name().and_then(|n| n.to_str()).map(String::from)
        else {
            skipped.system += 1;
            continue;
        };

        if is_hidden(&entry_path) {
            skipped.hidden += 1;
            continue;
        }

        if is_os_artifact(&filename) {
            skipped.system += 1;
            continue;
        }

        if !has_allowed_extension(&filename) {
            skipped.extension += 1;
            continue;
        }

        let Some((sku, sequence)) = parse_item_key(&filename) else {
            skipped.unparseable += 1;
            tracing::debug!(filename = %filename, "No derivable key, skipping entry");
            continue;
        };

        let temp_path = dest_dir.join(format!("{}_{}", Uuid::new_v4().simple(), filename));
        let mut out = File::create(&temp_path)?;
        let size = std::io::copy(&mut entry, &mut out)?;

        entries.push(ExtractedEntry {
            sku,
            sequence,
            original_filename: filename,
            temp_path,
            size,
        });
    }

    tracing::info!(
        archive = %archive_path.display(),
        accepted = entries.len(),
        skipped = skipped.total(),
        "Archive extracted"
    );

    Ok(ExtractionOutcome { entries, skipped })
}

/// Parse `<KEY>[_<SEQUENCE>]` from a filename
///
/// The key is alphanumeric-plus-dash starting with an alphanumeric. The
/// optional suffix after the last underscore must be numeric, a single
/// letter, or a vocabulary token; anything else makes the name
/// unparseable.
pub fn parse_item_key(filename: &str) -> Option<(String, Option<String>)> {
    let stem = filename.rsplit_once('.').map(|(s, _)| s).unwrap_or(filename);

    match stem.rsplit_once('_') {
        Some((key, suffix)) => {
            if is_valid_key(key) && is_valid_sequence(suffix) {
                Some((key.to_string(), Some(suffix.to_ascii_lowercase())))
            } else {
                None
            }
        }
        None => {
            if is_valid_key(stem) {
                Some((stem.to_string(), None))
            } else {
                None
            }
        }
    }
}

fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '-')
}

fn is_valid_sequence(token: &str) -> bool {
    if token.is_empty() {
        return false;
    }
    if token.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    if token.len() == 1 && token.chars().all(|c| c.is_ascii_alphabetic()) {
        return true;
    }
    SEQUENCE_VOCABULARY.contains(&token.to_ascii_lowercase().as_str())
}

fn is_hidden(path: &Path) -> bool {
    path.components().any(|component| {
        let name = component.as_os_str().to_string_lossy();
        name.starts_with('.') || name.starts_with("__")
    })
}

fn is_os_artifact(filename: &str) -> bool {
    let lower = filename.to_ascii_lowercase();
    matches!(lower.as_str(), "thumbs.db" | ".ds_store" | "desktop.ini")
}

fn has_allowed_extension(filename: &str) -> bool {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ALLOWED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn build_zip(dir: &Path, entries: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join("batch.zip");
        let file = File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();

        for (name, bytes) in entries {
            if name.ends_with('/') {
                writer.add_directory(name.trim_end_matches('/'), options).unwrap();
            } else {
                writer.start_file(*name, options).unwrap();
                writer.write_all(bytes).unwrap();
            }
        }
        writer.finish().unwrap();
        path
    }

    #[test]
    fn parses_key_with_and_without_sequence() {
        assert_eq!(
            parse_item_key("ABC-123_front.jpg"),
            Some(("ABC-123".to_string(), Some("front".to_string())))
        );
        assert_eq!(
            parse_item_key("ABC-123_2.jpg"),
            Some(("ABC-123".to_string(), Some("2".to_string())))
        );
        assert_eq!(
            parse_item_key("ABC-123_b.jpg"),
            Some(("ABC-123".to_string(), Some("b".to_string())))
        );
        assert_eq!(parse_item_key("ABC-123.jpg"), Some(("ABC-123".to_string(), None)));
        // Vocabulary match is case-insensitive, token stored lowercased
        assert_eq!(
            parse_item_key("ABC-123_FRONT.jpg"),
            Some(("ABC-123".to_string(), Some("front".to_string())))
        );
    }

    #[test]
    fn rejects_names_without_derivable_key() {
        // Suffix is neither numeric, single letter, nor vocabulary
        assert_eq!(parse_item_key("ABC-123_extra.jpg"), None);
        // Two underscores leave an invalid key before the last one
        assert_eq!(parse_item_key("ABC_123_front.jpg"), None);
        // Key must start alphanumeric
        assert_eq!(parse_item_key("-ABC.jpg"), None);
        assert_eq!(parse_item_key("photo (1).jpg"), None);
        assert_eq!(parse_item_key("_front.jpg"), None);
    }

    #[test]
    fn extracts_accepted_entries_and_counts_skips() {
        let dir = TempDir::new().unwrap();
        let archive = build_zip(
            dir.path(),
            &[
                ("photos/", b"" as &[u8]),
                ("photos/ABC-1_front.jpg", b"front bytes"),
                ("photos/ABC-1_back.jpg", b"back bytes"),
                ("B-2.png", b"solo"),
                ("__MACOSX/ABC-1_front.jpg", b"resource fork"),
                (".hidden.jpg", b"x"),
                ("Thumbs.db", b"x"),
                ("readme.txt", b"not an image"),
                ("not a key!.jpg", b"x"),
            ],
        );

        let work = dir.path().join("work");
        let outcome = extract_archive(&archive, &work).unwrap();

        assert_eq!(outcome.entries.len(), 3);
        assert_eq!(outcome.skipped.directories, 1);
        assert_eq!(outcome.skipped.hidden, 2);
        assert_eq!(outcome.skipped.system, 1);
        assert_eq!(outcome.skipped.extension, 1);
        assert_eq!(outcome.skipped.unparseable, 1);
        assert_eq!(outcome.skipped.total(), 6);

        let front = outcome
            .entries
            .iter()
            .find(|e| e.original_filename == "ABC-1_front.jpg")
            .unwrap();
        assert_eq!(front.sku, "ABC-1");
        assert_eq!(front.sequence.as_deref(), Some("front"));
        assert_eq!(front.size, 11);
        assert_eq!(std::fs::read(&front.temp_path).unwrap(), b"front bytes");

        // Temp names are unique even for entries sharing a filename
        let paths: std::collections::HashSet<_> =
            outcome.entries.iter().map(|e| e.temp_path.clone()).collect();
        assert_eq!(paths.len(), 3);
    }

    #[test]
    fn unreadable_archive_is_an_error() {
        let dir = TempDir::new().unwrap();
        let bogus = dir.path().join("not-a.zip");
        std::fs::write(&bogus, b"plain text, no zip magic").unwrap();

        let result = extract_archive(&bogus, &dir.path().join("work"));
        assert!(matches!(result, Err(ExtractError::Archive(_))));
    }
}
