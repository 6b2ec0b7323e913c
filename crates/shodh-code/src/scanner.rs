//! File discovery and text extraction for source indexing.
//!
//! Walks a source root depth-first, prunes excluded directories during the
//! walk, applies include/exclude globs to files, and decodes text content
//! (UTF-8 first, detected encoding as fallback). Unreadable files and
//! subtrees are logged and skipped; an empty stream is a valid result.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

use crate::config::RepositoryConfig;
use crate::types::{DirectoryRecord, ScannedFile, SourceRef};

/// Files larger than this are skipped outright.
pub const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
struct CompiledPattern {
    pattern: glob::Pattern,
    /// For `**/X` patterns: `X` alone, so the pattern also matches files at
    /// the source root and bare file names.
    suffix: Option<glob::Pattern>,
}

impl CompiledPattern {
    fn compile(raw: &str) -> Result<Self, String> {
        let pattern =
            glob::Pattern::new(raw).map_err(|e| format!("bad glob pattern '{raw}': {e}"))?;
        let suffix = raw
            .strip_prefix("**/")
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| format!("bad glob pattern '{raw}': {e}"))?;
        Ok(Self { pattern, suffix })
    }

    fn matches(&self, relative: &str, file_name: &str) -> bool {
        if let Some(suffix) = &self.suffix {
            if suffix.matches(relative) || suffix.matches(file_name) {
                return true;
            }
        }
        self.pattern.matches(relative)
    }
}

/// Compiled include/exclude globs for one source.
#[derive(Debug, Clone)]
pub struct PatternSet {
    include: Vec<CompiledPattern>,
    exclude: Vec<CompiledPattern>,
    /// Exclude patterns reduced to directory names (`**/node_modules/**`
    /// becomes `node_modules`) so whole subtrees can be pruned during the
    /// walk.
    exclude_dirs: Vec<glob::Pattern>,
}

impl PatternSet {
    pub fn compile(include: &[String], exclude: &[String]) -> Result<Self, String> {
        let include = include
            .iter()
            .map(|p| CompiledPattern::compile(p))
            .collect::<Result<Vec<_>, _>>()?;
        let exclude_compiled = exclude
            .iter()
            .map(|p| CompiledPattern::compile(p))
            .collect::<Result<Vec<_>, _>>()?;

        let mut exclude_dirs = Vec::new();
        for raw in exclude {
            let stripped = raw
                .trim_start_matches("**/")
                .trim_end_matches("/**")
                .trim_end_matches('/');
            if !stripped.is_empty() && !stripped.contains('/') {
                if let Ok(p) = glob::Pattern::new(stripped) {
                    exclude_dirs.push(p);
                }
            }
        }

        Ok(Self {
            include,
            exclude: exclude_compiled,
            exclude_dirs,
        })
    }

    /// Whether a file at `relative` (with basename `file_name`) should be
    /// indexed. Excludes win over includes.
    pub fn includes_file(&self, relative: &str, file_name: &str) -> bool {
        if self.excludes_file(relative, file_name) {
            return false;
        }
        self.include.iter().any(|p| p.matches(relative, file_name))
    }

    /// Whether a file matches any exclude pattern. The watcher applies
    /// this to raw filesystem events so its filtering matches the
    /// scanner's.
    pub fn excludes_file(&self, relative: &str, file_name: &str) -> bool {
        self.exclude.iter().any(|p| p.matches(relative, file_name))
    }

    /// Whether the walk should descend into a directory.
    pub fn excludes_dir(&self, relative: &str, dir_name: &str) -> bool {
        self.exclude_dirs
            .iter()
            .any(|p| p.matches(dir_name) || p.matches(relative))
    }
}

/// Scans one source (repository or managed directory) for indexable files.
pub struct FileScanner {
    root: PathBuf,
    source: SourceRef,
    patterns: PatternSet,
}

impl FileScanner {
    pub fn for_repository(config: &RepositoryConfig) -> Result<Self, String> {
        Ok(Self {
            root: config.path.clone(),
            source: SourceRef::Repository(config.name.clone()),
            patterns: PatternSet::compile(
                &config.file_patterns.include,
                &config.file_patterns.exclude,
            )?,
        })
    }

    pub fn for_directory(record: &DirectoryRecord) -> Result<Self, String> {
        Ok(Self {
            root: PathBuf::from(&record.path),
            source: SourceRef::Directory(record.id),
            patterns: PatternSet::compile(&record.include_patterns, &record.exclude_patterns)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source(&self) -> &SourceRef {
        &self.source
    }

    pub fn patterns(&self) -> &PatternSet {
        &self.patterns
    }

    /// Walk the source and yield matching, decodable files.
    pub fn scan(&self) -> impl Iterator<Item = ScannedFile> + '_ {
        let root = self.root.clone();
        WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(move |entry| {
                if entry.depth() == 0 || !entry.file_type().is_dir() {
                    return true;
                }
                let relative = entry
                    .path()
                    .strip_prefix(&root)
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_default();
                let name = entry.file_name().to_string_lossy();
                !self.patterns.excludes_dir(&relative, &name)
            })
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(err) => {
                    tracing::warn!(error = %err, "skipping unreadable directory entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .filter_map(move |entry| self.process_path(entry.path()))
    }

    /// Process a single path against this source's patterns. Used by the
    /// scan walk and by the watcher path for targeted reindexing. Returns
    /// `None` when the file is excluded, oversized, or undecodable.
    pub fn process_path(&self, path: &Path) -> Option<ScannedFile> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let relative_str = relative.to_string_lossy().to_string();
        let file_name = path.file_name()?.to_string_lossy();

        if !self.patterns.includes_file(&relative_str, &file_name) {
            return None;
        }

        let metadata = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to stat file");
                return None;
            }
        };

        if metadata.len() > MAX_FILE_SIZE {
            tracing::debug!(
                path = %path.display(),
                size = metadata.len(),
                "skipping oversized file"
            );
            return None;
        }

        let content = read_file_content(path)?;

        let last_modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or_else(|| chrono::Utc::now().timestamp());

        let file_type = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        Some(ScannedFile {
            file_path: path.to_path_buf(),
            relative_path: relative_str,
            source: self.source.clone(),
            file_type,
            size_bytes: metadata.len(),
            last_modified,
            content,
        })
    }
}

/// Read a file as text: strict UTF-8 first, then detected-encoding decode.
/// Binary files (embedded NUL) and unreadable files yield `None`.
pub fn read_file_content(path: &Path) -> Option<String> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to read file");
            return None;
        }
    };

    if raw.contains(&0) {
        tracing::debug!(path = %path.display(), "skipping binary file");
        return None;
    }

    match String::from_utf8(raw) {
        Ok(text) => Some(text),
        Err(err) => {
            let raw = err.into_bytes();
            let mut detector = chardetng::EncodingDetector::new();
            detector.feed(&raw, true);
            let encoding = detector.guess(None, true);
            let (decoded, _, _) = encoding.decode(&raw);
            tracing::warn!(
                path = %path.display(),
                encoding = encoding.name(),
                "non-UTF-8 file decoded with detected encoding"
            );
            Some(decoded.into_owned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FilePatterns, Priority};
    use std::fs;

    fn scanner_for(root: &Path, include: &[&str], exclude: &[&str]) -> FileScanner {
        let config = RepositoryConfig {
            name: "test".into(),
            path: root.to_path_buf(),
            enabled: true,
            priority: Priority::Medium,
            locked: false,
            file_patterns: FilePatterns {
                include: include.iter().map(|s| s.to_string()).collect(),
                exclude: exclude.iter().map(|s| s.to_string()).collect(),
            },
        };
        FileScanner::for_repository(&config).unwrap()
    }

    #[test]
    fn double_star_matches_root_and_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("README.md"), "root level").unwrap();
        fs::create_dir_all(dir.path().join("docs/guide")).unwrap();
        fs::write(dir.path().join("docs/guide/intro.md"), "nested").unwrap();
        fs::write(dir.path().join("main.py"), "print()").unwrap();

        let scanner = scanner_for(dir.path(), &["**/*.md"], &[]);
        let mut names: Vec<String> = scanner.scan().map(|f| f.file_name()).collect();
        names.sort();
        assert_eq!(names, ["README.md", "intro.md"]);
    }

    #[test]
    fn excluded_directories_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::create_dir_all(dir.path().join("nested/node_modules/pkg")).unwrap();
        fs::write(dir.path().join("src/app.js"), "let x = 1;").unwrap();
        fs::write(
            dir.path().join("nested/node_modules/pkg/index.js"),
            "ignored",
        )
        .unwrap();

        let scanner = scanner_for(dir.path(), &["**/*.js"], &["**/node_modules/**"]);
        let files: Vec<ScannedFile> = scanner.scan().collect();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, "src/app.js");
    }

    #[test]
    fn size_boundary_is_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        let at_limit = dir.path().join("at_limit.txt");
        let over_limit = dir.path().join("over_limit.txt");

        fs::write(&at_limit, "a".repeat(MAX_FILE_SIZE as usize)).unwrap();
        let file = fs::File::create(&over_limit).unwrap();
        file.set_len(MAX_FILE_SIZE + 1).unwrap();

        let scanner = scanner_for(dir.path(), &["**/*.txt"], &[]);
        assert!(scanner.process_path(&at_limit).is_some());
        assert!(scanner.process_path(&over_limit).is_none());
    }

    #[test]
    fn binary_files_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.txt");
        fs::write(&path, [0u8, 159, 146, 150]).unwrap();
        assert!(read_file_content(&path).is_none());
    }

    #[test]
    fn non_utf8_text_is_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latin1.txt");
        // "café" in Latin-1
        fs::write(&path, [0x63, 0x61, 0x66, 0xe9]).unwrap();
        let content = read_file_content(&path).unwrap();
        assert!(content.starts_with("caf"));
        assert_eq!(content.chars().count(), 4);
    }

    #[test]
    fn scanned_file_carries_source_and_mtime() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("note.md"), "hello").unwrap();
        let scanner = scanner_for(dir.path(), &["**/*.md"], &[]);
        let files: Vec<ScannedFile> = scanner.scan().collect();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].source, SourceRef::Repository("test".into()));
        assert!(files[0].last_modified > 0);
        assert_eq!(files[0].file_type, ".md");
    }
}
