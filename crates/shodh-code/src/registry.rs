//! Source catalogue: repositories (from the declarative config file plus
//! runtime additions) and managed directories (persisted in the metadata
//! store), with filesystem discovery of VCS roots.

use parking_lot::RwLock;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{FilePatterns, Priority, RepositoriesConfig, RepositoryConfig};
use crate::db::MetadataStore;
use crate::error::EngineError;
use crate::scanner::FileScanner;
use crate::types::{DirectoryRecord, SourceRef};

/// A repository candidate found by [`SourceRegistry::discover`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct CandidateSource {
    pub name: String,
    pub path: PathBuf,
    /// Normalised clone identifier from the origin remote, when the root
    /// has one. Lets callers detect the same clone across machines.
    pub clone_id: Option<String>,
    pub already_indexed: bool,
}

pub struct SourceRegistry {
    repositories: RwLock<Vec<RepositoryConfig>>,
    metadata: Arc<MetadataStore>,
}

impl SourceRegistry {
    pub fn new(metadata: Arc<MetadataStore>) -> Self {
        Self {
            repositories: RwLock::new(Vec::new()),
            metadata,
        }
    }

    /// Load the declarative config file, merging with any runtime
    /// additions. Returns the number of repositories added.
    pub fn load_config_file(&self, path: &Path) -> Result<usize, EngineError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no repositories config file, starting empty");
            return Ok(0);
        }
        let config = RepositoriesConfig::from_file(path).map_err(EngineError::Validation)?;
        let mut repositories = self.repositories.write();
        let mut added = 0;
        for repo in config.repositories {
            if repositories.iter().any(|r| r.name == repo.name) {
                continue;
            }
            repositories.push(repo);
            added += 1;
        }
        Ok(added)
    }

    // ── Repositories ───────────────────────────────────────────────────

    pub fn repositories(&self) -> Vec<RepositoryConfig> {
        self.repositories.read().clone()
    }

    pub fn get_repository(&self, name: &str) -> Option<RepositoryConfig> {
        self.repositories
            .read()
            .iter()
            .find(|r| r.name == name)
            .cloned()
    }

    pub fn add_repository(&self, config: RepositoryConfig) -> Result<(), EngineError> {
        config.validate().map_err(EngineError::Validation)?;
        let mut repositories = self.repositories.write();
        if repositories
            .iter()
            .any(|r| r.name == config.name || r.path == config.path)
        {
            return Err(EngineError::conflict(format!(
                "repository already registered: {}",
                config.name
            )));
        }
        repositories.push(config);
        Ok(())
    }

    pub fn set_repository_enabled(&self, name: &str, enabled: bool) -> Result<(), EngineError> {
        let mut repositories = self.repositories.write();
        let repo = repositories
            .iter_mut()
            .find(|r| r.name == name)
            .ok_or_else(|| EngineError::not_found(format!("unknown repository: {name}")))?;
        repo.enabled = enabled;
        Ok(())
    }

    pub fn remove_repository(&self, name: &str) -> Result<RepositoryConfig, EngineError> {
        let mut repositories = self.repositories.write();
        let index = repositories
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| EngineError::not_found(format!("unknown repository: {name}")))?;
        if repositories[index].locked {
            return Err(EngineError::conflict(format!(
                "repository is locked: {name}"
            )));
        }
        Ok(repositories.remove(index))
    }

    // ── Managed directories ────────────────────────────────────────────

    pub fn directories(&self) -> Result<Vec<DirectoryRecord>, EngineError> {
        Ok(self.metadata.list_directories(false)?)
    }

    pub fn get_directory(&self, id: i64) -> Result<DirectoryRecord, EngineError> {
        self.metadata
            .get_directory(id)?
            .ok_or_else(|| EngineError::not_found(format!("unknown directory: {id}")))
    }

    pub fn add_directory(
        &self,
        path: &Path,
        priority: i64,
        enabled: bool,
        notes: Option<&str>,
    ) -> Result<DirectoryRecord, EngineError> {
        if !path.is_dir() {
            return Err(EngineError::validation(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }
        let path_str = path.to_string_lossy().to_string();
        if self.metadata.get_directory_by_path(&path_str)?.is_some() {
            return Err(EngineError::conflict(format!(
                "directory already registered: {path_str}"
            )));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path_str.clone());
        Ok(self.metadata.add_directory(
            &path_str,
            &name,
            priority,
            enabled,
            notes,
            &FilePatterns::standard(),
        )?)
    }

    pub fn set_directory_enabled(&self, id: i64, enabled: bool) -> Result<(), EngineError> {
        let mut record = self.get_directory(id)?;
        record.enabled = enabled;
        self.metadata.update_directory(&record)?;
        Ok(())
    }

    pub fn remove_directory(&self, id: i64) -> Result<DirectoryRecord, EngineError> {
        let record = self.get_directory(id)?;
        self.metadata.delete_directory(id)?;
        Ok(record)
    }

    // ── Source resolution ──────────────────────────────────────────────

    /// Resolve a boundary-layer selector: a repository name, a directory id
    /// (`"3"`), or an explicit `directory:3`.
    pub fn resolve(&self, selector: &str) -> Option<SourceRef> {
        if let Some(repo) = self.get_repository(selector) {
            return Some(SourceRef::Repository(repo.name));
        }
        let id_part = selector.strip_prefix("directory:").unwrap_or(selector);
        if let Ok(id) = id_part.parse::<i64>() {
            if let Ok(Some(_)) = self.metadata.get_directory(id) {
                return Some(SourceRef::Directory(id));
            }
        }
        None
    }

    /// All enabled, unlocked sources in indexing order: repositories first,
    /// then directories by priority.
    pub fn enabled_sources(&self) -> Result<Vec<SourceRef>, EngineError> {
        let mut sources: Vec<SourceRef> = self
            .repositories
            .read()
            .iter()
            .filter(|r| r.enabled && !r.locked)
            .map(|r| SourceRef::Repository(r.name.clone()))
            .collect();
        for dir in self.metadata.list_directories(true)? {
            sources.push(SourceRef::Directory(dir.id));
        }
        Ok(sources)
    }

    pub fn source_root(&self, source: &SourceRef) -> Result<PathBuf, EngineError> {
        match source {
            SourceRef::Repository(name) => self
                .get_repository(name)
                .map(|r| r.path)
                .ok_or_else(|| EngineError::not_found(format!("unknown repository: {name}"))),
            SourceRef::Directory(id) => Ok(PathBuf::from(self.get_directory(*id)?.path)),
        }
    }

    pub fn scanner_for(&self, source: &SourceRef) -> Result<FileScanner, EngineError> {
        match source {
            SourceRef::Repository(name) => {
                let repo = self
                    .get_repository(name)
                    .ok_or_else(|| EngineError::not_found(format!("unknown repository: {name}")))?;
                FileScanner::for_repository(&repo).map_err(EngineError::Validation)
            }
            SourceRef::Directory(id) => {
                let record = self.get_directory(*id)?;
                FileScanner::for_directory(&record).map_err(EngineError::Validation)
            }
        }
    }

    /// Multiplier applied to fused scores for this source. Repositories
    /// carry a named priority; directory integer priorities map onto the
    /// same scale (>= 2 high, 1 medium, <= 0 low).
    pub fn priority_weight(&self, source_type: &str, source_id: &str) -> f32 {
        match source_type {
            "repository" => self
                .get_repository(source_id)
                .map(|r| r.priority.weight())
                .unwrap_or(1.0),
            "directory" => {
                let priority = source_id
                    .parse::<i64>()
                    .ok()
                    .and_then(|id| self.metadata.get_directory(id).ok().flatten())
                    .map(|d| d.priority)
                    .unwrap_or(1);
                match priority {
                    p if p >= 2 => Priority::High.weight(),
                    1 => Priority::Medium.weight(),
                    _ => Priority::Low.weight(),
                }
            }
            _ => 1.0,
        }
    }

    /// Extensions the watcher should accept for a source, derived from its
    /// include patterns. An empty set means every extension is watched.
    pub fn watch_extensions(&self, source: &SourceRef) -> Result<HashSet<String>, EngineError> {
        let include = match source {
            SourceRef::Repository(name) => {
                self.get_repository(name)
                    .ok_or_else(|| EngineError::not_found(format!("unknown repository: {name}")))?
                    .file_patterns
                    .include
            }
            SourceRef::Directory(id) => self.get_directory(*id)?.include_patterns,
        };

        let mut extensions = HashSet::new();
        for pattern in include {
            if let Some(pos) = pattern.rfind("*.") {
                let ext = &pattern[pos + 1..];
                if !ext.is_empty() && !ext.contains('*') && !ext.contains('/') {
                    extensions.insert(ext.to_string());
                }
            } else if pattern.ends_with("**/*") || pattern == "**/*" || pattern == "*" {
                // Catch-all include: watch everything.
                return Ok(HashSet::new());
            }
        }
        Ok(extensions)
    }

    pub fn exclude_patterns(&self, source: &SourceRef) -> Result<Vec<String>, EngineError> {
        match source {
            SourceRef::Repository(name) => Ok(self
                .get_repository(name)
                .ok_or_else(|| EngineError::not_found(format!("unknown repository: {name}")))?
                .file_patterns
                .exclude),
            SourceRef::Directory(id) => Ok(self.get_directory(*id)?.exclude_patterns),
        }
    }

    // ── Discovery ──────────────────────────────────────────────────────

    /// Walk the filesystem under `root` up to `max_depth`, recognising
    /// `.git` roots and skipping common build/vendor directories. Does not
    /// descend into discovered repositories.
    pub fn discover(
        &self,
        root: &Path,
        max_depth: usize,
        exclusions: &[String],
    ) -> Result<Vec<CandidateSource>, EngineError> {
        if !root.is_dir() {
            return Err(EngineError::validation(format!(
                "not a directory: {}",
                root.display()
            )));
        }

        let default_exclusions = [
            "node_modules",
            "venv",
            ".venv",
            "env",
            "__pycache__",
            "dist",
            "build",
            "target",
            ".dart_tool",
            "Pods",
            ".gradle",
            "archive",
            "backup",
        ];
        let mut excluded: HashSet<&str> = default_exclusions.into_iter().collect();
        for pattern in exclusions {
            excluded.insert(pattern.as_str());
        }

        let indexed_paths: HashSet<PathBuf> = self
            .repositories
            .read()
            .iter()
            .map(|r| r.path.clone())
            .chain(
                self.metadata
                    .list_directories(false)?
                    .into_iter()
                    .map(|d| PathBuf::from(d.path)),
            )
            .collect();

        let mut candidates = Vec::new();
        discover_walk(root, 0, max_depth, &excluded, &indexed_paths, &mut candidates);
        Ok(candidates)
    }
}

fn discover_walk(
    dir: &Path,
    depth: usize,
    max_depth: usize,
    excluded: &HashSet<&str>,
    indexed_paths: &HashSet<PathBuf>,
    out: &mut Vec<CandidateSource>,
) {
    if depth >= max_depth {
        return;
    }

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(path = %dir.display(), error = %err, "discovery: unreadable directory");
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || excluded.contains(name.as_str()) {
            continue;
        }

        if path.join(".git").is_dir() {
            out.push(CandidateSource {
                name,
                clone_id: origin_url(&path).map(|url| normalize_clone_id(&url)),
                already_indexed: indexed_paths.contains(&path),
                path,
            });
            // A repository root; don't look for nested repositories.
            continue;
        }

        discover_walk(&path, depth + 1, max_depth, excluded, indexed_paths, out);
    }
}

/// Read the origin remote URL from `.git/config`.
fn origin_url(repo_path: &Path) -> Option<String> {
    let config = std::fs::read_to_string(repo_path.join(".git").join("config")).ok()?;
    let remote_re = regex::Regex::new(r#"(?m)^\[remote "origin"\]"#).ok()?;
    let url_re = regex::Regex::new(r"(?m)^\s*url\s*=\s*(\S+)").ok()?;

    let start = remote_re.find(&config)?.end();
    let section = &config[start..];
    let end = section.find("\n[").unwrap_or(section.len());
    url_re
        .captures(&section[..end])
        .map(|c| c[1].to_string())
}

/// Normalise a clone URL so the same remote compares equal across
/// machines: strip scheme and credentials, unify the ssh `host:path`
/// form, drop a trailing `.git`, lowercase.
fn normalize_clone_id(url: &str) -> String {
    let mut rest = url.trim();
    for scheme in ["ssh://", "git://", "https://", "http://"] {
        if let Some(stripped) = rest.strip_prefix(scheme) {
            rest = stripped;
            break;
        }
    }
    if let Some(at) = rest.find('@') {
        rest = &rest[at + 1..];
    }
    let unified = rest.replacen(':', "/", 1);
    unified
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SourceRegistry {
        SourceRegistry::new(Arc::new(MetadataStore::open_in_memory().unwrap()))
    }

    fn repo(name: &str, path: &Path, priority: Priority) -> RepositoryConfig {
        RepositoryConfig {
            name: name.to_string(),
            path: path.to_path_buf(),
            enabled: true,
            priority,
            locked: false,
            file_patterns: FilePatterns::default(),
        }
    }

    #[test]
    fn add_resolve_and_remove_repository() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        registry
            .add_repository(repo("proj", dir.path(), Priority::High))
            .unwrap();

        assert!(matches!(
            registry.resolve("proj"),
            Some(SourceRef::Repository(_))
        ));
        assert!(registry.resolve("ghost").is_none());

        // Duplicate registration conflicts.
        let err = registry
            .add_repository(repo("proj", dir.path(), Priority::Low))
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        registry.remove_repository("proj").unwrap();
        assert!(registry.resolve("proj").is_none());
    }

    #[test]
    fn locked_repository_cannot_be_removed() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let mut config = repo("frozen", dir.path(), Priority::Medium);
        config.locked = true;
        registry.add_repository(config).unwrap();
        assert!(matches!(
            registry.remove_repository("frozen"),
            Err(EngineError::Conflict(_))
        ));
    }

    #[test]
    fn priority_weights_for_both_source_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        registry
            .add_repository(repo("hi", dir.path(), Priority::High))
            .unwrap();
        assert_eq!(registry.priority_weight("repository", "hi"), 1.5);
        assert_eq!(registry.priority_weight("repository", "missing"), 1.0);

        let record = registry
            .add_directory(dir.path(), 5, true, None)
            .unwrap();
        assert_eq!(
            registry.priority_weight("directory", &record.id.to_string()),
            1.5
        );
    }

    #[test]
    fn watch_extensions_derived_from_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let mut config = repo("proj", dir.path(), Priority::Medium);
        config.file_patterns = FilePatterns {
            include: vec!["**/*.py".into(), "**/*.md".into()],
            exclude: vec![],
        };
        registry.add_repository(config).unwrap();

        let extensions = registry
            .watch_extensions(&SourceRef::Repository("proj".into()))
            .unwrap();
        assert_eq!(
            extensions,
            HashSet::from([".py".to_string(), ".md".to_string()])
        );
    }

    #[test]
    fn discovery_finds_git_roots_and_marks_indexed() {
        let dir = tempfile::tempdir().unwrap();
        let repo_a = dir.path().join("alpha");
        let repo_b = dir.path().join("group/beta");
        std::fs::create_dir_all(repo_a.join(".git")).unwrap();
        std::fs::create_dir_all(repo_b.join(".git")).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/fake/.git")).unwrap();
        std::fs::write(
            repo_a.join(".git/config"),
            "[remote \"origin\"]\n\turl = git@github.com:Roshera/Alpha.git\n",
        )
        .unwrap();

        let registry = registry();
        registry
            .add_repository(repo("alpha", &repo_a, Priority::Medium))
            .unwrap();

        let mut found = registry.discover(dir.path(), 3, &[]).unwrap();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].name, "alpha");
        assert!(found[0].already_indexed);
        assert_eq!(
            found[0].clone_id.as_deref(),
            Some("github.com/roshera/alpha")
        );
        assert_eq!(found[1].name, "beta");
        assert!(!found[1].already_indexed);
    }

    #[test]
    fn clone_id_normalisation() {
        assert_eq!(
            normalize_clone_id("git@github.com:User/Repo.git"),
            "github.com/user/repo"
        );
        assert_eq!(
            normalize_clone_id("https://github.com/User/Repo.git"),
            "github.com/user/repo"
        );
        assert_eq!(
            normalize_clone_id("ssh://git@gitlab.com/team/repo/"),
            "gitlab.com/team/repo"
        );
    }
}
