//! End-to-end pipeline tests: index real files from temp sources through
//! the coordinator into both backends, then query through the supervisor
//! facade. Runs with the deterministic hashing embedder (no model on
//! disk), so the suite is fully hermetic.

use std::path::Path;
use std::time::Duration;

use shodh_code::config::Settings;
use shodh_code::coordinator::{ChangeKind, FileChange, RunStatus};
use shodh_code::search::SearchRequest;
use shodh_code::types::{IndexKind, SearchMode, SourceRef};
use shodh_code::{EngineError, Supervisor};

fn test_settings(base: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.data_dir = base.join("data");
    settings.repositories_config = base.join("repositories.yaml");
    settings.rewriter_enabled = false;
    settings.watch_enabled = false;
    settings.embedding.model_dir = None;
    settings.embedding.dimension = 128;
    settings.chunk_size = 200;
    settings.vector_batch_size = 8;
    settings
}

fn write_repositories_config(base: &Path, repos: &[(&str, &Path, &str)]) {
    let mut yaml = String::from("repositories:\n");
    for (name, path, priority) in repos {
        yaml.push_str(&format!(
            concat!(
                "  - name: {}\n",
                "    path: {}\n",
                "    enabled: true\n",
                "    priority: {}\n",
                "    file_patterns:\n",
                "      include: [\"**/*.py\", \"**/*.md\", \"**/*.txt\"]\n",
                "      exclude: [\"**/.git/**\"]\n",
            ),
            name,
            path.display(),
            priority
        ));
    }
    std::fs::write(base.join("repositories.yaml"), yaml).unwrap();
}

async fn run_to_completion(supervisor: &Supervisor, full_rebuild: bool) -> RunStatus {
    let response = supervisor
        .reindex(None, vec![], full_rebuild)
        .await
        .unwrap();
    let progress = supervisor
        .coordinator()
        .wait_for_run(response.run_id, Duration::from_secs(120))
        .await
        .expect("run should be tracked");
    progress.status
}

#[tokio::test(flavor = "multi_thread")]
async fn hybrid_search_after_fresh_index_finds_both_sides() {
    let base = tempfile::tempdir().unwrap();
    let repo = base.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    std::fs::write(
        repo.join("auth.py"),
        "def authenticate(token):\n    return verify_signature(token)\n",
    )
    .unwrap();
    std::fs::write(repo.join("NOTES.md"), "the login flow uses JWT\n").unwrap();
    write_repositories_config(base.path(), &[("proj", &repo, "medium")]);

    let supervisor = Supervisor::start(test_settings(base.path())).await.unwrap();
    assert_eq!(run_to_completion(&supervisor, true).await, RunStatus::Complete);

    let results = supervisor
        .search(SearchRequest::new("JWT authentication"))
        .await
        .unwrap();

    let names: Vec<&str> = results.iter().map(|r| r.file_name.as_str()).collect();
    assert!(names.contains(&"auth.py"), "missing auth.py in {names:?}");
    assert!(names.contains(&"NOTES.md"), "missing NOTES.md in {names:?}");

    // Both backends produced the same primary key per file.
    for result in &results {
        assert_eq!(
            result.id,
            shodh_code::ids::document_id(Path::new(&result.file_path))
        );
    }

    // Counters moved.
    let stats = supervisor.stats().await.unwrap();
    assert_eq!(stats.keyword_documents, 2);
    assert!(stats.vector_chunks >= 2);
    assert_eq!(stats.total_searches, 1);
    assert!(stats.last_index_time.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn metadata_rows_cover_every_indexed_file() {
    let base = tempfile::tempdir().unwrap();
    let repo = base.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    std::fs::write(repo.join("one.md"), "alpha document").unwrap();
    std::fs::write(repo.join("two.md"), "beta document").unwrap();
    write_repositories_config(base.path(), &[("proj", &repo, "medium")]);

    let supervisor = Supervisor::start(test_settings(base.path())).await.unwrap();
    assert_eq!(run_to_completion(&supervisor, true).await, RunStatus::Complete);

    let stats = supervisor.stats().await.unwrap();
    assert_eq!(stats.metadata.total_files, 2);
    assert_eq!(
        stats.metadata.by_index_kind.get("both").copied(),
        Some(2),
        "both passes should stamp every file: {:?}",
        stats.metadata.by_index_kind
    );

    // Source stats recorded for both kinds.
    assert_eq!(stats.source_stats.len(), 2);
    for source_stat in &stats.source_stats {
        assert_eq!(source_stat.total_files_indexed, 2);
        assert!(source_stat.initial_index_time_seconds.is_some());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn incremental_rerun_flushes_nothing() {
    let base = tempfile::tempdir().unwrap();
    let repo = base.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    std::fs::write(repo.join("a.md"), "first file").unwrap();
    std::fs::write(repo.join("b.md"), "second file").unwrap();
    write_repositories_config(base.path(), &[("proj", &repo, "medium")]);

    let supervisor = Supervisor::start(test_settings(base.path())).await.unwrap();
    assert_eq!(run_to_completion(&supervisor, false).await, RunStatus::Complete);

    let response = supervisor.reindex(None, vec![], false).await.unwrap();
    let progress = supervisor
        .coordinator()
        .wait_for_run(response.run_id, Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(progress.status, RunStatus::Complete);
    assert_eq!(progress.files_processed, 0);
    // Two files skipped by each of the two passes.
    assert_eq!(progress.files_unchanged, 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn watcher_driven_deletion_removes_the_document() {
    let base = tempfile::tempdir().unwrap();
    let repo = base.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    let doomed = repo.join("doomed.md");
    std::fs::write(&doomed, "xylophone maintenance handbook").unwrap();
    std::fs::write(repo.join("keep.md"), "unrelated content").unwrap();
    write_repositories_config(base.path(), &[("proj", &repo, "medium")]);

    let supervisor = Supervisor::start(test_settings(base.path())).await.unwrap();
    assert_eq!(run_to_completion(&supervisor, true).await, RunStatus::Complete);

    let results = supervisor
        .search(SearchRequest::new("xylophone"))
        .await
        .unwrap();
    assert!(!results.is_empty());

    std::fs::remove_file(&doomed).unwrap();
    supervisor
        .coordinator()
        .apply_changes(
            &SourceRef::Repository("proj".into()),
            &[FileChange {
                path: doomed.clone(),
                kind: ChangeKind::Remove,
            }],
            &[IndexKind::Keyword, IndexKind::Vector],
        )
        .await
        .unwrap();

    let results = supervisor
        .search(SearchRequest::new("xylophone"))
        .await
        .unwrap();
    assert!(
        results.iter().all(|r| !r.file_path.ends_with("doomed.md")),
        "deleted file still surfaced: {results:?}"
    );

    let stats = supervisor.stats().await.unwrap();
    assert_eq!(stats.keyword_documents, 1);
    assert_eq!(stats.metadata.total_files, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn watcher_driven_modification_reindexes_latest_content() {
    let base = tempfile::tempdir().unwrap();
    let repo = base.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    let file = repo.join("story.md");
    std::fs::write(&file, "the quokka sleeps").unwrap();
    write_repositories_config(base.path(), &[("proj", &repo, "medium")]);

    let supervisor = Supervisor::start(test_settings(base.path())).await.unwrap();
    assert_eq!(run_to_completion(&supervisor, true).await, RunStatus::Complete);

    // Rewrite with new content and a strictly newer mtime.
    std::thread::sleep(Duration::from_millis(1100));
    std::fs::write(&file, "the capybara swims").unwrap();
    supervisor
        .coordinator()
        .apply_changes(
            &SourceRef::Repository("proj".into()),
            &[FileChange {
                path: file.clone(),
                kind: ChangeKind::Upsert,
            }],
            &[IndexKind::Keyword, IndexKind::Vector],
        )
        .await
        .unwrap();

    let results = supervisor
        .search(SearchRequest::new("capybara"))
        .await
        .unwrap();
    assert!(!results.is_empty());

    // The stale token no longer matches on the keyword side.
    let mut request = SearchRequest::new("quokka");
    request.mode = SearchMode::Keyword;
    let results = supervisor.search(request).await.unwrap();
    assert!(results.is_empty(), "stale content still indexed");
}

#[tokio::test(flavor = "multi_thread")]
async fn full_rebuild_drops_files_no_longer_on_disk() {
    let base = tempfile::tempdir().unwrap();
    let repo = base.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    let ghost = repo.join("ghost.md");
    std::fs::write(&ghost, "ectoplasm residue report").unwrap();
    std::fs::write(repo.join("solid.md"), "perfectly normal file").unwrap();
    write_repositories_config(base.path(), &[("proj", &repo, "medium")]);

    let supervisor = Supervisor::start(test_settings(base.path())).await.unwrap();
    assert_eq!(run_to_completion(&supervisor, true).await, RunStatus::Complete);

    std::fs::remove_file(&ghost).unwrap();
    assert_eq!(run_to_completion(&supervisor, true).await, RunStatus::Complete);

    let results = supervisor
        .search(SearchRequest::new("ectoplasm"))
        .await
        .unwrap();
    assert!(results.is_empty(), "rebuilt index still holds ghost.md");

    let stats = supervisor.stats().await.unwrap();
    assert_eq!(stats.keyword_documents, 1);
    assert_eq!(stats.metadata.total_files, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn priority_reweighting_ranks_high_priority_source_first() {
    let base = tempfile::tempdir().unwrap();
    let repo_high = base.path().join("high");
    let repo_low = base.path().join("low");
    std::fs::create_dir_all(&repo_high).unwrap();
    std::fs::create_dir_all(&repo_low).unwrap();
    let content = "telemetry pipeline aggregates device metrics";
    std::fs::write(repo_high.join("doc.md"), content).unwrap();
    std::fs::write(repo_low.join("doc.md"), content).unwrap();
    write_repositories_config(
        base.path(),
        &[("vip", &repo_high, "high"), ("bulk", &repo_low, "low")],
    );

    let supervisor = Supervisor::start(test_settings(base.path())).await.unwrap();
    assert_eq!(run_to_completion(&supervisor, true).await, RunStatus::Complete);

    let results = supervisor
        .search(SearchRequest::new("telemetry metrics"))
        .await
        .unwrap();
    assert!(results.len() >= 2);
    assert_eq!(
        results[0].repository, "vip",
        "high-priority source should rank strictly first: {results:?}"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn keyword_and_semantic_modes_work_standalone() {
    let base = tempfile::tempdir().unwrap();
    let repo = base.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    std::fs::write(repo.join("notes.md"), "JWT tokens expire after an hour").unwrap();
    write_repositories_config(base.path(), &[("proj", &repo, "medium")]);

    let supervisor = Supervisor::start(test_settings(base.path())).await.unwrap();
    assert_eq!(run_to_completion(&supervisor, true).await, RunStatus::Complete);

    let mut request = SearchRequest::new("JWT");
    request.mode = SearchMode::Keyword;
    let keyword_only = supervisor.search(request).await.unwrap();
    assert_eq!(keyword_only.len(), 1);
    assert!(keyword_only[0].keyword_rank.is_some());
    assert!(keyword_only[0].semantic_rank.is_none());

    let mut request = SearchRequest::new("JWT token expiry");
    request.mode = SearchMode::Semantic;
    let semantic_only = supervisor.search(request).await.unwrap();
    assert!(!semantic_only.is_empty());
    assert!(semantic_only[0].semantic_distance.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn rewriter_fallback_keeps_search_working() {
    let base = tempfile::tempdir().unwrap();
    let repo = base.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    std::fs::write(repo.join("cleanup.sh.txt"), "cleanup script removes stale builds").unwrap();
    write_repositories_config(base.path(), &[("proj", &repo, "medium")]);

    // Rewriter enabled but pointing at a closed port.
    let mut settings = test_settings(base.path());
    settings.rewriter_enabled = true;
    settings.rewriter_host = "http://127.0.0.1".into();
    settings.rewriter_port = 1;

    let supervisor = Supervisor::start(settings).await.unwrap();
    assert_eq!(run_to_completion(&supervisor, true).await, RunStatus::Complete);

    let mut request = SearchRequest::new("find the cleanup script");
    request.rewrite = true;
    let results = supervisor.search(request).await.unwrap();
    assert!(!results.is_empty(), "fallback search should still match");
}

#[tokio::test(flavor = "multi_thread")]
async fn boundary_cases_empty_query_empty_index_and_limits() {
    let base = tempfile::tempdir().unwrap();
    let repo = base.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    write_repositories_config(base.path(), &[("proj", &repo, "medium")]);

    let supervisor = Supervisor::start(test_settings(base.path())).await.unwrap();

    // Empty query: empty list, not an error.
    let results = supervisor.search(SearchRequest::new("")).await.unwrap();
    assert!(results.is_empty());

    // Nothing indexed: empty list, not an error.
    let results = supervisor
        .search(SearchRequest::new("anything at all"))
        .await
        .unwrap();
    assert!(results.is_empty());

    // Limit bounds are validated.
    let mut request = SearchRequest::new("x");
    request.limit = 0;
    assert!(matches!(
        supervisor.search(request).await,
        Err(EngineError::Validation(_))
    ));
    let mut request = SearchRequest::new("x");
    request.limit = 101;
    assert!(matches!(
        supervisor.search(request).await,
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn min_score_filters_low_scoring_results() {
    let base = tempfile::tempdir().unwrap();
    let repo = base.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    std::fs::write(repo.join("a.md"), "orchestration layer docs").unwrap();
    write_repositories_config(base.path(), &[("proj", &repo, "medium")]);

    let supervisor = Supervisor::start(test_settings(base.path())).await.unwrap();
    assert_eq!(run_to_completion(&supervisor, true).await, RunStatus::Complete);

    // RRF scores live near 1/k; an absurd floor empties the result list.
    let mut request = SearchRequest::new("orchestration");
    request.min_score = 0.9;
    let results = supervisor.search(request).await.unwrap();
    assert!(results.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_stops_early_and_incremental_completes_the_rest() {
    let base = tempfile::tempdir().unwrap();
    let repo = base.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    for i in 0..400 {
        std::fs::write(
            repo.join(format!("file_{i:04}.md")),
            format!("document number {i} about subsystem {}", i % 7),
        )
        .unwrap();
    }
    write_repositories_config(base.path(), &[("proj", &repo, "medium")]);

    let mut settings = test_settings(base.path());
    settings.vector_batch_size = 4;
    let supervisor = Supervisor::start(settings).await.unwrap();

    let response = supervisor.reindex(None, vec![], true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stop = supervisor.stop_indexing(vec![]);
    assert_eq!(stop.stopped, ["keyword", "vector"]);

    let progress = supervisor
        .coordinator()
        .wait_for_run(response.run_id, Duration::from_secs(120))
        .await
        .unwrap();
    assert_ne!(progress.status, RunStatus::Running);
    assert_ne!(progress.status, RunStatus::Failed);
    if progress.status == RunStatus::Cancelled {
        // Partial counts: both passes together would be 800.
        assert!(progress.files_processed < 800);
    }

    // A follow-up incremental run brings the source fully up to date.
    assert_eq!(run_to_completion(&supervisor, false).await, RunStatus::Complete);
    let stats = supervisor.stats().await.unwrap();
    assert_eq!(stats.metadata.total_files, 400);
    assert_eq!(stats.keyword_documents, 400);
    assert_eq!(stats.metadata.by_index_kind.get("both").copied(), Some(400));
}

#[tokio::test(flavor = "multi_thread")]
async fn removing_a_source_purges_both_indexes() {
    let base = tempfile::tempdir().unwrap();
    let repo_keep = base.path().join("keep");
    let repo_gone = base.path().join("gone");
    std::fs::create_dir_all(&repo_keep).unwrap();
    std::fs::create_dir_all(&repo_gone).unwrap();
    std::fs::write(repo_keep.join("a.md"), "shared lighthouse keyword").unwrap();
    std::fs::write(repo_gone.join("b.md"), "shared lighthouse keyword").unwrap();
    write_repositories_config(
        base.path(),
        &[("keep", &repo_keep, "medium"), ("gone", &repo_gone, "medium")],
    );

    let supervisor = Supervisor::start(test_settings(base.path())).await.unwrap();
    assert_eq!(run_to_completion(&supervisor, true).await, RunStatus::Complete);

    supervisor.remove_source("gone").await.unwrap();

    let results = supervisor
        .search(SearchRequest::new("lighthouse"))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].repository, "keep");

    let stats = supervisor.stats().await.unwrap();
    assert_eq!(stats.keyword_documents, 1);
    assert_eq!(stats.metadata.total_files, 1);

    // Removing it again is NotFound.
    assert!(matches!(
        supervisor.remove_source("gone").await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn directory_sources_index_and_filter() {
    let base = tempfile::tempdir().unwrap();
    let docs = base.path().join("docs");
    std::fs::create_dir_all(&docs).unwrap();
    std::fs::write(docs.join("handbook.md"), "quasar observation handbook").unwrap();

    let supervisor = Supervisor::start(test_settings(base.path())).await.unwrap();
    let added = supervisor
        .add_sources(vec![docs.clone()], shodh_code::Priority::High, true)
        .await
        .unwrap();
    assert_eq!(added.added.len(), 1);

    assert_eq!(run_to_completion(&supervisor, true).await, RunStatus::Complete);

    let mut request = SearchRequest::new("quasar handbook");
    request.filters.directory_ids = Some(vec![1]);
    let results = supervisor.search(request).await.unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0].source_type, "directory");

    // Re-adding the same path is skipped, not an error.
    let again = supervisor
        .add_sources(vec![docs], shodh_code::Priority::High, true)
        .await
        .unwrap();
    assert!(again.added.is_empty());
    assert_eq!(again.skipped.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn mtime_equal_to_last_indexed_is_skipped() {
    let base = tempfile::tempdir().unwrap();
    let repo = base.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    let file = repo.join("same.md");
    std::fs::write(&file, "unchanging text").unwrap();
    write_repositories_config(base.path(), &[("proj", &repo, "medium")]);

    let supervisor = Supervisor::start(test_settings(base.path())).await.unwrap();
    assert_eq!(run_to_completion(&supervisor, false).await, RunStatus::Complete);

    // last_indexed >= mtime, so the coverage check skips the file even
    // when coming through the watcher path.
    let processed = supervisor
        .coordinator()
        .apply_changes(
            &SourceRef::Repository("proj".into()),
            &[FileChange {
                path: file,
                kind: ChangeKind::Upsert,
            }],
            &[IndexKind::Keyword, IndexKind::Vector],
        )
        .await
        .unwrap();
    assert_eq!(processed, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn metadata_coverage_uses_kind_granularity() {
    let base = tempfile::tempdir().unwrap();
    let repo = base.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    std::fs::write(repo.join("a.md"), "granular coverage check").unwrap();
    write_repositories_config(base.path(), &[("proj", &repo, "medium")]);

    let supervisor = Supervisor::start(test_settings(base.path())).await.unwrap();

    // Keyword-only first.
    let response = supervisor
        .reindex(None, vec![IndexKind::Keyword], false)
        .await
        .unwrap();
    supervisor
        .coordinator()
        .wait_for_run(response.run_id, Duration::from_secs(60))
        .await
        .unwrap();

    // The vector pass must not treat the keyword stamp as up to date.
    let response = supervisor
        .reindex(None, vec![IndexKind::Vector], false)
        .await
        .unwrap();
    let progress = supervisor
        .coordinator()
        .wait_for_run(response.run_id, Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(progress.status, RunStatus::Complete);
    assert_eq!(progress.files_processed, 1);

    let stats = supervisor.stats().await.unwrap();
    assert_eq!(stats.metadata.by_index_kind.get("both").copied(), Some(1));
}
