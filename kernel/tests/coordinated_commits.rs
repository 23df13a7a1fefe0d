use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use tablelog_kernel::coordinator::{
    CommitCoordinatorClient, CommitFailed, CommitFailureKind, InMemoryCommitCoordinator,
};
use tablelog_kernel::log::path::{delta_file_name, LAST_CHECKPOINT_FILE_NAME};
use tablelog_kernel::log::{
    decode_actions, Action, Add, InMemoryLogStore, LocalFileSystemLogStore, LogStore, Metadata,
    Protocol, Remove, Version,
};
use tablelog_kernel::state::properties::CHECKPOINT_INTERVAL_KEY;
use tablelog_kernel::state::{TableState, TableStateMachine};
use tablelog_kernel::transaction::{CheckpointMode, PostCommitCheckpoint, WriterOptions};
use tablelog_kernel::Table;

const LOG: &str = "memory://warehouse/events/_delta_log";

fn add(path: &str) -> Vec<Action> {
    vec![Action::Add(Add::new(path, 100))]
}

fn coordinated_table(store: &InMemoryLogStore, coordinator: &InMemoryCommitCoordinator) -> Table {
    Table::create(
        Arc::new(store.clone()),
        LOG,
        Protocol::default(),
        Metadata::new("{}").with_name("events"),
        Some(Arc::new(coordinator.connect())),
    )
    .unwrap()
    .with_options(WriterOptions {
        checkpoint_mode: CheckpointMode::Skip,
        retry_backoff_ms: 0,
        ..Default::default()
    })
}

/// Table state replayed from every published commit, ignoring checkpoints.
fn full_replay(store: &dyn LogStore, version: Version) -> TableState {
    let mut machine = TableStateMachine::new();
    for v in 0..=version {
        let actions = decode_actions(&store.read(&delta_file_name(v)).unwrap()).unwrap();
        machine.apply_commit(v, &actions).unwrap();
    }
    machine.into_state()
}

fn published(store: &InMemoryLogStore) -> BTreeMap<String, Vec<u8>> {
    store
        .names()
        .into_iter()
        .filter(|name| !name.starts_with("_commits/"))
        .map(|name| {
            let body = store.read(&name).unwrap();
            (name, body)
        })
        .collect()
}

#[test]
fn single_writer_versions_have_no_gaps() {
    let store = InMemoryLogStore::new();
    let coordinator = InMemoryCommitCoordinator::new(3);
    let table = coordinated_table(&store, &coordinator);

    let versions: Vec<Version> = (1..8)
        .map(|i| {
            table
                .transaction()
                .commit(add(&format!("f{i}")))
                .unwrap()
                .version
        })
        .collect();

    assert_eq!(versions, (1..8).collect::<Vec<_>>());
    assert_eq!(table.latest_version().unwrap(), 7);
    assert_eq!(table.snapshot(None).unwrap().state().file_count(), 7);
}

#[test]
fn get_commits_ranges_are_contiguous_and_agree() {
    let store = InMemoryLogStore::new();
    let coordinator = InMemoryCommitCoordinator::new(100);
    let table = coordinated_table(&store, &coordinator);
    for i in 1..=6 {
        table.transaction().commit(add(&i.to_string())).unwrap();
    }
    let coordinated = table.committer().coordinator().unwrap();
    let (client, conf) = (coordinated.client(), coordinated.table_conf());

    let low = client.get_commits(LOG, conf, Some(2), Some(5)).unwrap();
    let high = client.get_commits(LOG, conf, Some(4), None).unwrap();

    let low_versions: Vec<Version> = low.commits.iter().map(|c| c.version).collect();
    let high_versions: Vec<Version> = high.commits.iter().map(|c| c.version).collect();
    assert_eq!(low_versions, vec![2, 3, 4, 5]);
    assert_eq!(high_versions, vec![4, 5, 6]);
    assert_eq!(low.commits[2..], high.commits[..2]);
    assert_eq!(high.latest_table_version, Some(6));
}

#[test]
fn backfill_is_idempotent_whatever_the_hint() {
    let store = InMemoryLogStore::new();
    let coordinator = InMemoryCommitCoordinator::new(100);
    let table = coordinated_table(&store, &coordinator);
    for i in 1..=5 {
        table.transaction().commit(add(&i.to_string())).unwrap();
    }
    let committer = table.committer();

    committer.backfill_to_version(&store, 3, None).unwrap();
    let once = published(&store);
    committer.backfill_to_version(&store, 3, Some(3)).unwrap();
    committer.backfill_to_version(&store, 2, Some(99)).unwrap();
    assert_eq!(published(&store), once);

    // overlapping range with a stale hint
    committer.backfill_to_version(&store, 5, Some(1)).unwrap();
    let extended = published(&store);
    committer.backfill_to_version(&store, 5, None).unwrap();
    assert_eq!(published(&store), extended);

    assert!(extended.contains_key(&delta_file_name(5)));
    assert_eq!(
        full_replay(&store, 5),
        table.snapshot(None).unwrap().state().clone()
    );
}

#[test]
fn checkpoint_scenario_from_a_new_table() {
    let store = InMemoryLogStore::new();
    let coordinator = InMemoryCommitCoordinator::new(100);
    let table = coordinated_table(&store, &coordinator);

    // version 0 came from registration; commit 1 and 2
    table.transaction().commit(add("a")).unwrap();
    table.transaction().commit(add("b")).unwrap();

    // version 3 lowers the checkpoint interval to 2
    let result = table
        .transaction()
        .commit_with(|snapshot| {
            let metadata = snapshot
                .and_then(|s| s.metadata())
                .cloned()
                .unwrap()
                .with_configuration(CHECKPOINT_INTERVAL_KEY, "2");
            vec![Action::Metadata(metadata), Action::Add(Add::new("c", 100))]
        })
        .unwrap();
    assert_eq!(result.version, 3);
    assert_eq!(result.properties.checkpoint_interval, 2);
    assert!(table.checkpoint_manager().is_ready_for_checkpoint(&result));
    assert_eq!(result.checkpoint, PostCommitCheckpoint::Deferred);

    let checkpoint = table.checkpoint(3).unwrap();
    // protocol, metadata and three live files
    assert_eq!(checkpoint.size, 5);
    assert_eq!(
        store.read(LAST_CHECKPOINT_FILE_NAME).unwrap(),
        br#"{"version":3,"size":5}"#
    );

    let snapshot = table.snapshot(Some(3)).unwrap();
    assert_eq!(snapshot.checkpoint_version(), Some(3));
    assert_eq!(snapshot.state(), &full_replay(&store, 3));
}

#[test]
fn pruned_history_is_a_version_unavailable_error() {
    let store = InMemoryLogStore::new();
    let table = Table::create(
        Arc::new(store.clone()),
        LOG,
        Protocol::default(),
        Metadata::new("{}"),
        None,
    )
    .unwrap()
    .with_options(WriterOptions {
        checkpoint_mode: CheckpointMode::Skip,
        ..Default::default()
    });
    for i in 1..=6 {
        table.transaction().commit(add(&i.to_string())).unwrap();
    }
    table.checkpoint(4).unwrap();
    for v in 0..4 {
        store.delete(&delta_file_name(v)).unwrap();
    }

    let err = table.snapshot(Some(3)).unwrap_err();
    assert!(err.is_version_unavailable());
    assert_eq!(err.unavailable_version(), Some(3));
    assert!(err.to_string().contains("version 3"), "{err}");

    assert_eq!(table.snapshot(Some(4)).unwrap().state().file_count(), 4);
    assert_eq!(table.snapshot(None).unwrap().version(), 6);
}

#[test]
fn failure_classification_is_exhaustive() {
    let cells = [
        (false, false, CommitFailureKind::Fatal),
        (false, true, CommitFailureKind::PermanentConflict),
        (true, false, CommitFailureKind::Transient),
        (true, true, CommitFailureKind::RebaseableConflict),
    ];
    for (retryable, conflict, kind) in cells {
        assert_eq!(CommitFailureKind::from_flags(retryable, conflict), kind);
        let failure = CommitFailed::new(kind, "x");
        assert_eq!((failure.retryable(), failure.conflict()), (retryable, conflict));
    }
}

#[test]
fn rebase_after_conflict_lands_on_a_later_version() {
    let store = InMemoryLogStore::new();
    let coordinator = InMemoryCommitCoordinator::new(100);
    let ours = coordinated_table(&store, &coordinator);
    let theirs = Table::open(Arc::new(store.clone()), LOG, Some(Arc::new(coordinator.connect())))
        .unwrap();

    let mut targets = Vec::new();
    let result = ours
        .transaction()
        .commit_with(|snapshot| {
            let target = snapshot.map_or(0, |s| s.version() + 1);
            if targets.is_empty() {
                theirs.transaction().commit(add("theirs")).unwrap();
            }
            targets.push(target);
            add("ours")
        })
        .unwrap();

    assert_eq!(targets, vec![1, 2]);
    assert!(result.version > targets[0]);
    assert_eq!(result.attempts, 2);
}

#[test]
fn concurrent_writers_never_share_a_version() {
    let store = InMemoryLogStore::new();
    let coordinator = InMemoryCommitCoordinator::new(4);
    coordinated_table(&store, &coordinator);

    let versions: Vec<Version> = thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|w| {
                let client: Arc<dyn CommitCoordinatorClient> = Arc::new(coordinator.connect());
                let table = Table::open(Arc::new(store.clone()), LOG, Some(client))
                    .unwrap()
                    .with_options(WriterOptions {
                        max_commit_attempts: 100,
                        retry_backoff_ms: 1,
                        checkpoint_mode: CheckpointMode::Inline,
                    });
                scope.spawn(move || {
                    (0..5)
                        .map(|n| {
                            table
                                .transaction()
                                .commit(add(&format!("w{w}-{n}")))
                                .unwrap()
                                .version
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });

    let mut sorted = versions.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, (1..=20).collect::<Vec<_>>());
}

#[test]
fn semantic_equality_follows_the_backing_service() {
    let service = InMemoryCommitCoordinator::new(1);
    let client = service.connect();

    assert!(service.semantic_equals(&service));
    assert!(service.semantic_equals(&client));
    assert!(client.semantic_equals(&service));
    assert!(!service.semantic_equals(&InMemoryCommitCoordinator::new(1)));
}

#[test]
fn local_filesystem_table_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LocalFileSystemLogStore::try_new(dir.path()).unwrap());
    let log_path = dir.path().display().to_string();
    Table::create(
        store.clone(),
        log_path.clone(),
        Protocol::default(),
        Metadata::new("{}").with_configuration(CHECKPOINT_INTERVAL_KEY, "3"),
        None,
    )
    .unwrap();

    let table = Table::open(store.clone(), log_path, None).unwrap();
    table.transaction().commit(add("a")).unwrap();
    let result = table.transaction().commit(add("b")).unwrap();
    assert_eq!(result.checkpoint, PostCommitCheckpoint::Written { size: 4 });

    table
        .transaction()
        .commit(vec![Action::Remove(Remove::new("a"))])
        .unwrap();

    let pointer = table.checkpoint_manager().read_last_checkpoint().unwrap().unwrap();
    assert_eq!(pointer.version, 2);
    let snapshot = table.snapshot(None).unwrap();
    assert_eq!(snapshot.version(), 3);
    assert_eq!(snapshot.checkpoint_version(), Some(2));
    assert!(snapshot.state().contains_file("b"));
    assert!(!snapshot.state().contains_file("a"));
    assert_eq!(snapshot.state(), &full_replay(store.as_ref(), 3));
}
