//! End-to-end transfer tests against the in-process mock grid.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::config::{ConnectionConfig, TransferConfig};
use common::control::TransferControlBlock;
use common::error::Error;
use common::status::{TransferState, TransferStatus, TransferStatusCallback, TransferType};
use remote::parallel::Operation;
use remote::protocol::api::ApiNumber;
use remote::testutils::{MockGrid, MockGridConfig};
use remote::{Account, Session};
use rgrid::DataTransferOperations;

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<TransferStatus>>,
}

impl Recorder {
    fn events(&self) -> Vec<TransferStatus> {
        self.events.lock().unwrap().clone()
    }

    fn states(&self) -> Vec<TransferState> {
        self.events().into_iter().map(|status| status.state).collect()
    }
}

impl TransferStatusCallback for Recorder {
    fn status_callback(&self, status: TransferStatus) -> Result<(), Error> {
        self.events.lock().unwrap().push(status);
        Ok(())
    }
}

async fn operations(
    grid: &MockGrid,
    settings: TransferConfig,
) -> anyhow::Result<DataTransferOperations> {
    let session = Session::open(grid.account()?, &ConnectionConfig::default()).await?;
    Ok(DataTransferOperations::new(session, settings)?)
}

fn parallel_settings() -> TransferConfig {
    TransferConfig {
        parallel_threshold: 1024 * 1024,
        max_parallel_threads: 4,
        ..Default::default()
    }
}

async fn write_file(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, data).await?;
    Ok(())
}

/// tree/a.txt, tree/sub1/b.txt, tree/sub2/c.txt
async fn make_tree(root: &Path) -> anyhow::Result<std::path::PathBuf> {
    let tree = root.join("tree");
    write_file(&tree.join("a.txt"), b"alpha").await?;
    write_file(&tree.join("sub1").join("b.txt"), b"bravo!").await?;
    write_file(&tree.join("sub2").join("c.txt"), b"charlie").await?;
    Ok(tree)
}

#[tokio::test]
async fn parallel_put_of_large_file() -> anyhow::Result<()> {
    let grid = MockGrid::start(MockGridConfig::default()).await?;
    let tmp = tempfile::tempdir()?;
    let size = 10 * 1024 * 1024;
    let data: Vec<u8> = (0..size).map(|i| (i % 253) as u8).collect();
    let local = tmp.path().join("big.bin");
    write_file(&local, &data).await?;
    let mut ops = operations(&grid, parallel_settings()).await?;
    let control = Arc::new(TransferControlBlock::new());
    let summary = ops
        .put(&local, &grid.home(), None, Some(control.clone()))
        .await?;
    assert_eq!(summary.bytes_transferred, size as u64);
    assert_eq!(summary.files_transferred, 1);
    let remote = format!("{}/big.bin", grid.home());
    assert_eq!(grid.object(&remote).map(|object| object.data), Some(data));
    let mut ranges: Vec<_> = grid
        .directives()
        .into_iter()
        .filter(|record| record.operation == Operation::Put)
        .map(|record| (record.offset, record.length))
        .collect();
    ranges.sort();
    assert!(ranges.windows(2).all(|pair| pair[0].0 + pair[0].1 <= pair[1].0), "ranges overlap");
    assert_eq!(ranges.iter().map(|(_, length)| length).sum::<u64>(), size as u64);
    assert_eq!(control.total_files_to_transfer(), 1);
    assert_eq!(control.total_files_transferred_so_far(), 1);
    assert_eq!(control.bytes_transferred(), size as u64);
    ops.close().await?;
    Ok(())
}

#[tokio::test]
async fn put_directory_reports_every_file() -> anyhow::Result<()> {
    let grid = MockGrid::start(MockGridConfig::default()).await?;
    let tmp = tempfile::tempdir()?;
    let tree = make_tree(tmp.path()).await?;
    let mut ops = operations(&grid, TransferConfig::default()).await?;
    let recorder = Recorder::default();
    let summary = ops.put(&tree, &grid.home(), Some(&recorder), None).await?;
    assert_eq!(summary.files_transferred, 3);
    assert_eq!(summary.directories_created, 3);
    let events = recorder.events();
    assert_eq!(
        recorder.states(),
        vec![
            TransferState::Success,
            TransferState::Success,
            TransferState::Success,
            TransferState::OverallCompletion
        ]
    );
    assert!(events.iter().all(|status| status.total_files == 3));
    assert!(events.iter().all(|status| status.transfer_type == TransferType::Put));
    assert_eq!(events[2].files_transferred_so_far, 3);
    let root = format!("{}/tree", grid.home());
    assert_eq!(
        grid.object(&format!("{root}/sub1/b.txt")).map(|object| object.data),
        Some(b"bravo!".to_vec())
    );
    assert!(grid.has_collection(&format!("{root}/sub2")));
    Ok(())
}

#[tokio::test]
async fn failed_file_is_reported_and_transfer_goes_on() -> anyhow::Result<()> {
    let root = "/tempZone/home/rods/tree";
    let grid = MockGrid::start(MockGridConfig {
        reject_paths: vec![format!("{root}/sub1/b.txt")],
        ..Default::default()
    })
    .await?;
    let tmp = tempfile::tempdir()?;
    let tree = make_tree(tmp.path()).await?;
    let mut ops = operations(&grid, TransferConfig::default()).await?;
    let recorder = Recorder::default();
    let summary = ops.put(&tree, &grid.home(), Some(&recorder), None).await?;
    assert_eq!(summary.files_transferred, 2);
    assert_eq!(summary.files_failed, 1);
    assert_eq!(
        recorder.states(),
        vec![
            TransferState::Success,
            TransferState::Failure,
            TransferState::Success,
            TransferState::OverallCompletion
        ]
    );
    let failure = &recorder.events()[1];
    assert_eq!(failure.target_path, format!("{root}/sub1/b.txt"));
    assert_eq!(failure.total_bytes, 6);
    assert_eq!(failure.bytes_transferred_so_far, 0);
    assert!(matches!(failure.error.as_deref(), Some(Error::Server { .. })));
    assert!(grid.object(&format!("{root}/sub2/c.txt")).is_some());
    Ok(())
}

#[tokio::test]
async fn failure_without_callback_is_returned() -> anyhow::Result<()> {
    let root = "/tempZone/home/rods/tree";
    let grid = MockGrid::start(MockGridConfig {
        reject_paths: vec![format!("{root}/a.txt")],
        ..Default::default()
    })
    .await?;
    let tmp = tempfile::tempdir()?;
    let tree = make_tree(tmp.path()).await?;
    let mut ops = operations(&grid, TransferConfig::default()).await?;
    let error = ops.put(&tree, &grid.home(), None, None).await.unwrap_err();
    assert!(matches!(error, Error::Server { .. }), "{error:?}");
    assert!(grid.object(&format!("{root}/sub1/b.txt")).is_none());
    Ok(())
}

#[tokio::test]
async fn error_threshold_cancels_transfer() -> anyhow::Result<()> {
    let root = "/tempZone/home/rods/flat";
    let grid = MockGrid::start(MockGridConfig {
        reject_paths: vec![format!("{root}/1.bin"), format!("{root}/2.bin")],
        ..Default::default()
    })
    .await?;
    let tmp = tempfile::tempdir()?;
    let flat = tmp.path().join("flat");
    for name in ["1.bin", "2.bin", "3.bin"] {
        write_file(&flat.join(name), name.as_bytes()).await?;
    }
    let mut ops = operations(&grid, TransferConfig::default()).await?;
    let control = Arc::new(TransferControlBlock::with_settings(None, 1)?);
    let recorder = Recorder::default();
    ops.put(&flat, &grid.home(), Some(&recorder), Some(control.clone()))
        .await?;
    assert_eq!(recorder.states(), vec![TransferState::Failure, TransferState::Cancelled]);
    assert!(control.is_cancelled());
    assert_eq!(control.error_count(), 1);
    assert!(grid.object(&format!("{root}/3.bin")).is_none());
    Ok(())
}

#[tokio::test]
async fn restart_skips_files_up_to_restart_point() -> anyhow::Result<()> {
    let grid = MockGrid::start(MockGridConfig::default()).await?;
    let tmp = tempfile::tempdir()?;
    let tree = tokio::fs::canonicalize(make_tree(tmp.path()).await?).await?;
    let restart = tree.join("sub1").join("b.txt").display().to_string();
    let control = Arc::new(TransferControlBlock::with_settings(Some(restart), -1)?);
    let recorder = Recorder::default();
    let mut ops = operations(&grid, TransferConfig::default()).await?;
    let summary = ops
        .put(&tree, &grid.home(), Some(&recorder), Some(control.clone()))
        .await?;
    assert_eq!(summary.files_skipped, 2);
    assert_eq!(summary.files_transferred, 1);
    let root = format!("{}/tree", grid.home());
    assert!(grid.object(&format!("{root}/a.txt")).is_none());
    assert!(grid.object(&format!("{root}/sub1/b.txt")).is_none());
    assert!(grid.object(&format!("{root}/sub2/c.txt")).is_some());
    let events = recorder.events();
    assert_eq!(events[0].state, TransferState::Success);
    assert_eq!(events[0].files_transferred_so_far, 3);
    assert_eq!(control.total_files_transferred_so_far(), 3);
    Ok(())
}

#[tokio::test]
async fn cancelled_before_start() -> anyhow::Result<()> {
    let grid = MockGrid::start(MockGridConfig::default()).await?;
    let tmp = tempfile::tempdir()?;
    let tree = make_tree(tmp.path()).await?;
    let control = Arc::new(TransferControlBlock::new());
    control.cancel();
    let recorder = Recorder::default();
    let mut ops = operations(&grid, TransferConfig::default()).await?;
    let summary = ops
        .put(&tree, &grid.home(), Some(&recorder), Some(control))
        .await?;
    assert_eq!(summary.files_transferred, 0);
    assert_eq!(recorder.states(), vec![TransferState::Cancelled]);
    assert_eq!(grid.api_call_count(ApiNumber::DataObjPut), 0);
    Ok(())
}

#[tokio::test]
async fn get_collection_tree() -> anyhow::Result<()> {
    let grid = MockGrid::start(MockGridConfig {
        chunk_size: 4096,
        ..Default::default()
    })
    .await?;
    let home = grid.home();
    let large: Vec<u8> = (0..3 * 1024 * 1024u32).map(|i| (i % 241) as u8).collect();
    grid.add_object(&format!("{home}/data/one.txt"), "one");
    grid.add_object(&format!("{home}/data/deep/two.txt"), "two");
    grid.add_object(&format!("{home}/data/deep/large.bin"), large.clone());
    grid.add_collection(&format!("{home}/data/empty"));
    let tmp = tempfile::tempdir()?;
    let recorder = Recorder::default();
    let mut ops = operations(&grid, parallel_settings()).await?;
    let summary = ops
        .get(&format!("{home}/data"), tmp.path(), Some(&recorder), None)
        .await?;
    assert_eq!(summary.files_transferred, 3);
    let local = tmp.path().join("data");
    assert_eq!(tokio::fs::read(local.join("one.txt")).await?, b"one");
    assert_eq!(tokio::fs::read(local.join("deep").join("large.bin")).await?, large);
    assert!(local.join("empty").is_dir());
    assert_eq!(grid.api_call_count(ApiNumber::OprComplete), 1);
    let events = recorder.events();
    assert!(events.iter().all(|status| status.total_files == 3));
    assert_eq!(events.last().map(|status| status.state), Some(TransferState::OverallCompletion));
    Ok(())
}

#[tokio::test]
async fn get_single_object_into_directory() -> anyhow::Result<()> {
    let grid = MockGrid::start(MockGridConfig::default()).await?;
    let remote = format!("{}/report.csv", grid.home());
    grid.add_object(&remote, "a,b\n1,2\n");
    let tmp = tempfile::tempdir()?;
    let mut ops = operations(&grid, TransferConfig::default()).await?;
    ops.get(&remote, tmp.path(), None, None).await?;
    assert_eq!(tokio::fs::read(tmp.path().join("report.csv")).await?, b"a,b\n1,2\n");
    let renamed = tmp.path().join("copy.csv");
    ops.get(&remote, &renamed, None, None).await?;
    assert_eq!(tokio::fs::read(&renamed).await?, b"a,b\n1,2\n");
    let error = ops
        .get(&format!("{}/missing", grid.home()), tmp.path(), None, None)
        .await
        .unwrap_err();
    assert!(matches!(error, Error::InvalidArgument(_)), "{error:?}");
    Ok(())
}

#[tokio::test]
async fn replicate_collection() -> anyhow::Result<()> {
    let grid = MockGrid::start(MockGridConfig::default()).await?;
    let home = grid.home();
    grid.add_object(&format!("{home}/set/x"), "xx");
    grid.add_object(&format!("{home}/set/nested/y"), "yyy");
    let recorder = Recorder::default();
    let mut ops = operations(&grid, TransferConfig::default()).await?;
    let summary = ops
        .replicate(&format!("{home}/set"), "archiveResc", Some(&recorder), None)
        .await?;
    assert_eq!(summary.files_transferred, 2);
    assert_eq!(summary.bytes_transferred, 5);
    for path in [format!("{home}/set/x"), format!("{home}/set/nested/y")] {
        let resources = grid.object(&path).map(|object| object.resources).unwrap_or_default();
        assert!(resources.contains("archiveResc"), "{path}: {resources:?}");
    }
    let events = recorder.events();
    assert!(events.iter().all(|status| status.target_resource == "archiveResc"));
    assert!(events.iter().all(|status| status.transfer_type == TransferType::Replicate));
    let error = ops
        .replicate(&format!("{home}/set"), "", None, None)
        .await
        .unwrap_err();
    assert!(matches!(error, Error::InvalidArgument(_)));
    Ok(())
}

#[tokio::test]
async fn single_file_failure_with_callback() -> anyhow::Result<()> {
    let remote = "/tempZone/home/rods/locked.bin";
    let grid = MockGrid::start(MockGridConfig {
        reject_paths: vec![remote.to_string()],
        ..Default::default()
    })
    .await?;
    let tmp = tempfile::tempdir()?;
    let local = tmp.path().join("locked.bin");
    write_file(&local, b"secret").await?;
    let recorder = Recorder::default();
    let mut ops = operations(&grid, TransferConfig::default()).await?;
    ops.put(&local, remote, Some(&recorder), None).await?;
    assert_eq!(
        recorder.states(),
        vec![TransferState::Failure, TransferState::OverallCompletion]
    );
    Ok(())
}

#[tokio::test]
async fn move_onto_itself_is_a_no_op() -> anyhow::Result<()> {
    let grid = MockGrid::start(MockGridConfig::default()).await?;
    let path = format!("{}/same", grid.home());
    grid.add_object(&path, "data");
    let mut ops = operations(&grid, TransferConfig::default()).await?;
    let calls = grid.api_calls().len();
    ops.move_object(&path, &path).await?;
    assert_eq!(grid.api_calls().len(), calls);
    // moving into the parent collection resolves to the same path
    ops.move_object(&path, &grid.home()).await?;
    assert_eq!(grid.api_call_count(ApiNumber::DataObjRename), 0);
    assert!(grid.object(&path).is_some());
    Ok(())
}

#[tokio::test]
async fn move_family() -> anyhow::Result<()> {
    let grid = MockGrid::start(MockGridConfig::default()).await?;
    let home = grid.home();
    grid.add_object(&format!("{home}/inbox/file.dat"), "payload");
    grid.add_collection(&format!("{home}/archive"));
    grid.add_collection(&format!("{home}/projects/alpha"));
    let mut ops = operations(&grid, TransferConfig::default()).await?;

    ops.move_object(&format!("{home}/inbox/file.dat"), &format!("{home}/archive"))
        .await?;
    assert!(grid.object(&format!("{home}/archive/file.dat")).is_some());

    ops.move_object(&format!("{home}/archive/file.dat"), &format!("{home}/archive/renamed.dat"))
        .await?;
    assert!(grid.object(&format!("{home}/archive/renamed.dat")).is_some());

    ops.move_collection_under(&format!("{home}/projects/alpha"), &format!("{home}/archive"))
        .await?;
    assert!(grid.has_collection(&format!("{home}/archive/alpha")));
    assert!(!grid.has_collection(&format!("{home}/projects/alpha")));

    let error = ops
        .move_collection_under(&format!("{home}/archive"), &format!("{home}/archive/alpha"))
        .await
        .unwrap_err();
    assert!(matches!(error, Error::InvalidArgument(_)), "{error:?}");

    ops.physical_move(&format!("{home}/archive/renamed.dat"), "fastResc")
        .await?;
    let resources = grid
        .object(&format!("{home}/archive/renamed.dat"))
        .map(|object| object.resources)
        .unwrap_or_default();
    assert_eq!(resources.into_iter().collect::<Vec<_>>(), vec!["fastResc".to_string()]);
    let error = ops
        .physical_move(&format!("{home}/archive"), "fastResc")
        .await
        .unwrap_err();
    assert!(matches!(error, Error::InvalidArgument(_)), "{error:?}");
    Ok(())
}

#[tokio::test]
async fn wrong_password_is_an_authentication_error() -> anyhow::Result<()> {
    let grid = MockGrid::start(MockGridConfig::default()).await?;
    let account = Account::new(
        grid.address().ip().to_string(),
        grid.address().port(),
        "rods",
        "tempZone",
        "wrong",
    )?;
    let error = Session::open(account, &ConnectionConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(error, Error::Authentication(_)), "{error:?}");
    assert!(error.is_recoverable());
    // the server is still serving valid clients
    let ops = operations(&grid, TransferConfig::default()).await?;
    ops.close().await?;
    Ok(())
}

#[tokio::test]
async fn pam_session_transfers() -> anyhow::Result<()> {
    let grid = MockGrid::start(MockGridConfig::default()).await?;
    let session = Session::open(grid.pam_account()?, &ConnectionConfig::default()).await?;
    let mut ops = DataTransferOperations::new(session, TransferConfig::default())?;
    let tmp = tempfile::tempdir()?;
    let local = tmp.path().join("pam.txt");
    write_file(&local, b"via pam").await?;
    ops.put(&local, &grid.home(), None, None).await?;
    assert_eq!(
        grid.object(&format!("{}/pam.txt", grid.home())).map(|object| object.data),
        Some(b"via pam".to_vec())
    );
    Ok(())
}

#[tokio::test]
async fn relative_source_is_resolved_before_filtering() -> anyhow::Result<()> {
    let grid = MockGrid::start(MockGridConfig::default()).await?;
    let home = grid.home();
    let tmp = tempfile::tempdir()?;
    let tree = tokio::fs::canonicalize(make_tree(tmp.path()).await?).await?;
    let original_dir = std::env::current_dir()?;
    std::env::set_current_dir(tmp.path())?;
    let restart = tree.join("a.txt").display().to_string();
    let control = Arc::new(TransferControlBlock::with_settings(Some(restart), -1)?);
    let recorder = Recorder::default();
    let mut ops = operations(&grid, TransferConfig::default()).await?;
    let summary = ops
        .put(Path::new("tree"), &home, Some(&recorder), Some(control))
        .await?;
    assert_eq!(summary.files_skipped, 1);
    assert_eq!(summary.files_transferred, 2);
    assert_eq!(
        recorder.events()[0].source_path,
        tree.join("sub1").join("b.txt").display().to_string()
    );
    assert!(grid.object(&format!("{home}/tree/a.txt")).is_none());
    assert!(grid.object(&format!("{home}/tree/sub2/c.txt")).is_some());

    // "." and ".." take the name of the directory they stand for
    grid.add_collection(&format!("{home}/dot"));
    std::env::set_current_dir(&tree)?;
    ops.put(Path::new("."), &format!("{home}/dot"), None, None)
        .await?;
    grid.add_collection(&format!("{home}/dotdot"));
    std::env::set_current_dir(tree.join("sub1"))?;
    ops.put(Path::new(".."), &format!("{home}/dotdot"), None, None)
        .await?;
    std::env::set_current_dir(original_dir)?;
    assert!(grid.object(&format!("{home}/dot/tree/a.txt")).is_some());
    assert!(grid.object(&format!("{home}/dotdot/tree/sub1/b.txt")).is_some());
    Ok(())
}

#[tokio::test]
async fn paused_transfer_waits_for_resume() -> anyhow::Result<()> {
    let grid = MockGrid::start(MockGridConfig::default()).await?;
    let tmp = tempfile::tempdir()?;
    let tree = make_tree(tmp.path()).await?;
    let settings = TransferConfig {
        pause_poll_interval: Duration::from_millis(10),
        ..Default::default()
    };
    let mut ops = operations(&grid, settings).await?;
    let control = Arc::new(TransferControlBlock::new());
    control.pause();
    let recorder = Recorder::default();
    let resume = async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let puts_while_paused = grid.api_call_count(ApiNumber::DataObjPut);
        let events_while_paused = recorder.events().len();
        control.resume();
        (puts_while_paused, events_while_paused)
    };
    let home = grid.home();
    let (summary, (puts_while_paused, events_while_paused)) = tokio::join!(
        ops.put(&tree, &home, Some(&recorder), Some(control.clone())),
        resume
    );
    assert_eq!(puts_while_paused, 0);
    assert_eq!(events_while_paused, 0);
    assert_eq!(summary?.files_transferred, 3);
    assert_eq!(grid.api_call_count(ApiNumber::DataObjPut), 3);
    assert_eq!(recorder.states().last(), Some(&TransferState::OverallCompletion));
    Ok(())
}

#[tokio::test]
async fn callback_error_aborts_transfer() -> anyhow::Result<()> {
    let grid = MockGrid::start(MockGridConfig::default()).await?;
    let tmp = tempfile::tempdir()?;
    let tree = make_tree(tmp.path()).await?;
    let mut ops = operations(&grid, TransferConfig::default()).await?;
    let refusing = |status: TransferStatus| -> Result<(), Error> {
        match status.state {
            TransferState::Success => Err(Error::transfer("status sink is full")),
            _ => Ok(()),
        }
    };
    let error = ops
        .put(&tree, &grid.home(), Some(&refusing), None)
        .await
        .unwrap_err();
    assert!(error.to_string().contains("status sink is full"), "{error}");
    let root = format!("{}/tree", grid.home());
    assert!(grid.object(&format!("{root}/a.txt")).is_some());
    assert!(grid.object(&format!("{root}/sub1/b.txt")).is_none());
    assert_eq!(grid.api_call_count(ApiNumber::DataObjPut), 1);
    Ok(())
}

#[tokio::test]
async fn broken_parallel_stream_fails_that_file_only() -> anyhow::Result<()> {
    let grid = MockGrid::start(MockGridConfig {
        broken_stream: Some(1),
        ..Default::default()
    })
    .await?;
    let tmp = tempfile::tempdir()?;
    let mixed = tmp.path().join("mixed");
    let size = 2 * 1024 * 1024;
    write_file(&mixed.join("big.bin"), &vec![7u8; size]).await?;
    write_file(&mixed.join("small.txt"), b"small").await?;
    let control = Arc::new(TransferControlBlock::new());
    let recorder = Recorder::default();
    let mut ops = operations(&grid, parallel_settings()).await?;
    let summary = ops
        .put(&mixed, &grid.home(), Some(&recorder), Some(control.clone()))
        .await?;
    assert_eq!(summary.files_failed, 1);
    assert_eq!(summary.files_transferred, 1);
    assert_eq!(
        recorder.states(),
        vec![
            TransferState::Failure,
            TransferState::Success,
            TransferState::OverallCompletion
        ]
    );
    let failure = &recorder.events()[0];
    assert_eq!(failure.total_bytes, size as u64);
    // the stream failure is reported, not the server's refusal to complete the operation
    assert!(
        matches!(failure.error.as_deref(), Some(Error::Connection { .. })),
        "{:?}",
        failure.error
    );
    assert_eq!(control.error_count(), 1);
    assert_eq!(grid.api_call_count(ApiNumber::OprComplete), 1);
    let root = format!("{}/mixed", grid.home());
    assert!(grid.object(&format!("{root}/big.bin")).is_none());
    assert!(grid.object(&format!("{root}/small.txt")).is_some());
    Ok(())
}

#[tokio::test]
async fn broken_parallel_stream_fails_get() -> anyhow::Result<()> {
    let grid = MockGrid::start(MockGridConfig {
        broken_stream: Some(0),
        ..Default::default()
    })
    .await?;
    let remote = format!("{}/big.bin", grid.home());
    grid.add_object(&remote, vec![3u8; 2 * 1024 * 1024]);
    let tmp = tempfile::tempdir()?;
    let mut ops = operations(&grid, parallel_settings()).await?;
    let error = ops
        .get(&remote, tmp.path(), None, None)
        .await
        .unwrap_err();
    assert!(
        matches!(error, Error::Transfer { .. } | Error::Connection { .. }),
        "{error:?}"
    );
    assert_eq!(grid.api_call_count(ApiNumber::OprComplete), 1);
    // the control connection survives a failed portal
    ops.get(&remote, tmp.path(), None, None)
        .await
        .unwrap_err();
    assert_eq!(grid.api_call_count(ApiNumber::OprComplete), 2);
    Ok(())
}
