use notes_kernel::models::{NoticeKind, SqlRequest};
use notes_kernel::{
    BroadcastNotifier, FetchError, FetchHints, IndexHandle, IndexedFile, Kernel, KernelDeps, KernelSettings,
    RemoteFetcher,
};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct SlowRepo {
    data_path: PathBuf,
    calls: Mutex<Vec<PathBuf>>,
    opens: AtomicUsize,
}

impl SlowRepo {
    fn delay_for(path: &Path) -> Duration {
        let name = path.to_string_lossy();
        if name.contains("slow") {
            Duration::from_millis(800)
        } else {
            Duration::from_millis(50)
        }
    }

    fn calls_for(&self, suffix: &str) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|path| path.ends_with(suffix))
            .count()
    }
}

impl RemoteFetcher for SlowRepo {
    fn data_path(&self) -> &Path {
        &self.data_path
    }

    fn fetch_into(&self, absolute_path: &Path, _hints: &FetchHints) -> Result<(), FetchError> {
        self.calls.lock().expect("calls lock").push(absolute_path.to_path_buf());
        std::thread::sleep(Self::delay_for(absolute_path));
        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent).map_err(anyhow::Error::from)?;
        }
        fs::write(absolute_path, b"asset").map_err(anyhow::Error::from)?;
        Ok(())
    }

    fn latest(&self) -> anyhow::Result<IndexHandle> {
        Ok(IndexHandle { id: "latest".to_string() })
    }

    fn list_files(&self, _index: &IndexHandle) -> anyhow::Result<Vec<IndexedFile>> {
        Ok(Vec::new())
    }
}

fn build_kernel(root: &Path, timeout_ms: u64) -> (Arc<Kernel>, Arc<SlowRepo>, BroadcastNotifier) {
    let repo = Arc::new(SlowRepo {
        data_path: root.join("data"),
        calls: Mutex::new(Vec::new()),
        opens: AtomicUsize::new(0),
    });
    let notifier = BroadcastNotifier::new(64);
    let provider_repo = Arc::clone(&repo);
    let deps = KernelDeps {
        repo_provider: Arc::new(move || {
            provider_repo.opens.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(Arc::clone(&provider_repo) as Arc<dyn RemoteFetcher>)
        }),
        notifier: Arc::new(notifier.clone()),
    };
    let settings = KernelSettings {
        repo_key: Some("repo-key".to_string()),
        lazy_load_timeout_ms: timeout_ms,
        gate_poll_interval_ms: 10,
        gate_availability_wait_ms: 1_000,
        ..KernelSettings::default()
    };
    let kernel = Kernel::new(root.to_path_buf(), settings, deps).expect("kernel");
    (kernel, repo, notifier)
}

fn sql(stmt: &str) -> SqlRequest {
    SqlRequest {
        stmt: stmt.to_string(),
        args: Vec::new(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_waiters_share_one_remote_fetch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (kernel, repo, notifier) = build_kernel(dir.path(), 5_000);
    let mut notices = notifier.subscribe();

    let mut handles = Vec::new();
    for index in 0..8 {
        let kernel = Arc::clone(&kernel);
        let raw = if index % 2 == 0 { "assets/shared%20file.png" } else { "/assets/shared+file.png" };
        handles.push(tokio::spawn(async move { kernel.assets().load_asset_on_demand(raw).await }));
    }
    for handle in handles {
        handle.await.expect("join").expect("load");
    }

    assert_eq!(repo.calls_for("assets/shared file.png"), 1);
    assert_eq!(repo.opens.load(Ordering::SeqCst), 1);
    assert!(kernel.assets().is_asset_cached("assets/shared file.png"));

    let first = notices.recv().await.expect("push notice");
    assert_eq!(first.kind, NoticeKind::Push);
    assert!(first.message.contains("assets/shared file.png"));
    let second = notices.recv().await.expect("update notice");
    assert_eq!(second.kind, NoticeKind::Update);
    assert_eq!(second.id, first.id);

    kernel.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_key_does_not_delay_other_keys() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (kernel, _repo, _notifier) = build_kernel(dir.path(), 5_000);

    let slow = {
        let loader = kernel.loader().clone();
        tokio::spawn(async move { loader.try_fetch("assets/slow.bin").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    assert!(kernel.loader().try_fetch("assets/fast.bin").await);
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(!slow.is_finished());

    assert!(slow.await.expect("join"));
    kernel.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waiter_gives_up_within_timeout() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (kernel, _repo, _notifier) = build_kernel(dir.path(), 150);

    let started = Instant::now();
    assert!(!kernel.loader().try_fetch("assets/slow-video.mp4").await);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(150));
    assert!(elapsed < Duration::from_millis(600));

    let stats = kernel.lazy_load_stats();
    assert_eq!(stats.loading_count, 1);
    assert!(stats.loading_files.contains_key("assets/slow-video.mp4"));

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(kernel.lazy_load_stats().completed_count, 1);
    kernel.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn statements_issued_during_sync_replay_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (kernel, _repo, _notifier) = build_kernel(dir.path(), 5_000);
    let db = kernel.extra_db().clone();
    assert!(db.exec(sql("CREATE TABLE log (seq INTEGER)")).await.is_success());

    let writers = {
        let db = db.clone();
        async move {
            let mut handles = Vec::new();
            for seq in 1..=3_usize {
                let writer = db.clone();
                handles.push(tokio::spawn(async move {
                    writer
                        .exec(SqlRequest {
                            stmt: "INSERT INTO log (seq) VALUES (?1)".to_string(),
                            args: vec![json!(seq)],
                        })
                        .await
                }));
                while db.snapshot().queue_len < seq {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
            handles
        }
    };

    let handles = kernel
        .run_sync(async {
            let handles = writers.await;
            assert!(dir.path().join("storage/extra.db").exists());
            Ok(handles)
        })
        .await
        .expect("sync");

    for handle in handles {
        let response = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("replayed in time")
            .expect("join");
        assert!(response.is_success(), "{}", response.msg);
    }

    let rows = db.query(sql("SELECT seq FROM log ORDER BY rowid")).await;
    assert_eq!(rows.data, json!([{ "seq": 1 }, { "seq": 2 }, { "seq": 3 }]));
    kernel.close().await.expect("close");
}

#[tokio::test]
async fn status_board_round_trip_through_kernel() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (kernel, _repo, _notifier) = build_kernel(dir.path(), 5_000);

    kernel.status().post(&json!({ "indexing": "42%" })).await.expect("post");
    let found = kernel.status().get(&["indexing".to_string()]).await;
    assert_eq!(found["indexing"].value, "42%");
    kernel.close().await.expect("close");
}
