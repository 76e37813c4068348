//! End-to-end upload → store → download runs against `MemoryStore`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::{Rng, RngCore};
use relaysync_protocol::{TransferDescriptor, TransferKind};
use relaysync_transfer::{
    AdaptiveTransferController, AssertionRecord, ControllerConfig, DestinationPlan,
    DownloadEngine, DownloadTarget, MemoryStore, SessionKey, TransferConfig, TransferDeps,
    TransferError, TransferOutcome, UploadEngine, UploadSummary, build_archive, compute_delta,
};

const KEY: [u8; 32] = [0x42; 32];

struct Harness {
    dir: tempfile::TempDir,
    store: Arc<MemoryStore>,
}

impl Harness {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            store: Arc::new(MemoryStore::new()),
        }
    }

    fn deps(&self) -> TransferDeps {
        TransferDeps::in_memory(Arc::clone(&self.store), SessionKey::from_bytes(KEY))
    }

    fn config(&self, chunk: usize, parallelism: usize) -> TransferConfig {
        TransferConfig {
            controller: ControllerConfig::fixed(chunk, parallelism),
            temp_dir: Some(self.dir.path().join("tmp")),
            supervisor_tick_ms: 5,
            ..TransferConfig::default()
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn write(&self, name: &str, data: &[u8]) -> PathBuf {
        let path = self.path(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    async fn upload(
        &self,
        source: &Path,
        descriptor: TransferDescriptor,
        chunk: usize,
        parallelism: usize,
    ) -> Result<UploadSummary, TransferError> {
        UploadEngine::new(source, descriptor, self.deps(), self.config(chunk, parallelism))
            .run()
            .await
    }

    /// Announces parts in `order` while the download runs.
    async fn download(
        &self,
        summary: &UploadSummary,
        plan: DestinationPlan,
        order: Vec<u32>,
    ) -> Result<relaysync_transfer::DownloadReport, TransferError> {
        let target = DownloadTarget::new(summary.descriptor.clone(), plan).unwrap();
        let engine = Arc::new(DownloadEngine::new(target, self.deps(), self.config(1024, 1)));
        let run = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.run().await })
        };
        for part in order {
            engine.on_part_ready(part);
            tokio::task::yield_now().await;
        }
        engine.on_file_ready_to_finalize(summary.total_parts);
        run.await.unwrap()
    }
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

fn error_reports(store: &MemoryStore) -> Vec<(String, String)> {
    store
        .assertions()
        .into_iter()
        .filter_map(|a| match a {
            AssertionRecord::Error {
                category, message, ..
            } => Some((category, message)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn round_trip_across_chunk_sizes() {
    let cases: &[(usize, &[usize])] = &[
        (1, &[0, 1, 257]),
        (63, &[0, 62, 63, 64, 4_000]),
        (64, &[0, 64, 128, 4_001]),
        (65, &[1, 65, 130, 4_002]),
        (1024, &[0, 1023, 1024, 1025, 100_000]),
        (1 << 20, &[0, 1, (1 << 20) + 7, 10 * 1_000_000]),
    ];

    for &(chunk, lengths) in cases {
        for &len in lengths {
            let h = Harness::new();
            let data = random_bytes(len);
            let source = h.write("src.bin", &data);
            let id = format!("rt-{chunk}-{len}");
            let d = TransferDescriptor::new(id.as_str(), "s", "c", TransferKind::FullCopy);

            let summary = h.upload(&source, d, chunk, 4).await.unwrap();
            let expected_parts = if len == 0 { 1 } else { len.div_ceil(chunk) } as u32;
            assert_eq!(summary.total_parts, expected_parts, "chunk {chunk} len {len}");
            assert_eq!(summary.bytes_acknowledged, len as u64);
            assert_eq!(h.store.parts(&id), (1..=expected_parts).collect::<Vec<_>>());

            let dest = h.path("out.bin");
            let report = h
                .download(
                    &summary,
                    DestinationPlan::Copy(vec![dest.clone()]),
                    (1..=summary.total_parts).collect(),
                )
                .await
                .unwrap();
            assert_eq!(report.bytes_merged, len as u64);
            assert_eq!(std::fs::read(&dest).unwrap(), data, "chunk {chunk} len {len}");
        }
    }
}

#[tokio::test]
async fn any_announcement_order_merges_identically() {
    let h = Harness::new();
    let data = random_bytes(9_000);
    let source = h.write("src.bin", &data);
    let d = TransferDescriptor::new("perm", "s", "c", TransferKind::FullCopy);
    let summary = h.upload(&source, d, 1000, 3).await.unwrap();
    assert_eq!(summary.total_parts, 9);

    let mut rng = rand::thread_rng();
    for round in 0..8 {
        let mut order: Vec<u32> = (1..=summary.total_parts).collect();
        order.shuffle(&mut rng);
        let dest = h.path(&format!("perm-{round}.bin"));
        h.download(&summary, DestinationPlan::Copy(vec![dest.clone()]), order)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    let merged: Vec<u32> = h
        .store
        .assertions()
        .into_iter()
        .filter_map(|a| match a {
            AssertionRecord::PartDownloaded { part, .. } => Some(part),
            _ => None,
        })
        .take(9)
        .collect();
    assert_eq!(merged, (1..=9).collect::<Vec<_>>());
}

#[tokio::test]
async fn total_announced_first_still_completes() {
    let h = Harness::new();
    let data = random_bytes(2_500);
    let source = h.write("src.bin", &data);
    let d = TransferDescriptor::new("total-first", "s", "c", TransferKind::FullCopy);
    let summary = h.upload(&source, d, 1000, 1).await.unwrap();

    let dest = h.path("out.bin");
    let target =
        DownloadTarget::new(summary.descriptor.clone(), DestinationPlan::Copy(vec![dest.clone()]))
            .unwrap();
    let engine = DownloadEngine::new(target, h.deps(), h.config(1024, 1));
    assert!(engine.on_file_ready_to_finalize(3));
    assert!(!engine.on_file_ready_to_finalize(4));
    assert!(!engine.on_part_ready(4));
    for part in [3, 1, 2] {
        assert!(engine.on_part_ready(part));
    }
    engine.run().await.unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), data);
}

#[tokio::test]
async fn corrupted_part_fails_fast() {
    let h = Harness::new();
    let data = random_bytes(6_000);
    let source = h.write("src.bin", &data);
    let d = TransferDescriptor::new("corrupt", "s", "c", TransferKind::FullCopy);
    let summary = h.upload(&source, d, 1000, 2).await.unwrap();
    assert!(h.store.corrupt("corrupt", 2));

    let dest = h.path("out.bin");
    let err = h
        .download(
            &summary,
            DestinationPlan::Copy(vec![dest.clone()]),
            (1..=summary.total_parts).collect(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Crypto { part: 2 }));
    assert!(!dest.exists());

    let merged: Vec<u32> = h
        .store
        .assertions()
        .into_iter()
        .filter_map(|a| match a {
            AssertionRecord::PartDownloaded { part, .. } => Some(part),
            _ => None,
        })
        .collect();
    assert_eq!(merged, vec![1]);

    let reports = error_reports(&h.store);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, "crypto");
}

#[tokio::test]
async fn wrong_key_never_writes_destination() {
    let h = Harness::new();
    let source = h.write("src.bin", b"secret payload");
    let d = TransferDescriptor::new("wrong-key", "s", "c", TransferKind::FullCopy);
    let summary = h.upload(&source, d, 64, 1).await.unwrap();

    let dest = h.path("out.bin");
    let target =
        DownloadTarget::new(summary.descriptor.clone(), DestinationPlan::Copy(vec![dest.clone()]))
            .unwrap();
    let deps = TransferDeps::in_memory(Arc::clone(&h.store), SessionKey::from_bytes([1; 32]));
    let engine = DownloadEngine::new(target, deps, h.config(64, 1));
    engine.on_part_ready(1);
    engine.on_file_ready_to_finalize(1);
    assert!(matches!(
        engine.run().await,
        Err(TransferError::Crypto { part: 1 })
    ));
    assert!(!dest.exists());
}

#[tokio::test]
async fn rejected_fetch_fails_download() {
    let h = Harness::new();
    let source = h.write("src.bin", &random_bytes(3_000));
    let d = TransferDescriptor::new("get-404", "s", "c", TransferKind::FullCopy);
    let summary = h.upload(&source, d, 1000, 1).await.unwrap();
    h.store.fail_get(3, 404);

    let err = h
        .download(
            &summary,
            DestinationPlan::Copy(vec![h.path("out.bin")]),
            vec![1, 2, 3],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::StorageRejected { status: 404 }));
    assert_eq!(error_reports(&h.store)[0].0, "storage");
}

#[tokio::test]
async fn failed_upload_cleans_up_and_restarts_with_new_iv() {
    let h = Harness::new();
    let data = random_bytes(10_000);
    let source = h.write("src.bin", &data);
    let d = TransferDescriptor::new("retry", "s", "c", TransferKind::FullCopy);
    h.store.fail_put(4, 403);

    let err = h.upload(&source, d.clone(), 1000, 2).await.unwrap_err();
    assert!(matches!(err, TransferError::StorageRejected { status: 403 }));
    assert!(h.store.parts("retry").is_empty());
    assert_eq!(error_reports(&h.store).len(), 1);
    assert!(!h.store.assertions().iter().any(|a| matches!(a, AssertionRecord::UploadFinished { .. })));

    // A new attempt needs a new descriptor (fresh IV).
    let h2 = Harness::new();
    let restarted = d.restarted();
    assert_ne!(restarted.iv, d.iv);
    let source = h2.write("src.bin", &data);
    let summary = h2.upload(&source, restarted, 1000, 2).await.unwrap();
    assert_eq!(summary.total_parts, 10);
}

#[tokio::test]
async fn assertion_rejected_mid_upload_aborts_and_cleans_up() {
    let h = Harness::new();
    h.store.set_put_delay(Duration::from_millis(20));
    let source = h.write("src.bin", &random_bytes(10_000));
    let d = TransferDescriptor::new("reject-up", "s", "c", TransferKind::FullCopy);

    let store = Arc::clone(&h.store);
    let toggle = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        store.reject_assertions(true);
    });
    let err = h.upload(&source, d, 1000, 2).await.unwrap_err();
    toggle.await.unwrap();

    assert!(matches!(err, TransferError::Assertion(_)));
    assert!(h.store.parts("reject-up").is_empty());
    assert!(!h.store.assertions().iter().any(|a| matches!(a, AssertionRecord::UploadFinished { .. })));
    assert_eq!(error_reports(&h.store), vec![("assertion".to_string(), err.to_string())]);
}

#[tokio::test]
async fn assertion_rejected_mid_download_leaves_destination_untouched() {
    let h = Harness::new();
    let source = h.write("src.bin", &random_bytes(5_000));
    let d = TransferDescriptor::new("reject-down", "s", "c", TransferKind::FullCopy);
    let summary = h.upload(&source, d, 1000, 2).await.unwrap();
    h.store.reject_assertions(true);

    let dest = h.write("existing.bin", b"previous version");
    let err = h
        .download(
            &summary,
            DestinationPlan::Copy(vec![dest.clone()]),
            (1..=summary.total_parts).collect(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::Assertion(_)));
    assert_eq!(std::fs::read(&dest).unwrap(), b"previous version");
    assert!(!h.store.assertions().iter().any(|a| matches!(a, AssertionRecord::DownloadFinished { .. })));
    assert_eq!(error_reports(&h.store)[0].0, "assertion");
    let leftovers = std::fs::read_dir(h.path("tmp")).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn three_mib_at_fixed_chunk_and_parallelism() {
    const MIB: usize = 1 << 20;
    let h = Harness::new();
    h.store.set_put_delay(Duration::from_millis(30));
    let data = random_bytes(3 * MIB);
    let source = h.write("src.bin", &data);
    let d = TransferDescriptor::new("three-mib", "s", "c", TransferKind::FullCopy);

    let engine = UploadEngine::new(&source, d, h.deps(), h.config(MIB, 2));
    let mut progress = engine.subscribe();
    let summary = engine.run().await.unwrap();

    assert_eq!(summary.total_parts, 3);
    assert_eq!(summary.bytes_acknowledged, 3_145_728);
    assert!(h.store.max_in_flight() <= 2);
    assert!(h.store.max_in_flight() >= 1);
    assert_eq!(h.store.parts("three-mib"), vec![1, 2, 3]);

    let snapshot = engine.progress();
    assert_eq!(snapshot.slices_created, 3);
    assert_eq!(snapshot.slices_completed, 3);
    assert_eq!(snapshot.chunk_size, MIB);
    assert_eq!(snapshot.parallelism, 2);

    let last = *progress.borrow_and_update();
    assert_eq!(last.bytes_transferred, 3_145_728);
    assert!(!last.is_error);
}

#[tokio::test]
async fn second_destination_failing_keeps_the_first() {
    let h = Harness::new();
    let data = random_bytes(4_096);
    let source = h.write("src.bin", &data);
    let d = TransferDescriptor::new("two-dest", "s", "c", TransferKind::FullCopy);
    let summary = h.upload(&source, d, 1024, 2).await.unwrap();

    let good = h.path("good.bin");
    let blocker = h.write("blocker", b"not a directory");
    let bad = blocker.join("bad.bin");
    let err = h
        .download(
            &summary,
            DestinationPlan::Copy(vec![good.clone(), bad.clone()]),
            (1..=summary.total_parts).collect(),
        )
        .await
        .unwrap_err();

    match err {
        TransferError::Finalization { finalized, failed } => {
            assert_eq!(finalized, vec![good.clone()]);
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].path, bad);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(std::fs::read(&good).unwrap(), data);
    assert!(!h.store.assertions().iter().any(|a| matches!(a, AssertionRecord::DownloadFinished { .. })));
    assert_eq!(error_reports(&h.store)[0].0, "finalization");
}

#[tokio::test]
async fn delta_transfer_updates_every_baseline() {
    let h = Harness::new();
    let baseline = random_bytes(50_000);
    let mut updated = baseline.clone();
    updated[10_000..10_050].copy_from_slice(&[7u8; 50]);
    updated.extend_from_slice(b"appended");

    let patch = compute_delta(&baseline, &updated, 512).encode();
    assert!(patch.len() < updated.len());
    let source = h.write("patch.rsdp", &patch);
    let d = TransferDescriptor::new("delta", "s", "c", TransferKind::DeltaPatch);
    let summary = h.upload(&source, d, 700, 2).await.unwrap();

    let a = h.write("a.bin", &baseline);
    let b = h.write("b.bin", &baseline);
    let report = h
        .download(
            &summary,
            DestinationPlan::Delta(vec![a.clone(), b.clone()]),
            (1..=summary.total_parts).rev().collect(),
        )
        .await
        .unwrap();
    assert_eq!(report.finalized, vec![a.clone(), b.clone()]);
    assert_eq!(std::fs::read(&a).unwrap(), updated);
    assert_eq!(std::fs::read(&b).unwrap(), updated);
}

#[tokio::test]
async fn archive_transfer_extracts_mapped_entries() {
    let h = Harness::new();
    let readme = h.write("readme.txt", b"hello archive");
    let payload = random_bytes(30_000);
    let blob = h.write("blob.bin", &payload);
    let entries = BTreeMap::from([
        ("docs/readme.txt".to_string(), readme),
        ("data/blob.bin".to_string(), blob),
    ]);
    let zip_path = h.path("bundle.zip");
    build_archive(&entries, &zip_path).unwrap();

    let d = TransferDescriptor::new("archive", "s", "c", TransferKind::Archive);
    let summary = h.upload(&zip_path, d, 4096, 3).await.unwrap();

    let out = h.path("out");
    let plan = DestinationPlan::Archive(BTreeMap::from([
        (
            "docs/readme.txt".to_string(),
            vec![out.join("a/readme.txt"), out.join("b/readme.txt")],
        ),
        ("data/blob.bin".to_string(), vec![out.join("blob.bin")]),
    ]));
    let report = h
        .download(&summary, plan, (1..=summary.total_parts).collect())
        .await
        .unwrap();

    assert_eq!(report.finalized.len(), 3);
    assert_eq!(std::fs::read(out.join("a/readme.txt")).unwrap(), b"hello archive");
    assert_eq!(std::fs::read(out.join("b/readme.txt")).unwrap(), b"hello archive");
    assert_eq!(std::fs::read(out.join("blob.bin")).unwrap(), payload);
}

#[test]
fn controller_stays_in_bounds_under_grants() {
    let config = ControllerConfig::default();
    let controller = AdaptiveTransferController::new(config.clone());
    let mut rng = rand::thread_rng();
    let err = TransferError::Timeout;

    for i in 0..2_000u32 {
        if i % 97 == 0 {
            controller.set_granted_slots(rng.gen_range(0..=10));
        }
        let success = rng.gen_bool(0.7);
        controller.record_result(&TransferOutcome {
            elapsed: Duration::from_millis(rng.gen_range(1..5_000)),
            success,
            part_number: i + 1,
            status: Some(if success { 201 } else { 503 }),
            error: (!success).then_some(&err),
            actual_bytes: success.then(|| rng.gen_range(0..(64 << 20))),
        });

        let chunk = controller.next_chunk_size_bytes();
        assert!((config.min_chunk_size..=config.max_chunk_size).contains(&chunk));
        let par = controller.parallelism();
        assert!((config.min_parallelism..=config.max_parallelism).contains(&par));
        if let Some(granted) = controller.granted_slots() {
            assert!(controller.desired_parallelism() <= granted);
        }
    }
}
