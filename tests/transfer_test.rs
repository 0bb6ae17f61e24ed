//! End-to-end transfers between nodes on a loopback network
//!
//! Each test runs its seeders and a leecher in the same process, joined to a
//! freshly generated network.

use lishnet_core::{
    Config, ImportOptions, LishNode, Manifest, ManifestSource, NetworkDefinition, NodeError,
    TransferPhase, TransferStatus,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::timeout;
use tracing_subscriber::{fmt, EnvFilter};

const CHUNK_SIZE: u64 = 4096;

fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

fn config(dir: &Path, name: &str) -> Config {
    Config {
        data_dir: dir.join(name),
        listen_address: "/ip4/127.0.0.1/tcp/0".to_string(),
        hash_workers: 2,
        chunk_retries: 1,
        max_parallel_chunks: 4,
        request_timeout_secs: 10,
        dial_timeout_secs: 5,
        peer_discovery_attempts: 5,
        peer_retry_interval_ms: 200,
        ..Config::default()
    }
}

/// Bytes that differ in every chunk
fn pattern(len: usize, seed: u32) -> Vec<u8> {
    (0..len as u32)
        .map(|i| (i.wrapping_add(seed).wrapping_mul(2_654_435_761) >> 24) as u8)
        .collect()
}

fn sample_tree(root: &Path) -> PathBuf {
    let data = root.join("dataset");
    std::fs::create_dir_all(data.join("nested/deeper")).unwrap();
    std::fs::write(data.join("big.bin"), pattern(10 * CHUNK_SIZE as usize + 123, 1)).unwrap();
    std::fs::write(data.join("nested/small.txt"), b"hello lish").unwrap();
    std::fs::write(data.join("nested/deeper/copy.bin"), pattern(3 * CHUNK_SIZE as usize, 1))
        .unwrap();
    std::fs::write(data.join("empty"), b"").unwrap();
    data
}

async fn join(nodes: &[&LishNode], definition: &NetworkDefinition) {
    for node in nodes {
        node.networks().import(definition.clone()).await.unwrap();
        node.networks()
            .set_enabled(&definition.network_id, true)
            .await
            .unwrap();
    }
}

async fn connect(from: &LishNode, to: &LishNode, network_id: &str) {
    let addresses = to.networks().addresses(network_id).await.unwrap();
    assert!(!addresses.is_empty());
    from.networks()
        .connect(network_id, &addresses[0])
        .await
        .unwrap();
}

async fn wait(handle: &lishnet_core::DownloadHandle) -> TransferStatus {
    timeout(Duration::from_secs(60), handle.wait())
        .await
        .expect("transfer did not finish")
}

fn assert_same_file(a: &Path, b: &Path) {
    assert_eq!(
        std::fs::read(a).unwrap(),
        std::fs::read(b).unwrap(),
        "{} differs from {}",
        a.display(),
        b.display()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_full_transfer() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let data = sample_tree(dir.path());

    let seeder = LishNode::open(&config(dir.path(), "seeder")).await.unwrap();
    let leecher = LishNode::open(&config(dir.path(), "leecher")).await.unwrap();
    let definition = NetworkDefinition::generate("loopback", None, vec![]);
    join(&[&seeder, &leecher], &definition).await;
    connect(&leecher, &seeder, &definition.network_id).await;

    let manifest = seeder
        .import_local(
            &data,
            ImportOptions {
                chunk_size: CHUNK_SIZE,
                ..ImportOptions::default()
            },
        )
        .await
        .unwrap();

    let mut events = leecher.subscribe();
    let handle = leecher
        .download(
            &definition.network_id,
            ManifestSource::Manifest(manifest.clone()),
        )
        .await
        .unwrap();
    let status = wait(&handle).await;

    assert_eq!(status.phase, TransferPhase::Complete, "{:?}", status.error);
    assert_eq!(status.have_chunks, manifest.chunk_count() as u64);
    for file in &manifest.files {
        assert_same_file(&data.join(&file.path), &status.directory.join(&file.path));
    }

    let detail = leecher.dataset(&manifest.id).await.unwrap();
    assert!(detail.summary.complete);

    // Identical chunks are fetched once
    let unique = manifest.digests().len() as u64;
    assert_eq!(leecher.metrics().chunks_fetched(), unique);
    assert!(seeder.metrics().chunks_served() >= unique);

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.dataset_id(), manifest.id);
        names.push(event.name());
    }
    assert!(names.contains(&"download:progress"));
    assert_eq!(names.last(), Some(&"download:complete"));

    leecher.shutdown().await;
    seeder.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transfer_resumes_from_partial_copy() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("single");
    std::fs::create_dir_all(&data).unwrap();
    std::fs::write(data.join("blob"), pattern(12 * CHUNK_SIZE as usize, 7)).unwrap();

    let seeder = LishNode::open(&config(dir.path(), "seeder")).await.unwrap();
    let leecher = LishNode::open(&config(dir.path(), "leecher")).await.unwrap();
    let definition = NetworkDefinition::generate("loopback", None, vec![]);
    join(&[&seeder, &leecher], &definition).await;
    connect(&leecher, &seeder, &definition.network_id).await;

    let manifest = seeder
        .import_local(
            &data,
            ImportOptions {
                chunk_size: CHUNK_SIZE,
                ..ImportOptions::default()
            },
        )
        .await
        .unwrap();
    let total = manifest.chunk_count();
    assert_eq!(total, 12);

    // The leecher already holds the first five chunks from an earlier run
    let partial = dir.path().join("partial");
    std::fs::create_dir_all(&partial).unwrap();
    let mut bytes = std::fs::read(data.join("blob")).unwrap();
    for b in bytes[5 * CHUNK_SIZE as usize..].iter_mut() {
        *b = 0;
    }
    std::fs::write(partial.join("blob"), &bytes).unwrap();
    let held: HashSet<_> = manifest.files[0].chunk_digests[..5]
        .iter()
        .cloned()
        .collect();
    leecher
        .store()
        .upsert(
            &manifest,
            Some(partial.to_string_lossy().into_owned()),
            Some(&held),
        )
        .await
        .unwrap();

    let handle = leecher
        .download(
            &definition.network_id,
            ManifestSource::Manifest(manifest.clone()),
        )
        .await
        .unwrap();
    let status = wait(&handle).await;

    assert_eq!(status.phase, TransferPhase::Complete, "{:?}", status.error);
    assert_eq!(status.directory, partial);
    assert_eq!(leecher.metrics().chunks_fetched(), (total - 5) as u64);
    assert_same_file(&data.join("blob"), &partial.join("blob"));

    leecher.shutdown().await;
    seeder.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_corrupt_chunks_are_rejected() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("victim");
    std::fs::create_dir_all(&data).unwrap();
    std::fs::write(data.join("file"), pattern(2 * CHUNK_SIZE as usize, 3)).unwrap();

    let seeder = LishNode::open(&config(dir.path(), "seeder")).await.unwrap();
    let leecher = LishNode::open(&config(dir.path(), "leecher")).await.unwrap();
    let definition = NetworkDefinition::generate("loopback", None, vec![]);
    join(&[&seeder, &leecher], &definition).await;
    connect(&leecher, &seeder, &definition.network_id).await;

    let manifest = seeder
        .import_local(
            &data,
            ImportOptions {
                chunk_size: CHUNK_SIZE,
                ..ImportOptions::default()
            },
        )
        .await
        .unwrap();

    // Same size, different bytes: the seeder now serves chunks that do not
    // match the manifest
    std::fs::write(data.join("file"), pattern(2 * CHUNK_SIZE as usize, 99)).unwrap();

    let handle = leecher
        .download(
            &definition.network_id,
            ManifestSource::Manifest(manifest.clone()),
        )
        .await
        .unwrap();
    let status = wait(&handle).await;

    assert_eq!(status.phase, TransferPhase::Failed);
    assert!(status.error.is_some());
    assert_eq!(status.have_chunks, 0);
    assert!(leecher.metrics().verification_failures() > 0);
    assert_eq!(leecher.metrics().chunks_fetched(), 0);

    // The pre-sized target holds none of the rejected bytes
    let written = std::fs::read(status.directory.join("file")).unwrap();
    assert_eq!(written, vec![0u8; 2 * CHUNK_SIZE as usize]);

    let detail = leecher.dataset(&manifest.id).await.unwrap();
    assert!(!detail.summary.complete);
    assert_eq!(detail.summary.have_count, 0);

    leecher.shutdown().await;
    seeder.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_good_seeder_covers_for_corrupt_one() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let original = pattern(8 * CHUNK_SIZE as usize, 5);

    let first = LishNode::open(&config(dir.path(), "first")).await.unwrap();
    let second = LishNode::open(&config(dir.path(), "second")).await.unwrap();
    let leecher = LishNode::open(&config(dir.path(), "leecher")).await.unwrap();
    let definition = NetworkDefinition::generate("loopback", None, vec![]);
    join(&[&first, &second, &leecher], &definition).await;
    connect(&leecher, &first, &definition.network_id).await;
    connect(&leecher, &second, &definition.network_id).await;

    let mut manifest = None;
    for (node, name) in [(&first, "copy-first"), (&second, "copy-second")] {
        let data = dir.path().join(name);
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("file"), &original).unwrap();
        let imported = node
            .import_local(
                &data,
                ImportOptions {
                    chunk_size: CHUNK_SIZE,
                    id: Some("shared-dataset".to_string()),
                    ..ImportOptions::default()
                },
            )
            .await
            .unwrap();
        manifest.get_or_insert(imported);
    }
    let manifest = manifest.unwrap();

    // Peers are tried in peer id order, so corrupt the one asked first
    let bad = if first.networks().local_peer_id() < second.networks().local_peer_id() {
        "copy-first"
    } else {
        "copy-second"
    };
    std::fs::write(
        dir.path().join(bad).join("file"),
        pattern(8 * CHUNK_SIZE as usize, 77),
    )
    .unwrap();

    let handle = leecher
        .download(
            &definition.network_id,
            ManifestSource::Manifest(manifest.clone()),
        )
        .await
        .unwrap();
    let status = wait(&handle).await;

    assert_eq!(status.phase, TransferPhase::Complete, "{:?}", status.error);
    assert_eq!(std::fs::read(status.directory.join("file")).unwrap(), original);
    assert!(leecher.metrics().verification_failures() >= manifest.chunk_count() as u64);
    assert_eq!(
        leecher.metrics().chunks_fetched(),
        manifest.digests().len() as u64
    );

    leecher.shutdown().await;
    second.shutdown().await;
    first.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remove_dataset_stops_download() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("slow");
    std::fs::create_dir_all(&data).unwrap();
    std::fs::write(data.join("file"), pattern(4 * CHUNK_SIZE as usize, 11)).unwrap();

    let seeder = LishNode::open(&config(dir.path(), "seeder")).await.unwrap();
    // Enough retries that the download cannot finish on its own
    let leecher = LishNode::open(&Config {
        chunk_retries: 1000,
        ..config(dir.path(), "leecher")
    })
    .await
    .unwrap();
    let definition = NetworkDefinition::generate("loopback", None, vec![]);
    join(&[&seeder, &leecher], &definition).await;
    connect(&leecher, &seeder, &definition.network_id).await;

    let manifest = seeder
        .import_local(
            &data,
            ImportOptions {
                chunk_size: CHUNK_SIZE,
                ..ImportOptions::default()
            },
        )
        .await
        .unwrap();
    std::fs::write(data.join("file"), pattern(4 * CHUNK_SIZE as usize, 12)).unwrap();

    let handle = leecher
        .download(
            &definition.network_id,
            ManifestSource::Manifest(manifest.clone()),
        )
        .await
        .unwrap();
    timeout(Duration::from_secs(30), async {
        while leecher.metrics().verification_failures() == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("download never started fetching");
    assert!(!handle.status().phase.is_terminal());

    assert!(leecher.remove_dataset(&manifest.id).await.unwrap());
    let status = wait(&handle).await;

    assert_eq!(status.phase, TransferPhase::Failed);
    assert!(status.error.is_some());
    assert_eq!(leecher.metrics().chunks_fetched(), 0);
    assert!(matches!(
        leecher.dataset(&manifest.id).await,
        Err(NodeError::DatasetNotFound(_))
    ));
    assert!(leecher.transfers().await.is_empty());

    leecher.shutdown().await;
    seeder.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_different_keys_are_isolated() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    let a = LishNode::open(&config(dir.path(), "a")).await.unwrap();
    let b = LishNode::open(&config(dir.path(), "b")).await.unwrap();

    // Same network id, independently generated keys
    let first = NetworkDefinition::generate("shared", None, vec![]);
    let mut second = NetworkDefinition::generate("shared", None, vec![]);
    second.network_id = first.network_id.clone();
    assert_ne!(first.pre_shared_key, second.pre_shared_key);

    join(&[&a], &first).await;
    join(&[&b], &second).await;

    let addresses = b.networks().addresses(&first.network_id).await.unwrap();
    let result = timeout(
        Duration::from_secs(30),
        a.networks().connect(&first.network_id, &addresses[0]),
    )
    .await
    .expect("dial did not settle");
    assert!(result.is_err());

    assert!(a.networks().peers(&first.network_id).await.unwrap().is_empty());
    assert!(b.networks().peers(&first.network_id).await.unwrap().is_empty());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exported_manifest_drives_download() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let data = sample_tree(dir.path());

    let seeder = LishNode::open(&config(dir.path(), "seeder")).await.unwrap();
    let leecher = LishNode::open(&config(dir.path(), "leecher")).await.unwrap();
    let definition = NetworkDefinition::generate("loopback", None, vec![]);
    join(&[&seeder, &leecher], &definition).await;
    connect(&leecher, &seeder, &definition.network_id).await;

    let manifest = seeder
        .import_local(
            &data,
            ImportOptions {
                chunk_size: CHUNK_SIZE,
                ..ImportOptions::default()
            },
        )
        .await
        .unwrap();
    let bytes = seeder
        .export_manifest(
            &manifest.id,
            lishnet_core::ExportOptions {
                minify: true,
                compress: true,
            },
        )
        .await
        .unwrap();
    let path = dir.path().join("shared.lish.zst");
    std::fs::write(&path, &bytes).unwrap();
    assert_eq!(Manifest::load(&path).unwrap(), manifest);

    let handle = leecher
        .download(&definition.network_id, ManifestSource::Path(path))
        .await
        .unwrap();
    let status = wait(&handle).await;
    assert_eq!(status.phase, TransferPhase::Complete, "{:?}", status.error);
    assert!(status.directory.join("empty").exists());

    leecher.shutdown().await;
    seeder.shutdown().await;
}
