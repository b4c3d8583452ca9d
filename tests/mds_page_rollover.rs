use std::time::Duration;

use nvlog::{Config, Epoch, InitMode, Wal};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

fn engine_config() -> (TempDir, Config) {
    let dir = tempfile::tempdir().expect("tempdir");
    let nv_root = dir.path().join("nv");
    let disk_root = dir.path().join("disk");
    std::fs::create_dir_all(&nv_root).expect("nv root");
    std::fs::create_dir_all(&disk_root).expect("disk root");
    let mut config = Config::new(nv_root, disk_root);
    config.writer_buffer_size = 4096;
    config.segment_size = 8192;
    config.nv_quota = 16384;
    // 64 records per metadata page.
    config.mds_page_size = 4096;
    (dir, config)
}

#[test]
fn page_rollover_pages_out_and_continues() {
    let (_dir, config) = engine_config();
    let wal = Wal::open(config, InitMode::CreateIfNotExists).expect("open");
    let mut writer = wal.writer(0).expect("writer");

    // Epochs 1..=64 fill metadata page 1; epoch 65 needs page 2, which
    // forces page 1 out to the page file first.
    for raw in 1..=65u64 {
        writer.append(&[raw as u8], Epoch::new(raw));
        wal.advance_stable_epoch(Epoch::new(raw)).expect("advance");
        wal.wait_durable(Epoch::new(raw), WAIT).expect("durable");
    }

    assert_eq!(wal.durable_epoch(), Epoch::new(65));
    assert_eq!(wal.paged_mds_epoch(), Epoch::new(64));

    // Records on both sides of the page boundary resolve.
    let meta = wal.epoch_metadata(Epoch::new(64)).expect("metadata 64");
    assert_eq!((meta.from_offset, meta.to_off), (63, 64));
    let meta = wal.epoch_metadata(Epoch::new(65)).expect("metadata 65");
    assert_eq!((meta.from_offset, meta.to_off), (64, 65));

    let mut cursor = wal.open_cursor(Epoch::new(1), Epoch::new(65)).expect("cursor");
    let mut bytes = Vec::new();
    while cursor.is_valid() {
        bytes.extend_from_slice(cursor.data());
        cursor.next().expect("cursor next");
    }
    let expected: Vec<u8> = (1..=65u64).map(|raw| raw as u8).collect();
    assert_eq!(bytes, expected);
    drop(cursor);

    wal.shutdown().expect("shutdown");
}

#[test]
fn user_metadata_is_stamped_and_searchable() {
    let (_dir, config) = engine_config();
    let wal = Wal::open(config, InitMode::CreateIfNotExists).expect("open");
    let mut writer = wal.writer(0).expect("writer");

    for raw in 1..=20u64 {
        writer.append(&[raw as u8], Epoch::new(raw));
        wal.advance_stable_epoch_with_metadata(Epoch::new(raw), raw * 10, 1000 - raw)
            .expect("advance");
    }
    wal.wait_durable(Epoch::new(20), WAIT).expect("durable");

    assert_eq!(wal.epoch_metadata(Epoch::new(5)).expect("meta").user_metadata_0, 50);
    assert_eq!(wal.epoch_metadata(Epoch::new(5)).expect("meta").user_metadata_1, 995);

    // user_metadata_0 grows with the epoch: lower bound of ">= 100".
    let lower = wal
        .find_metadata_lower_bound(0, |meta| meta >= 100)
        .expect("search")
        .expect("found");
    assert_eq!(lower.epoch_id, 10);

    // user_metadata_1 shrinks with the epoch: upper bound of ">= 985".
    let upper = wal
        .find_metadata_upper_bound(1, |meta| meta >= 985)
        .expect("search")
        .expect("found");
    assert_eq!(upper.epoch_id, 15);

    let none = wal
        .find_metadata_lower_bound(0, |meta| meta > 10_000)
        .expect("search");
    assert!(none.is_none());

    wal.shutdown().expect("shutdown");
}
