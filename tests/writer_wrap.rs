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
    // Small ring so the second epoch wraps the buffer end.
    config.writer_buffer_size = 1024;
    config.segment_size = 8192;
    config.nv_quota = 16384;
    config.mds_page_size = 4096;
    (dir, config)
}

#[test]
fn payload_wrapping_the_ring_lands_contiguously() {
    let (_dir, config) = engine_config();
    let wal = Wal::open(config, InitMode::CreateIfNotExists).expect("open");
    let mut writer = wal.writer(0).expect("writer");

    let first: Vec<u8> = (0..700usize).map(|i| (i % 127) as u8).collect();
    writer.append(&first, Epoch::new(1));
    wal.advance_stable_epoch(Epoch::new(1)).expect("advance");
    wal.wait_durable(Epoch::new(1), WAIT).expect("durable");

    // Starts at ring offset 700 and wraps at 1024.
    let second: Vec<u8> = (0..700usize).map(|i| ((i * 7) % 113) as u8).collect();
    writer.append(&second, Epoch::new(2));
    wal.advance_stable_epoch(Epoch::new(2)).expect("advance");
    wal.wait_durable(Epoch::new(2), WAIT).expect("durable");

    let meta = wal.epoch_metadata(Epoch::new(2)).expect("metadata");
    assert_eq!((meta.from_seg_id, meta.from_offset), (1, 700));
    assert_eq!((meta.to_seg_id, meta.to_off), (1, 1400));

    let mut cursor = wal.open_cursor(Epoch::new(2), Epoch::new(2)).expect("cursor");
    assert!(cursor.is_valid());
    assert_eq!(cursor.data(), &second[..]);
    cursor.next().expect("cursor next");
    assert!(!cursor.is_valid());
    drop(cursor);

    let mut cursor = wal.open_cursor(Epoch::new(1), Epoch::new(1)).expect("cursor");
    assert_eq!(cursor.data(), &first[..]);
    drop(cursor);

    wal.shutdown().expect("shutdown");
}
