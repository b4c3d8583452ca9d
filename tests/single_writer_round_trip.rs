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
    config.mds_page_size = 4096;
    (dir, config)
}

#[test]
fn single_writer_one_epoch_round_trip() {
    let (_dir, config) = engine_config();
    let payload: Vec<u8> = (0..100u32).map(|i| i as u8).collect();

    let wal = Wal::open(config.clone(), InitMode::CreateIfNotExists).expect("open");
    let mut writer = wal.writer(0).expect("writer");
    writer.append(&payload, Epoch::new(1));
    wal.advance_stable_epoch(Epoch::new(1)).expect("advance");
    wal.wait_durable(Epoch::new(1), WAIT).expect("durable");

    assert_eq!(wal.durable_epoch(), Epoch::new(1));
    assert!(wal.pipeline_error().is_none());
    let meta = wal.epoch_metadata(Epoch::new(1)).expect("metadata");
    assert_eq!((meta.from_seg_id, meta.from_offset), (1, 0));
    assert_eq!((meta.to_seg_id, meta.to_off), (1, 100));

    let mut cursor = wal.open_cursor(Epoch::new(1), Epoch::new(1)).expect("cursor");
    assert!(cursor.is_valid());
    assert_eq!(cursor.current_epoch(), Epoch::new(1));
    assert_eq!(cursor.data(), &payload[..]);
    cursor.next().expect("advance past the range");
    assert!(!cursor.is_valid());
    drop(cursor);

    wal.shutdown().expect("shutdown");

    let wal = Wal::open(config, InitMode::Restart).expect("restart");
    assert_eq!(wal.durable_epoch(), Epoch::new(1));
    let mut cursor = wal.open_cursor(Epoch::new(1), Epoch::new(1)).expect("cursor");
    assert_eq!(cursor.data(), &payload[..]);
    cursor.next().expect("advance past the range");
    assert!(!cursor.is_valid());
    drop(cursor);
    wal.shutdown().expect("shutdown after restart");
}

#[test]
fn zero_byte_epoch_concludes() {
    let (_dir, config) = engine_config();
    let wal = Wal::open(config, InitMode::CreateIfNotExists).expect("open");

    // The client advances the stable epoch without writing anything.
    wal.advance_stable_epoch(Epoch::new(1)).expect("advance");
    wal.wait_durable(Epoch::new(1), WAIT).expect("durable");

    let meta = wal.epoch_metadata(Epoch::new(1)).expect("metadata");
    assert_eq!(
        (meta.from_seg_id, meta.from_offset),
        (meta.to_seg_id, meta.to_off)
    );

    // A cursor over the empty epoch has nothing to yield.
    let cursor = wal.open_cursor(Epoch::new(1), Epoch::new(1)).expect("cursor");
    assert!(!cursor.is_valid());
    drop(cursor);
    wal.shutdown().expect("shutdown");
}

#[test]
fn flusher_heartbeat_advances() {
    let (_dir, config) = engine_config();
    let wal = Wal::open(config, InitMode::CreateIfNotExists).expect("open");
    let deadline = std::time::Instant::now() + WAIT;
    while wal.flusher_heartbeat_ns() == 0 {
        assert!(std::time::Instant::now() < deadline, "no heartbeat observed");
        std::thread::sleep(Duration::from_millis(1));
    }
    wal.shutdown().expect("shutdown");
}

#[test]
fn cursor_rejects_bad_ranges() {
    let (_dir, config) = engine_config();
    let wal = Wal::open(config, InitMode::CreateIfNotExists).expect("open");
    assert!(wal.open_cursor(Epoch::new(0), Epoch::new(1)).is_err());
    assert!(wal.open_cursor(Epoch::new(5), Epoch::new(3)).is_err());

    // Valid range beyond the durable epoch: empty cursor, not an error.
    let cursor = wal.open_cursor(Epoch::new(1), Epoch::new(3)).expect("cursor");
    assert!(!cursor.is_valid());
    drop(cursor);
    wal.shutdown().expect("shutdown");
}
