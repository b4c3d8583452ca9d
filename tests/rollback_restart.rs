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

fn read_range(wal: &Wal, begin: u64, end: u64) -> Vec<u8> {
    let mut cursor = wal
        .open_cursor(Epoch::new(begin), Epoch::new(end))
        .expect("cursor");
    let mut bytes = Vec::new();
    while cursor.is_valid() {
        bytes.extend_from_slice(cursor.data());
        cursor.next().expect("cursor next");
    }
    bytes
}

#[test]
fn rollback_below_paged_metadata() {
    let (_dir, config) = engine_config();
    let wal = Wal::open(config.clone(), InitMode::CreateIfNotExists).expect("open");
    let mut writer = wal.writer(0).expect("writer");

    // Three metadata pages get paged out over 200 epochs (K = 64).
    for raw in 1..=200u64 {
        writer.append(&[raw as u8], Epoch::new(raw));
        wal.advance_stable_epoch(Epoch::new(raw)).expect("advance");
        wal.wait_durable(Epoch::new(raw), WAIT).expect("durable");
    }
    assert_eq!(wal.paged_mds_epoch(), Epoch::new(192));

    wal.rollback_to_epoch(Epoch::new(50)).expect("rollback");
    assert_eq!(wal.durable_epoch(), Epoch::new(50));
    assert_eq!(wal.paged_mds_epoch(), Epoch::new(0));
    assert_eq!(wal.latest_epoch(), Epoch::new(50));

    // Rolled-back epochs disappear; retained ones still read back.
    let expected: Vec<u8> = (1..=50u64).map(|raw| raw as u8).collect();
    assert_eq!(read_range(&wal, 1, 50), expected);
    assert!(read_range(&wal, 51, 200).is_empty());

    // Rolling forward is rejected.
    assert!(wal.rollback_to_epoch(Epoch::new(60)).is_err());
    wal.shutdown().expect("shutdown");

    // Restart keeps the rollback authoritative and resumes after it.
    let wal = Wal::open(config, InitMode::Restart).expect("restart");
    assert_eq!(wal.durable_epoch(), Epoch::new(50));
    assert_eq!(read_range(&wal, 1, 50), expected);
    assert!(read_range(&wal, 51, 200).is_empty());

    let mut writer = wal.writer(0).expect("writer");
    writer.append(&[0xEE; 32], Epoch::new(51));
    wal.advance_stable_epoch(Epoch::new(51)).expect("advance");
    wal.wait_durable(Epoch::new(51), WAIT).expect("durable");
    assert_eq!(read_range(&wal, 51, 51), vec![0xEE; 32]);
    wal.shutdown().expect("shutdown after restart");
}

#[test]
fn stable_epoch_advances_in_one_call() {
    let (_dir, config) = engine_config();
    let wal = Wal::open(config, InitMode::CreateIfNotExists).expect("open");
    let mut writer = wal.writer(0).expect("writer");

    // Declare several epochs stable at once; the flusher concludes the
    // whole chain.
    for raw in 1..=4u64 {
        writer.append(&[raw as u8; 16], Epoch::new(raw));
    }
    wal.advance_stable_epoch(Epoch::new(4)).expect("advance");
    wal.wait_durable(Epoch::new(4), WAIT).expect("durable");

    for raw in 1..=4u64 {
        assert_eq!(read_range(&wal, raw, raw), vec![raw as u8; 16]);
    }
    wal.shutdown().expect("shutdown");
}
