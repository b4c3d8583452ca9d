use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nvlog::{Config, Epoch, InitMode, Wal};

fn bench_append(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let nv_root = dir.path().join("nv");
    let disk_root = dir.path().join("disk");
    std::fs::create_dir_all(&nv_root).expect("nv root");
    std::fs::create_dir_all(&disk_root).expect("disk root");

    let mut config = Config::new(nv_root, disk_root);
    config.writer_buffer_size = 1 << 20;
    config.segment_size = 8 << 20;
    config.nv_quota = 16 << 20;
    let wal = Wal::open(config, InitMode::CreateIfNotExists).expect("open");
    let mut writer = wal.writer(0).expect("writer");

    let payload = [0x5Au8; 256];
    let mut epoch = Epoch::new(1);
    let mut appended = 0u64;

    c.bench_function("append_256b", |b| {
        b.iter(|| {
            while !writer.has_enough_space() {
                std::hint::spin_loop();
            }
            writer.append(black_box(&payload), epoch);
            appended += 1;
            // Seal a batch periodically so frames recycle.
            if appended % 2048 == 0 {
                wal.advance_stable_epoch(epoch).expect("advance");
                wal.wait_durable(epoch, Duration::from_secs(30)).expect("durable");
                epoch = epoch.next();
            }
        })
    });

    wal.advance_stable_epoch(epoch).expect("advance");
    wal.wait_durable(epoch, Duration::from_secs(30)).expect("durable");
    wal.shutdown().expect("shutdown");
}

criterion_group!(benches, bench_append);
criterion_main!(benches);
