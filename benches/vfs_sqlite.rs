use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pagecask::{is_registered, open_database, register_vfs, EngineConfig};
use rusqlite::Connection;
use std::path::Path;
use tempfile::TempDir;

const LZ4_VFS: &str = "pagecask-bench-lz4";
const ZSTD_VFS: &str = "pagecask-bench-zstd";

fn register_bench_vfs() {
    for (name, codec) in [(LZ4_VFS, "lz4"), (ZSTD_VFS, "zstd")] {
        if !is_registered(name) {
            let config = EngineConfig::default()
                .with_compression(Some(codec))
                .with_index_capacity(65536);
            register_vfs(name, config, false).unwrap();
        }
    }
}

/// `None` opens through the platform VFS for a baseline
fn connect(path: &Path, vfs: Option<&str>) -> Connection {
    let conn = match vfs {
        Some(name) => open_database(path, name).unwrap(),
        None => Connection::open(path).unwrap(),
    };
    conn.execute("CREATE TABLE IF NOT EXISTS test (id INTEGER PRIMARY KEY, data TEXT)", [])
        .unwrap();
    conn
}

fn populate(conn: &mut Connection, count: usize) {
    let tx = conn.transaction().unwrap();
    for i in 0..count {
        tx.execute(
            "INSERT INTO test (data) VALUES (?)",
            [format!("Test data {} {}", i, "payload ".repeat(8))],
        )
        .unwrap();
    }
    tx.commit().unwrap();
}

const BACKENDS: [(&str, Option<&str>); 3] =
    [("plain", None), ("lz4", Some(LZ4_VFS)), ("zstd", Some(ZSTD_VFS))];

/// Benchmark SQLite INSERT performance through each backend
fn bench_vfs_inserts(c: &mut Criterion) {
    register_bench_vfs();
    let mut group = c.benchmark_group("vfs_inserts");
    group.sample_size(20);

    for count in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(count as u64));

        for (label, vfs) in BACKENDS {
            group.bench_with_input(BenchmarkId::new(label, count), &count, |b, &count| {
                b.iter_with_setup(
                    || {
                        let dir = TempDir::new().unwrap();
                        let conn = connect(&dir.path().join("bench.db"), vfs);
                        (conn, dir)
                    },
                    |(mut conn, _dir)| {
                        populate(&mut conn, count);
                        black_box(&conn);
                    },
                );
            });
        }
    }

    group.finish();
}

/// Benchmark SQLite SELECT performance through each backend
fn bench_vfs_selects(c: &mut Criterion) {
    register_bench_vfs();
    let mut group = c.benchmark_group("vfs_selects");

    for count in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(count as u64));

        for (label, vfs) in BACKENDS {
            group.bench_with_input(BenchmarkId::new(label, count), &count, |b, &count| {
                let dir = TempDir::new().unwrap();
                let mut conn = connect(&dir.path().join("bench.db"), vfs);
                populate(&mut conn, count);

                b.iter(|| {
                    let mut stmt = conn.prepare_cached("SELECT * FROM test").unwrap();
                    let rows: Vec<(i64, String)> = stmt
                        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                        .unwrap()
                        .collect::<Result<Vec<_>, _>>()
                        .unwrap();
                    black_box(rows);
                });
            });
        }
    }

    group.finish();
}

/// Benchmark UPDATE of every row, which rewrites pages in place
fn bench_vfs_updates(c: &mut Criterion) {
    register_bench_vfs();
    let mut group = c.benchmark_group("vfs_updates");
    group.sample_size(20);

    for count in [100usize, 1_000, 5_000] {
        group.throughput(Throughput::Elements(count as u64));

        for (label, vfs) in BACKENDS {
            group.bench_with_input(BenchmarkId::new(label, count), &count, |b, &count| {
                let dir = TempDir::new().unwrap();
                let mut conn = connect(&dir.path().join("bench.db"), vfs);
                populate(&mut conn, count);

                let mut round = 0u64;
                b.iter(|| {
                    round += 1;
                    let tx = conn.transaction().unwrap();
                    tx.execute("UPDATE test SET data = ?1", [format!("Updated {}", round)])
                        .unwrap();
                    tx.commit().unwrap();
                    black_box(&conn);
                });
            });
        }
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_vfs_inserts,
    bench_vfs_selects,
    bench_vfs_updates
);
criterion_main!(benches);
