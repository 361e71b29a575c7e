//! Integration tests for the pagecask SQLite VFS

use crate::codec::key::{set_master_key, TEST_KEY};
use crate::config::EngineConfig;
use crate::error::CaskError;
use crate::header::MAGIC;
use crate::vfs::{is_registered, register_vfs, unregister_vfs};
use rusqlite::{params, Connection, OpenFlags};
use std::path::Path;
use tempfile::TempDir;

// Global lock to ensure VFS tests run serially (VFS registration is global in SQLite)
use std::sync::Mutex as StdMutex;
static VFS_TEST_LOCK: StdMutex<()> = StdMutex::new(());

fn config() -> EngineConfig {
    EngineConfig::default().with_index_capacity(1024)
}

fn open(path: &Path, vfs: &str, create: bool) -> Connection {
    let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_URI;
    if create {
        flags |= OpenFlags::SQLITE_OPEN_CREATE;
    }
    let uri = format!("file:{}?vfs={}", path.display(), vfs);
    Connection::open_with_flags(&uri, flags).unwrap()
}

fn file_prefix(path: &Path, len: usize) -> Vec<u8> {
    let bytes = std::fs::read(path).unwrap();
    bytes[..len.min(bytes.len())].to_vec()
}

#[test]
fn test_vfs_registration() {
    let _lock = VFS_TEST_LOCK.lock();

    let name = "pagecask-test-registration";
    assert!(!is_registered(name));

    register_vfs(name, config(), false).unwrap();
    assert!(is_registered(name));

    // Names are unique
    assert!(matches!(
        register_vfs(name, config(), false),
        Err(CaskError::VFSRegistrationFailed(_))
    ));

    unregister_vfs(name).unwrap();
    assert!(!is_registered(name));

    // Unknown names are ignored; registering again works
    unregister_vfs(name).unwrap();
    register_vfs(name, config(), false).unwrap();
    unregister_vfs(name).unwrap();
}

#[test]
fn test_vfs_rejects_bad_config() {
    let _lock = VFS_TEST_LOCK.lock();

    let bad = EngineConfig::default().with_page_size(1000);
    assert!(register_vfs("pagecask-test-bad", bad, false).is_err());
    assert!(!is_registered("pagecask-test-bad"));
}

#[cfg(unix)]
#[test]
fn test_unregister_refuses_foreign_vfs() {
    let _lock = VFS_TEST_LOCK.lock();

    assert!(matches!(
        unregister_vfs("unix"),
        Err(CaskError::BadConfig(_))
    ));
    assert!(is_registered("unix"));
}

#[test]
fn test_vfs_full_sqlite_integration() {
    let _lock = VFS_TEST_LOCK.lock();

    let name = "pagecask-test-full";
    register_vfs(name, config(), false).unwrap();

    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");

    {
        let conn = open(&db_path, name, true);
        conn.execute(
            "CREATE TABLE users (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                email TEXT NOT NULL UNIQUE
            )",
            [],
        )
        .unwrap();

        for (user, email) in [
            ("Alice", "alice@example.com"),
            ("Bob", "bob@example.com"),
            ("Charlie", "charlie@example.com"),
        ] {
            conn.execute(
                "INSERT INTO users (name, email) VALUES (?1, ?2)",
                params![user, email],
            )
            .unwrap();
        }

        conn.execute(
            "UPDATE users SET email = ?1 WHERE name = ?2",
            params!["newalice@example.com", "Alice"],
        )
        .unwrap();
        conn.execute("DELETE FROM users WHERE name = ?1", params!["Bob"])
            .unwrap();

        conn.close().unwrap();
    }

    // Stored as a container, not as a plain SQLite file
    assert_eq!(file_prefix(&db_path, MAGIC.len()), MAGIC.to_vec());

    {
        let conn = open(&db_path, name, false);
        let names: Vec<String> = conn
            .prepare("SELECT name FROM users ORDER BY id")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(names, vec!["Alice", "Charlie"]);

        let alice_email: String = conn
            .query_row(
                "SELECT email FROM users WHERE name = ?1",
                params!["Alice"],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(alice_email, "newalice@example.com");

        let check: String = conn
            .query_row("PRAGMA integrity_check", [], |row| row.get(0))
            .unwrap();
        assert_eq!(check, "ok");
    }

    unregister_vfs(name).unwrap();
}

#[test]
fn test_vfs_compresses_repetitive_data() {
    let _lock = VFS_TEST_LOCK.lock();

    let name = "pagecask-test-compress";
    register_vfs(name, config(), false).unwrap();

    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("bulk.db");

    {
        let mut conn = open(&db_path, name, true);
        conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, body TEXT)", [])
            .unwrap();
        let tx = conn.transaction().unwrap();
        for i in 0..2000 {
            tx.execute(
                "INSERT INTO t (body) VALUES (?1)",
                params![format!("row {:06} {}", i, "lorem ipsum ".repeat(20))],
            )
            .unwrap();
        }
        tx.commit().unwrap();

        let page_count: i64 = conn
            .query_row("PRAGMA page_count", [], |row| row.get(0))
            .unwrap();
        let page_size: i64 = conn
            .query_row("PRAGMA page_size", [], |row| row.get(0))
            .unwrap();
        conn.close().unwrap();

        let logical = (page_count * page_size) as u64;
        let physical = std::fs::metadata(&db_path).unwrap().len();
        assert!(
            physical < logical,
            "container {} bytes, logical {} bytes",
            physical,
            logical
        );
    }

    let conn = open(&db_path, name, false);
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 2000);
    drop(conn);

    unregister_vfs(name).unwrap();
}

#[test]
fn test_vfs_transactions() {
    let _lock = VFS_TEST_LOCK.lock();

    let name = "pagecask-test-txn";
    register_vfs(name, config(), false).unwrap();

    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("txn.db");
    let mut conn = open(&db_path, name, true);

    conn.execute(
        "CREATE TABLE accounts (id INTEGER PRIMARY KEY, balance REAL)",
        [],
    )
    .unwrap();
    conn.execute("INSERT INTO accounts (balance) VALUES (100.0)", [])
        .unwrap();
    conn.execute("INSERT INTO accounts (balance) VALUES (50.0)", [])
        .unwrap();

    {
        let tx = conn.transaction().unwrap();
        tx.execute("UPDATE accounts SET balance = balance - 30 WHERE id = 1", [])
            .unwrap();
        tx.execute("UPDATE accounts SET balance = balance + 30 WHERE id = 2", [])
            .unwrap();
        tx.commit().unwrap();
    }

    {
        let tx = conn.transaction().unwrap();
        tx.execute("UPDATE accounts SET balance = 0", []).unwrap();
        tx.rollback().unwrap();
    }

    let balances: Vec<f64> = conn
        .prepare("SELECT balance FROM accounts ORDER BY id")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(balances, vec![70.0, 80.0]);

    drop(conn);
    unregister_vfs(name).unwrap();
}

#[test]
fn test_plain_database_passes_through() {
    let _lock = VFS_TEST_LOCK.lock();

    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("plain.db");

    {
        let conn = Connection::open(&db_path).unwrap();
        conn.execute("CREATE TABLE notes (body TEXT)", []).unwrap();
        conn.execute("INSERT INTO notes VALUES ('written plain')", [])
            .unwrap();
    }

    let name = "pagecask-test-plain";
    register_vfs(name, config(), false).unwrap();

    {
        let conn = open(&db_path, name, false);
        conn.execute("INSERT INTO notes VALUES ('written through vfs')", [])
            .unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM notes", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    assert_eq!(file_prefix(&db_path, 16), b"SQLite format 3\0".to_vec());
    unregister_vfs(name).unwrap();
}

#[test]
fn test_vfs_wal_mode() {
    let _lock = VFS_TEST_LOCK.lock();

    let name = "pagecask-test-wal";
    register_vfs(name, config(), false).unwrap();

    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("wal.db");

    {
        let conn = open(&db_path, name, true);
        let mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");

        conn.execute("CREATE TABLE events (id INTEGER PRIMARY KEY, kind TEXT)", [])
            .unwrap();
        for i in 0..50 {
            conn.execute("INSERT INTO events (kind) VALUES (?1)", params![format!("e{}", i)])
                .unwrap();
        }
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .unwrap();
        conn.close().unwrap();
    }

    assert_eq!(file_prefix(&db_path, MAGIC.len()), MAGIC.to_vec());

    let conn = open(&db_path, name, false);
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 50);
    drop(conn);

    unregister_vfs(name).unwrap();
}

#[test]
fn test_vfs_encrypted_database() {
    let _lock = VFS_TEST_LOCK.lock();
    set_master_key(TEST_KEY);

    let name = "pagecask-test-encrypted";
    let encrypted = config()
        .with_compression(Some("lz4"))
        .with_encryption(Some("aes-256-gcm"));
    register_vfs(name, encrypted, false).unwrap();

    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("secret.db");

    {
        let conn = open(&db_path, name, true);
        conn.execute("CREATE TABLE secrets (value TEXT)", []).unwrap();
        conn.execute("INSERT INTO secrets VALUES ('attack at dawn')", [])
            .unwrap();
    }

    let raw = std::fs::read(&db_path).unwrap();
    assert!(!raw.windows(14).any(|w| w == b"attack at dawn"));

    let conn = open(&db_path, name, false);
    let value: String = conn
        .query_row("SELECT value FROM secrets", [], |row| row.get(0))
        .unwrap();
    assert_eq!(value, "attack at dawn");
    drop(conn);

    unregister_vfs(name).unwrap();
}
