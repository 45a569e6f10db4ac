//! Crash and recovery tests. A "crash" is a `std::mem::forget` of the whole
//! store: destructors never run, nothing gets a final save, and the only
//! durable state is whatever the data file and the WAL already held. That is
//! exactly the situation a killed process leaves behind.

use std::mem::forget;
use std::path::PathBuf;

use synrix_lattice::license::LicenseInfo;
use synrix_lattice::{Lattice, LatticeOptions, NodeType, WalOptions};

const DEVICE: u32 = 3;

fn store_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("store.lat")
}

fn open(dir: &tempfile::TempDir) -> Lattice {
    let mut lattice = Lattice::init_with_options(
        &store_path(dir),
        LatticeOptions {
            max_ram_nodes: 1000,
            device_id: DEVICE,
            counter_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        },
    )
    .unwrap();
    lattice.apply_license(LicenseInfo { limit: 0, unlimited: true });
    lattice
}

#[test]
fn flushed_adds_survive_a_crash_without_checkpoint() {
    let dir = tempfile::tempdir().unwrap();

    let mut ids = Vec::new();
    {
        let mut lattice = open(&dir);
        lattice.enable_wal(WalOptions::default()).unwrap();
        for i in 0..100 {
            ids.push(
                lattice
                    .add(NodeType::Primitive, &format!("ISA_{}", i), &format!("v{}", i), 0)
                    .unwrap(),
            );
        }
        lattice.flush().unwrap();
        forget(lattice);
    }

    let mut back = open(&dir);
    assert_eq!(back.node_count(), 0);
    back.enable_wal(WalOptions::default()).unwrap();

    assert_eq!(back.node_count(), 100);
    assert_eq!(back.next_local_id(), 101);
    for (i, &id) in ids.iter().enumerate() {
        let node = back.get_copy(id).unwrap();
        assert_eq!(node.name(), format!("ISA_{}", i));
        assert_eq!(node.text().unwrap(), format!("v{}", i));
    }
}

#[test]
fn replay_reproduces_updates_deletes_and_edges() {
    let dir = tempfile::tempdir().unwrap();

    let (a, b, c);
    {
        let mut lattice = open(&dir);
        lattice.enable_wal(WalOptions::default()).unwrap();
        a = lattice.add(NodeType::Primitive, "ISA_A", "v1", 0).unwrap();
        b = lattice
            .add_binary(NodeType::Primitive, "ISA_B", &[1, 2, 3], 0)
            .unwrap();
        c = lattice.add(NodeType::Primitive, "ISA_C", "leaf", 0).unwrap();

        lattice.update(a, "v2").unwrap();
        lattice.update_binary(c, &[9, 9]).unwrap();
        lattice.delete(b).unwrap();
        lattice.add_child(a, c).unwrap();

        lattice.flush().unwrap();
        forget(lattice);
    }

    let mut back = open(&dir);
    back.enable_wal(WalOptions::default()).unwrap();

    assert_eq!(back.node_count(), 2);
    let node_a = back.get_copy(a).unwrap();
    assert_eq!(node_a.text(), Some("v2"));
    assert_eq!(node_a.children.as_slice(), &[c]);

    let node_c = back.get_copy(c).unwrap();
    assert_eq!(node_c.binary_payload().unwrap().0, &[9, 9]);

    assert!(back.get_copy(b).is_err());
    assert_eq!(back.next_local_id(), 4);
}

#[test]
fn checkpoint_divides_file_state_from_log_state() {
    let dir = tempfile::tempdir().unwrap();

    {
        let mut lattice = open(&dir);
        lattice.enable_wal(WalOptions::default()).unwrap();
        for i in 0..10 {
            lattice
                .add(NodeType::Primitive, &format!("PRE_{}", i), "x", 0)
                .unwrap();
        }
        lattice.checkpoint().unwrap();

        lattice.add(NodeType::Primitive, "POST_A", "x", 0).unwrap();
        lattice.add(NodeType::Primitive, "POST_B", "x", 0).unwrap();
        lattice.flush().unwrap();
        forget(lattice);
    }

    let mut back = open(&dir);
    // The checkpoint's save put the first ten in the data file.
    assert_eq!(back.node_count(), 10);
    back.enable_wal(WalOptions::default()).unwrap();
    // Replay adds only the post-checkpoint pair.
    assert_eq!(back.node_count(), 12);
    assert_eq!(back.next_local_id(), 13);
    assert_eq!(back.find_by_name("POST_", 10).len(), 2);
}

#[test]
fn recovery_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();

    {
        let mut lattice = open(&dir);
        lattice.enable_wal(WalOptions::default()).unwrap();
        for i in 0..5 {
            lattice
                .add(NodeType::Primitive, &format!("ISA_{}", i), "x", 0)
                .unwrap();
        }
        lattice.flush().unwrap();
        forget(lattice);
    }

    let mut back = open(&dir);
    let applied = back.recover_from_wal().unwrap();
    assert_eq!(applied, 5);
    assert_eq!(back.node_count(), 5);

    // A second replay finds every node already present.
    let applied = back.recover_from_wal().unwrap();
    assert_eq!(applied, 0);
    assert_eq!(back.node_count(), 5);
}

#[test]
fn flush_returns_the_durable_watermark() {
    let dir = tempfile::tempdir().unwrap();
    let mut lattice = open(&dir);
    lattice.enable_wal(WalOptions::default()).unwrap();

    lattice.add(NodeType::Primitive, "A_1", "x", 0).unwrap();
    lattice.add(NodeType::Primitive, "A_2", "x", 0).unwrap();
    lattice.add(NodeType::Primitive, "A_3", "x", 0).unwrap();

    let watermark = lattice.flush().unwrap();
    assert_eq!(watermark, 3);
    assert!(lattice.flush_wait(3).unwrap() >= 3);
}

#[test]
fn synchronous_wal_needs_no_flush() {
    let dir = tempfile::tempdir().unwrap();

    {
        let mut lattice = open(&dir);
        lattice
            .enable_wal(WalOptions {
                batching: false,
                ..Default::default()
            })
            .unwrap();
        lattice.add(NodeType::Primitive, "SYNC_A", "x", 0).unwrap();
        lattice.add(NodeType::Primitive, "SYNC_B", "x", 0).unwrap();
        // No flush, no save. Straight to the floor.
        forget(lattice);
    }

    let mut back = open(&dir);
    back.enable_wal(WalOptions::default()).unwrap();
    assert_eq!(back.node_count(), 2);
}

#[test]
fn wal_errors_without_enable() {
    let dir = tempfile::tempdir().unwrap();
    let mut lattice = open(&dir);
    assert!(lattice.flush().is_err());
    assert!(lattice.checkpoint().is_err());
}
