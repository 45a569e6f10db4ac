//! Chunked storage tests: split, metadata, the three resolution tiers and
//! byte-exact reassembly.

use std::path::PathBuf;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use synrix_lattice::license::LicenseInfo;
use synrix_lattice::{Lattice, LatticeError, LatticeOptions, NodeType, CHUNK_PAYLOAD};

const DEVICE: u32 = 5;

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

fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

#[test]
fn chunked_roundtrip_with_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let mut lattice = open(&dir);

    let data = random_bytes(1510, 1);
    let parent = lattice
        .add_chunked(NodeType::Primitive, "BLOB_BIG", &data, 0)
        .unwrap();

    assert!(lattice.is_chunked(parent).unwrap());
    assert_eq!(lattice.get_chunked_size(parent).unwrap(), 1510);
    assert_eq!(lattice.get_chunked(parent).unwrap(), data);

    // 1510 bytes split into 500 byte payloads.
    let node = lattice.get_copy(parent).unwrap();
    assert_eq!(node.kind, NodeType::ChunkHeader);
    assert!(node.name().starts_with("C:"));
    assert_eq!(node.children.len(), 1510usize.div_ceil(CHUNK_PAYLOAD));

    let mut buf = vec![0u8; 1510];
    assert_eq!(lattice.get_chunked_to_buffer(parent, &mut buf).unwrap(), 1510);
    assert_eq!(buf, data);

    let mut small = vec![0u8; 1509];
    assert_eq!(
        lattice.get_chunked_to_buffer(parent, &mut small),
        Err(LatticeError::BufferTooSmall)
    );

    let plain = lattice.add(NodeType::Primitive, "ISA_X", "x", 0).unwrap();
    assert!(!lattice.is_chunked(plain).unwrap());
}

#[test]
fn chunked_roundtrip_at_size_boundaries() {
    let dir = tempfile::tempdir().unwrap();
    let mut lattice = open(&dir);

    for (i, &len) in [1usize, 499, 500, 501, 1000, 5000, 12345].iter().enumerate() {
        let data = random_bytes(len, i as u64);
        let parent = lattice
            .add_chunked(NodeType::Primitive, &format!("BLOB_{}", len), &data, 0)
            .unwrap();
        assert_eq!(lattice.get_chunked_size(parent).unwrap(), len as u64, "len {}", len);
        assert_eq!(lattice.get_chunked(parent).unwrap(), data, "len {}", len);
    }
}

#[test]
fn chunked_survives_snapshot_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let data = random_bytes(3333, 9);

    let parent;
    {
        let mut lattice = open(&dir);
        parent = lattice
            .add_chunked(NodeType::Primitive, "BLOB_PERSIST", &data, 0)
            .unwrap();
        lattice.save().unwrap();
    }

    let mut back = open(&dir);
    assert_eq!(back.get_chunked_size(parent).unwrap(), 3333);
    assert_eq!(back.get_chunked(parent).unwrap(), data);
}

#[test]
fn chunked_disk_mode_reads_sequential_slots() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.lat");
    let data = random_bytes(5000, 4);

    let parent;
    {
        let mut lattice = Lattice::init_disk_mode(&path, 50, DEVICE, 200).unwrap();
        lattice.apply_license(LicenseInfo { limit: 0, unlimited: true });
        parent = lattice
            .add_chunked(NodeType::Primitive, "BLOB_DISK", &data, 0)
            .unwrap();
        lattice.save().unwrap();
        lattice.cleanup().unwrap();
    }

    let mut lattice = Lattice::init_disk_mode(&path, 50, DEVICE, 200).unwrap();
    // Parent plus ten chunks.
    assert_eq!(lattice.node_count(), 11);
    assert_eq!(lattice.get_chunked_size(parent).unwrap(), 5000);
    assert_eq!(lattice.get_chunked(parent).unwrap(), data);
}

#[test]
fn oversized_chunk_count_falls_back_to_name_scan() {
    let dir = tempfile::tempdir().unwrap();
    let mut lattice = open(&dir);

    // 61 chunks: the id array (24 + 61 * 8 bytes) no longer fits the parent
    // envelope, so reads go through the name scan.
    let len = CHUNK_PAYLOAD * 61;
    let data = random_bytes(len, 13);
    let parent = lattice
        .add_chunked(NodeType::Primitive, "BLOB_HUGE", &data, 0)
        .unwrap();

    assert_eq!(lattice.get_chunked_size(parent).unwrap(), len as u64);
    assert_eq!(lattice.get_chunked(parent).unwrap(), data);
}

#[test]
fn empty_chunked_payload_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let mut lattice = open(&dir);
    assert_eq!(
        lattice.add_chunked(NodeType::Primitive, "BLOB_EMPTY", &[], 0),
        Err(LatticeError::NullInput)
    );
}
