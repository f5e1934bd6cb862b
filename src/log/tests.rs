//! Unit tests for the segmented log.

mod store_tests {
    use crate::error::LogError;
    use crate::log::record::LEN_WIDTH;
    use crate::log::store::Store;
    use tempfile::tempdir;

    const PAYLOAD: &[u8] = b"hello world";
    const WIDTH: u64 = (PAYLOAD.len() + LEN_WIDTH) as u64;

    #[test]
    fn test_store_append_read() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("0.store")).unwrap();

        for i in 0..3u64 {
            let (n, pos) = store.append(PAYLOAD).unwrap();
            assert_eq!(n, WIDTH);
            assert_eq!(pos, i * WIDTH);
        }
        assert_eq!(store.size(), 3 * WIDTH);

        for i in 0..3u64 {
            assert_eq!(store.read(i * WIDTH).unwrap(), PAYLOAD);
        }
    }

    #[test]
    fn test_store_reopen_keeps_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.store");
        {
            let store = Store::open(&path).unwrap();
            store.append(PAYLOAD).unwrap();
            store.append(PAYLOAD).unwrap();
            store.close().unwrap();
        }

        let store = Store::open(&path).unwrap();
        assert_eq!(store.size(), 2 * WIDTH);
        let (_, pos) = store.append(PAYLOAD).unwrap();
        assert_eq!(pos, 2 * WIDTH);
        assert_eq!(store.read(WIDTH).unwrap(), PAYLOAD);
    }

    #[test]
    fn test_store_read_past_end_is_corruption() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("0.store")).unwrap();
        store.append(PAYLOAD).unwrap();

        let err = store.read(WIDTH).unwrap_err();
        assert!(matches!(err, LogError::Corruption(_)), "got {:?}", err);
    }

    #[test]
    fn test_store_huge_length_prefix_is_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.store");
        std::fs::write(&path, [0xFFu8; 16]).unwrap();

        let store = Store::open(&path).unwrap();
        let err = store.read(0).unwrap_err();
        assert!(matches!(err, LogError::Corruption(_)), "got {:?}", err);
    }

    #[test]
    fn test_store_truncate() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("0.store")).unwrap();
        store.append(PAYLOAD).unwrap();
        store.append(b"second").unwrap();

        store.truncate(WIDTH).unwrap();
        assert_eq!(store.size(), WIDTH);

        let (_, pos) = store.append(b"third").unwrap();
        assert_eq!(pos, WIDTH);
        assert_eq!(store.read(WIDTH).unwrap(), b"third");
    }
}

mod index_tests {
    use std::fs;

    use crate::error::LogError;
    use crate::log::index::{self, ENTRY_WIDTH, Index};
    use tempfile::tempdir;

    #[test]
    fn test_index_empty_read_is_end_of_data() {
        let dir = tempdir().unwrap();
        let index = Index::open(dir.path().join("0.index"), 1024).unwrap();

        let err = index.read(-1).unwrap_err();
        assert!(index::is_end_of_index(&err));
    }

    #[test]
    fn test_index_write_read() {
        let dir = tempdir().unwrap();
        let mut index = Index::open(dir.path().join("0.index"), 1024).unwrap();

        let entries = [(0u32, 0u64), (1, 10), (2, 35)];
        for (rel, pos) in entries {
            index.write(rel, pos).unwrap();
        }
        for (rel, pos) in entries {
            assert_eq!(index.read(rel as i64).unwrap(), (rel, pos));
        }
        assert_eq!(index.read(-1).unwrap(), (2, 35));

        assert!(index::is_end_of_index(&index.read(3).unwrap_err()));
        assert!(index::is_end_of_index(&index.read(-2).unwrap_err()));
    }

    #[test]
    fn test_index_close_shrinks_file_and_reopens() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.index");
        {
            let mut index = Index::open(&path, 1024).unwrap();
            assert_eq!(fs::metadata(&path).unwrap().len(), 1024);
            index.write(0, 0).unwrap();
            index.write(1, 20).unwrap();
            index.close().unwrap();
        }
        assert_eq!(fs::metadata(&path).unwrap().len(), 2 * ENTRY_WIDTH);

        let index = Index::open(&path, 1024).unwrap();
        assert_eq!(index.read(-1).unwrap(), (1, 20));
        assert_eq!(index.entries(), 2);
    }

    #[test]
    fn test_index_full() {
        let dir = tempdir().unwrap();
        let mut index = Index::open(dir.path().join("0.index"), 2 * ENTRY_WIDTH + 4).unwrap();

        index.write(0, 0).unwrap();
        index.write(1, 1).unwrap();
        assert!(index.is_full());

        let err = index.write(2, 2).unwrap_err();
        assert!(matches!(err, LogError::IndexFull { .. }));
    }

    #[test]
    fn test_index_rejects_ragged_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.index");
        fs::write(&path, [0u8; 13]).unwrap();

        let err = Index::open(&path, 1024).err().unwrap();
        assert!(matches!(err, LogError::Corruption(_)));
    }
}

mod segment_tests {
    use crate::error::LogError;
    use crate::log::LogConfig;
    use crate::log::index::ENTRY_WIDTH;
    use crate::log::record::Record;
    use crate::log::segment::{Segment, parse_segment_file};
    use std::path::Path;
    use tempfile::tempdir;

    #[test]
    fn test_segment_append_until_index_maxed() {
        let dir = tempdir().unwrap();
        let config = LogConfig {
            max_store_bytes: 1024,
            max_index_bytes: ENTRY_WIDTH * 3,
            initial_offset: 0,
        };

        let mut segment = Segment::open(dir.path(), 16, &config).unwrap();
        assert_eq!(segment.next_offset(), 16);
        assert!(!segment.is_maxed());

        for i in 0..3u64 {
            let off = segment.append(Record::new("hello world")).unwrap();
            assert_eq!(off, 16 + i);

            let got = segment.read(off).unwrap();
            assert_eq!(got.value, b"hello world");
            assert_eq!(got.offset, off);
        }

        assert!(segment.is_maxed());
        let err = segment.append(Record::new("overflow")).unwrap_err();
        assert!(matches!(err, LogError::IndexFull { .. }));
        segment.close().unwrap();

        // Reopen with a tiny store limit: state comes back from disk.
        let config = LogConfig {
            max_store_bytes: 16,
            ..config
        };
        let segment = Segment::open(dir.path(), 16, &config).unwrap();
        assert_eq!(segment.next_offset(), 19);
        assert!(segment.is_maxed());
        assert!(segment.read(19).unwrap_err().is_out_of_range());
    }

    #[test]
    fn test_segment_truncate_from() {
        let dir = tempdir().unwrap();
        let mut segment = Segment::open(dir.path(), 0, &LogConfig::default()).unwrap();
        for i in 0..5 {
            segment.append(Record::new(format!("record-{}", i))).unwrap();
        }

        segment.truncate_from(3).unwrap();
        assert_eq!(segment.next_offset(), 3);
        assert!(segment.read(3).unwrap_err().is_out_of_range());
        assert_eq!(segment.read(2).unwrap().value, b"record-2");

        let off = segment.append(Record::new("replacement")).unwrap();
        assert_eq!(off, 3);
        assert_eq!(segment.read(3).unwrap().value, b"replacement");
    }

    #[test]
    fn test_segment_remove_deletes_files() {
        let dir = tempdir().unwrap();
        let mut segment = Segment::open(dir.path(), 7, &LogConfig::default()).unwrap();
        segment.append(Record::new("x")).unwrap();
        segment.remove().unwrap();

        assert!(!dir.path().join("7.store").exists());
        assert!(!dir.path().join("7.index").exists());
    }

    #[test]
    fn test_parse_segment_file() {
        assert_eq!(parse_segment_file(Path::new("/d/42.store")), Some(42));
        assert_eq!(parse_segment_file(Path::new("/d/42.index")), Some(42));
        assert_eq!(parse_segment_file(Path::new("/d/42.tmp")), None);
        assert_eq!(parse_segment_file(Path::new("/d/meta.store")), None);
    }
}

mod log_tests {
    use std::fs;
    use std::io::Read;

    use crate::log::record::LEN_WIDTH;
    use crate::log::{Log, LogConfig, Record};
    use tempfile::{TempDir, tempdir};

    fn small_log() -> (TempDir, Log) {
        let dir = tempdir().unwrap();
        let config = LogConfig {
            max_store_bytes: 32,
            ..Default::default()
        };
        let log = Log::open(dir.path(), config).unwrap();
        (dir, log)
    }

    fn record(value: &str) -> Record {
        Record::new(value)
    }

    #[test]
    fn test_append_read() {
        let (_dir, log) = small_log();
        let off = log.append(record("hello world")).unwrap();
        assert_eq!(off, 0);

        let got = log.read(off).unwrap();
        assert_eq!(got.value, b"hello world");
        assert_eq!(got.offset, 0);
    }

    #[test]
    fn test_offsets_are_monotonic() {
        let dir = tempdir().unwrap();
        let log = Log::open(dir.path(), LogConfig::default()).unwrap();

        for expected in 0..50u64 {
            let off = log.append(record(&format!("record-{}", expected))).unwrap();
            assert_eq!(off, expected);
        }
        assert_eq!(log.lowest_offset(), 0);
        assert_eq!(log.highest_offset(), 49);
        assert_eq!(log.next_offset(), 50);
        assert!(log.segment_count() > 1);

        for off in 0..50u64 {
            assert_eq!(log.read(off).unwrap().value, format!("record-{}", off).as_bytes());
        }
    }

    #[test]
    fn test_out_of_range() {
        let (_dir, log) = small_log();
        assert!(log.read(1).unwrap_err().is_out_of_range());

        log.append(record("hello world")).unwrap();
        assert!(log.read(1).unwrap_err().is_out_of_range());
    }

    #[test]
    fn test_rollover_on_second_append() {
        let (_dir, log) = small_log();

        let first = log.append(record("hello world")).unwrap();
        assert_eq!(log.segment_count(), 1);

        let second = log.append(record("hello world")).unwrap();
        assert_eq!(second, first + 1);
        assert_eq!(log.segment_count(), 2);

        let dir = log.dir();
        assert!(dir.join("1.store").exists());
        assert!(dir.join("1.index").exists());
    }

    #[test]
    fn test_init_existing() {
        let dir = tempdir().unwrap();
        let config = LogConfig {
            max_store_bytes: 32,
            ..Default::default()
        };
        {
            let log = Log::open(dir.path(), config.clone()).unwrap();
            for _ in 0..3 {
                log.append(record("hello world")).unwrap();
            }
            log.close().unwrap();
        }

        let log = Log::open(dir.path(), config).unwrap();
        assert_eq!(log.lowest_offset(), 0);
        assert_eq!(log.highest_offset(), 2);
        assert_eq!(log.append(record("hello world")).unwrap(), 3);
        assert_eq!(log.read(1).unwrap().value, b"hello world");
    }

    #[test]
    fn test_init_ignores_unrelated_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), b"junk").unwrap();

        let log = Log::open(dir.path(), LogConfig::default()).unwrap();
        assert_eq!(log.segment_count(), 1);
        assert_eq!(log.append(record("a")).unwrap(), 0);
    }

    #[test]
    fn test_initial_offset() {
        let dir = tempdir().unwrap();
        let config = LogConfig {
            initial_offset: 100,
            ..Default::default()
        };
        let log = Log::open(dir.path(), config).unwrap();
        assert_eq!(log.append(record("a")).unwrap(), 100);
        assert_eq!(log.lowest_offset(), 100);
        assert!(log.read(99).unwrap_err().is_out_of_range());
    }

    #[test]
    fn test_reader_streams_store_bytes() {
        let (_dir, log) = small_log();
        log.append(record("hello world")).unwrap();
        log.append(record("second")).unwrap();

        let mut bytes = Vec::new();
        log.reader().unwrap().read_to_end(&mut bytes).unwrap();

        let mut rest = bytes.as_slice();
        let mut values = Vec::new();
        while !rest.is_empty() {
            let mut len = [0u8; LEN_WIDTH];
            len.copy_from_slice(&rest[..LEN_WIDTH]);
            let len = u64::from_be_bytes(len) as usize;
            let rec = Record::decode(&rest[LEN_WIDTH..LEN_WIDTH + len]).unwrap();
            values.push((rec.offset, rec.value));
            rest = &rest[LEN_WIDTH + len..];
        }

        assert_eq!(
            values,
            vec![(0, b"hello world".to_vec()), (1, b"second".to_vec())]
        );
    }

    #[test]
    fn test_truncate_prefix() {
        let (_dir, log) = small_log();
        for _ in 0..3 {
            log.append(record("hello world")).unwrap();
        }
        assert_eq!(log.segment_count(), 3);

        log.truncate(1).unwrap();
        assert!(log.read(0).unwrap_err().is_out_of_range());
        assert!(log.read(1).unwrap_err().is_out_of_range());
        assert_eq!(log.read(2).unwrap().value, b"hello world");
        assert_eq!(log.lowest_offset(), 2);
    }

    #[test]
    fn test_truncate_everything_keeps_active_segment() {
        let (_dir, log) = small_log();
        for _ in 0..3 {
            log.append(record("hello world")).unwrap();
        }

        log.truncate(10).unwrap();
        assert_eq!(log.segment_count(), 1);
        assert_eq!(log.lowest_offset(), 11);
        assert_eq!(log.append(record("after")).unwrap(), 11);
    }

    #[test]
    fn test_truncate_keeps_live_segments_when_remove_fails() {
        let (dir, log) = small_log();
        for _ in 0..3 {
            log.append(record("hello world")).unwrap();
        }
        fs::remove_file(dir.path().join("0.index")).unwrap();

        assert!(log.truncate(1).is_err());
        assert_eq!(log.segment_count(), 1);
        assert_eq!(log.lowest_offset(), 2);
        assert_eq!(log.read(2).unwrap().value, b"hello world");
        assert_eq!(log.append(record("after")).unwrap(), 3);
    }

    #[test]
    fn test_truncate_at_empty_active_segment() {
        let (dir, log) = small_log();
        log.append(record("hello world")).unwrap();
        log.truncate(0).unwrap();
        assert!(dir.path().join("1.store").exists());

        // The fresh segment at the boundary is reused, not reopened.
        log.truncate(0).unwrap();
        assert_eq!(log.segment_count(), 1);
        assert!(dir.path().join("1.store").exists());
        assert_eq!(log.lowest_offset(), 1);
        assert_eq!(log.append(record("again")).unwrap(), 1);
    }

    #[test]
    fn test_truncate_suffix_before_only_segment() {
        let dir = tempdir().unwrap();
        let config = LogConfig {
            initial_offset: 5,
            ..Default::default()
        };
        let log = Log::open(dir.path(), config).unwrap();
        log.append(record("a")).unwrap();

        log.truncate_suffix(3).unwrap();
        assert_eq!(log.segment_count(), 1);
        assert_eq!(log.next_offset(), 3);
        assert!(!dir.path().join("5.store").exists());
        assert_eq!(log.append(record("b")).unwrap(), 3);
    }

    #[test]
    fn test_tiny_index_limit_holds_one_entry() {
        let dir = tempdir().unwrap();
        let config = LogConfig {
            max_index_bytes: 1,
            ..Default::default()
        };
        let log = Log::open(dir.path(), config).unwrap();

        for expected in 0..3u64 {
            assert_eq!(log.append(record("x")).unwrap(), expected);
        }
        assert_eq!(log.segment_count(), 3);
        assert_eq!(log.read(1).unwrap().value, b"x");
    }

    #[test]
    fn test_truncate_suffix() {
        let (_dir, log) = small_log();
        for i in 0..4 {
            log.append(record(&format!("record-{}", i))).unwrap();
        }

        log.truncate_suffix(2).unwrap();
        assert_eq!(log.next_offset(), 2);
        assert!(log.read(2).unwrap_err().is_out_of_range());
        assert_eq!(log.read(1).unwrap().value, b"record-1");

        assert_eq!(log.append(record("again")).unwrap(), 2);
        assert_eq!(log.read(2).unwrap().value, b"again");
    }

    #[test]
    fn test_truncate_suffix_within_segment() {
        let dir = tempdir().unwrap();
        let log = Log::open(dir.path(), LogConfig::default()).unwrap();
        for i in 0..5 {
            log.append(record(&format!("record-{}", i))).unwrap();
        }

        log.truncate_suffix(3).unwrap();
        assert_eq!(log.segment_count(), 1);
        assert_eq!(log.highest_offset(), 2);
        assert_eq!(log.append(record("new")).unwrap(), 3);
    }

    #[test]
    fn test_reset_reproduces_offsets() {
        let (_dir, log) = small_log();
        let first: Vec<u64> = (0..3).map(|_| log.append(record("x")).unwrap()).collect();

        log.reset().unwrap();
        assert_eq!(log.segment_count(), 1);
        assert!(log.read(0).unwrap_err().is_out_of_range());

        let second: Vec<u64> = (0..3).map(|_| log.append(record("x")).unwrap()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_reset_to() {
        let (_dir, log) = small_log();
        log.append(record("x")).unwrap();

        log.reset_to(42).unwrap();
        assert_eq!(log.lowest_offset(), 42);
        assert_eq!(log.append(record("y")).unwrap(), 42);
        assert_eq!(log.config().initial_offset, 42);
    }

    #[test]
    fn test_remove_deletes_directory() {
        let parent = tempdir().unwrap();
        let path = parent.path().join("log");
        let log = Log::open(&path, LogConfig::default()).unwrap();
        log.append(record("x")).unwrap();

        log.remove().unwrap();
        assert!(!path.exists());
    }
}
