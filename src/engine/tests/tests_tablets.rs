//! Externally built tablets: push and import.

#[cfg(test)]
mod tests {
    use crate::engine::EngineError;
    use crate::engine::tests::helpers::{collect, memtable_only_config, open_mem};
    use crate::storage::{MemStorage, Storage, StorageError};
    use crate::tablet::{TabletWriter, TabletWriterOptions};
    use crate::view::KeyValue;

    fn tablet_bytes(entries: &[KeyValue]) -> Vec<u8> {
        let mut out = Vec::new();
        TabletWriter::new(TabletWriterOptions::default())
            .write(&mut out, entries.iter().cloned())
            .unwrap();
        out
    }

    /// # Scenario
    /// A bulk-loaded tablet pushed on top of flushed data.
    ///
    /// # Starting environment
    /// One flushed tablet with `a=1`, `b=2`, `c=3`; a separately written
    /// `bulk.tab` with `b=20` and a tombstone for `c`.
    ///
    /// # Actions
    /// `push_tablet("bulk.tab")`; read; close and reopen.
    ///
    /// # Expected behavior
    /// The pushed tablet shadows the older one; the order survives reopen.
    #[test]
    fn pushed_tablet_shadows_older_data() {
        let storage = MemStorage::new();
        let engine = open_mem(&storage, memtable_only_config());
        engine.put(b"a", b"1").unwrap();
        engine.put(b"b", b"2").unwrap();
        engine.put(b"c", b"3").unwrap();
        engine.flush_all().unwrap();

        let bulk = tablet_bytes(&[KeyValue::put("b", "20"), KeyValue::tombstone("c")]);
        storage.put_bytes("bulk.tab", bulk).unwrap();
        engine.push_tablet("bulk.tab").unwrap();

        let expected = vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"20".to_vec())];
        assert_eq!(collect(engine.find(None).unwrap()), expected);
        engine.close().unwrap();

        let engine = open_mem(&storage, memtable_only_config());
        assert_eq!(
            engine.stats().unwrap().tablets,
            vec!["000001.tab".to_string(), "bulk.tab".to_string()]
        );
        assert_eq!(collect(engine.find(None).unwrap()), expected);
    }

    /// # Scenario
    /// Importing tablet bytes from a reader.
    ///
    /// # Starting environment
    /// Empty engine; a serialized tablet in memory.
    ///
    /// # Actions
    /// `import_tablet(&bytes[..])`.
    ///
    /// # Expected behavior
    /// The tablet lands under the next numbered name and is readable.
    #[test]
    fn import_tablet_from_reader() {
        let engine = open_mem(&MemStorage::new(), memtable_only_config());
        let data = tablet_bytes(&[KeyValue::put("x", "1"), KeyValue::put("y", "2")]);

        let name = engine.import_tablet(&data[..]).unwrap();
        assert_eq!(name, "000001.tab");
        assert_eq!(engine.get(b"y").unwrap().as_bytes(), b"2");
        assert_eq!(engine.stats().unwrap().tablets, vec![name]);
    }

    /// # Scenario
    /// Importing bytes that are not a tablet.
    ///
    /// # Starting environment
    /// Engine with one key.
    ///
    /// # Actions
    /// `import_tablet` of 100 zero bytes.
    ///
    /// # Expected behavior
    /// A tablet error; the copied file is removed and the stack is unchanged.
    #[test]
    fn import_of_garbage_is_rejected() {
        let storage = MemStorage::new();
        let engine = open_mem(&storage, memtable_only_config());
        engine.put(b"k", b"v").unwrap();

        let err = engine.import_tablet(&[0u8; 100][..]).unwrap_err();
        assert!(matches!(err, EngineError::Tablet(_)), "got {err:?}");
        assert!(!storage.exists("000001.tab"));
        assert!(engine.stats().unwrap().tablets.is_empty());
        assert_eq!(engine.get(b"k").unwrap().as_bytes(), b"v");
    }

    /// # Scenario
    /// Pushing a name that does not exist.
    ///
    /// # Starting environment
    /// Empty engine.
    ///
    /// # Actions
    /// `push_tablet("missing.tab")`.
    ///
    /// # Expected behavior
    /// `Storage(NotFound)`; the manifest is untouched.
    #[test]
    fn push_of_missing_tablet_fails() {
        let engine = open_mem(&MemStorage::new(), memtable_only_config());
        let err = engine.push_tablet("missing.tab").unwrap_err();
        assert!(
            matches!(err, EngineError::Storage(StorageError::NotFound(_))),
            "got {err:?}"
        );
        assert!(engine.stats().unwrap().tablets.is_empty());
    }
}
