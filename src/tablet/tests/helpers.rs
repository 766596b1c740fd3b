use crate::storage::{MemStorage, Storage};
use crate::tablet::{FileTablet, TabletReaderOptions, TabletWriter, TabletWriterOptions};
use crate::view::KeyValue;

/// Keys `key-00000` .. with values `value-{i}`; every eleventh entry is a tombstone.
pub fn sample_entries(n: usize) -> Vec<KeyValue> {
    (0..n)
        .map(|i| {
            let key = format!("key-{i:05}");
            if i % 11 == 5 {
                KeyValue::tombstone(key.as_str())
            } else {
                KeyValue::put(key.as_str(), format!("value-{i}").as_str())
            }
        })
        .collect()
}

/// Serializes `entries` into an in-memory tablet image.
pub fn write_tablet(entries: &[KeyValue], options: TabletWriterOptions) -> Vec<u8> {
    let mut out = Vec::new();
    TabletWriter::new(options)
        .write(&mut out, entries.iter().cloned())
        .unwrap();
    out
}

/// Opens a tablet image through a fresh memory storage.
pub fn open_bytes(data: Vec<u8>, options: TabletReaderOptions) -> Result<FileTablet, crate::tablet::TabletError> {
    let storage = MemStorage::new();
    storage.put_bytes("000001.tab", data).unwrap();
    FileTablet::open(storage.open("000001.tab").unwrap(), options)
}

/// Small blocks so a few hundred entries span many of them.
pub fn small_blocks(compression: bool) -> TabletWriterOptions {
    TabletWriterOptions {
        block_size: 256,
        compression,
        restart_interval: 4,
        check_key_order: true,
    }
}
