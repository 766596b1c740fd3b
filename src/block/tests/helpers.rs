use bytes::Bytes;

use crate::block::{Block, BlockWriter};
use crate::view::KeyValue;

/// Keys `key-0000` .. `key-{n-1}` with every seventh entry a tombstone.
pub fn sample_entries(n: usize) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
    (0..n)
        .map(|i| {
            let key = format!("key-{i:04}").into_bytes();
            let value = (i % 7 != 3).then(|| format!("value-{i}").into_bytes());
            (key, value)
        })
        .collect()
}

/// Builds a finished block from `entries`.
pub fn build_block(entries: &[(Vec<u8>, Option<Vec<u8>>)], restart_interval: usize) -> Block {
    let mut writer = BlockWriter::new(restart_interval).unwrap();
    for (key, value) in entries {
        writer.append(key, value.as_deref()).unwrap();
    }
    Block::new(Bytes::copy_from_slice(writer.finish())).unwrap()
}

/// Collects an iterator of entries into plain owned pairs.
pub fn collect(iter: impl Iterator<Item = Result<KeyValue, crate::block::BlockError>>) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
    iter.map(|kv| {
        let kv = kv.unwrap();
        (kv.key.to_vec(), kv.value.map(|v| v.to_vec()))
    })
    .collect()
}
