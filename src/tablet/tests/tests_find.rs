//! Positioned lookups across blocks, plus hand-built tablet fixtures.

use rand::Rng;

use crate::tablet::tests::helpers::{open_bytes, sample_entries, small_blocks, write_tablet};
use crate::tablet::{BLOCK_FLAG_COMPRESSED, TabletReader, TabletReaderOptions};
use crate::view::KeyValue;

/// Headerless single-block tablet: `[1,2,3] -> [4,5,6]`.
fn inline_tablet() -> Vec<u8> {
    let parts: &[&[u8]] = &[
        &[0x00, 0x00, 0x11],             // envelope: checksum, flags, length 17
        &[0x00, 0xA3, 1, 2, 3],          // key
        &[0xA3, 4, 5, 6],                // value
        &[0, 0, 0, 0], &[0, 0, 0, 1],    // one restart at 0
        &[0x0E, 0xA7, 0xDA, 0x7A],       // meta index
        &[0xDA, 0x7A, 0xBA, 0x5E],       // data index
        &[0x00, 0x14, 0xA3, 1, 2, 3],    // offset 0, length 20, first key
        &[0xCF, 0, 0, 0, 0, 0, 0, 0, 20],
        &[0xCF, 0, 0, 0, 0, 0, 0, 0, 4],
        &[0xCF, 0, 0, 0, 0, 0, 0, 0, 24],
        &[0xCF, 0, 0, 0, 0, 0, 0, 0, 10],
        &[0x0B, 0x50, 0x1E, 0x7E],
    ];
    parts.concat()
}

fn keys(iter: impl Iterator<Item = Result<KeyValue, crate::tablet::TabletError>>) -> Vec<Vec<u8>> {
    iter.map(|kv| kv.unwrap().key.to_vec()).collect()
}

/// # Scenario
/// Find on a hand-built tablet with no header.
///
/// # Starting environment
/// One block holding `[1,2,3] -> [4,5,6]`, zero checksum.
///
/// # Actions
/// `find([1,2,3])` with checksum verification on.
///
/// # Expected behavior
/// Yields the single entry; a zero checksum is never verified.
#[test]
fn inline_fixture_find_with_term() {
    let tablet = open_bytes(inline_tablet(), TabletReaderOptions { verify_checksums: true }).unwrap();
    assert_eq!(tablet.index().len(), 1);
    assert_eq!(tablet.index()[0].length, 20);

    let got: Vec<KeyValue> = tablet.find(Some(&[1u8, 2, 3][..])).unwrap().map(Result::unwrap).collect();
    assert_eq!(got, vec![KeyValue::put(&[1u8, 2, 3][..], &[4u8, 5, 6][..])]);
}

/// # Scenario
/// Snappy-compressed envelope built outside the writer.
///
/// # Starting environment
/// A 13-byte block with no restart points, compressed, envelope flags 1.
///
/// # Actions
/// `TabletReader::read_block`.
///
/// # Expected behavior
/// Decompresses and yields the one entry.
#[test]
fn reader_decodes_compressed_envelope() {
    let block: &[u8] = &[0x00, 0xA3, 1, 2, 3, 0xA3, 4, 5, 6, 0, 0, 0, 0];
    let compressed = snap::raw::Encoder::new().compress_vec(block).unwrap();
    let mut envelope = vec![0x00, 0x01, compressed.len() as u8];
    envelope.extend_from_slice(&compressed);

    let decoded = TabletReader::default().read_block(envelope.into()).unwrap();
    assert_eq!(decoded.flags, BLOCK_FLAG_COMPRESSED);
    assert_eq!(decoded.block.num_restarts(), 0);
    let entries: Vec<KeyValue> = decoded.block.iter().map(Result::unwrap).collect();
    assert_eq!(entries, vec![KeyValue::put(&[1u8, 2, 3][..], &[4u8, 5, 6][..])]);
}

/// # Scenario
/// Every present key is found as the first result, across block boundaries.
///
/// # Starting environment
/// 400 entries in 256-byte blocks.
///
/// # Actions
/// `find(key)` for each key, including the first key of every block.
///
/// # Expected behavior
/// The iterator starts exactly at the key and runs to the end of the tablet.
#[test]
fn find_each_key_runs_to_end() {
    let entries = sample_entries(400);
    let tablet = open_bytes(write_tablet(&entries, small_blocks(true)), TabletReaderOptions::default()).unwrap();

    for (i, kv) in entries.iter().enumerate() {
        let got = keys(tablet.find(Some(kv.key.as_bytes())).unwrap());
        assert_eq!(got.len(), entries.len() - i, "find from {i}");
        assert_eq!(got[0], kv.key.to_vec());
    }

    for entry in tablet.index() {
        let mut iter = tablet.find(Some(&entry.first_key[..])).unwrap();
        assert_eq!(iter.next().unwrap().unwrap().key.as_bytes(), &entry.first_key[..]);
    }
}

/// # Scenario
/// Terms that fall between keys, before the first, and after the last.
///
/// # Starting environment
/// 300 entries `key-00000`..`key-00299` in small blocks.
///
/// # Actions
/// Find `key-00100x`, `a`, `key-99999`, and the empty term.
///
/// # Expected behavior
/// Next greater key; whole tablet; nothing; whole tablet.
#[test]
fn find_between_before_and_after() {
    let entries = sample_entries(300);
    let tablet = open_bytes(write_tablet(&entries, small_blocks(false)), TabletReaderOptions::default()).unwrap();

    let got = keys(tablet.find(Some(&b"key-00100x"[..])).unwrap());
    assert_eq!(got[0], b"key-00101".to_vec());
    assert_eq!(got.len(), 199);

    assert_eq!(keys(tablet.find(Some(&b"a"[..])).unwrap()).len(), 300);
    assert!(keys(tablet.find(Some(&b"key-99999"[..])).unwrap()).is_empty());
    assert_eq!(keys(tablet.find(Some(&b""[..])).unwrap()).len(), 300);
}

/// # Scenario
/// Randomized lookups compared against a linear scan.
///
/// # Starting environment
/// 250 entries with gaps (every third index only).
///
/// # Actions
/// 200 random terms of varying shape.
///
/// # Expected behavior
/// `find(term)` equals the suffix of entries with key `>= term`.
#[test]
fn randomized_find_matches_linear_scan() {
    let entries: Vec<KeyValue> = sample_entries(750).into_iter().step_by(3).collect();
    let tablet = open_bytes(write_tablet(&entries, small_blocks(true)), TabletReaderOptions::default()).unwrap();

    let mut rng = rand::rng();
    for _ in 0..200 {
        let n: u32 = rng.random_range(0..800);
        let term = match rng.random_range(0..3) {
            0 => format!("key-{n:05}"),
            1 => format!("key-{n:05}~"),
            _ => format!("key-{}", n / 10),
        };
        let expected: Vec<Vec<u8>> = entries
            .iter()
            .filter(|kv| kv.key.as_bytes() >= term.as_bytes())
            .map(|kv| kv.key.to_vec())
            .collect();
        assert_eq!(keys(tablet.find(Some(term.as_bytes())).unwrap()), expected, "term {term}");
    }
}

/// # Scenario
/// Iterators outlive the tablet handle.
///
/// # Starting environment
/// A multi-block tablet.
///
/// # Actions
/// Take an iterator, drop the `FileTablet`, then drain.
///
/// # Expected behavior
/// All entries are still produced.
#[test]
fn iterator_outlives_tablet_handle() {
    let entries = sample_entries(200);
    let tablet = open_bytes(write_tablet(&entries, small_blocks(false)), TabletReaderOptions::default()).unwrap();
    let iter = tablet.find(None).unwrap();
    drop(tablet);
    assert_eq!(iter.count(), 200);
}
