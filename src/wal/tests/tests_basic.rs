//! Basic write / replay cycle of the transaction log.

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tempfile::TempDir;

    use crate::storage::{DiskStorage, Storage};
    use crate::wal::tests::helpers::{init_tracing, payload, record, replay, write_log};
    use crate::wal::{LogReader, LogWriter};

    /// # Scenario
    /// Exact bytes of a single small transaction.
    ///
    /// # Starting environment
    /// Empty log.
    ///
    /// # Actions
    /// Write `hello`.
    ///
    /// # Expected behavior
    /// One FULL record: big-endian CRC32 of the payload, type 1, length 5, payload.
    #[test]
    fn single_record_layout() {
        init_tracing();
        let data = write_log(&[b"hello".to_vec()]);
        assert_eq!(data.len(), 12);
        assert_eq!(&data[..4], &crc32fast::hash(b"hello").to_be_bytes());
        assert_eq!(&data[4..7], &[0x01, 0x00, 0x05]);
        assert_eq!(&data[7..], b"hello");
        assert_eq!(data, record(1, b"hello"));
    }

    /// # Scenario
    /// Several transactions, including an empty one, replay in order.
    ///
    /// # Starting environment
    /// Empty log.
    ///
    /// # Actions
    /// Write `a`, an empty transaction, a 1000-byte payload, then `z`; replay.
    ///
    /// # Expected behavior
    /// The same four byte strings in the same order.
    #[test]
    fn replay_in_order() {
        init_tracing();
        let txs = vec![b"a".to_vec(), Vec::new(), payload(1000, 3), b"z".to_vec()];
        let got: Vec<Bytes> = replay(write_log(&txs)).into_iter().map(Result::unwrap).collect();
        assert_eq!(got.len(), 4);
        for (got, want) in got.iter().zip(&txs) {
            assert_eq!(&got[..], &want[..]);
        }
    }

    /// # Scenario
    /// Empty and header-short logs.
    ///
    /// # Starting environment
    /// A zero-byte log and a six-byte log.
    ///
    /// # Actions
    /// Replay both.
    ///
    /// # Expected behavior
    /// No transactions and no errors.
    #[test]
    fn empty_log_has_no_transactions() {
        assert!(replay(Vec::new()).is_empty());
        assert!(replay(vec![0; 6]).is_empty());
    }

    /// # Scenario
    /// Appending to an existing log continues the block layout.
    ///
    /// # Starting environment
    /// A log holding one 20000-byte transaction.
    ///
    /// # Actions
    /// Open a second writer at the existing length and append a 20000-byte
    /// transaction that must split at the block boundary.
    ///
    /// # Expected behavior
    /// Replay yields both transactions intact.
    #[test]
    fn append_continues_block_layout() {
        let first = payload(20000, 1);
        let second = payload(20000, 2);
        let data = write_log(std::slice::from_ref(&first));

        let position = data.len() as u64;
        let mut writer = LogWriter::new(data, position);
        writer.write_transaction(&second).unwrap();
        let data = writer.into_inner();

        // Second transaction starts as FIRST and continues as LAST in block 1.
        assert_eq!(data[20007 + 4], 2);
        assert_eq!(data[32768 + 4], 4);

        let got: Vec<Bytes> = replay(data).into_iter().map(Result::unwrap).collect();
        assert_eq!(&got[0][..], &first[..]);
        assert_eq!(&got[1][..], &second[..]);
    }

    /// # Scenario
    /// Round-trip through on-disk storage.
    ///
    /// # Starting environment
    /// Temporary directory with `DiskStorage`.
    ///
    /// # Actions
    /// Write three transactions through a storage channel, sync, reopen for
    /// append, write one more, then read the file back.
    ///
    /// # Expected behavior
    /// All four transactions replay in order.
    #[test]
    fn disk_roundtrip_with_append() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let storage = DiskStorage::new(tmp.path());

        let txs: Vec<Vec<u8>> = (0..4).map(|i| payload(5000 * (i + 1), i as u8)).collect();

        let mut writer = LogWriter::new(storage.create("write.log").unwrap(), 0);
        for tx in &txs[..3] {
            writer.write_transaction(tx).unwrap();
        }
        writer.flush().unwrap();
        writer.get_mut().sync().unwrap();
        drop(writer);

        let channel = storage.append("write.log").unwrap();
        let position = channel.position();
        let mut writer = LogWriter::new(channel, position);
        writer.write_transaction(&txs[3]).unwrap();
        writer.flush().unwrap();
        drop(writer);

        let data = storage.open("write.log").unwrap().read_all().unwrap();
        let got: Vec<Bytes> = LogReader::new(data)
            .transactions()
            .map(Result::unwrap)
            .collect();
        assert_eq!(got.len(), 4);
        for (got, want) in got.iter().zip(&txs) {
            assert_eq!(&got[..], &want[..]);
        }
    }
}
