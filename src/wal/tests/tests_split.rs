//! Splitting of large transactions across 32 KiB blocks, and tail padding.

#[cfg(test)]
mod tests {
    use crate::wal::tests::helpers::{payload, replay, write_log};
    use crate::wal::{BLOCK_SIZE, HEADER_SIZE};

    fn type_at(data: &[u8], offset: usize) -> u8 {
        data[offset + 4]
    }

    fn len_at(data: &[u8], offset: usize) -> usize {
        u16::from_be_bytes([data[offset + 5], data[offset + 6]]) as usize
    }

    /// # Scenario
    /// A transaction spanning four blocks.
    ///
    /// # Starting environment
    /// Empty log.
    ///
    /// # Actions
    /// Write 100000 bytes.
    ///
    /// # Expected behavior
    /// FIRST, MIDDLE, MIDDLE each filling a whole block, then LAST with the
    /// remaining 1717 bytes; the reader rejoins them byte-for-byte.
    #[test]
    fn split_into_first_middle_last() {
        let tx = payload(100_000, 7);
        let data = write_log(std::slice::from_ref(&tx));
        let full = BLOCK_SIZE - HEADER_SIZE;

        assert_eq!((type_at(&data, 0), len_at(&data, 0)), (2, full));
        assert_eq!((type_at(&data, BLOCK_SIZE), len_at(&data, BLOCK_SIZE)), (3, full));
        assert_eq!((type_at(&data, 2 * BLOCK_SIZE), len_at(&data, 2 * BLOCK_SIZE)), (3, full));
        assert_eq!(
            (type_at(&data, 3 * BLOCK_SIZE), len_at(&data, 3 * BLOCK_SIZE)),
            (4, 100_000 - 3 * full)
        );
        assert_eq!(data.len(), 3 * BLOCK_SIZE + HEADER_SIZE + 100_000 - 3 * full);

        let got = replay(data);
        assert_eq!(got.len(), 1);
        assert_eq!(&got[0].as_ref().unwrap()[..], &tx[..]);
    }

    /// # Scenario
    /// A transaction that exactly fills the rest of a block is not split.
    ///
    /// # Starting environment
    /// Empty log.
    ///
    /// # Actions
    /// Write `BLOCK_SIZE - 7` bytes, then a small transaction.
    ///
    /// # Expected behavior
    /// One FULL record filling block 0; the next record starts block 1.
    #[test]
    fn exact_fit_is_full_record() {
        let big = payload(BLOCK_SIZE - HEADER_SIZE, 1);
        let data = write_log(&[big.clone(), b"next".to_vec()]);

        assert_eq!(type_at(&data, 0), 1);
        assert_eq!(type_at(&data, BLOCK_SIZE), 1);
        assert_eq!(len_at(&data, BLOCK_SIZE), 4);

        let got = replay(data);
        assert_eq!(&got[0].as_ref().unwrap()[..], &big[..]);
        assert_eq!(&got[1].as_ref().unwrap()[..], b"next");
    }

    /// # Scenario
    /// One byte too many for the rest of the block.
    ///
    /// # Starting environment
    /// Empty log.
    ///
    /// # Actions
    /// Write `BLOCK_SIZE - 6` bytes.
    ///
    /// # Expected behavior
    /// FIRST with `BLOCK_SIZE - 7` bytes, then LAST with one byte.
    #[test]
    fn one_byte_over_splits() {
        let tx = payload(BLOCK_SIZE - HEADER_SIZE + 1, 9);
        let data = write_log(std::slice::from_ref(&tx));
        assert_eq!(type_at(&data, 0), 2);
        assert_eq!((type_at(&data, BLOCK_SIZE), len_at(&data, BLOCK_SIZE)), (4, 1));
        assert_eq!(&replay(data)[0].as_ref().unwrap()[..], &tx[..]);
    }

    /// # Scenario
    /// Fewer than seven bytes left in a block.
    ///
    /// # Starting environment
    /// Log whose first record ends 5 bytes before the block boundary.
    ///
    /// # Actions
    /// Write a second transaction.
    ///
    /// # Expected behavior
    /// Five zero bytes of padding, the second record at the start of block 1,
    /// and replay skips the padding.
    #[test]
    fn block_tail_is_padded() {
        let first = payload(BLOCK_SIZE - HEADER_SIZE - 5, 4);
        let data = write_log(&[first.clone(), b"second".to_vec()]);

        assert_eq!(&data[BLOCK_SIZE - 5..BLOCK_SIZE], &[0, 0, 0, 0, 0]);
        assert_eq!(type_at(&data, BLOCK_SIZE), 1);

        let got = replay(data);
        assert_eq!(got.len(), 2);
        assert_eq!(&got[0].as_ref().unwrap()[..], &first[..]);
        assert_eq!(&got[1].as_ref().unwrap()[..], b"second");
    }

    /// # Scenario
    /// Padding is only written by the next transaction.
    ///
    /// # Starting environment
    /// Log ending 5 bytes before a block boundary.
    ///
    /// # Actions
    /// Replay without further writes.
    ///
    /// # Expected behavior
    /// Exactly one transaction, no error for the missing tail.
    #[test]
    fn short_block_tail_at_eof() {
        let first = payload(BLOCK_SIZE - HEADER_SIZE - 5, 4);
        let data = write_log(std::slice::from_ref(&first));
        assert_eq!(data.len(), BLOCK_SIZE - 5);
        let got = replay(data);
        assert_eq!(got.len(), 1);
        assert!(got[0].is_ok());
    }
}
