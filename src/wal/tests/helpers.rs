use bytes::Bytes;
use tracing_subscriber::EnvFilter;

use crate::wal::{LogReader, LogWriter, WalError};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Writes `transactions` into a fresh in-memory log.
pub fn write_log(transactions: &[Vec<u8>]) -> Vec<u8> {
    let mut writer = LogWriter::new(Vec::new(), 0);
    for tx in transactions {
        writer.write_transaction(tx).unwrap();
    }
    writer.into_inner()
}

/// Replays a log image, collecting every result.
pub fn replay(data: Vec<u8>) -> Vec<Result<Bytes, WalError>> {
    LogReader::new(Bytes::from(data)).transactions().collect()
}

/// Hand-encodes one physical record.
pub fn record(code: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(7 + payload.len());
    out.extend_from_slice(&crc32fast::hash(payload).to_be_bytes());
    out.push(code);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
