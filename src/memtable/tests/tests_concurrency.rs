#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use crate::memtable::{MemTable, Value};
    use crate::view::ByteView;

    /// # Scenario
    /// Several writers on disjoint keys.
    ///
    /// # Starting environment
    /// Shared memtable, 4 threads.
    ///
    /// # Actions
    /// Each thread sets 500 keys prefixed by its id.
    ///
    /// # Expected behavior
    /// All 2000 keys present, iteration strictly ascending, size is the exact total.
    #[test]
    fn concurrent_writers() {
        let mem = Arc::new(MemTable::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let mem = Arc::clone(&mem);
                thread::spawn(move || {
                    for i in 0..500 {
                        let key = format!("t{t}-{i:04}");
                        mem.set(ByteView::from(key.as_str()), ByteView::from("v"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(mem.len(), 2000);
        assert_eq!(mem.size(), 2000 * (7 + 1));
        let keys: Vec<ByteView> = mem.find(None).map(|kv| kv.key).collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    /// # Scenario
    /// Readers scan while a writer overwrites.
    ///
    /// # Starting environment
    /// 200 keys valued `old`.
    ///
    /// # Actions
    /// One thread rewrites every key to `new` while another scans repeatedly.
    ///
    /// # Expected behavior
    /// Every scan sees all 200 keys exactly once, each with `old` or `new`.
    #[test]
    fn scans_during_overwrites() {
        let mem = Arc::new(MemTable::new());
        for i in 0..200 {
            mem.set(ByteView::from(format!("k{i:03}").as_str()), ByteView::from("old"));
        }

        let writer = {
            let mem = Arc::clone(&mem);
            thread::spawn(move || {
                for i in 0..200 {
                    mem.set(ByteView::from(format!("k{i:03}").as_str()), ByteView::from("new"));
                }
            })
        };

        for _ in 0..20 {
            let entries: Vec<_> = mem.find(None).collect();
            assert_eq!(entries.len(), 200);
            for kv in entries {
                let value = kv.value.unwrap();
                assert!(value.as_bytes() == b"old" || value.as_bytes() == b"new");
            }
        }
        writer.join().unwrap();
        assert_eq!(mem.get(b"k199"), Some(Value::Present(ByteView::from("new"))));
    }
}
