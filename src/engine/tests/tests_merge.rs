//! Merge iterator: shadowing, tombstones, predicates, and error handling.

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rand::Rng;

    use crate::engine::tests::helpers::init_tracing;
    use crate::engine::{EngineError, MergeIterator, Source};
    use crate::view::KeyValue;

    fn source(entries: Vec<KeyValue>) -> Source {
        Box::new(entries.into_iter().map(Ok))
    }

    fn pairs(iter: MergeIterator) -> Vec<(String, String)> {
        iter.map(|kv| {
            let kv = kv.unwrap();
            let value = kv.value.unwrap();
            (
                String::from_utf8(kv.key.to_vec()).unwrap(),
                String::from_utf8(value.to_vec()).unwrap(),
            )
        })
        .collect()
    }

    fn owned(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// # Scenario
    /// Three sources with overlapping keys and tombstones.
    ///
    /// # Starting environment
    /// Oldest: `a=1 b=1 c=1`; middle: `b=2 d=del`; newest: `c=del e=3`.
    ///
    /// # Actions
    /// Merge all three.
    ///
    /// # Expected behavior
    /// `a=1 b=2 e=3`: the newest source wins per key, and deleted keys vanish.
    #[test]
    fn newest_source_wins_and_tombstones_vanish() {
        init_tracing();
        let merged = MergeIterator::new(vec![
            source(vec![
                KeyValue::put("a", "1"),
                KeyValue::put("b", "1"),
                KeyValue::put("c", "1"),
            ]),
            source(vec![KeyValue::put("b", "2"), KeyValue::tombstone("d")]),
            source(vec![KeyValue::tombstone("c"), KeyValue::put("e", "3")]),
        ])
        .unwrap();

        assert_eq!(pairs(merged), owned(&[("a", "1"), ("b", "2"), ("e", "3")]));
    }

    /// # Scenario
    /// A tombstone in an old source does not hide a newer value.
    ///
    /// # Starting environment
    /// Oldest: `k=del`; newest: `k=v`.
    ///
    /// # Actions
    /// Merge.
    ///
    /// # Expected behavior
    /// `k=v`.
    #[test]
    fn newer_value_resurrects_deleted_key() {
        let merged = MergeIterator::new(vec![
            source(vec![KeyValue::tombstone("k")]),
            source(vec![KeyValue::put("k", "v")]),
        ])
        .unwrap();
        assert_eq!(pairs(merged), owned(&[("k", "v")]));
    }

    /// # Scenario
    /// No sources, and only empty sources.
    ///
    /// # Starting environment
    /// None.
    ///
    /// # Actions
    /// Merge.
    ///
    /// # Expected behavior
    /// Empty streams.
    #[test]
    fn empty_inputs() {
        assert_eq!(MergeIterator::new(Vec::new()).unwrap().count(), 0);
        let merged = MergeIterator::new(vec![source(Vec::new()), source(Vec::new())]).unwrap();
        assert_eq!(merged.count(), 0);
    }

    /// # Scenario
    /// A predicate truncates the stream.
    ///
    /// # Starting environment
    /// Keys `ab1 ab2 ac1` spread over two sources, `ab3` deleted.
    ///
    /// # Actions
    /// Merge with a `starts_with("ab")` predicate.
    ///
    /// # Expected behavior
    /// `ab1 ab2`; the stream ends at `ac1` and stays ended.
    #[test]
    fn predicate_ends_stream() {
        let mut merged = MergeIterator::new(vec![
            source(vec![KeyValue::put("ab1", "x"), KeyValue::put("ac1", "x")]),
            source(vec![KeyValue::put("ab2", "y"), KeyValue::tombstone("ab3")]),
        ])
        .unwrap()
        .with_predicate(Box::new(|kv| kv.key.starts_with(b"ab")));

        assert_eq!(merged.next().unwrap().unwrap().key.as_bytes(), b"ab1");
        assert_eq!(merged.next().unwrap().unwrap().key.as_bytes(), b"ab2");
        assert!(merged.next().is_none());
        assert!(merged.next().is_none());
    }

    /// # Scenario
    /// A source fails mid-stream.
    ///
    /// # Starting environment
    /// One healthy source and one that yields `b` then an error.
    ///
    /// # Actions
    /// Drain the merge.
    ///
    /// # Expected behavior
    /// Entries up to the failure, exactly one error, then the end.
    #[test]
    fn source_error_is_reported_once() {
        let failing: Source = Box::new(
            vec![
                Ok(KeyValue::put("b", "1")),
                Err(EngineError::Internal("boom".into())),
                Ok(KeyValue::put("z", "1")),
            ]
            .into_iter(),
        );
        let merged =
            MergeIterator::new(vec![source(vec![KeyValue::put("a", "1")]), failing]).unwrap();

        let results: Vec<_> = merged.collect();
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
        assert!(matches!(results.last(), Some(Err(EngineError::Internal(_)))));
    }

    /// # Scenario
    /// A source whose first entry is an error.
    ///
    /// # Starting environment
    /// Single failing source.
    ///
    /// # Actions
    /// Build the merge.
    ///
    /// # Expected behavior
    /// Construction fails with that error.
    #[test]
    fn error_in_head_fails_construction() {
        let failing: Source = Box::new(std::iter::once(Err(EngineError::Closed)));
        assert!(matches!(
            MergeIterator::new(vec![failing]),
            Err(EngineError::Closed)
        ));
    }

    /// # Scenario
    /// Randomized sources compared against a last-writer-wins model.
    ///
    /// # Starting environment
    /// Five sources with random sorted keys from `0..60`, about a quarter
    /// of them tombstones.
    ///
    /// # Actions
    /// Merge, and replay the sources oldest-to-newest into a `BTreeMap`.
    ///
    /// # Expected behavior
    /// The merge equals the model's live entries.
    #[test]
    fn randomized_merge_matches_model() {
        let mut rng = rand::rng();
        for _ in 0..50 {
            let mut sources = Vec::new();
            let mut model: BTreeMap<String, Option<String>> = BTreeMap::new();

            for s in 0..5 {
                let mut keys: Vec<u32> = (0..rng.random_range(0..20))
                    .map(|_| rng.random_range(0..60))
                    .collect();
                keys.sort_unstable();
                keys.dedup();

                let mut entries = Vec::new();
                for k in keys {
                    let key = format!("k{k:03}");
                    if rng.random_range(0..4) == 0 {
                        entries.push(KeyValue::tombstone(key.as_str()));
                        model.insert(key, None);
                    } else {
                        let value = format!("s{s}");
                        entries.push(KeyValue::put(key.as_str(), value.as_str()));
                        model.insert(key, Some(value));
                    }
                }
                sources.push(source(entries));
            }

            let expected: Vec<(String, String)> = model
                .into_iter()
                .filter_map(|(k, v)| v.map(|v| (k, v)))
                .collect();
            assert_eq!(pairs(MergeIterator::new(sources).unwrap()), expected);
        }
    }
}
