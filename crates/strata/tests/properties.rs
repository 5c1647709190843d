//! Property tests for change detection, binary search, and rank fusion.

use std::collections::{BTreeMap, HashMap};
use std::fs;

use proptest::prelude::*;
use strata::binary_search::hamming_distance;
use strata::ranking::{RRF_K, RankedList, reciprocal_rank_fusion};
use strata::{BinarySearcher, MerkleTree, SearchResult, find_changed_files};

type Tree = BTreeMap<(String, String), String>;

fn tree_strategy() -> impl Strategy<Value = Tree> {
    prop::collection::btree_map(("[a-c]", "[a-z]{1,6}"), "[a-z ]{0,20}", 1..8)
}

fn write_tree(root: &std::path::Path, tree: &Tree) {
    for ((dir, name), content) in tree {
        let dir = root.join(dir);
        fs::create_dir_all(&dir).expect("failed to create dir");
        fs::write(dir.join(format!("{name}.rs")), content).expect("failed to write file");
    }
}

fn naive_top_k(vectors: &[Vec<u8>], query: &[u8], k: usize) -> Vec<(i64, u32)> {
    let mut scored: Vec<(u32, i64)> = vectors
        .iter()
        .enumerate()
        .map(|(id, v)| {
            let d = v.iter().zip(query).map(|(a, b)| (a ^ b).count_ones()).sum();
            (d, i64::try_from(id).expect("id fits i64"))
        })
        .collect();
    scored.sort_unstable();
    scored.into_iter().take(k).map(|(d, id)| (id, d)).collect()
}

fn ranked(paths: &[usize]) -> Vec<SearchResult> {
    paths
        .iter()
        .map(|p| SearchResult::new(format!("/p/{p}.rs"), 0.0))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn rebuilding_an_unchanged_tree_finds_no_changes(tree in tree_strategy()) {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        write_tree(dir.path(), &tree);

        let first = MerkleTree::build_from_directory(dir.path()).expect("first snapshot");
        let second = MerkleTree::build_from_directory(dir.path()).expect("second snapshot");

        prop_assert_eq!(first.root_hash(), second.root_hash());
        prop_assert!(find_changed_files(Some(&first), Some(&second)).is_empty());
        prop_assert_eq!(
            find_changed_files(None, Some(&second)).len(),
            tree.len()
        );
    }

    #[test]
    fn editing_one_file_reports_only_that_file(tree in tree_strategy()) {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        write_tree(dir.path(), &tree);
        let before = MerkleTree::build_from_directory(dir.path()).expect("snapshot before");

        let ((edited_dir, edited_name), content) = tree.iter().next().expect("non-empty tree");
        let edited = dir.path().join(edited_dir).join(format!("{edited_name}.rs"));
        fs::write(&edited, format!("{content}!")).expect("failed to edit file");
        let after = MerkleTree::build_from_directory(dir.path()).expect("snapshot after");

        let changed = find_changed_files(Some(&before), Some(&after));
        prop_assert_eq!(changed.len(), 1);
        let edited_file = format!("{edited_name}.rs");
        prop_assert!(changed[0].ends_with(&edited_file));
        prop_assert_ne!(before.root_hash(), after.root_hash());
    }

    #[test]
    fn binary_search_matches_exhaustive_scan(
        vectors in prop::collection::vec(prop::collection::vec(any::<u8>(), 4), 1..200),
        query in prop::collection::vec(any::<u8>(), 4),
        k in 1usize..50,
    ) {
        let searcher = BinarySearcher::from_vectors(
            vectors
                .iter()
                .enumerate()
                .map(|(id, v)| (i64::try_from(id).expect("id fits i64"), v.clone())),
        )
        .expect("valid vectors")
        .expect("non-empty input");

        let (ids, distances) = searcher.search(&query, k).expect("search");
        let expected = naive_top_k(&vectors, &query, k);

        prop_assert_eq!(ids.len(), expected.len());
        for ((id, d), (want_id, want_d)) in ids.iter().zip(&distances).zip(&expected) {
            prop_assert_eq!(*id, *want_id);
            prop_assert_eq!(*d, *want_d);
            let stored = &vectors[usize::try_from(*id).expect("id fits usize")];
            prop_assert_eq!(hamming_distance(stored, &query), *d);
        }
    }

    #[test]
    fn fused_scores_follow_the_formula(
        first in Just((0..12usize).collect::<Vec<_>>()).prop_shuffle(),
        second in Just((0..12usize).collect::<Vec<_>>()).prop_shuffle(),
        take_first in 0usize..12,
        take_second in 0usize..12,
        w1 in 0.1f64..10.0,
        w2 in 0.1f64..10.0,
    ) {
        let first = &first[..take_first];
        let second = &second[..take_second];
        let fused = reciprocal_rank_fusion(
            vec![
                RankedList::new("fts", w1, ranked(first)),
                RankedList::new("vector", w2, ranked(second)),
            ],
            RRF_K,
        );

        let mut expected: HashMap<String, f64> = HashMap::new();
        for (list, weight) in [(first, w1 / (w1 + w2)), (second, w2 / (w1 + w2))] {
            for (rank, p) in list.iter().enumerate() {
                #[allow(clippy::cast_precision_loss)]
                let contribution = weight / (RRF_K + (rank + 1) as f64);
                *expected.entry(format!("/p/{p}.rs")).or_default() += contribution;
            }
        }

        prop_assert_eq!(fused.len(), expected.len());
        for pair in fused.windows(2) {
            prop_assert!(pair[0].score >= pair[1].score);
        }
        for result in &fused {
            let want = expected[&result.path.to_string_lossy().into_owned()];
            prop_assert!((result.score - want).abs() < 1e-12);
        }
    }

    #[test]
    fn promoting_a_document_never_lowers_its_score(
        order in Just((0..10usize).collect::<Vec<_>>()).prop_shuffle(),
        from in 1usize..10,
    ) {
        let doc = order[from];
        let mut promoted = order.clone();
        promoted.swap(from, from - 1);

        let score_of = |list: &[usize]| {
            reciprocal_rank_fusion(vec![RankedList::new("fts", 1.0, ranked(list))], RRF_K)
                .into_iter()
                .find(|r| r.path.to_string_lossy() == format!("/p/{doc}.rs"))
                .map(|r| r.score)
                .expect("document present")
        };

        prop_assert!(score_of(&promoted) > score_of(&order));
    }
}
