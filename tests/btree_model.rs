use anyhow::Result;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

use pageindex::access::btree::{BPlusTree, BPlusTreeConfig, KeyValue, KeyValueCodec, TreeContext};
use pageindex::access::freelist::{ReuseList, ReuseListImpl};
use pageindex::access::structure::DataStructure;
use pageindex::storage::{PageMemory, PageMemoryConfig};

#[derive(Debug, Clone)]
enum Op {
    Put(u64, u64),
    Remove(u64),
    RemoveCeil(u64),
    Find(u64),
    Range(u64, u64),
}

fn op() -> impl Strategy<Value = Op> {
    let key = 0u64..200;
    prop_oneof![
        4 => (key.clone(), any::<u64>()).prop_map(|(k, v)| Op::Put(k, v)),
        3 => key.clone().prop_map(Op::Remove),
        1 => key.clone().prop_map(Op::RemoveCeil),
        1 => key.clone().prop_map(Op::Find),
        1 => (key.clone(), key).prop_map(|(a, b)| Op::Range(a.min(b), a.max(b))),
    ]
}

fn new_tree(max: usize) -> Result<BPlusTree<KeyValueCodec>> {
    let mem = PageMemory::new(PageMemoryConfig {
        page_size: 1024,
        partition: 0,
    })?;
    let reuse: Arc<dyn ReuseList> = Arc::new(ReuseListImpl::create("reuse", mem.clone(), None)?);
    BPlusTree::create(
        BPlusTreeConfig {
            name: "model".to_string(),
            max_items_per_page: Some(max),
        },
        DataStructure::new(mem, None, Some(reuse)),
        Arc::new(TreeContext::new()),
        KeyValueCodec,
    )
}

fn run(ops: &[Op], max: usize) -> Result<()> {
    let tree = new_tree(max)?;
    let mut model = BTreeMap::new();

    for op in ops {
        match *op {
            Op::Put(k, v) => {
                let old = tree.put(KeyValue::new(k, v))?;
                assert_eq!(old.map(|r| r.value), model.insert(k, v), "put {}", k);
            }
            Op::Remove(k) => {
                let removed = tree.remove(&KeyValue::lookup(k))?;
                assert_eq!(removed.map(|r| r.value), model.remove(&k), "remove {}", k);
            }
            Op::RemoveCeil(k) => {
                let removed = tree.remove_ceil(&KeyValue::lookup(k), None)?;
                let expected = model.range(k..).next().map(|(k, v)| (*k, *v));
                if let Some((key, _)) = expected {
                    model.remove(&key);
                }
                assert_eq!(removed.map(|r| (r.key, r.value)), expected, "remove ceil {}", k);
            }
            Op::Find(k) => {
                let found = tree.find_one(&KeyValue::lookup(k))?;
                assert_eq!(found.map(|r| r.value), model.get(&k).copied(), "find {}", k);
            }
            Op::Range(a, b) => {
                let rows: Vec<(u64, u64)> = tree
                    .find(Some(&KeyValue::lookup(a)), Some(&KeyValue::lookup(b)))?
                    .map(|r| r.map(|r| (r.key, r.value)))
                    .collect::<Result<_>>()?;
                let expected: Vec<(u64, u64)> = model.range(a..=b).map(|(k, v)| (*k, *v)).collect();
                assert_eq!(rows, expected, "range {}..={}", a, b);
            }
        }
    }

    tree.validate_tree()?;
    assert_eq!(tree.size()?, model.len());
    let all: Vec<u64> = tree
        .find(None, None)?
        .map(|r| r.map(|r| r.key))
        .collect::<Result<_>>()?;
    assert_eq!(all, model.keys().copied().collect::<Vec<_>>());
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_tree_matches_btreemap(ops in prop::collection::vec(op(), 1..600), max in 3usize..8) {
        if let Err(e) = run(&ops, max) {
            return Err(TestCaseError::fail(format!("{:#}", e)));
        }
    }
}

#[test]
fn test_fill_then_drain() -> Result<()> {
    let mut ops: Vec<Op> = (0..200).map(|k| Op::Put((k * 37) % 200, k)).collect();
    ops.extend((0..200).map(|k| Op::Remove((k * 53) % 200)));
    run(&ops, 3)
}
