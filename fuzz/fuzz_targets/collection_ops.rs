#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use spark_binding::{Cursor, DynamicCollection, IterationExhausted};

/// Fuzz 指令：对动态集合与若干游标的交错操作。
///
/// - **Why**：游标位置由写者在锁内修正，增删与前进的任意交错都必须保持成对承诺；
/// - **How**：集合只追加递增编号，游标交付序列因此必须严格递增；
/// - **What**：不 panic；`has_next` 的答案约束下一次 `next_entry`；交付编号单调。
#[derive(Debug, Arbitrary)]
enum CollectionOp {
    Add,
    Insert { position: u8 },
    RemoveAt { position: u8 },
    OpenCursor,
    DropCursor { cursor: u8 },
    HasNext { cursor: u8 },
    NextEntry { cursor: u8 },
}

struct Tracked {
    cursor: Cursor<u32>,
    promised: Option<bool>,
    last: Option<u32>,
}

fuzz_target!(|ops: Vec<CollectionOp>| {
    let collection = DynamicCollection::new();
    let mut cursors: Vec<Tracked> = Vec::new();
    let mut next_id = 0_u32;
    // 中间插入会打破编号单调，此后只检查承诺。
    let mut append_only = true;

    for op in ops.into_iter().take(256) {
        match op {
            CollectionOp::Add => {
                collection.add(next_id);
                next_id += 1;
            }
            CollectionOp::Insert { position } => {
                let len = collection.len();
                let position = usize::from(position) % (len + 1);
                if position != len {
                    append_only = false;
                }
                collection.insert(position, next_id);
                next_id += 1;
            }
            CollectionOp::RemoveAt { position } => {
                let len = collection.len();
                if len > 0 {
                    assert!(collection.remove_at(usize::from(position) % len).is_some());
                } else {
                    assert!(collection.remove_at(usize::from(position)).is_none());
                }
            }
            CollectionOp::OpenCursor => {
                if cursors.len() < 8 {
                    cursors.push(Tracked {
                        cursor: collection.cursor(),
                        promised: None,
                        last: None,
                    });
                }
            }
            CollectionOp::DropCursor { cursor } => {
                if !cursors.is_empty() {
                    let index = usize::from(cursor) % cursors.len();
                    cursors.swap_remove(index);
                }
            }
            CollectionOp::HasNext { cursor } => {
                if let Some(tracked) = pick(&mut cursors, cursor) {
                    tracked.promised = Some(tracked.cursor.has_next());
                }
            }
            CollectionOp::NextEntry { cursor } => {
                if let Some(tracked) = pick(&mut cursors, cursor) {
                    let outcome = tracked.cursor.next_entry();
                    match tracked.promised.take() {
                        Some(true) => assert!(outcome.is_ok()),
                        Some(false) => assert_eq!(outcome, Err(IterationExhausted)),
                        None => {}
                    }
                    if let Ok(Some(value)) = outcome {
                        if append_only && let Some(last) = tracked.last {
                            assert!(value > last, "交付编号必须单调：{last} 之后得到 {value}");
                        }
                        tracked.last = Some(value);
                    }
                }
            }
        }
    }
    assert_eq!(collection.cursor_count(), cursors.len());
});

fn pick(cursors: &mut [Tracked], cursor: u8) -> Option<&mut Tracked> {
    if cursors.is_empty() {
        return None;
    }
    let index = usize::from(cursor) % cursors.len();
    cursors.get_mut(index)
}
