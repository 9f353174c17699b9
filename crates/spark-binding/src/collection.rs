//! 一致性动态集合。
//!
//! # 模块定位（Why）
//! - 多基数引用需要向调用方暴露“当前全部匹配实例”的视图，而实例会在遍历过程中随时到达或离开；
//! - 标准容器的迭代器在并发结构变更下要么失效、要么需要长时间持锁，两者都不可接受。
//!
//! # 核心机制（How）
//! - 元素与所有存活游标的位置表共用一把粗粒度锁，结构变更在锁内以 O(k) 修正游标（k 为存活游标数）；
//! - 元素在锁内克隆、锁外交付，调用方处理元素期间不阻塞写者；
//! - 游标记录自己对 `has_next` 的承诺：承诺“有下一个”后，即使该元素被并发移除，下一次 `next_entry`
//!   也会兑现为占位符 `Ok(None)`；承诺“没有了”后，下一次 `next_entry` 必然返回 [`IterationExhausted`]。
//!
//! # 契约说明（What）
//! - 与游标位置无关的插入/删除不会导致该游标重复或遗漏元素；
//! - 所有变更操作都是全函数：越界下标返回 `None`，不会 panic；
//! - 游标在 `Drop` 时从位置表注销。

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

/// 对已承诺“没有更多元素”的游标调用 `next_entry`。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("dynamic collection cursor has no further elements")]
pub struct IterationExhausted;

/// 元素排序函数。
pub type OrderFn<T> = Arc<dyn Fn(&T, &T) -> CmpOrdering + Send + Sync>;

/// 线程安全、可在遍历期间增删的有序集合。克隆共享同一份存储。
pub struct DynamicCollection<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    ordering: Option<OrderFn<T>>,
    next_cursor: AtomicU64,
}

struct State<T> {
    items: Vec<T>,
    cursors: HashMap<u64, CursorState>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Promise {
    Undecided,
    Next,
    /// 已承诺的元素被并发移除，下一次交付占位符。
    Placeholder,
    Exhausted,
}

#[derive(Debug)]
struct CursorState {
    index: usize,
    promise: Promise,
}

impl<T> State<T> {
    fn on_insert(&mut self, position: usize) {
        for cursor in self.cursors.values_mut() {
            if position < cursor.index
                || (position == cursor.index && cursor.promise == Promise::Next)
            {
                cursor.index += 1;
            }
        }
    }

    fn on_remove(&mut self, position: usize) {
        for cursor in self.cursors.values_mut() {
            if position < cursor.index {
                cursor.index -= 1;
            } else if position == cursor.index && cursor.promise == Promise::Next {
                cursor.promise = Promise::Placeholder;
            }
        }
    }
}

impl<T: Clone> DynamicCollection<T> {
    /// 按追加顺序保存元素。
    pub fn new() -> Self {
        Self::build(None)
    }

    /// 按 `ordering` 有序插入；与已有元素相等时排在其后。
    pub fn with_ordering<F>(ordering: F) -> Self
    where
        F: Fn(&T, &T) -> CmpOrdering + Send + Sync + 'static,
    {
        Self::build(Some(Arc::new(ordering)))
    }

    fn build(ordering: Option<OrderFn<T>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    items: Vec::new(),
                    cursors: HashMap::new(),
                }),
                ordering,
                next_cursor: AtomicU64::new(0),
            }),
        }
    }

    /// 加入元素并返回其落位下标。
    pub fn add(&self, item: T) -> usize {
        let mut state = self.shared.state.lock();
        let position = match &self.shared.ordering {
            Some(ordering) => state
                .items
                .iter()
                .position(|existing| ordering(existing, &item) == CmpOrdering::Greater)
                .unwrap_or(state.items.len()),
            None => state.items.len(),
        };
        state.items.insert(position, item);
        state.on_insert(position);
        position
    }

    /// 在指定下标插入；超出末尾时追加。有序集合同样按给定下标插入，由调用方保证顺序。
    pub fn insert(&self, position: usize, item: T) -> usize {
        let mut state = self.shared.state.lock();
        let position = position.min(state.items.len());
        state.items.insert(position, item);
        state.on_insert(position);
        position
    }

    /// 移除指定下标的元素；越界返回 `None`。
    pub fn remove_at(&self, position: usize) -> Option<T> {
        let mut state = self.shared.state.lock();
        if position >= state.items.len() {
            return None;
        }
        let removed = state.items.remove(position);
        state.on_remove(position);
        Some(removed)
    }

    /// 移除第一个满足谓词的元素。
    pub fn remove_where<P>(&self, predicate: P) -> Option<T>
    where
        P: Fn(&T) -> bool,
    {
        let mut state = self.shared.state.lock();
        let position = state.items.iter().position(predicate)?;
        let removed = state.items.remove(position);
        state.on_remove(position);
        Some(removed)
    }

    /// 原位替换第一个满足谓词的元素并返回旧值；游标位置不受影响。
    pub fn replace_where<P>(&self, predicate: P, item: T) -> Option<T>
    where
        P: Fn(&T) -> bool,
    {
        let mut state = self.shared.state.lock();
        let position = state.items.iter().position(predicate)?;
        Some(std::mem::replace(&mut state.items[position], item))
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().items.is_empty()
    }

    pub fn get(&self, position: usize) -> Option<T> {
        self.shared.state.lock().items.get(position).cloned()
    }

    /// 当前元素的一致快照。
    pub fn snapshot(&self) -> Vec<T> {
        self.shared.state.lock().items.clone()
    }

    /// 查找第一个满足谓词的元素。
    pub fn find<P>(&self, predicate: P) -> Option<T>
    where
        P: Fn(&T) -> bool,
    {
        self.shared
            .state
            .lock()
            .items
            .iter()
            .find(|item| predicate(item))
            .cloned()
    }

    /// 创建从头开始的游标。
    pub fn cursor(&self) -> Cursor<T> {
        let id = self.shared.next_cursor.fetch_add(1, Ordering::Relaxed);
        self.shared.state.lock().cursors.insert(
            id,
            CursorState {
                index: 0,
                promise: Promise::Undecided,
            },
        );
        Cursor {
            shared: Arc::clone(&self.shared),
            id,
        }
    }

    /// 当前存活的游标数量。
    pub fn cursor_count(&self) -> usize {
        self.shared.state.lock().cursors.len()
    }
}

impl<T: Clone + PartialEq> DynamicCollection<T> {
    /// 移除第一个与 `item` 相等的元素，返回是否移除。
    pub fn remove(&self, item: &T) -> bool {
        self.remove_where(|existing| existing == item).is_some()
    }

    pub fn contains(&self, item: &T) -> bool {
        self.shared.state.lock().items.contains(item)
    }
}

impl<T: Clone> Default for DynamicCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for DynamicCollection<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for DynamicCollection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("DynamicCollection")
            .field("items", &state.items)
            .field("cursors", &state.cursors.len())
            .finish()
    }
}

/// 集合上的游标。
///
/// # 教案式说明
/// - **意图 (Why)**：让遍历方在集合持续变化时仍能依赖 `has_next` / `next_entry` 的成对承诺；
/// - **逻辑 (How)**：游标只保存自身编号，真实位置存放在集合的位置表中，由写者在锁内修正；
/// - **契约 (What)**：
///   - `has_next` 返回 `true` 后，下一次 `next_entry` 返回 `Ok(Some(_))` 或占位符 `Ok(None)`；
///   - `has_next` 返回 `false` 后，下一次 `next_entry` 返回 `Err(IterationExhausted)`；
///   - 未调用 `has_next` 时，`next_entry` 按当前状态即时判断；
/// - **风险 (Trade-offs)**：作为 [`Iterator`] 使用时占位符会被跳过，调用方若需感知并发移除应使用显式协议。
pub struct Cursor<T> {
    shared: Arc<Shared<T>>,
    id: u64,
}

impl<T: Clone> Cursor<T> {
    pub fn has_next(&mut self) -> bool {
        let mut state = self.shared.state.lock();
        let len = state.items.len();
        let Some(cursor) = state.cursors.get_mut(&self.id) else {
            return false;
        };
        match cursor.promise {
            Promise::Next | Promise::Placeholder => true,
            Promise::Undecided | Promise::Exhausted => {
                let available = cursor.index < len;
                cursor.promise = if available {
                    Promise::Next
                } else {
                    Promise::Exhausted
                };
                available
            }
        }
    }

    /// 取下一个元素；`Ok(None)` 表示承诺过的元素已被并发移除。
    pub fn next_entry(&mut self) -> Result<Option<T>, IterationExhausted> {
        let mut state = self.shared.state.lock();
        let State { items, cursors } = &mut *state;
        let Some(cursor) = cursors.get_mut(&self.id) else {
            return Err(IterationExhausted);
        };
        let promise = std::mem::replace(&mut cursor.promise, Promise::Undecided);
        match promise {
            Promise::Placeholder => Ok(None),
            Promise::Exhausted => Err(IterationExhausted),
            Promise::Next | Promise::Undecided => match items.get(cursor.index) {
                Some(item) => {
                    cursor.index += 1;
                    Ok(Some(item.clone()))
                }
                None => Err(IterationExhausted),
            },
        }
    }
}

impl<T: Clone> Iterator for Cursor<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        loop {
            match self.next_entry() {
                Ok(Some(item)) => return Some(item),
                Ok(None) => continue,
                Err(IterationExhausted) => return None,
            }
        }
    }
}

impl<T> Drop for Cursor<T> {
    fn drop(&mut self) {
        self.shared.state.lock().cursors.remove(&self.id);
    }
}

impl<T> fmt::Debug for Cursor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xyz() -> DynamicCollection<&'static str> {
        let collection = DynamicCollection::new();
        for item in ["X", "Y", "Z"] {
            collection.add(item);
        }
        collection
    }

    #[test]
    fn removal_before_cursor_neither_repeats_nor_skips() {
        let collection = xyz();
        let mut cursor = collection.cursor();
        assert_eq!(cursor.next_entry(), Ok(Some("X")));
        assert_eq!(collection.remove_at(0), Some("X"));
        assert_eq!(cursor.next_entry(), Ok(Some("Y")));
        assert_eq!(cursor.next_entry(), Ok(Some("Z")));
        assert_eq!(cursor.next_entry(), Err(IterationExhausted));
    }

    #[test]
    fn promised_element_removed_yields_placeholder() {
        let collection = xyz();
        let mut cursor = collection.cursor();
        assert!(cursor.has_next());
        collection.remove_at(0);
        assert_eq!(cursor.next_entry(), Ok(None), "已承诺的元素被移除后应交付占位符");
        assert_eq!(cursor.next_entry(), Ok(Some("Y")));
    }

    #[test]
    fn exhausted_promise_is_honored_then_reevaluated() {
        let collection = DynamicCollection::new();
        let mut cursor = collection.cursor();
        assert!(!cursor.has_next());
        collection.add(1);
        assert_eq!(cursor.next_entry(), Err(IterationExhausted));
        assert!(cursor.has_next(), "再次询问时应重新评估");
        assert_eq!(cursor.next_entry(), Ok(Some(1)));
    }

    #[test]
    fn insertion_at_promised_slot_keeps_promised_element() {
        let collection = xyz();
        let mut cursor = collection.cursor();
        assert!(cursor.has_next());
        collection.insert(0, "W");
        assert_eq!(cursor.next_entry(), Ok(Some("X")));
        let rest: Vec<_> = cursor.collect();
        assert_eq!(rest, vec!["Y", "Z"]);
    }

    #[test]
    fn ordered_insertion_is_stable() {
        let collection = DynamicCollection::with_ordering(|a: &(u8, char), b: &(u8, char)| {
            a.0.cmp(&b.0)
        });
        collection.add((2, 'a'));
        collection.add((1, 'b'));
        collection.add((2, 'c'));
        collection.add((0, 'd'));
        let order: Vec<char> = collection.snapshot().iter().map(|item| item.1).collect();
        assert_eq!(order, vec!['d', 'b', 'a', 'c']);
    }

    #[test]
    fn cursors_deregister_on_drop() {
        let collection = xyz();
        {
            let _first = collection.cursor();
            let _second = collection.cursor();
            assert_eq!(collection.cursor_count(), 2);
        }
        assert_eq!(collection.cursor_count(), 0);
        assert!(collection.remove(&"Y"));
        assert!(!collection.remove(&"Y"));
        assert_eq!(collection.remove_at(7), None);
    }
}
