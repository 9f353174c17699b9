//! 启动顺序的拓扑排序。
//!
//! # 教案式说明
//! - **意图 (Why)**：启动阶段需要让被依赖者先于依赖者初始化；待排序集合往往只是完整组件图的一部分，
//!   中间环节可能不在集合中（A → B → C，只排 A 与 C），此时仍必须保证 C 在 A 之前；
//! - **逻辑 (How)**：
//!   1. 对每个成员沿完整依赖函数做深度优先遍历，收集可达的其他成员，得到“传递可达”边；
//!   2. 在这些边上执行 Kahn 算法，同层按输入位置出队，保证同一输入得到同一输出；
//! - **契约 (What)**：依赖在前；无依赖关系的成员保持输入相对顺序；存在环时返回
//!   [`OrderingError::Cycle`] 而不会无限循环；
//! - **风险 (Trade-offs)**：可达性计算为 O(n·(V+E))，面向启动期的组件规模。

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::cmp::Reverse;
use std::fmt;
use std::hash::Hash;

use thiserror::Error;

/// 排序失败。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum OrderingError {
    /// 成员之间存在依赖环，`members` 为无法排出的成员（按输入顺序）。
    #[error("dependency cycle among {members:?}")]
    Cycle { members: Vec<String> },
    /// 输入中出现重复键。
    #[error("duplicate component `{key}` in ordering input")]
    DuplicateKey { key: String },
}

/// 按传递依赖排序的无状态工具。
#[derive(Clone, Copy, Debug, Default)]
pub struct TopologicalOrderer;

impl TopologicalOrderer {
    /// 排序 `items`。
    ///
    /// - `key` 取出成员的标识；
    /// - `dependencies` 返回任意标识（不限于成员）的直接依赖。
    pub fn sort<T, K, FK, FD>(items: Vec<T>, key: FK, dependencies: FD) -> Result<Vec<T>, OrderingError>
    where
        K: Clone + Eq + Hash + fmt::Display,
        FK: Fn(&T) -> K,
        FD: Fn(&K) -> Vec<K>,
    {
        let keys: Vec<K> = items.iter().map(&key).collect();
        let mut position: HashMap<K, usize> = HashMap::with_capacity(keys.len());
        for (index, item_key) in keys.iter().enumerate() {
            if position.insert(item_key.clone(), index).is_some() {
                return Err(OrderingError::DuplicateKey {
                    key: item_key.to_string(),
                });
            }
        }

        // dependents[j]：必须排在 j 之后的成员。
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); keys.len()];
        let mut in_degree = vec![0_usize; keys.len()];
        for (index, root) in keys.iter().enumerate() {
            for prerequisite in reachable_members(root, &position, &dependencies) {
                dependents[prerequisite].push(index);
                in_degree[index] += 1;
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(index, _)| Reverse(index))
            .collect();
        let mut order = Vec::with_capacity(keys.len());
        while let Some(Reverse(index)) = ready.pop() {
            order.push(index);
            for &dependent in &dependents[index] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        if order.len() != keys.len() {
            let placed: HashSet<usize> = order.iter().copied().collect();
            let members = keys
                .iter()
                .enumerate()
                .filter(|(index, _)| !placed.contains(index))
                .map(|(_, member)| member.to_string())
                .collect();
            return Err(OrderingError::Cycle { members });
        }

        let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
        Ok(order
            .into_iter()
            .filter_map(|index| slots[index].take())
            .collect())
    }
}

/// 从 `root` 出发可达的成员下标，环回到 `root` 自身时也包含 `root`。
fn reachable_members<K, FD>(root: &K, position: &HashMap<K, usize>, dependencies: &FD) -> Vec<usize>
where
    K: Clone + Eq + Hash,
    FD: Fn(&K) -> Vec<K>,
{
    let mut visited: HashSet<K> = HashSet::new();
    let mut stack: Vec<K> = dependencies(root);
    let mut found = Vec::new();
    while let Some(next) = stack.pop() {
        if !visited.insert(next.clone()) {
            continue;
        }
        if let Some(&index) = position.get(&next) {
            found.push(index);
        }
        stack.extend(dependencies(&next));
    }
    found
}
