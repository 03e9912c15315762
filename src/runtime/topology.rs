use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError<K: Debug> {
    #[error("cycle detected: {path:?}")]
    CycleDetected { path: Vec<K> },
}

/// Depth-first topological sort with an explicit work stack.
///
/// `get_dependencies` returns the nodes that must come before a node.
/// Dependencies are visited in the order they are returned, and roots in
/// the order of `nodes`, so the result is deterministic. On a cycle the
/// error carries the nodes on it, in dependency order.
pub fn topological_sort<K>(
    nodes: impl IntoIterator<Item = K>,
    get_dependencies: impl Fn(&K) -> Vec<K>,
) -> Result<Vec<K>, TopologyError<K>>
where
    K: Hash + Eq + Clone + Debug,
{
    let nodes: Vec<K> = nodes.into_iter().collect();
    let dependencies: HashMap<K, Vec<K>> = nodes
        .iter()
        .map(|node| (node.clone(), get_dependencies(node)))
        .collect();

    let mut sorted = Vec::with_capacity(nodes.len());
    let mut visited: HashSet<K> = HashSet::new();
    let mut on_stack: HashSet<K> = HashSet::new();
    // (node, index of the next dependency to visit)
    let mut stack: Vec<(K, usize)> = Vec::new();
    let no_dependencies = Vec::new();

    for root in &nodes {
        if visited.contains(root) {
            continue;
        }
        on_stack.insert(root.clone());
        stack.push((root.clone(), 0));

        while let Some((node, next)) = stack.last_mut() {
            let deps = dependencies.get(node).unwrap_or(&no_dependencies);
            let Some(dep) = deps.get(*next) else {
                if let Some((node, _)) = stack.pop() {
                    on_stack.remove(&node);
                    visited.insert(node.clone());
                    sorted.push(node);
                }
                continue;
            };
            *next += 1;

            if on_stack.contains(dep) {
                let start = stack.iter().position(|(n, _)| n == dep).unwrap_or(0);
                let mut path: Vec<K> = stack[start..].iter().map(|(n, _)| n.clone()).collect();
                path.reverse();
                return Err(TopologyError::CycleDetected { path });
            }
            if !visited.contains(dep) {
                on_stack.insert(dep.clone());
                stack.push((dep.clone(), 0));
            }
        }
    }

    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_chain() {
        // a -> b -> c
        let nodes = vec!["c", "b", "a"];
        let deps = |node: &&str| -> Vec<&str> {
            match *node {
                "b" => vec!["a"],
                "c" => vec!["b"],
                _ => vec![],
            }
        };

        let sorted = topological_sort(nodes, deps).unwrap();
        assert_eq!(sorted, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_diamond() {
        // a -> b -> d
        // a -> c -> d
        let nodes = vec!["a", "b", "c", "d"];
        let deps = |node: &&str| -> Vec<&str> {
            match *node {
                "b" => vec!["a"],
                "c" => vec!["a"],
                "d" => vec!["b", "c"],
                _ => vec![],
            }
        };

        let sorted = topological_sort(nodes, deps).unwrap();
        assert_eq!(sorted, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_independent_nodes_keep_input_order() {
        let sorted = topological_sort(vec![3, 1, 2], |_| Vec::new()).unwrap();
        assert_eq!(sorted, vec![3, 1, 2]);
    }

    #[test]
    fn test_cycle_detection() {
        // a -> b -> c -> a
        let nodes = vec!["x", "a", "b", "c"];
        let deps = |node: &&str| -> Vec<&str> {
            match *node {
                "a" => vec!["c"],
                "b" => vec!["a"],
                "c" => vec!["b"],
                _ => vec![],
            }
        };

        match topological_sort(nodes, deps) {
            Err(TopologyError::CycleDetected { path }) => {
                assert_eq!(path.len(), 3);
                assert!(path.contains(&"a") && path.contains(&"b") && path.contains(&"c"));
            }
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_long_chain() {
        let n = 200_000u32;
        let sorted = topological_sort((0..n).rev(), |node| {
            if *node == 0 {
                Vec::new()
            } else {
                vec![node - 1]
            }
        })
        .unwrap();
        assert_eq!(sorted, (0..n).collect::<Vec<_>>());
    }

    #[test]
    fn test_self_loop() {
        let result = topological_sort(vec!["a"], |_| vec!["a"]);
        assert_eq!(
            result,
            Err(TopologyError::CycleDetected { path: vec!["a"] })
        );
    }
}
