//! Dependency resolution and load-order planning
//!
//! Pure functions over registry snapshots: no I/O, no side effects, fully
//! deterministic. Given the same set of entries, `compute_load_order` always
//! yields the same plan, so load order is reproducible across restarts.
//!
//! The plan is a sequence of groups. All plugins in a group can load
//! concurrently; group N+1 must wait for group N. Within a group the order is
//! ascending priority, then lexical name.

use std::collections::{HashMap, HashSet};

/// One node of the dependency graph, distilled from a registry snapshot
#[derive(Debug, Clone)]
pub struct PlanNode {
    pub name: String,
    pub dependencies: Vec<String>,
    pub priority: i32,
    /// Already loaded; counts as a resolved dependency and is never scheduled
    pub satisfied: bool,
}

/// A plugin that cannot be scheduled because of unresolved dependencies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingDependency {
    pub name: String,
    /// The dependency names blocking this plugin, sorted
    pub missing: Vec<String>,
}

/// A dependency cycle, identified by its sorted membership.
///
/// Two reports with the same members describe the same cycle regardless of
/// where the walk entered it; `signature` gives callers a stable key to
/// deduplicate repeated reports against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Member plugin names, sorted lexically
    pub members: Vec<String>,
}

impl CycleReport {
    pub fn signature(&self) -> String {
        self.members.join("\u{1f}")
    }
}

/// Result of a planning pass
#[derive(Debug, Clone, Default)]
pub struct LoadPlan {
    /// Dependency-ordered groups of plugin names
    pub groups: Vec<Vec<String>>,
    /// Plugins excluded for unresolved dependencies
    pub missing: Vec<MissingDependency>,
    /// Dependency cycles found among the schedulable plugins
    pub cycles: Vec<CycleReport>,
}

/// Compute a deterministic load plan.
///
/// Satisfied nodes anchor the graph but are never scheduled. A node is
/// excluded (and reported missing) when a dependency is absent from the node
/// set, or transitively when a dependency is itself excluded or trapped in a
/// cycle. Cycle members themselves are reported separately and stay out of
/// the groups; the rest of the graph still resolves around them.
pub fn compute_load_order(nodes: &[PlanNode]) -> LoadPlan {
    let by_name: HashMap<&str, &PlanNode> =
        nodes.iter().map(|n| (n.name.as_str(), n)).collect();

    let mut excluded: HashMap<String, Vec<String>> = HashMap::new();

    // Direct misses: dependency names nobody registered.
    for node in nodes {
        if node.satisfied {
            continue;
        }
        let absent: Vec<String> = node
            .dependencies
            .iter()
            .filter(|d| !by_name.contains_key(d.as_str()))
            .cloned()
            .collect();
        if !absent.is_empty() {
            excluded.insert(node.name.clone(), absent);
        }
    }

    // Cycles among the remaining schedulable nodes.
    let schedulable: Vec<&PlanNode> = nodes
        .iter()
        .filter(|n| !n.satisfied && !excluded.contains_key(&n.name))
        .collect();
    let cycles = find_cycles(&schedulable);
    let cycle_members: HashSet<&str> = cycles
        .iter()
        .flat_map(|c| c.members.iter().map(String::as_str))
        .collect();

    // Transitive misses: a dependency that exists but is excluded or cyclic
    // will never load, so its dependents are blocked too.
    loop {
        let mut blocked: Vec<(String, Vec<String>)> = Vec::new();
        for node in nodes {
            if node.satisfied
                || excluded.contains_key(&node.name)
                || cycle_members.contains(node.name.as_str())
            {
                continue;
            }
            let unresolvable: Vec<String> = node
                .dependencies
                .iter()
                .filter(|d| {
                    excluded.contains_key(d.as_str()) || cycle_members.contains(d.as_str())
                })
                .cloned()
                .collect();
            if !unresolvable.is_empty() {
                blocked.push((node.name.clone(), unresolvable));
            }
        }
        if blocked.is_empty() {
            break;
        }
        for (name, deps) in blocked {
            excluded.insert(name, deps);
        }
    }

    // Layered topological sort over what is left.
    let mut resolved: HashSet<&str> = nodes
        .iter()
        .filter(|n| n.satisfied)
        .map(|n| n.name.as_str())
        .collect();
    let mut remaining: Vec<&PlanNode> = nodes
        .iter()
        .filter(|n| {
            !n.satisfied
                && !excluded.contains_key(&n.name)
                && !cycle_members.contains(n.name.as_str())
        })
        .collect();

    let mut groups: Vec<Vec<String>> = Vec::new();
    while !remaining.is_empty() {
        let mut ready: Vec<&PlanNode> = remaining
            .iter()
            .filter(|n| {
                n.dependencies
                    .iter()
                    .all(|d| resolved.contains(d.as_str()))
            })
            .copied()
            .collect();

        // Can only be empty if cycle detection missed something; bail rather
        // than spin.
        if ready.is_empty() {
            for node in &remaining {
                excluded.insert(node.name.clone(), node.dependencies.clone());
            }
            break;
        }

        ready.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.name.cmp(&b.name))
        });

        let group: Vec<String> = ready.iter().map(|n| n.name.clone()).collect();
        for name in &group {
            resolved.insert(by_name[name.as_str()].name.as_str());
        }
        remaining.retain(|n| !resolved.contains(n.name.as_str()));
        groups.push(group);
    }

    let mut missing: Vec<MissingDependency> = excluded
        .into_iter()
        .map(|(name, mut deps)| {
            deps.sort();
            deps.dedup();
            MissingDependency {
                name,
                missing: deps,
            }
        })
        .collect();
    missing.sort_by(|a, b| a.name.cmp(&b.name));

    LoadPlan {
        groups,
        missing,
        cycles,
    }
}

/// Find strongly connected components of size > 1 (plus self-loops) with
/// Tarjan's algorithm, iterative to keep deep graphs off the call stack.
fn find_cycles(nodes: &[&PlanNode]) -> Vec<CycleReport> {
    let index_of: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.name.as_str(), i))
        .collect();
    let adjacency: Vec<Vec<usize>> = nodes
        .iter()
        .map(|n| {
            n.dependencies
                .iter()
                .filter_map(|d| index_of.get(d.as_str()).copied())
                .collect()
        })
        .collect();

    let n = nodes.len();
    let mut index = vec![usize::MAX; n];
    let mut lowlink = vec![0usize; n];
    let mut on_stack = vec![false; n];
    let mut stack: Vec<usize> = Vec::new();
    let mut next_index = 0usize;
    let mut components: Vec<Vec<usize>> = Vec::new();

    // Explicit DFS frames: (node, position in its adjacency list).
    for start in 0..n {
        if index[start] != usize::MAX {
            continue;
        }
        let mut frames: Vec<(usize, usize)> = vec![(start, 0)];
        while let Some(&mut (v, ref mut edge)) = frames.last_mut() {
            if *edge == 0 {
                index[v] = next_index;
                lowlink[v] = next_index;
                next_index += 1;
                stack.push(v);
                on_stack[v] = true;
            }
            if let Some(&w) = adjacency[v].get(*edge) {
                *edge += 1;
                if index[w] == usize::MAX {
                    frames.push((w, 0));
                } else if on_stack[w] {
                    lowlink[v] = lowlink[v].min(index[w]);
                }
            } else {
                if lowlink[v] == index[v] {
                    let mut component = Vec::new();
                    loop {
                        let w = stack.pop().expect("tarjan stack underflow");
                        on_stack[w] = false;
                        component.push(w);
                        if w == v {
                            break;
                        }
                    }
                    components.push(component);
                }
                frames.pop();
                if let Some(&(parent, _)) = frames.last() {
                    lowlink[parent] = lowlink[parent].min(lowlink[v]);
                }
            }
        }
    }

    let mut cycles: Vec<CycleReport> = components
        .into_iter()
        .filter(|c| {
            c.len() > 1 || {
                let v = c[0];
                adjacency[v].contains(&v)
            }
        })
        .map(|c| {
            let mut members: Vec<String> =
                c.into_iter().map(|i| nodes[i].name.clone()).collect();
            members.sort();
            CycleReport { members }
        })
        .collect();
    cycles.sort_by(|a, b| a.members.cmp(&b.members));
    cycles
}
