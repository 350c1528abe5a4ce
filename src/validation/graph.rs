use crate::types::TaskKey;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// Tasks left over after a topological sort: every one of them sits on or
/// behind a dependency cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyCycle {
    pub tasks: Vec<TaskKey>,
}

impl fmt::Display for DependencyCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = self
            .tasks
            .iter()
            .map(TaskKey::value)
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "dependency cycle among: {keys}")
    }
}

/// Kahn's algorithm over `(task, depends_on)` pairs. Dependencies on keys
/// outside the input are ignored here; they are reported as dangling
/// elsewhere. Ties keep input order.
///
/// # Errors
/// Returns the tasks that could not be ordered when the graph has a cycle.
pub fn dependency_order<'a, I>(edges: I) -> Result<Vec<TaskKey>, DependencyCycle>
where
    I: IntoIterator<Item = (&'a TaskKey, &'a [TaskKey])>,
{
    let edges: Vec<(&TaskKey, &[TaskKey])> = edges.into_iter().collect();
    let known: HashSet<&TaskKey> = edges.iter().map(|(key, _)| *key).collect();

    let mut in_degree: HashMap<&TaskKey, usize> = HashMap::new();
    let mut dependents: HashMap<&TaskKey, Vec<&TaskKey>> = HashMap::new();
    for &(key, deps) in &edges {
        let deps: HashSet<&TaskKey> = deps.iter().filter(|d| known.contains(d)).collect();
        in_degree.insert(key, deps.len());
        for dep in deps {
            dependents.entry(dep).or_default().push(key);
        }
    }

    let mut ready: VecDeque<&TaskKey> = edges
        .iter()
        .map(|(key, _)| *key)
        .filter(|key| in_degree.get(key) == Some(&0))
        .collect();
    let mut order = Vec::with_capacity(edges.len());

    while let Some(key) = ready.pop_front() {
        order.push(key.clone());
        for dependent in dependents.get(key).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(*dependent);
                }
            }
        }
    }

    if order.len() == edges.len() {
        return Ok(order);
    }
    let ordered: HashSet<&TaskKey> = order.iter().collect();
    Err(DependencyCycle {
        tasks: edges
            .iter()
            .map(|(key, _)| *key)
            .filter(|key| !ordered.contains(key))
            .cloned()
            .collect(),
    })
}
