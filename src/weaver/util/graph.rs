/*
 * Copyright (C) 2025 The Weaver Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::collections::HashMap;
use std::error::Error;
use std::fmt;

/// Errors produced while building or sorting a dependency graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// An edge references a vertex that was never added.
    UnknownVertex { from: String, to: String },
    /// The graph contains at least one dependency cycle.
    Cycle,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::UnknownVertex { from, to } => write!(
                f,
                "edge from {from:?} references unknown vertex {to:?}"
            ),
            GraphError::Cycle => write!(f, "dependency graph contains a cycle"),
        }
    }
}

impl Error for GraphError {}

/// Directed acyclic graph over resource names.
///
/// An edge from `A` to `B` records that `A` depends on `B`. Vertices keep
/// their insertion order so `topo_sort` is deterministic for identical input.
#[derive(Debug, Default)]
pub struct Graph {
    names: Vec<String>,
    index: HashMap<String, usize>,
    dependencies: Vec<Vec<usize>>,
}

impl Graph {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            names: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            dependencies: Vec::with_capacity(capacity),
        }
    }

    /// Adds a vertex. Adding the same name twice is a no-op.
    pub fn add_vertex(&mut self, name: &str) {
        if self.index.contains_key(name) {
            return;
        }
        self.index.insert(name.to_string(), self.names.len());
        self.names.push(name.to_string());
        self.dependencies.push(Vec::new());
    }

    /// Adds an edge recording that `from` depends on `to`.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), GraphError> {
        let unknown = |from: &str, to: &str| GraphError::UnknownVertex {
            from: from.to_string(),
            to: to.to_string(),
        };
        let from_idx = *self.index.get(from).ok_or_else(|| unknown(from, to))?;
        let to_idx = *self.index.get(to).ok_or_else(|| unknown(from, to))?;
        if !self.dependencies[from_idx].contains(&to_idx) {
            self.dependencies[from_idx].push(to_idx);
        }
        Ok(())
    }

    /// Returns the dependency names of `name`, in edge insertion order.
    pub fn dependencies_of(&self, name: &str) -> &[usize] {
        match self.index.get(name) {
            Some(idx) => &self.dependencies[*idx],
            None => &[],
        }
    }

    pub fn name_of(&self, idx: usize) -> &str {
        &self.names[idx]
    }

    /// Produces a linear order in which every dependency precedes its
    /// dependents. Ties break by vertex insertion order.
    pub fn topo_sort(&self) -> Result<Vec<String>, GraphError> {
        let count = self.names.len();
        let mut indegree = vec![0usize; count];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
        for (from, deps) in self.dependencies.iter().enumerate() {
            indegree[from] = deps.len();
            for &to in deps {
                dependents[to].push(from);
            }
        }

        // Scanning the ready list from the lowest insertion index keeps the
        // output stable without a priority queue; bundles are small.
        let mut ready: Vec<usize> = (0..count).filter(|&v| indegree[v] == 0).collect();
        let mut sorted = Vec::with_capacity(count);
        while let Some(position) = ready
            .iter()
            .enumerate()
            .min_by_key(|(_, &v)| v)
            .map(|(pos, _)| pos)
        {
            let vertex = ready.swap_remove(position);
            sorted.push(self.names[vertex].clone());
            for &dependent in &dependents[vertex] {
                indegree[dependent] -= 1;
                if indegree[dependent] == 0 {
                    ready.push(dependent);
                }
            }
        }

        if sorted.len() != count {
            return Err(GraphError::Cycle);
        }
        Ok(sorted)
    }
}
