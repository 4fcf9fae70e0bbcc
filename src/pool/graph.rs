//! Dependency graph over a worker group's tasks.
//!
//! Built once before dispatch; duplicate ids, unknown dependencies and cycles
//! are configuration errors and fail the phase before any worker starts.

use std::collections::HashMap;

use super::task::TaskDescriptor;
use crate::errors::PoolError;

pub type TaskIndex = usize;

#[derive(Debug, Clone)]
pub struct TaskGraph {
    tasks: Vec<TaskDescriptor>,
    index_map: HashMap<String, TaskIndex>,
    /// index -> tasks blocked by it
    forward_edges: Vec<Vec<TaskIndex>>,
    /// index -> tasks it is blocked by
    reverse_edges: Vec<Vec<TaskIndex>>,
}

impl TaskGraph {
    pub fn build(tasks: Vec<TaskDescriptor>) -> Result<Self, PoolError> {
        let mut index_map = HashMap::new();
        for (i, task) in tasks.iter().enumerate() {
            if index_map.insert(task.id.clone(), i).is_some() {
                return Err(PoolError::DuplicateTask {
                    id: task.id.clone(),
                });
            }
        }

        let mut forward_edges: Vec<Vec<TaskIndex>> = vec![Vec::new(); tasks.len()];
        let mut reverse_edges: Vec<Vec<TaskIndex>> = vec![Vec::new(); tasks.len()];
        for (to_idx, task) in tasks.iter().enumerate() {
            for dep in &task.blocked_by {
                let from_idx = *index_map
                    .get(dep)
                    .ok_or_else(|| PoolError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    })?;
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let graph = Self {
            tasks,
            index_map,
            forward_edges,
            reverse_edges,
        };
        graph.validate_no_cycles()?;
        Ok(graph)
    }

    /// Kahn's algorithm; leftover in-degree marks the tasks on a cycle.
    fn validate_no_cycles(&self) -> Result<(), PoolError> {
        let mut in_degree: Vec<usize> = self.reverse_edges.iter().map(Vec::len).collect();
        let mut queue: Vec<TaskIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;
        while let Some(node) = queue.pop() {
            processed += 1;
            for &dependent in &self.forward_edges[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != self.tasks.len() {
            let tasks = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| self.tasks[i].id.clone())
                .collect();
            return Err(PoolError::DependencyCycle { tasks });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> &[TaskDescriptor] {
        &self.tasks
    }

    pub fn index_of(&self, id: &str) -> Option<TaskIndex> {
        self.index_map.get(id).copied()
    }

    /// Ids of tasks directly blocked by `id`.
    pub fn dependents(&self, id: &str) -> Vec<String> {
        self.index_of(id)
            .map(|i| {
                self.forward_edges[i]
                    .iter()
                    .map(|&d| self.tasks[d].id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn into_tasks(self) -> Vec<TaskDescriptor> {
        self.tasks
    }
}
