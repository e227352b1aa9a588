//! Task transition graph.
//!
//! Uses `petgraph` to model the transitions of a direct workflow. Unlike a
//! plain DAG, cycles are legal (a task may loop back on error), so the graph
//! is used for reference checking, start-task discovery, inbound lookups for
//! joins and reachability warnings rather than for topological ordering.

use std::collections::HashMap;

use conflux_types::definition::{TaskSpec, Transition, WorkflowSpec};
use conflux_types::execution::TransitionEvent;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use petgraph::Direction;

use super::definition::WorkflowError;

/// Directed graph of task transitions, borrowed from a [`WorkflowSpec`].
#[derive(Debug)]
pub struct TaskGraph<'a> {
    spec: &'a WorkflowSpec,
    graph: DiGraph<&'a str, TransitionEvent>,
    nodes: HashMap<&'a str, NodeIndex>,
}

impl<'a> TaskGraph<'a> {
    /// Build the graph. Fails if a transition names an unknown task.
    pub fn build(spec: &'a WorkflowSpec) -> Result<Self, WorkflowError> {
        let mut graph = DiGraph::new();
        let mut nodes = HashMap::with_capacity(spec.tasks.len());
        for task in &spec.tasks {
            nodes.insert(task.name.as_str(), graph.add_node(task.name.as_str()));
        }

        for task in &spec.tasks {
            let from = nodes[task.name.as_str()];
            for (event, transitions) in transitions_of(task) {
                for transition in transitions {
                    if transition.command().is_some() {
                        continue;
                    }
                    let to = nodes.get(transition.task.as_str()).ok_or_else(|| {
                        WorkflowError::UnknownTask(format!(
                            "task '{}' transitions to unknown task '{}'",
                            task.name, transition.task
                        ))
                    })?;
                    graph.add_edge(from, *to, event);
                }
            }
        }

        Ok(Self { spec, graph, nodes })
    }

    /// Tasks without inbound transitions, in definition order.
    pub fn start_tasks(&self) -> Vec<&'a TaskSpec> {
        self.spec
            .tasks
            .iter()
            .filter(|task| {
                self.graph
                    .neighbors_directed(self.nodes[task.name.as_str()], Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect()
    }

    /// Names of tasks with a transition into `name`, in definition order.
    pub fn inbound(&self, name: &str) -> Vec<&'a str> {
        let Some(&node) = self.nodes.get(name) else {
            return Vec::new();
        };
        let mut inbound: Vec<&'a str> = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .map(|idx| self.graph[idx])
            .collect();
        inbound.sort_by_key(|n| self.spec.tasks.iter().position(|t| t.name == *n));
        inbound.dedup();
        inbound
    }

    /// Tasks that no start task can reach.
    pub fn unreachable_tasks(&self) -> Vec<&'a str> {
        let mut reached = vec![false; self.graph.node_count()];
        for start in self.start_tasks() {
            let mut bfs = Bfs::new(&self.graph, self.nodes[start.name.as_str()]);
            while let Some(idx) = bfs.next(&self.graph) {
                reached[idx.index()] = true;
            }
        }
        self.spec
            .tasks
            .iter()
            .filter(|task| !reached[self.nodes[task.name.as_str()].index()])
            .map(|task| task.name.as_str())
            .collect()
    }
}

fn transitions_of(task: &TaskSpec) -> [(TransitionEvent, &[Transition]); 4] {
    [
        (TransitionEvent::OnSuccess, task.on_success.as_slice()),
        (TransitionEvent::OnError, task.on_error.as_slice()),
        (TransitionEvent::OnComplete, task.on_complete.as_slice()),
        (TransitionEvent::OnSkip, task.on_skip.as_slice()),
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(yaml: &str) -> WorkflowSpec {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    #[test]
    fn test_linear_chain_has_single_start() {
        let spec = spec(
            r#"
name: chain
tasks:
  - name: a
    on-success: b
  - name: b
    on-success: c
  - name: c
"#,
        );
        let graph = TaskGraph::build(&spec).unwrap();
        let starts: Vec<&str> = graph.start_tasks().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(starts, vec!["a"]);
        assert_eq!(graph.inbound("c"), vec!["b"]);
        assert!(graph.unreachable_tasks().is_empty());
    }

    #[test]
    fn test_independent_tasks_all_start_in_definition_order() {
        let spec = spec(
            r#"
name: fan
tasks:
  - name: z
  - name: a
  - name: m
"#,
        );
        let graph = TaskGraph::build(&spec).unwrap();
        let starts: Vec<&str> = graph.start_tasks().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(starts, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_join_inbound_in_definition_order() {
        let spec = spec(
            r#"
name: diamond
tasks:
  - name: a
    on-success: [c, b]
  - name: b
    on-success: d
  - name: c
    on-complete: d
  - name: d
    join: all
"#,
        );
        let graph = TaskGraph::build(&spec).unwrap();
        assert_eq!(graph.inbound("d"), vec!["b", "c"]);
        assert!(graph.inbound("missing").is_empty());
    }

    #[test]
    fn test_cycles_are_allowed() {
        let spec = spec(
            r#"
name: retry-loop
tasks:
  - name: setup
    on-success: work
  - name: work
    on-error: work
"#,
        );
        let graph = TaskGraph::build(&spec).unwrap();
        assert_eq!(graph.start_tasks().len(), 1);
        assert_eq!(graph.inbound("work"), vec!["setup", "work"]);
    }

    #[test]
    fn test_unknown_transition_target() {
        let spec = spec(
            r#"
name: broken
tasks:
  - name: a
    on-error: nowhere
"#,
        );
        let err = TaskGraph::build(&spec).unwrap_err();
        assert!(err.to_string().contains("unknown task 'nowhere'"));
    }

    #[test]
    fn test_unreachable_cycle_is_reported() {
        let spec = spec(
            r#"
name: island
tasks:
  - name: a
  - name: b
    on-success: c
  - name: c
    on-success: b
"#,
        );
        let graph = TaskGraph::build(&spec).unwrap();
        assert_eq!(graph.unreachable_tasks(), vec!["b", "c"]);
    }
}
