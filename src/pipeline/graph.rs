use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use crate::adapters::ToolAdapter;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("task '{0}' is defined more than once")]
    DuplicateTask(String),

    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("dependency cycle through task '{0}'")]
    Cycle(String),

    #[error("no adapter registered for tool '{0}'")]
    MissingAdapter(String),
}

/// One unit of work: a tool adapter plus the tasks it waits for.
#[derive(Clone)]
pub struct Task {
    pub name: String,
    pub dependencies: Vec<String>,
    pub adapter: Arc<dyn ToolAdapter>,
}

impl Task {
    pub fn new(adapter: Arc<dyn ToolAdapter>) -> Self {
        Self {
            name: adapter.name().to_string(),
            dependencies: Vec::new(),
            adapter,
        }
    }

    pub fn depends_on(mut self, dependencies: &[&str]) -> Self {
        for dependency in dependencies {
            if !self.dependencies.iter().any(|d| d == dependency) {
                self.dependencies.push(dependency.to_string());
            }
        }
        self
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("adapter", &self.adapter.name())
            .finish()
    }
}

/// A validated, acyclic set of tasks.
///
/// Tasks are addressed by their position in [`TaskGraph::tasks`]; `dependents`
/// is the reverse of the dependency relation over those positions.
#[derive(Debug)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl TaskGraph {
    pub fn new(tasks: Vec<Task>) -> Result<Self, GraphError> {
        let mut index = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if index.insert(task.name.clone(), i).is_some() {
                return Err(GraphError::DuplicateTask(task.name.clone()));
            }
        }

        let mut graph = DiGraph::<usize, ()>::with_capacity(tasks.len(), tasks.len());
        let nodes: Vec<_> = (0..tasks.len()).map(|i| graph.add_node(i)).collect();
        let mut dependents = vec![Vec::new(); tasks.len()];

        for (i, task) in tasks.iter().enumerate() {
            for dependency in &task.dependencies {
                let &dep = index
                    .get(dependency)
                    .ok_or_else(|| GraphError::UnknownDependency {
                        task: task.name.clone(),
                        dependency: dependency.clone(),
                    })?;
                graph.add_edge(nodes[dep], nodes[i], ());
                dependents[dep].push(i);
            }
        }

        let order = toposort(&graph, None)
            .map_err(|cycle| GraphError::Cycle(tasks[graph[cycle.node_id()]].name.clone()))?
            .into_iter()
            .map(|node| graph[node])
            .collect();

        Ok(Self {
            tasks,
            index,
            dependents,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, index: usize) -> &Task {
        &self.tasks[index]
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Tasks that directly depend on `index`.
    pub fn dependents(&self, index: usize) -> &[usize] {
        &self.dependents[index]
    }

    /// Task indices in an order where every task follows its dependencies.
    pub fn topological_order(&self) -> &[usize] {
        &self.order
    }
}
