//! Write-once stage registry and plan ordering.
//!
//! Construction enforces the two graph invariants: stage IDs are unique,
//! and at most one registered stage produces any given data tag. The full
//! graph is checked for cycles at `build`, so a manager never comes up
//! over an unschedulable pipeline.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use pulse_types::DataTag;

use crate::error::RegistryError;
use crate::stage::Stage;

/// Accumulates stage declarations before the registry is frozen.
#[derive(Default)]
pub struct RegistryBuilder {
    stages: Vec<Arc<dyn Stage>>,
    ids: HashSet<String>,
    producers: HashMap<DataTag, String>,
}

impl std::fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("ids", &self.ids)
            .field("producers", &self.producers)
            .finish()
    }
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a stage. Fails on a duplicate ID or duplicate producer.
    pub fn register(&mut self, stage: impl Stage + 'static) -> Result<&mut Self, RegistryError> {
        self.register_arc(Arc::new(stage))
    }

    /// [`register`](Self::register) for an already-shared stage.
    pub fn register_arc(&mut self, stage: Arc<dyn Stage>) -> Result<&mut Self, RegistryError> {
        let id = stage.id().to_string();
        if !self.ids.insert(id.clone()) {
            return Err(RegistryError::DuplicateStage { id });
        }
        for tag in stage.produced_outputs() {
            if let Some(first) = self.producers.get(&tag) {
                return Err(RegistryError::DuplicateProducer {
                    tag,
                    first: first.clone(),
                    second: id,
                });
            }
            self.producers.insert(tag, id.clone());
        }
        self.stages.push(stage);
        Ok(self)
    }

    /// Freezes the registry, verifying the full stage graph is acyclic.
    pub fn build(self) -> Result<Registry, RegistryError> {
        let by_id = self
            .stages
            .iter()
            .enumerate()
            .map(|(index, stage)| (stage.id().to_string(), index))
            .collect();
        let producers = self
            .producers
            .into_iter()
            .filter_map(|(tag, id)| {
                self.stages
                    .iter()
                    .position(|s| s.id() == id)
                    .map(|index| (tag, index))
            })
            .collect();
        let registry = Registry {
            stages: self.stages,
            by_id,
            producers,
        };
        let all: HashSet<String> = registry.stages.iter().map(|s| s.id().to_string()).collect();
        registry.plan_order(&all)?;
        Ok(registry)
    }
}

/// Immutable stage registry, preserving registration order.
pub struct Registry {
    stages: Vec<Arc<dyn Stage>>,
    by_id: HashMap<String, usize>,
    producers: HashMap<DataTag, usize>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("by_id", &self.by_id)
            .field("producers", &self.producers)
            .finish()
    }
}

impl Registry {
    pub fn get(&self, id: &str) -> Option<&Arc<dyn Stage>> {
        self.by_id.get(id).map(|&index| &self.stages[index])
    }

    /// All stages in registration order.
    pub fn stages(&self) -> &[Arc<dyn Stage>] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// The stage producing `tag`, if any.
    pub fn producer_of(&self, tag: &DataTag) -> Option<&Arc<dyn Stage>> {
        self.producers.get(tag).map(|&index| &self.stages[index])
    }

    /// Topological order of the plan members: a stage appears after every
    /// plan member producing a tag it requires. Ready-set ties are broken
    /// by declared `dependencies`, then registration order (stable).
    pub fn plan_order(&self, plan: &HashSet<String>) -> Result<Vec<Arc<dyn Stage>>, RegistryError> {
        let members: Vec<usize> = self
            .stages
            .iter()
            .enumerate()
            .filter(|(_, stage)| plan.contains(stage.id()))
            .map(|(index, _)| index)
            .collect();

        // Hard edges: tag producer -> consumer, both inside the plan.
        let mut indegree: HashMap<usize, usize> = members.iter().map(|&m| (m, 0)).collect();
        let mut edges: HashMap<usize, Vec<usize>> = HashMap::new();
        for &consumer in &members {
            for tag in self.stages[consumer].required_inputs() {
                let Some(&producer) = self.producers.get(&tag) else {
                    continue;
                };
                if producer == consumer || !indegree.contains_key(&producer) {
                    continue;
                }
                edges.entry(producer).or_default().push(consumer);
                *indegree.get_mut(&consumer).expect("plan member") += 1;
            }
        }

        let mut remaining: Vec<usize> = members.clone();
        let mut ordered = Vec::with_capacity(members.len());
        while !remaining.is_empty() {
            let ready: Vec<usize> = remaining
                .iter()
                .copied()
                .filter(|m| indegree[m] == 0)
                .collect();
            if ready.is_empty() {
                return Err(RegistryError::Cycle {
                    stage_id: self.stages[remaining[0]].id().to_string(),
                });
            }

            // Declared dependencies are advisory: prefer a ready stage none
            // of whose dependencies is still unfinished, falling back to
            // plain registration order so an inconsistent hint cannot wedge
            // the sort. `ready` and `remaining` keep registration order.
            let unfinished: HashSet<&str> = remaining
                .iter()
                .map(|&m| self.stages[m].id())
                .collect();
            let pick = ready
                .iter()
                .copied()
                .find(|&m| {
                    self.stages[m].dependencies().iter().all(|dep| {
                        dep.as_str() == self.stages[m].id() || !unfinished.contains(dep.as_str())
                    })
                })
                .unwrap_or(ready[0]);

            remaining.retain(|&m| m != pick);
            ordered.push(Arc::clone(&self.stages[pick]));
            for &consumer in edges.get(&pick).map(Vec::as_slice).unwrap_or_default() {
                if let Some(count) = indegree.get_mut(&consumer) {
                    *count = count.saturating_sub(1);
                }
            }
        }
        Ok(ordered)
    }
}
