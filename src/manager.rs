//! Supervision of several forests at once, with inter-forest dependency
//! order applied to start, stop and tick.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures::future::join_all;

use crate::error::ForestError;
use crate::forest::{topological_layers, Forest};
use crate::Status;

#[derive(Default)]
pub struct ForestManager {
    forests: Vec<Forest>,
    dependencies: HashMap<String, HashSet<String>>,
}

impl ForestManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_forest(&mut self, forest: Forest) -> Result<(), ForestError> {
        if self.forests.iter().any(|f| f.name() == forest.name()) {
            return Err(ForestError::DuplicateForest(forest.name().to_owned()));
        }
        self.forests.push(forest);
        Ok(())
    }

    pub fn remove_forest(&mut self, name: &str) -> Result<Forest, ForestError> {
        let index = self
            .forests
            .iter()
            .position(|f| f.name() == name)
            .ok_or_else(|| ForestError::UnknownForest(name.to_owned()))?;
        self.dependencies.remove(name);
        for deps in self.dependencies.values_mut() {
            deps.remove(name);
        }
        Ok(self.forests.remove(index))
    }

    /// Declare that `forest` starts after and ticks after `depends_on`.
    pub fn add_dependency(&mut self, forest: &str, depends_on: &str) -> Result<(), ForestError> {
        for name in [forest, depends_on] {
            if self.forest(name).is_none() {
                return Err(ForestError::UnknownForest(name.to_owned()));
            }
        }
        self.dependencies
            .entry(forest.to_owned())
            .or_default()
            .insert(depends_on.to_owned());
        Ok(())
    }

    pub fn forest(&self, name: &str) -> Option<&Forest> {
        self.forests.iter().find(|f| f.name() == name)
    }

    pub fn forest_mut(&mut self, name: &str) -> Option<&mut Forest> {
        self.forests.iter_mut().find(|f| f.name() == name)
    }

    pub fn forests(&self) -> &[Forest] {
        &self.forests
    }

    /// Start every forest in dependency order. If one fails, the forests
    /// already started are stopped again, in reverse, before returning.
    pub async fn start_all(&mut self) -> Result<(), ForestError> {
        let order: Vec<String> = self.layers()?.into_iter().flatten().collect();
        let mut started: Vec<String> = Vec::new();
        for name in order {
            let outcome = match self.forest_mut(&name) {
                Some(forest) => forest.start().await,
                None => continue,
            };
            if let Err(err) = outcome {
                for name in started.iter().rev() {
                    if let Some(forest) = self.forest_mut(name) {
                        forest.stop().await;
                    }
                }
                return Err(err);
            }
            started.push(name);
        }
        Ok(())
    }

    /// Stop every forest, dependents first. Idempotent like `Forest::stop`.
    pub async fn stop_all(&mut self) -> Result<(), ForestError> {
        let order: Vec<String> = self.layers()?.into_iter().flatten().collect();
        for name in order.iter().rev() {
            if let Some(forest) = self.forest_mut(name) {
                forest.stop().await;
            }
        }
        Ok(())
    }

    /// One round over every forest that is not stopped: dependency layers
    /// in order, forests inside a layer concurrently. Returns per-forest
    /// tree statuses.
    pub async fn tick_all(
        &mut self,
    ) -> Result<HashMap<String, HashMap<String, Status>>, ForestError> {
        let layers = self.layers()?;
        let mut results = HashMap::new();
        for layer in &layers {
            let ticks = self
                .forests
                .iter_mut()
                .filter(|forest| {
                    forest.state() != crate::RunState::Stopped
                        && layer.iter().any(|name| name == forest.name())
                })
                .map(|forest| async move {
                    let outcome = forest.tick().await;
                    (forest.name().to_owned(), outcome)
                });
            for (name, outcome) in join_all(ticks).await {
                results.insert(name, outcome?);
            }
        }
        Ok(results)
    }

    /// Drive [`tick_all`](Self::tick_all) at `period` until every forest
    /// has been stopped or any tick fails.
    pub async fn run_all(&mut self, period: Duration) -> Result<(), ForestError> {
        let mut timer = tokio::time::interval(period.max(Duration::from_millis(1)));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            timer.tick().await;
            if self
                .forests
                .iter()
                .all(|forest| forest.state() == crate::RunState::Stopped)
            {
                break;
            }
            self.tick_all().await?;
        }
        Ok(())
    }

    fn layers(&self) -> Result<Vec<Vec<String>>, ForestError> {
        let nodes: Vec<(String, HashSet<String>)> = self
            .forests
            .iter()
            .map(|forest| {
                (
                    forest.name().to_owned(),
                    self.dependencies
                        .get(forest.name())
                        .cloned()
                        .unwrap_or_default(),
                )
            })
            .collect();
        topological_layers(&nodes)
    }
}
