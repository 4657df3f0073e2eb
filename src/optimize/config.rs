//! Resolved tuning declarations and optimizer bindings per component.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::entrance::{EntranceDecl, OptimizeEntrance};
use super::item::{ItemDecl, OptimizeType, SqlFileSpec};
use super::optimizer::{Optimizer, OptimizerSet};
use crate::error::{OptimizeError, Result};
use crate::value::Params;

/// Entrances declared for each stage of one component, in declaration order.
pub type StageMap = BTreeMap<String, Vec<EntranceDecl>>;

/// What the parser produced: stage declarations plus optimizer bindings,
/// together with the shared environment entrances are bound to.
#[derive(Debug, Default)]
pub struct OptimizeConfig {
    stages: HashMap<String, StageMap>,
    optimizers: HashMap<String, HashMap<OptimizeType, OptimizerSet>>,
    environment: Option<Arc<Params>>,
}

impl OptimizeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Environment
    // -----------------------------------------------------------------------

    /// Replace the shared environment (tenant, host, credentials, ...).
    ///
    /// Entrances already handed out keep the environment they were bound to.
    pub fn set_environment(&mut self, environment: Params) {
        self.environment = Some(Arc::new(environment));
    }

    /// Set a single environment entry, creating the environment if needed.
    pub fn set_environment_value(&mut self, key: impl Into<String>, value: Value) {
        let env = self.environment.get_or_insert_with(|| Arc::new(Params::new()));
        Arc::make_mut(env).insert(key.into(), value);
    }

    pub fn environment(&self) -> Option<&Params> {
        self.environment.as_deref()
    }

    // -----------------------------------------------------------------------
    // Declarations
    // -----------------------------------------------------------------------

    /// Replace every stage declared for `component`.
    pub fn set_stages(&mut self, component: impl Into<String>, stages: StageMap) {
        self.stages.insert(component.into(), stages);
    }

    /// Merge optimizers into `component`'s bindings for `kind`; same-named
    /// optimizers are overwritten, others are left alone.
    pub fn merge_optimizers(&mut self, component: &str, kind: OptimizeType, optimizers: Vec<Optimizer>) {
        let set = self
            .optimizers
            .entry(component.to_string())
            .or_default()
            .entry(kind)
            .or_default();
        for optimizer in optimizers {
            set.insert(optimizer.name().to_string(), Arc::new(optimizer));
        }
    }

    /// Forget every declaration and binding; the environment is kept.
    pub fn clear(&mut self) {
        self.stages.clear();
        self.optimizers.clear();
    }

    /// Components with declared stages, sorted.
    pub fn components(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.stages.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Stage names declared for `component`, sorted.
    pub fn stages(&self, component: &str) -> Vec<&str> {
        self.stages
            .get(component)
            .map(|s| s.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Raw declarations for a (component, stage).
    pub fn declarations(&self, component: &str, stage: &str) -> &[EntranceDecl] {
        self.stages
            .get(component)
            .and_then(|s| s.get(stage))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn optimizer(&self, component: &str, kind: OptimizeType, name: &str) -> Option<&Arc<Optimizer>> {
        self.optimizers.get(component)?.get(&kind)?.get(name)
    }

    /// Build, bind and return fresh entrances for a (component, stage).
    ///
    /// Unknown components or stages yield an empty list.
    ///
    /// # Errors
    /// `EnvironmentUnset` when no environment was set.
    pub fn get_optimize_entrances(&self, component: &str, stage: &str) -> Result<Vec<OptimizeEntrance>> {
        let environment = self.environment.clone().ok_or(OptimizeError::EnvironmentUnset)?;
        let mut entrances = Vec::new();
        for decl in self.declarations(component, stage) {
            let optimizers = self
                .optimizers
                .get(component)
                .and_then(|by_kind| by_kind.get(&decl.kind))
                .cloned()
                .unwrap_or_default();
            let mut entrance = OptimizeEntrance::new(component, stage, decl);
            entrance.bind(optimizers, Arc::clone(&environment))?;
            entrances.push(entrance);
        }
        debug!(component, stage, count = entrances.len(), "built optimize entrances");
        Ok(entrances)
    }

    /// Make `stage` run exactly these SQL scripts, discarding whatever was
    /// declared for it.
    pub fn force_sql_stage(&mut self, component: &str, stage: &str, scripts: Vec<SqlFileSpec>) {
        let decl = EntranceDecl {
            kind: OptimizeType::ExecSqlFile,
            items: scripts.into_iter().map(ItemDecl::SqlFile).collect(),
        };
        self.stages
            .entry(component.to_string())
            .or_default()
            .insert(stage.to_string(), vec![decl]);
    }
}
