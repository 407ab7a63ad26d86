//! Domain plugin contracts and dispatch registry.
//!
//! Three capability sets mirror the pipeline stages a domain can
//! specialize: value scoring, deliberation, adaptation. A domain registers
//! any subset; missing capabilities fall back to the core defaults. A
//! plugin failure is never fatal to the pipeline: the registry logs it and
//! downgrades to the fallback, recording `plugin_error` for the explain bag.

pub mod assistant;
pub mod os_robotics;
pub mod rover;
pub mod trader;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::PceResult;
use crate::types::{ActionPlan, CciReading, ExecutionResult, JsonMap, PceEvent};
use crate::vel::ValueAssessment;

pub trait ValueModelPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn matches(&self, event: &PceEvent, state: &JsonMap) -> bool;
    fn evaluate(&self, event: &PceEvent, state: &JsonMap) -> PceResult<ValueAssessment>;
}

#[async_trait]
pub trait DecisionPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn matches(&self, event: &PceEvent, state: &JsonMap) -> bool;

    /// Deliberate an action plan. Plugins may mutate their own state slice
    /// (session memory, pending transitions); the kernel persists the
    /// snapshot after the pipeline completes.
    async fn deliberate(
        &self,
        event: &PceEvent,
        state: &mut JsonMap,
        assessment: &ValueAssessment,
        cci: &CciReading,
    ) -> PceResult<ActionPlan>;
}

pub trait AdaptationPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn matches(&self, event: &PceEvent, state: &JsonMap, result: &ExecutionResult) -> bool;
    fn adapt(
        &self,
        state: &mut JsonMap,
        event: &PceEvent,
        result: &ExecutionResult,
    ) -> PceResult<()>;
}

/// First-match dispatch over the registered plugins. Registration happens
/// at boot; the registry is read-only afterwards.
#[derive(Default)]
pub struct PluginRegistry {
    value_plugins: Vec<Arc<dyn ValueModelPlugin>>,
    decision_plugins: Vec<Arc<dyn DecisionPlugin>>,
    adaptation_plugins: Vec<Arc<dyn AdaptationPlugin>>,
}

/// Outcome of a plugin deliberation attempt, so the kernel can record the
/// downgrade reason without the plugin layer knowing about explain bags.
pub struct DeliberationOutcome {
    pub plan: Option<ActionPlan>,
    pub plugin_name: Option<&'static str>,
    pub plugin_error: Option<String>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_value_model(&mut self, plugin: Arc<dyn ValueModelPlugin>) {
        self.value_plugins.push(plugin);
    }

    pub fn register_decision(&mut self, plugin: Arc<dyn DecisionPlugin>) {
        self.decision_plugins.push(plugin);
    }

    pub fn register_adaptation(&mut self, plugin: Arc<dyn AdaptationPlugin>) {
        self.adaptation_plugins.push(plugin);
    }

    /// Value pass. Returns `None` when no plugin matched (caller applies
    /// the core default) or when the matching plugin failed.
    pub fn evaluate(&self, event: &PceEvent, state: &JsonMap) -> Option<ValueAssessment> {
        let plugin = self
            .value_plugins
            .iter()
            .find(|p| p.matches(event, state))?;
        match plugin.evaluate(event, state) {
            Ok(assessment) => Some(assessment),
            Err(err) => {
                warn!(plugin = plugin.name(), error = %err, "value plugin failed; using default");
                None
            }
        }
    }

    /// Deliberation pass. A plugin error is reported, not propagated.
    pub async fn deliberate(
        &self,
        event: &PceEvent,
        state: &mut JsonMap,
        assessment: &ValueAssessment,
        cci: &CciReading,
    ) -> DeliberationOutcome {
        let Some(plugin) = self
            .decision_plugins
            .iter()
            .find(|p| p.matches(event, state))
        else {
            return DeliberationOutcome {
                plan: None,
                plugin_name: None,
                plugin_error: None,
            };
        };

        match plugin.deliberate(event, state, assessment, cci).await {
            Ok(plan) => DeliberationOutcome {
                plan: Some(plan),
                plugin_name: Some(plugin.name()),
                plugin_error: None,
            },
            Err(err) => {
                warn!(plugin = plugin.name(), error = %err, "decision plugin failed; downgrading");
                DeliberationOutcome {
                    plan: None,
                    plugin_name: Some(plugin.name()),
                    plugin_error: Some(err.to_string()),
                }
            }
        }
    }

    /// Adaptation pass. Returns whether a plugin handled the event.
    pub fn adapt(
        &self,
        state: &mut JsonMap,
        event: &PceEvent,
        result: &ExecutionResult,
    ) -> bool {
        let Some(plugin) = self
            .adaptation_plugins
            .iter()
            .find(|p| p.matches(event, state, result))
        else {
            return false;
        };
        if let Err(err) = plugin.adapt(state, event, result) {
            warn!(plugin = plugin.name(), error = %err, "adaptation plugin failed; using default");
            return false;
        }
        true
    }
}
