//! Maps job types to their ordered stages.

use std::collections::HashMap;
use std::sync::Arc;

use super::{CommandStage, PipelineConfig, Stage};

/// Registry of pipelines keyed by job type.
#[derive(Default, Clone)]
pub struct PipelineRegistry {
    pipelines: HashMap<String, Vec<Arc<dyn Stage>>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build command pipelines from configuration.
    pub fn from_config(pipelines: &[PipelineConfig]) -> Self {
        let mut registry = Self::new();
        for pipeline in pipelines {
            let stages = pipeline
                .stages
                .iter()
                .map(|c| Arc::new(CommandStage::new(c.clone())) as Arc<dyn Stage>)
                .collect();
            registry.register(&pipeline.job_type, stages);
        }
        registry
    }

    /// Register (or replace) the pipeline for a job type.
    pub fn register(&mut self, job_type: impl Into<String>, stages: Vec<Arc<dyn Stage>>) {
        self.pipelines.insert(job_type.into(), stages);
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_pipeline(mut self, job_type: impl Into<String>, stages: Vec<Arc<dyn Stage>>) -> Self {
        self.register(job_type, stages);
        self
    }

    pub fn get(&self, job_type: &str) -> Option<&[Arc<dyn Stage>]> {
        self.pipelines.get(job_type).map(Vec::as_slice)
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.pipelines.contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.pipelines.keys().cloned().collect();
        types.sort();
        types
    }
}
