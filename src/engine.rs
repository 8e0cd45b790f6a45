//! The pluggable execution engine seam.
//!
//! A slot asks its [`EngineFactory`] for a private [`ExecutionEngine`] from
//! inside the slot's own thread, so engines never need to be shared or sent
//! across threads once created.

use std::sync::Arc;

use futures::future::{self, LocalBoxFuture};

use crate::api::api_objects::{JobResult, Message};

/// Single entry point: run one job's messages to a result.
///
/// An `Err` is recorded as a failed job; so is `Ok` with `success: false`.
pub trait ExecutionEngine {
    fn execute<'a>(&'a mut self, messages: &'a [Message]) -> LocalBoxFuture<'a, anyhow::Result<JobResult>>;
}

pub trait EngineFactory: Send + Sync + 'static {
    fn create(&self, slot_id: usize) -> anyhow::Result<Box<dyn ExecutionEngine>>;
}

/// Engine backed by a plain function. Every slot shares the function.
pub struct FnEngine<F> {
    func: Arc<F>,
}

impl<F> FnEngine<F>
where
    F: Fn(&[Message]) -> anyhow::Result<JobResult> + Send + Sync + 'static,
{
    pub fn new(func: F) -> Self {
        Self { func: Arc::new(func) }
    }
}

struct FnEngineInstance<F> {
    func: Arc<F>,
}

impl<F> ExecutionEngine for FnEngineInstance<F>
where
    F: Fn(&[Message]) -> anyhow::Result<JobResult>,
{
    fn execute<'a>(&'a mut self, messages: &'a [Message]) -> LocalBoxFuture<'a, anyhow::Result<JobResult>> {
        Box::pin(future::ready((self.func)(messages)))
    }
}

impl<F> EngineFactory for FnEngine<F>
where
    F: Fn(&[Message]) -> anyhow::Result<JobResult> + Send + Sync + 'static,
{
    fn create(&self, _slot_id: usize) -> anyhow::Result<Box<dyn ExecutionEngine>> {
        Ok(Box::new(FnEngineInstance { func: Arc::clone(&self.func) }))
    }
}
