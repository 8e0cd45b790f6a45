use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use futures::future::LocalBoxFuture;
use serde::Serialize;
use tracing::{debug, info};
use wasmtime::component::{Component, Linker, ResourceTable, Val};
use wasmtime::{Config, Engine, Store};
use wasmtime_wasi::p2::{self, IoView, WasiCtx, WasiCtxBuilder, WasiView};

use crate::api::api_objects::{JobResult, Message};
use crate::engine::{EngineFactory, ExecutionEngine};

pub struct HostState {
    wasi: WasiCtx,
    table: ResourceTable,
}

impl HostState {
    fn new() -> Self {
        HostState {
            wasi: WasiCtxBuilder::new().inherit_stderr().build(),
            table: ResourceTable::new(),
        }
    }
}

impl WasiView for HostState {
    fn ctx(&mut self) -> &mut WasiCtx {
        &mut self.wasi
    }
}
impl IoView for HostState {
    fn table(&mut self) -> &mut ResourceTable {
        &mut self.table
    }
}

#[derive(Serialize)]
struct EngineRequest<'a> {
    messages: &'a [Message],
}

/// Compiled component shared by every slot. Compilation happens once, at
/// construction, so a bad module fails fast instead of on the first job.
pub struct WasmEngineFactory {
    engine: Engine,
    linker: Linker<HostState>,
    component: Component,
    module_path: PathBuf,
    entry_point: String,
}

impl WasmEngineFactory {
    pub fn new(module_path: impl AsRef<Path>, entry_point: impl Into<String>) -> anyhow::Result<Self> {
        let module_path = module_path.as_ref().to_path_buf();
        let entry_point = entry_point.into();

        let mut config = Config::new();
        config.async_support(true).wasm_component_model(true);
        let engine = Engine::new(&config).context("failed to create wasm engine")?;

        let mut linker: Linker<HostState> = Linker::new(&engine);
        p2::add_to_linker_async(&mut linker).context("add_to_linker_async failed")?;

        let component = Component::from_file(&engine, &module_path)
            .with_context(|| format!("failed to compile component at {:?}", module_path))?;
        info!(module = %module_path.display(), entry_point = %entry_point, "Execution engine compiled");

        Ok(Self { engine, linker, component, module_path, entry_point })
    }

    pub fn module_path(&self) -> &Path {
        &self.module_path
    }
}

impl EngineFactory for WasmEngineFactory {
    fn create(&self, slot_id: usize) -> anyhow::Result<Box<dyn ExecutionEngine>> {
        debug!(slot_id, "Creating wasm component loader");
        Ok(Box::new(WasmComponentLoader {
            engine: self.engine.clone(),
            linker: self.linker.clone(),
            component: self.component.clone(),
            entry_point: self.entry_point.clone(),
        }))
    }
}

/// Per-slot executor. Each job gets a brand-new `Store`, so nothing one job
/// leaves in guest memory is visible to the next.
pub struct WasmComponentLoader {
    engine: Engine,
    linker: Linker<HostState>,
    component: Component,
    entry_point: String,
}

impl WasmComponentLoader {
    async fn run(&self, messages: &[Message]) -> anyhow::Result<JobResult> {
        let mut store = Store::new(&self.engine, HostState::new());
        let instance = self
            .linker
            .instantiate_async(&mut store, &self.component)
            .await
            .context("instantiate_async failed")?;

        let entry_point = &self.entry_point;
        let func = instance
            .get_func(&mut store, entry_point)
            .ok_or_else(|| anyhow!("exported function `{entry_point}` not found"))?;

        let request = serde_json::to_string(&EngineRequest { messages })?;
        let mut results = vec![Val::String("".into())];
        func.call_async(&mut store, &[Val::String(request.into())], &mut results)
            .await
            .with_context(|| format!("`{entry_point}` trapped"))?;
        func.post_return_async(&mut store).await?;

        match results.into_iter().next() {
            Some(Val::String(output)) => Ok(parse_output(&output, messages)),
            other => Err(anyhow!("`{entry_point}` returned {other:?}, expected a string")),
        }
    }
}

impl ExecutionEngine for WasmComponentLoader {
    fn execute<'a>(&'a mut self, messages: &'a [Message]) -> LocalBoxFuture<'a, anyhow::Result<JobResult>> {
        Box::pin(self.run(messages))
    }
}

/// Guests return either a `JobResult` document or plain reply text.
fn parse_output(output: &str, input: &[Message]) -> JobResult {
    if let Ok(result) = serde_json::from_str::<JobResult>(output) {
        return result;
    }
    let mut messages = input.to_vec();
    messages.push(Message::assistant(output));
    JobResult::success(output, messages)
}
