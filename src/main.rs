use std::sync::Arc;

use job_dispatch::wasm_loaders::WasmEngineFactory;
use job_dispatch::{EngineFactory, FnEngine, Message, WorkerPool, lifecycle, logging, utils};
use tracing::{info, warn};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let config = utils::load_config();
    logging::init(&config.log_config())?;
    for warning in &config.warnings {
        warn!("{warning}");
    }

    let factory: Arc<dyn EngineFactory> = if config.num_workers > 0 {
        Arc::new(WasmEngineFactory::new(&config.engine_module, &config.engine_entry_point)?)
    } else {
        // jobs are admitted and queued; nothing in this process runs them
        info!("Local execution disabled (num_workers = 0)");
        Arc::new(FnEngine::new(|_: &[Message]| Err(anyhow::anyhow!("local execution is disabled"))))
    };
    let pool = Arc::new(WorkerPool::new(factory, config.pool_config())?);

    if !lifecycle::run(&config, pool).await? {
        std::process::exit(1);
    }
    Ok(())
}
