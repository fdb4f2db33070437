//! `publish`: seed the catalog with a function and a new deployment.
//!
//! Writes straight into the control plane's state file, so it must run
//! while the control plane is stopped.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::info;

use faasgrid_core::epoch_millis;
use faasgrid_state::{Deployment, Function, StateStore};

pub struct PublishArgs {
    pub data_dir: PathBuf,
    pub name: String,
    pub code: PathBuf,
    pub entry_point: String,
    pub memory_mb: u32,
    pub timeout_seconds: u32,
    pub description: String,
    pub comment: String,
}

pub fn run_publish(args: PublishArgs) -> anyhow::Result<()> {
    std::fs::create_dir_all(&args.data_dir)?;
    let db_path = args.data_dir.join("faasgrid.redb");
    let state = StateStore::open(&db_path)
        .with_context(|| format!("open {} (is the control plane running?)", db_path.display()))?;

    let deployment = publish(&state, &args)?;
    info!(
        function = %deployment.function_name,
        version = deployment.version,
        deployment_id = %deployment.id,
        "deployment published"
    );
    println!("{} v{} ({})", deployment.function_name, deployment.version, deployment.id);
    Ok(())
}

/// Create or update the function, then publish `args.code` as its active deployment.
fn publish(state: &StateStore, args: &PublishArgs) -> anyhow::Result<Deployment> {
    let code = read_code(&args.code)?;
    let now = epoch_millis();

    let function = match state.get_function(&args.name)? {
        Some(existing) => Function {
            description: args.description.clone(),
            entry_point: args.entry_point.clone(),
            memory_mb: args.memory_mb,
            timeout_seconds: args.timeout_seconds,
            is_active: true,
            updated_at: now,
            ..existing
        },
        None => Function {
            id: uuid::Uuid::new_v4().to_string(),
            name: args.name.clone(),
            description: args.description.clone(),
            entry_point: args.entry_point.clone(),
            memory_mb: args.memory_mb,
            timeout_seconds: args.timeout_seconds,
            is_active: true,
            created_at: now,
            updated_at: now,
        },
    };
    state.put_function(&function)?;

    Ok(state.publish_deployment(&args.name, code, "", &args.comment, now)?)
}

fn read_code(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("read code {}", path.display()))
}
