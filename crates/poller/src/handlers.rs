use std::path::PathBuf;
use std::time::Duration;

use mwsflow::{CallbackRegistry, Delivery, HandlerOptions};
use serde::{Deserialize, Serialize};

/// Argument for the `save_to_dir` handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveToDir {
    pub dir: PathBuf,
}

pub fn build_registry() -> CallbackRegistry {
    let mut registry = CallbackRegistry::new();

    // Built-in handlers. Embedders register their own next to these.
    registry.register("log_summary", |d: Delivery, _arg: ()| async move {
        tracing::info!(
            entry_id = %d.entry_id,
            kind = d.kind.as_str(),
            remote_id = %d.remote_id,
            bytes = d.content.len(),
            "result received"
        );
        Ok(())
    });

    registry.register_with_options(
        "save_to_dir",
        |d: Delivery, arg: SaveToDir| async move {
            tokio::fs::create_dir_all(&arg.dir).await?;
            let path = arg
                .dir
                .join(format!("{}-{}.bin", d.kind.as_str(), d.entry_id));
            tokio::fs::write(&path, &d.content).await?;
            tracing::info!(path = %path.display(), bytes = d.content.len(), "result saved");
            Ok::<(), anyhow::Error>(())
        },
        HandlerOptions::new().timeout(Duration::from_secs(30)),
    );

    registry
}
