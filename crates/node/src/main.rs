use std::sync::Arc;

use anyhow::Context;

use segq_infra::Config;
use segq_node::load::{self, LoadProfile};
use segq_node::{Node, SyntheticSegmenter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    segq_observability::init();

    let config = Config::from_env().context("invalid configuration")?;
    let node = Node::start(&config, Arc::new(SyntheticSegmenter::default()))?;

    if config.load_test_jobs > 0 {
        load::submit(node.service(), &LoadProfile::new(config.load_test_jobs)).await?;
    }

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");
    node.shutdown().await;

    Ok(())
}
