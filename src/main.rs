use anyhow::Context;
use clap::Parser;
use tracing::info;

use yfs_gateway::ClusterContext;

#[derive(Parser, Debug)]
#[command(name = "yfs-gateway")]
struct Params {
    #[arg(long, env = "YFS_GATEWAY_CONFIG", default_value = "cluster.properties")]
    pub config: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .with_thread_ids(true)
        .compact()
        .init();

    let params = Params::parse();
    let ctx = ClusterContext::get_or_init(&params.config)?;

    let topology = ctx.topology();
    let records = ctx.store().len()?;
    info!(
        "gateway up as {} with {} cluster nodes, {} placement records",
        topology.local,
        topology.nodes.len(),
        records
    );

    let handle = ctx
        .runtime()
        .handle()
        .context("cluster runtime not started")?;
    handle.block_on(async {
        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");
        Ok::<_, anyhow::Error>(())
    })?;
    Ok(())
}
