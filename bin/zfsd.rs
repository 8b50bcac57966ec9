//! Reconciliation daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use zfsd_reconcile::config::Config;
use zfsd_reconcile::reconcile;
use zfsd_reconcile::Context;

#[derive(Parser, Debug)]
#[command(name = "zfsd", about = "Reconciliation daemon for a partially-connected distributed filesystem")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "/etc/zfsd/config.toml")]
    config: PathBuf,

    /// Root directory holding this node's local volume storage.
    #[arg(short, long, default_value = "/var/lib/zfsd")]
    volume_root: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(err) => {
            tracing::error!(?err, path = ?args.config, "failed to load configuration");
            std::process::exit(1);
        }
    };

    tracing::info!(this_node = config.this_node, "zfsd starting");
    let ctx = Arc::new(Context::new(config, &args.volume_root));

    let scheduler = ctx.scheduler.clone();
    scheduler
        .spawn_workers(move |scheduler| {
            let ctx = ctx.clone();
            async move {
                loop {
                    if let Some(fh) = scheduler.pop_next() {
                        reconcile::run_one(&ctx, fh).await;
                        continue;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                }
            }
        })
        .await;

    tracing::info!("zfsd ready");
    std::future::pending::<()>().await;
}
