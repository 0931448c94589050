//! Proxy (slave) entrypoint: websocket relay in front of the backends.

use anyhow::Context;
use clap::Parser;

use vizgate::config::{ServeArgs, Settings};
use vizgate::proxy::{ProxyApi, ProxyState};
use vizgate::registry;
use vizgate::server;

#[derive(Parser, Debug)]
#[command(name = "vizgate-proxy", about = "Visualization websocket proxy", version)]
struct Args {
    #[command(flatten)]
    serve: ServeArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let settings = Settings::from_env().context("invalid configuration")?;
    server::init_tracing(&settings.log_level);

    let registry = registry::open(&settings.registry)
        .await
        .context("cannot open registry")?;

    let state = ProxyState {
        registry,
        renderer_port: settings.renderer_port,
        backend_port: settings.backend_port,
    };

    let addr = args.serve.bind_addr(settings.slave_port)?;
    server::serve(
        "proxy",
        addr,
        ProxyApi::router(state),
        server::shutdown_signal(),
    )
    .await?;

    Ok(())
}
