//! Scheduler (master) entrypoint: control API plus the expiry reaper.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use vizgate::allocator;
use vizgate::auth::UserInfoAuthenticator;
use vizgate::config::{ServeArgs, Settings};
use vizgate::registry;
use vizgate::scheduler::{Reaper, SchedulerApi, SchedulerState};
use vizgate::server;

#[derive(Parser, Debug)]
#[command(name = "vizgate-scheduler", about = "Visualization job scheduler", version)]
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

    // A registry we cannot open is fatal; everything else degrades per
    // request.
    let registry = registry::open(&settings.registry)
        .await
        .context("cannot open registry")?;
    if settings.recreate_registry {
        registry
            .recreate_schema()
            .await
            .context("cannot recreate registry schema")?;
    } else {
        registry
            .ensure_schema()
            .await
            .context("cannot ensure registry schema")?;
    }

    let client = settings.outbound_client()?;
    let authenticator = Arc::new(UserInfoAuthenticator::new(
        client.clone(),
        settings.auth.clone(),
    ));
    let allocator = allocator::create_allocator(&settings.allocator, client).await?;

    let reaper = Reaper::new(
        registry.clone(),
        allocator.clone(),
        settings.cleanup_period,
    );
    let (reaper_stop, reaper_signal) = tokio::sync::oneshot::channel();
    let reaper_task = tokio::spawn(reaper.run(reaper_signal));

    let state = SchedulerState {
        authenticator,
        allocator: allocator.clone(),
        registry,
        job_duration: settings.job_duration,
        proxy_base_url: settings.proxy_base_url.clone(),
    };

    let addr = args.serve.bind_addr(settings.master_port)?;
    server::serve(
        "scheduler",
        addr,
        SchedulerApi::router(state),
        server::shutdown_signal(),
    )
    .await?;

    // Stop the reaper before the allocator goes away; an in-flight destroy
    // is awaited, not torn down.
    let _ = reaper_stop.send(());
    let _ = reaper_task.await;
    allocator.close().await;

    Ok(())
}
