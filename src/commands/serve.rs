use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

use a1_mediator::bus::LoopbackBus;
use a1_mediator::busloop::{self, Mediator};
use a1_mediator::config::Config;
use a1_mediator::ei::EiBridge;
use a1_mediator::http;
use a1_mediator::metrics;
use a1_mediator::registry::PolicyRegistry;
use a1_mediator::store::{MemStore, RedisStore, Store};

pub async fn run(port_override: Option<u16>) -> Result<()> {
    let mut config = Config::from_env();
    if let Some(port) = port_override {
        config.http_port = port;
    }

    println!("Starting A1 policy mediator...\n");
    info!(
        http_port = config.http_port,
        rmr_port = config.rmr_port,
        use_fake_sdl = config.use_fake_sdl,
        retry_times = config.rmr_retry_times,
        no_resp_ttl_s = config.instance_delete_no_resp_ttl.as_secs(),
        resp_ttl_s = config.instance_delete_resp_ttl.as_secs(),
        ecs_service_host = %config.ecs_service_host,
        "mediator_starting"
    );

    print!("  State store ................. ");
    let store: Arc<dyn Store> = if config.use_fake_sdl {
        println!("in-memory (USE_FAKE_SDL)");
        Arc::new(MemStore::new())
    } else {
        let store =
            RedisStore::new(&config.sdl_url).context("Failed to configure the Redis store")?;
        println!("redis ({})", config.sdl_url);
        Arc::new(store)
    };

    let registry = PolicyRegistry::new(store, &config);
    let bus = Arc::new(LoopbackBus::new());
    let ei = EiBridge::new(&config.ecs_service_host);
    let mediator = Mediator::new(registry, bus, ei, &config);

    // Force-init Prometheus counters so they appear on /a1-p/metrics
    metrics::force_init();

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));

    println!("  Bus transport ............... loopback (port {})", config.rmr_port);
    println!("  EI coordinator .............. {}", config.ecs_service_host);
    println!(
        "  Delete grace windows ........ {}s no-resp / {}s resp",
        config.instance_delete_no_resp_ttl.as_secs(),
        config.instance_delete_resp_ttl.as_secs()
    );
    println!("  HTTP server ................. http://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    GET    /a1-p/healthcheck ................................. Liveness probe");
    println!("    GET    /a1-p/metrics ..................................... Prometheus metrics");
    println!("    GET    /a1-p/policytypes ................................. List policy type ids");
    println!("    PUT    /a1-p/policytypes/{{id}} ............................ Create a policy type");
    println!("    GET    /a1-p/policytypes/{{id}} ............................ Read a policy type");
    println!("    DELETE /a1-p/policytypes/{{id}} ............................ Delete a policy type");
    println!("    GET    /a1-p/policytypes/{{id}}/policies ................... List instance ids");
    println!("    PUT    /a1-p/policytypes/{{id}}/policies/{{iid}} ............ Create/replace an instance");
    println!("    GET    /a1-p/policytypes/{{id}}/policies/{{iid}} ............ Read an instance");
    println!("    DELETE /a1-p/policytypes/{{id}}/policies/{{iid}} ............ Delete an instance");
    println!("    GET    /a1-p/policytypes/{{id}}/policies/{{iid}}/status ..... Aggregated status");
    println!("    POST   /data-delivery .................................... EI result ingestion");
    println!();
    println!("Mediator running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    let loop_handle = tokio::spawn(busloop::run(mediator.clone()));

    let app = http::build_router(mediator.clone());
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind the HTTP listener")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("shutdown_signal_received");
    println!("\n{}", "=".repeat(70));
    println!("Shutdown signal received. Stopping mediator...");

    mediator.shutdown();
    let _ = loop_handle.await;

    info!("mediator_stopped");
    println!("Mediator stopped.");
    Ok(())
}
