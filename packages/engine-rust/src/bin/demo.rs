//! `switchyard-demo` -- runs two sample routes until Ctrl-C.
//!
//! - `heartbeat`: a timer fires every `--period-ms`, a template builds a
//!   greeting, and the result is logged.
//! - `echo`: an HTTP endpoint on `--http-addr` answers `POST /echo` with the
//!   request body in upper case.

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use switchyard_engine::route::{RouteBuilder, StepsDsl};
use switchyard_engine::{
    CompositeProperties, EngineConfig, EnvProperties, MapProperties, SwitchyardContext,
};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "switchyard-demo")]
#[command(about = "Runs sample Switchyard routes", long_about = None)]
struct Cli {
    /// Address the echo route listens on
    #[arg(long, env = "SWITCHYARD_DEMO_HTTP_ADDR", default_value = "127.0.0.1:8080")]
    http_addr: String,

    /// Heartbeat timer period in milliseconds
    #[arg(long, env = "SWITCHYARD_DEMO_PERIOD_MS", default_value_t = 2000)]
    period_ms: u64,

    /// Emit logs as JSON lines
    #[arg(long, env = "SWITCHYARD_DEMO_JSON_LOGS")]
    json_logs: bool,

    /// Route ids to leave out, `*` wildcards allowed
    #[arg(long = "exclude-route", value_delimiter = ',')]
    exclude_routes: Vec<String>,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let demo = MapProperties::new()
        .with("demo.http-addr", cli.http_addr.as_str())
        .with("demo.period-ms", cli.period_ms.to_string());
    let properties = CompositeProperties::new()
        .with_source(Arc::new(demo))
        .with_source(Arc::new(EnvProperties::new()));
    let config = EngineConfig {
        route_exclude_patterns: cli.exclude_routes,
        ..EngineConfig::default()
    };
    let ctx = SwitchyardContext::with_properties(config, Arc::new(properties));

    let added = ctx
        .add_routes([
            RouteBuilder::from("timer:heartbeat?period={{demo.period-ms}}")
                .route_id("heartbeat")
                .description("logs a greeting on every tick")
                .set_body("Hello from ${routeId}, tick ${exchangeProperty.SwitchyardTimerCounter}")
                .log_at(Level::INFO, "${body}"),
            RouteBuilder::from("http:{{demo.http-addr}}/echo")
                .route_id("echo")
                .description("answers with the request body in upper case")
                .convert_body_to(switchyard_engine::core::TypeKey::Text)
                .process_named("upper-case", |exchange| {
                    let text = exchange.body_as::<String>()?.unwrap_or_default();
                    exchange.set_body(text.to_uppercase());
                    Ok(())
                })
                .to("log:echo?showHeaders=true"),
        ])
        .await
        .context("adding demo routes")?;

    ctx.start().await.context("starting routes")?;
    info!(routes = ?added, http_addr = %cli.http_addr, "switchyard demo running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down");
    ctx.stop().await;
    Ok(())
}
