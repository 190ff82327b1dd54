mod clock;
mod config;
mod conflict;
mod db;
mod device;
mod driver;
mod error;
mod evaluator;
mod executor;
mod gateway;
mod mqtt;
mod pipeline;
mod preset;
mod reversal;
mod state;
mod sync;
mod web;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, sync::Arc, time::Duration};
use time::UtcOffset;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use clock::SystemClock;
use db::Db;
use driver::Driver;
use executor::Executor;
use gateway::HttpGateway;
use mqtt::{DEVICE_TOPICS, SENSOR_TOPICS};
use pipeline::Pipeline;
use state::StateStore;
use sync::StateSync;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let config_path = env::var("HUB_CONFIG").unwrap_or_else(|_| "greenhouse.toml".to_string());
    let cfg = config::load(&config_path)?;

    // The local offset can only be read soundly before any threads exist.
    let offset = match cfg.control.utc_offset()? {
        Some(o) => o,
        None => UtcOffset::current_local_offset().unwrap_or_else(|e| {
            warn!("local utc offset unavailable ({e}), schedules run in UTC");
            UtcOffset::UTC
        }),
    };

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?
        .block_on(run(cfg, offset))
}

async fn run(cfg: config::Config, offset: UtcOffset) -> Result<()> {
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let db_url =
        env::var("DB_URL").unwrap_or_else(|_| "sqlite:greenhouse.db?mode=rwc".to_string());

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    let clock = Arc::new(SystemClock::new(offset));
    let state = Arc::new(StateStore::new(
        clock,
        cfg.control.policy,
        cfg.control.resolution_log_size,
    ));
    config::apply(&cfg, &db, state.now().unix_timestamp()).await?;
    state.record_system("hub started".to_string()).await;

    // ── Control pipeline ────────────────────────────────────────────
    let gateway = Arc::new(
        HttpGateway::new(&cfg.gateway.base_url, cfg.gateway.timeout())
            .context("failed to build gateway client")?,
    );
    let executor = Executor::new(gateway.clone(), state.clone(), cfg.gateway.timeout())
        .with_journal(db.clone());
    let pipeline = Pipeline::new(state.clone(), executor, cfg.control.recency_window());
    let driver = Driver::new(
        pipeline,
        gateway.clone(),
        cfg.control.cancel_reversals_on_activate,
    );

    let sync = Arc::new(StateSync::new(gateway.clone(), gateway, state.clone()));
    sync.refresh().await;
    tokio::spawn(sync.run(cfg.gateway.poll_interval()));

    // ── Resume the persisted preset ─────────────────────────────────
    match db.active_preset().await? {
        Some(name) => match db.get_preset(&name).await? {
            Some(preset) => {
                driver.activate(preset).await;
            }
            None => warn!(preset = %name, "active preset is not stored, scheduler idle"),
        },
        None => info!("no active preset, scheduler idle until one is activated"),
    }

    // ── Web server ──────────────────────────────────────────────────
    let app = web::AppState {
        driver: driver.clone(),
        db: db.clone(),
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(app).await {
            tracing::error!("operator api stopped: {e:#}");
        }
    });

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("greenhouse-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    client.subscribe(SENSOR_TOPICS, QoS::AtLeastOnce).await?;
    client.subscribe(DEVICE_TOPICS, QoS::AtLeastOnce).await?;
    info!("hub subscribed to {SENSOR_TOPICS} and {DEVICE_TOPICS}");

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                match mqtt::ingest(&state, &p.topic, &p.payload).await {
                    Ok(what) => debug!(topic = %p.topic, ?what, "ingested"),
                    Err(msg) => {
                        warn!("{msg}");
                        state.record_error(msg).await;
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                state.record_system("mqtt connected".to_string()).await;
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("mqtt disconnected");
                state.record_system("mqtt disconnected".to_string()).await;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                state.record_error(format!("mqtt error: {e}")).await;
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
