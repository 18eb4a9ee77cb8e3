mod clock;
mod config;
mod db;
mod dryback;
mod engine;
mod ingest;
mod mqtt;
mod phase;
mod policy;
mod scheduler;
mod sizer;
mod state;
mod web;
mod zone;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, sync::Arc, time::Duration};
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use db::Db;
use engine::SteeringEngine;
use mqtt::{extract_ack_zone, extract_substrate_zone, ACK_FILTER, SUBSTRATE_FILTER};
use state::SystemState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:cropsteer.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config + engine ─────────────────────────────────────────────
    let cfg = config::load(&config_path)?;
    if cfg.zones.is_empty() {
        warn!("no zones configured");
    }

    let now = OffsetDateTime::now_utc();
    let next_id = db.max_command_id().await? + 1;
    let engine = Arc::new(SteeringEngine::new(cfg, now, next_id));
    let restored = engine.restore(&db.load_zone_states().await?, now).await;
    info!(restored, next_command_id = next_id, "engine ready");

    // ── Shared state (ephemeral, for the operator api) ──────────────
    let shared = SystemState::shared();
    shared
        .write()
        .await
        .record_system(format!("hub started, {restored} zone(s) restored"));
    let expired = scheduler::expire_pending(&db, &shared, now).await;
    if expired > 0 {
        info!(expired, "pending commands from previous run marked timeout");
    }

    // ── Web server ──────────────────────────────────────────────────
    let web_state = web::AppState::new(Arc::clone(&shared), Arc::clone(&engine), config_path);
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state).await {
            error!("web server stopped: {e:#}");
        }
    });

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("cropsteer-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    client.subscribe(SUBSTRATE_FILTER, QoS::AtLeastOnce).await?;
    client.subscribe(ACK_FILTER, QoS::AtLeastOnce).await?;
    info!("subscribed to {SUBSTRATE_FILTER} and {ACK_FILTER}");

    // ── Scheduler ───────────────────────────────────────────────────
    tokio::spawn(scheduler::run(
        Arc::clone(&engine),
        db.clone(),
        client.clone(),
        Arc::clone(&shared),
    ));

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let topic = p.topic.as_str();
                if let Some(zone_id) = extract_substrate_zone(topic) {
                    scheduler::handle_substrate(
                        &engine,
                        &shared,
                        zone_id,
                        &p.payload,
                        OffsetDateTime::now_utc(),
                    )
                    .await;
                } else if let Some(zone_id) = extract_ack_zone(topic) {
                    scheduler::handle_ack(
                        &engine,
                        &db,
                        &shared,
                        zone_id,
                        &p.payload,
                        OffsetDateTime::now_utc(),
                    )
                    .await;
                } else {
                    debug!(topic, "unhandled topic");
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt error: {e}. reconnecting...");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(None, format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
