use anyhow::Result;
use carewatch::config;
use carewatch::db::models::ChannelKind;
use carewatch::db::repositories::{AlarmsRepository, ContactsRepository, NotificationsRepository};
use carewatch::db::DatabaseService;
use carewatch::detection::DetectionCandidate;
use carewatch::dispatch::{LogChannel, NotificationDispatcher};
use carewatch::fusion::FusionEngine;
use carewatch::lifecycle::LifecycleEngine;
use carewatch::messaging::broker::{create_message_broker, MessageBrokerTrait};
use carewatch::messaging::{EventType, RealtimeBridge};
use carewatch::scheduler::DeadlineScheduler;
use chrono::Utc;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

async fn run_app() -> Result<()> {
    // Initialize logging
    env_logger::init();
    info!("Starting CareWatch alarm engine");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = config::load_config(config_path.as_deref())?;
    info!("Configuration loaded");

    // Database connection pool and migrations
    let database = DatabaseService::new(&config.database).await?;
    let alarm_store = Arc::new(AlarmsRepository::new(database.pool.clone()));
    let notification_store = Arc::new(NotificationsRepository::new(database.pool.clone()));
    let contact_directory = Arc::new(ContactsRepository::new(database.pool.clone()));

    // Create and initialize message broker
    let message_broker = create_message_broker(config.message_broker.clone()).await?;
    info!("Message broker initialized");

    // Publish system startup event
    if let Err(e) = message_broker
        .publish(
            EventType::SystemStartup,
            None,
            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "timestamp": Utc::now().to_rfc3339()
            }),
        )
        .await
    {
        warn!("Failed to publish system startup event: {}", e);
    }

    // Notification dispatcher with the development log adapters; real channel
    // integrations register here
    let mut dispatcher = NotificationDispatcher::new(
        notification_store,
        contact_directory,
        config.dispatch.clone(),
    );
    for kind in [
        ChannelKind::Push,
        ChannelKind::Sms,
        ChannelKind::Voice,
        ChannelKind::Email,
    ] {
        dispatcher.register_adapter(Arc::new(LogChannel::new(kind)));
    }
    let dispatcher = Arc::new(dispatcher);

    let fusion = Arc::new(FusionEngine::new(config.fusion.clone()));
    let scheduler = Arc::new(DeadlineScheduler::new());

    let engine = Arc::new(
        LifecycleEngine::new(
            alarm_store.clone(),
            scheduler.clone(),
            dispatcher,
            config.lifecycle.clone(),
        )
        .with_broker(message_broker.clone())
        .with_fusion(fusion.clone()),
    );

    // Restore pending windows from the store, then start the timer loop
    let restored = scheduler.rebuild(alarm_store.as_ref()).await?;
    info!("Restored {} pending alarm windows", restored);
    tokio::spawn(scheduler.clone().run(engine.clone()));

    // Console action channel
    let bridge = Arc::new(RealtimeBridge::new(engine.clone(), message_broker.clone()));
    bridge.run().await?;

    // Inbound detection feed: camera-side analytics publish candidates on
    // detection.candidate.<camera_id>
    {
        let fusion = fusion.clone();
        let engine = engine.clone();
        message_broker
            .subscribe_pattern(
                "detection.#",
                Arc::new(move |message| {
                    match serde_json::from_value::<DetectionCandidate>(message.payload.clone()) {
                        Ok(candidate) => match fusion.ingest(candidate) {
                            Ok(Some(request)) => {
                                let engine = engine.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = engine.create(request).await {
                                        error!("Failed to admit fused alarm: {}", e);
                                    }
                                });
                            }
                            Ok(None) => {}
                            Err(e) => warn!("Rejected detection candidate: {}", e),
                        },
                        Err(e) => warn!("Malformed detection candidate: {}", e),
                    }
                    Ok(())
                }),
            )
            .await?;
    }
    info!("Detection feed subscribed");

    // Periodically flush held single-camera candidates out of the fusion
    // window
    {
        let fusion = fusion.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                for request in fusion.flush_expired(Utc::now()) {
                    if let Err(e) = engine.create(request).await {
                        error!("Failed to admit fused alarm: {}", e);
                    }
                }
            }
        });
    }

    info!("CareWatch alarm engine running");

    // Wait for termination signals
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    if let Err(e) = message_broker
        .publish(
            EventType::SystemShutdown,
            None,
            serde_json::json!({"reason": "Normal shutdown"}),
        )
        .await
    {
        error!("Failed to publish shutdown event: {}", e);
    }

    // Allow time for the message to be sent before shutting down
    tokio::time::sleep(Duration::from_secs(1)).await;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}
