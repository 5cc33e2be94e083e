use crate::detection::{AlarmRequest, AlarmType};
use crate::error::Error;
use crate::lifecycle::state::ConfirmationState;
use crate::lifecycle::LifecycleEngine;
use crate::messaging::broker::MessageBrokerTrait;
use crate::messaging::event::{EventMessage, EventType};
use anyhow::Result;
use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// Action kinds a console client may request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Create,
    Confirm,
    Dismiss,
    Propose,
    Arbitrate,
    Cancel,
    Resolve,
}

/// Inbound console action envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action: ActionKind,
    pub actor_id: Uuid,
    /// Target alarm; required for everything except `create`
    #[serde(default)]
    pub event_id: Option<Uuid>,
    /// Action-specific payload
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct ReasonPayload {
    #[serde(default)]
    reason: Option<String>,
}

/// Manual alarm trigger (panic button, console-raised incident)
#[derive(Debug, Clone, Deserialize)]
struct CreatePayload {
    subject_id: Uuid,
    area_id: Uuid,
    event_type: AlarmType,
    #[serde(default = "default_manual_confidence")]
    confidence: f64,
    #[serde(default)]
    context: serde_json::Value,
}

fn default_manual_confidence() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
struct ProposePayload {
    #[serde(default)]
    new_type: Option<AlarmType>,
    #[serde(default)]
    new_status: Option<ConfirmationState>,
    reason: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ArbitratePayload {
    accept: bool,
    #[serde(default)]
    reason: Option<String>,
}

/// Connects the broker's console action channel to the lifecycle engine.
/// Every inbound action gets an ack message back, positive or negative;
/// malformed actions are rejected and logged, never silently dropped.
#[derive(Clone)]
pub struct RealtimeBridge {
    engine: Arc<LifecycleEngine>,
    broker: Arc<dyn MessageBrokerTrait>,
}

impl RealtimeBridge {
    pub fn new(engine: Arc<LifecycleEngine>, broker: Arc<dyn MessageBrokerTrait>) -> Self {
        Self { engine, broker }
    }

    /// Subscribe to the console action channel. Returns the subscription id.
    pub async fn run(&self) -> Result<String> {
        let bridge = self.clone();
        let subscription_id = self
            .broker
            .subscribe(
                EventType::ActionRequested,
                Arc::new(move |message| {
                    let bridge = bridge.clone();
                    tokio::spawn(async move {
                        bridge.process(message).await;
                    });
                    Ok(())
                }),
            )
            .await?;
        info!("Realtime bridge listening for console actions");
        Ok(subscription_id)
    }

    /// Handle one inbound message and publish the ack
    pub async fn process(&self, message: EventMessage) {
        let request_id = message.id;
        let source_id = message.source_id;
        let ack = match self.handle_action(&message).await {
            Ok(event_id) => json!({
                "request_id": request_id,
                "ok": true,
                "event_id": event_id,
            }),
            Err(e) => {
                warn!("Rejected console action {}: {}", request_id, e);
                json!({
                    "request_id": request_id,
                    "ok": false,
                    "error": e.to_string(),
                })
            }
        };
        if let Err(e) = self
            .broker
            .publish(EventType::ActionAck, source_id, ack)
            .await
        {
            warn!("Failed to ack console action {}: {}", request_id, e);
        }
    }

    /// Apply one console action to the lifecycle engine, returning the id of
    /// the affected alarm
    pub async fn handle_action(&self, message: &EventMessage) -> Result<Uuid> {
        let request: ActionRequest = serde_json::from_value(message.payload.clone())
            .map_err(|e| Error::InvalidInput(format!("Malformed console action: {}", e)))?;

        match request.action {
            ActionKind::Create => {
                let create: CreatePayload = Self::parse(&request.payload)?;
                let alarm = self
                    .engine
                    .create(AlarmRequest {
                        subject_id: create.subject_id,
                        area_id: create.area_id,
                        camera_ids: Vec::new(),
                        event_type: create.event_type,
                        confidence: create.confidence,
                        reliability: create.confidence,
                        captured_at: Utc::now(),
                        context: create.context,
                    })
                    .await?;
                Ok(alarm.id)
            }
            ActionKind::Confirm => {
                let id = Self::target(&request)?;
                let payload: ReasonPayload = Self::parse_opt(&request.payload)?;
                let alarm = self.engine.confirm(id, request.actor_id, payload.reason).await?;
                Ok(alarm.id)
            }
            ActionKind::Dismiss => {
                let id = Self::target(&request)?;
                let payload: ReasonPayload = Self::parse_opt(&request.payload)?;
                let alarm = self.engine.dismiss(id, request.actor_id, payload.reason).await?;
                Ok(alarm.id)
            }
            ActionKind::Propose => {
                let id = Self::target(&request)?;
                let payload: ProposePayload = Self::parse(&request.payload)?;
                let alarm = self
                    .engine
                    .propose(
                        id,
                        request.actor_id,
                        payload.new_type,
                        payload.new_status,
                        payload.reason,
                    )
                    .await?;
                Ok(alarm.id)
            }
            ActionKind::Arbitrate => {
                let id = Self::target(&request)?;
                let payload: ArbitratePayload = Self::parse(&request.payload)?;
                let alarm = self
                    .engine
                    .arbitrate(id, request.actor_id, payload.accept, payload.reason)
                    .await?;
                Ok(alarm.id)
            }
            ActionKind::Cancel => {
                let id = Self::target(&request)?;
                let payload: ReasonPayload = Self::parse_opt(&request.payload)?;
                let reason = payload
                    .reason
                    .unwrap_or_else(|| "canceled via console".to_string());
                let alarm = self.engine.cancel(id, Some(request.actor_id), reason).await?;
                Ok(alarm.id)
            }
            ActionKind::Resolve => {
                let id = Self::target(&request)?;
                let payload: ReasonPayload = Self::parse_opt(&request.payload)?;
                let alarm = self.engine.resolve(id, request.actor_id, payload.reason).await?;
                Ok(alarm.id)
            }
        }
    }

    fn target(request: &ActionRequest) -> Result<Uuid> {
        Ok(request
            .event_id
            .ok_or_else(|| Error::InvalidInput("Action requires an event_id".to_string()))?)
    }

    fn parse<T: serde::de::DeserializeOwned>(payload: &serde_json::Value) -> Result<T> {
        Ok(serde_json::from_value(payload.clone())
            .map_err(|e| Error::InvalidInput(format!("Malformed action payload: {}", e)))?)
    }

    fn parse_opt<T: serde::de::DeserializeOwned + Default>(
        payload: &serde_json::Value,
    ) -> Result<T> {
        if payload.is_null() {
            return Ok(T::default());
        }
        Self::parse(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DispatchConfig, LifecycleConfig};
    use crate::db::memory::MemoryStore;
    use crate::dispatch::NotificationDispatcher;
    use crate::messaging::broker::EventCallback;
    use crate::scheduler::DeadlineScheduler;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBroker {
        published: Mutex<Vec<(EventType, serde_json::Value)>>,
    }

    #[async_trait]
    impl MessageBrokerTrait for RecordingBroker {
        async fn publish(
            &self,
            event_type: EventType,
            _source_id: Option<Uuid>,
            payload: serde_json::Value,
        ) -> Result<()> {
            self.published.lock().unwrap().push((event_type, payload));
            Ok(())
        }

        async fn subscribe(&self, _event_type: EventType, _cb: EventCallback) -> Result<String> {
            Ok("sub".to_string())
        }

        async fn subscribe_pattern(&self, _pattern: &str, _cb: EventCallback) -> Result<String> {
            Ok("sub".to_string())
        }

        async fn unsubscribe(&self, _subscription_id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn bridge() -> (Arc<RealtimeBridge>, Arc<LifecycleEngine>, Arc<RecordingBroker>) {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Arc::new(NotificationDispatcher::new(
            store.clone(),
            store.clone(),
            DispatchConfig::default(),
        ));
        let engine = Arc::new(LifecycleEngine::new(
            store,
            Arc::new(DeadlineScheduler::new()),
            dispatcher,
            LifecycleConfig::default(),
        ));
        let broker = Arc::new(RecordingBroker::default());
        let bridge = Arc::new(RealtimeBridge::new(engine.clone(), broker.clone()));
        (bridge, engine, broker)
    }

    fn action_message(payload: serde_json::Value) -> EventMessage {
        EventMessage::new(EventType::ActionRequested, None, payload)
    }

    #[tokio::test]
    async fn manual_trigger_creates_and_confirm_settles() {
        let (bridge, engine, _) = bridge();
        let actor = Uuid::new_v4();

        let created = bridge
            .handle_action(&action_message(json!({
                "action": "create",
                "actor_id": actor,
                "payload": {
                    "subject_id": Uuid::new_v4(),
                    "area_id": Uuid::new_v4(),
                    "event_type": "manual_emergency",
                },
            })))
            .await
            .unwrap();

        let alarm = engine.fetch(created).await.unwrap().unwrap();
        assert_eq!(alarm.event_type, AlarmType::ManualEmergency);
        assert_eq!(alarm.confidence, 1.0);

        bridge
            .handle_action(&action_message(json!({
                "action": "confirm",
                "actor_id": actor,
                "event_id": created,
                "payload": {"reason": "verified on stream"},
            })))
            .await
            .unwrap();
        let alarm = engine.fetch(created).await.unwrap().unwrap();
        assert_eq!(alarm.confirmation_state, ConfirmationState::Confirmed);
        assert_eq!(alarm.last_actor, Some(actor));
    }

    #[tokio::test]
    async fn proposal_flow_works_over_the_bridge() {
        let (bridge, engine, _) = bridge();
        let created = bridge
            .handle_action(&action_message(json!({
                "action": "create",
                "actor_id": Uuid::new_v4(),
                "payload": {
                    "subject_id": Uuid::new_v4(),
                    "area_id": Uuid::new_v4(),
                    "event_type": "fall",
                    "confidence": 0.7,
                },
            })))
            .await
            .unwrap();

        bridge
            .handle_action(&action_message(json!({
                "action": "propose",
                "actor_id": Uuid::new_v4(),
                "event_id": created,
                "payload": {"new_status": "dismissed", "reason": "patient is fine"},
            })))
            .await
            .unwrap();
        bridge
            .handle_action(&action_message(json!({
                "action": "arbitrate",
                "actor_id": Uuid::new_v4(),
                "event_id": created,
                "payload": {"accept": true},
            })))
            .await
            .unwrap();

        let alarm = engine.fetch(created).await.unwrap().unwrap();
        assert_eq!(alarm.confirmation_state, ConfirmationState::Dismissed);
    }

    #[tokio::test]
    async fn malformed_action_gets_a_negative_ack() {
        let (bridge, _, broker) = bridge();

        bridge
            .process(action_message(json!({"action": "explode"})))
            .await;

        let published = broker.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        let (event_type, ack) = &published[0];
        assert_eq!(*event_type, EventType::ActionAck);
        assert_eq!(ack["ok"], json!(false));
        assert!(ack["error"].as_str().unwrap().contains("Malformed"));
    }

    #[tokio::test]
    async fn decision_without_target_is_rejected() {
        let (bridge, _, _) = bridge();
        let err = bridge
            .handle_action(&action_message(json!({
                "action": "dismiss",
                "actor_id": Uuid::new_v4(),
            })))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("event_id"));
    }
}
