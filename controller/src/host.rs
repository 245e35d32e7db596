use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, Publish};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use recirc_common::{ControlError, RecirculatorEngine, RuntimeConfig};

use crate::{
    store::{load_target, AppStore},
    supervisor::Supervisor,
    transport::MqttTransport,
};

type AppSupervisor = Supervisor<MqttTransport, AppStore>;

#[derive(Clone)]
struct AppState {
    supervisor: Arc<AppSupervisor>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.recirculator.sanitize();

    let device_id = std::env::var("DEVICE_ID").unwrap_or(runtime.device_id.clone());
    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(runtime.network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.mqtt_port);

    let mut mqtt_options = MqttOptions::new("recirculator-controller", mqtt_host, mqtt_port);
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(runtime.network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(runtime.network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);
    let transport = Arc::new(MqttTransport::new(
        mqtt,
        Duration::from_millis(runtime.recirculator.request_timeout_ms),
    ));
    spawn_mqtt_loop(transport.clone(), device_id.clone(), eventloop);

    let store = Arc::new(store);
    let target = load_target(store.as_ref()).await;
    let engine = RecirculatorEngine::new(runtime.recirculator.clone(), target);
    let supervisor = Arc::new(Supervisor::new(engine, transport, store, device_id));
    supervisor.attach().await;

    let app_state = AppState {
        supervisor: supervisor.clone(),
    };

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/start", post(handle_start))
        .route("/api/stop", post(handle_stop))
        .route("/api/target", get(handle_get_target))
        .with_state(app_state);

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller for {} listening on http://{addr}", supervisor.device_id());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    supervisor.detach().await;
    Ok(())
}

/// What the MQTT loop does with one event.
#[derive(Debug)]
enum MqttStep {
    Route(Publish),
    Resubscribe,
    Ignore,
}

/// Clean sessions drop subscriptions on every reconnect, so each `ConnAck`
/// has to subscribe to the reply topics again.
fn classify(event: Event) -> MqttStep {
    match event {
        Event::Incoming(Incoming::Publish(message)) => MqttStep::Route(message),
        Event::Incoming(Incoming::ConnAck(_)) => MqttStep::Resubscribe,
        _ => MqttStep::Ignore,
    }
}

fn spawn_mqtt_loop(
    transport: Arc<MqttTransport>,
    device_id: String,
    mut eventloop: rumqttc::EventLoop,
) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await.map(classify) {
                Ok(MqttStep::Route(message)) => {
                    transport.route(&message.topic, &message.payload).await;
                }
                Ok(MqttStep::Resubscribe) => {
                    info!("mqtt connected, subscribing to replies from {device_id}");
                    // The request queue is drained by this loop, so never
                    // wait on it from here.
                    let transport = transport.clone();
                    let device_id = device_id.clone();
                    tokio::spawn(async move {
                        if let Err(err) = transport.subscribe(&device_id).await {
                            warn!("failed to subscribe to device reply topics: {err}");
                        }
                    });
                }
                Ok(MqttStep::Ignore) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.supervisor.snapshot().await)
}

async fn handle_start(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let value = match params.get("value") {
        Some(raw) => match raw.parse::<f32>() {
            Ok(value) => Some(value),
            Err(_) => return error_response(StatusCode::BAD_REQUEST, "Invalid temperature value"),
        },
        None => None,
    };

    match state.supervisor.start(value).await {
        Ok(status) => Json(status).into_response(),
        Err(err) => control_error_response(&err),
    }
}

async fn handle_stop(State(state): State<AppState>) -> impl IntoResponse {
    match state.supervisor.stop().await {
        Ok(status) => Json(status).into_response(),
        Err(err) => control_error_response(&err),
    }
}

async fn handle_get_target(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.supervisor.stored_target().await)
}

fn control_error_response(err: &ControlError) -> axum::response::Response {
    let status = match err {
        ControlError::OutOfRange { .. } => StatusCode::BAD_REQUEST,
        ControlError::Busy(_) | ControlError::Cancelled { .. } => StatusCode::CONFLICT,
        ControlError::Dispatch { .. } => StatusCode::BAD_GATEWAY,
        ControlError::NoResponse { .. } | ControlError::EarlyStop { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(status, &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_errors_map_to_http_statuses() {
        let cases = [
            (
                ControlError::OutOfRange {
                    value: 90.0,
                    min: 30.0,
                    max: 60.0,
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                ControlError::Busy(recirc_common::Phase::Heating),
                StatusCode::CONFLICT,
            ),
            (
                ControlError::Dispatch {
                    command: "turnOn",
                    message: "no reply".to_string(),
                },
                StatusCode::BAD_GATEWAY,
            ),
            (
                ControlError::Cancelled { next: "turnOn" },
                StatusCode::CONFLICT,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(control_error_response(&err).status(), expected);
        }
    }

    #[test]
    fn every_connack_resubscribes() {
        let connack = Event::Incoming(Incoming::ConnAck(rumqttc::ConnAck {
            session_present: false,
            code: rumqttc::ConnectReturnCode::Success,
        }));
        assert!(matches!(classify(connack), MqttStep::Resubscribe));

        let publish = Event::Incoming(Incoming::Publish(Publish::new(
            "recirculator/dev/reply",
            rumqttc::QoS::AtMostOnce,
            r#"{"requestId":1,"ok":true}"#,
        )));
        assert!(
            matches!(classify(publish), MqttStep::Route(message) if message.topic == "recirculator/dev/reply")
        );

        assert!(matches!(
            classify(Event::Incoming(Incoming::PingResp)),
            MqttStep::Ignore
        ));
    }
}
