#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::protocol::{ClientMessage, ServerMessage};
use crate::engine::FilterKind;
use crate::metrics::ServerMetrics;
use crate::session::{
    FakeClientSettings, SessionError, SessionRegistry, Topology, TreeSettings, ViewerParams,
};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client. Gathering bursts a handful of ICE
/// candidates per endpoint; benchmark runs never queue more than this.
const CHANNEL_CAPACITY: usize = 256;

/// Idle timeout — close connection if no message received within this duration.
/// Long enough for an unattended benchmark hold phase, short enough to not
/// pin semaphore permits forever.
const IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Serialize a ServerMessage and send it through the channel as pre-serialized JSON.
fn send_json(
    sender: &mpsc::Sender<Arc<String>>,
    msg: &ServerMessage,
) -> anyhow::Result<()> {
    let json = Arc::new(serde_json::to_string(msg)?);
    sender.try_send(json).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

/// Handles a single WebSocket connection
pub async fn handle_connection(
    socket: WebSocket,
    registry: Arc<SessionRegistry>,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    let connection_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {}", connection_id);

    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    let connection_id_clone = connection_id.clone();
    let send_metrics = metrics.clone();

    // Spawn task to send messages to client
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc_messages_sent();
            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for connection: {}", connection_id_clone);
    });

    loop {
        // Idle timeout: close connection if no message within IDLE_TIMEOUT
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break, // Stream error or closed
            Err(_) => {
                warn!("Idle timeout for connection {}", connection_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc_messages_received();

                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => {
                        let start = Instant::now();
                        let result = handle_client_message(
                            client_msg,
                            &connection_id,
                            &tx,
                            &registry,
                            &metrics,
                        )
                        .await;
                        metrics.observe_message_handling(start.elapsed());

                        if let Err(e) = result {
                            error!("Error handling message: {}", e);
                            metrics.inc_errors();
                            // If channel is closed, send task has exited — break
                            if tx.is_closed() {
                                break;
                            }
                            let _ = send_json(&tx, &ServerMessage::Error {
                                message: format!("Error: {e}"),
                            });
                        }
                    }
                    Err(e) => {
                        warn!("Invalid message format: {}", e);
                        metrics.inc_errors();
                        let _ = send_json(&tx, &ServerMessage::Error {
                            message: format!("Invalid message format: {e}"),
                        });
                    }
                }
            }
            Message::Close(_) => {
                info!("Client {} closed connection", connection_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // WebSocket ping/pong handled automatically
            }
            _ => {
                warn!("Unexpected message type from client {}", connection_id);
            }
        }
    }

    // Disconnect equals stop: whatever role the connection held ends now.
    registry.stop(&connection_id).await;

    // _conn_guard dropped here → dec_connections_active
    // _permit dropped here → release semaphore

    drop(tx);
    let _ = send_task.await;

    info!("Connection handler finished for connection: {}", connection_id);
}

/// Handle a single client message
async fn handle_client_message(
    message: ClientMessage,
    connection_id: &str,
    sender: &mpsc::Sender<Arc<String>>,
    registry: &Arc<SessionRegistry>,
    metrics: &ServerMetrics,
) -> anyhow::Result<()> {
    match message {
        ClientMessage::Presenter {
            session_number,
            sdp_offer,
            load_points,
        } => {
            match registry
                .start_presenter(&session_number, connection_id, sender.clone(), &sdp_offer, load_points)
                .await
            {
                Ok(sdp_answer) => {
                    metrics.inc_presenters_started();
                    send_json(sender, &ServerMessage::presenter_accepted(sdp_answer))?;
                }
                Err(SessionError::PresenterAlreadyPresent(session)) => {
                    send_json(sender, &ServerMessage::presenter_rejected(format!(
                        "Another user is currently acting as presenter in session {session}. Try again later."
                    )))?;
                }
                Err(e) => {
                    reject_on_engine_error(e, connection_id, sender, registry, metrics).await?;
                }
            }
        }

        ClientMessage::Viewer {
            session_number,
            sdp_offer,
            processing,
            fake_clients,
            fake_points,
            fake_clients_per_instance,
            time_between_clients,
            remove_fake_clients,
            play_time,
            kms_topology,
            kms_number,
            webrtc_channels,
            kms_rate,
            rate_kms_latency,
            kms_latency,
        } => {
            let filter_kind = FilterKind::from_key(processing.as_deref().unwrap_or("none"));
            let params = ViewerParams {
                sdp_offer,
                filter_kind,
                topology: Topology::from_key(kms_topology.as_deref()),
                fake: FakeClientSettings {
                    fake_clients,
                    time_between_clients: Duration::from_millis(time_between_clients),
                    fake_points,
                    fake_clients_per_instance,
                    filter_kind,
                    remove_fake_clients,
                    play_time: Duration::from_secs(play_time),
                },
                tree: TreeSettings {
                    levels: kms_number,
                    channels: webrtc_channels,
                    level_rate: Duration::from_secs(kms_rate),
                    load_points: fake_points,
                    filter_kind,
                },
                latency_interval: kms_latency
                    .then(|| Duration::from_millis(rate_kms_latency.max(1))),
            };

            match registry
                .start_viewer(&session_number, connection_id, sender.clone(), params)
                .await
            {
                Ok(sdp_answer) => {
                    metrics.inc_viewers_started();
                    if fake_clients > 0 {
                        metrics.add_fake_clients_requested(fake_clients as u64);
                    }
                    send_json(sender, &ServerMessage::viewer_accepted(sdp_answer))?;
                }
                Err(SessionError::NoPresenter(session)) => {
                    send_json(sender, &ServerMessage::viewer_rejected(format!(
                        "No active presenter in session {session} now. Become the presenter or try again later."
                    )))?;
                }
                Err(SessionError::DuplicateViewer(session)) => {
                    send_json(sender, &ServerMessage::viewer_rejected(format!(
                        "You are already viewing session {session}. Use a different browser/tab to add additional viewers."
                    )))?;
                }
                Err(e) => {
                    reject_on_engine_error(e, connection_id, sender, registry, metrics).await?;
                }
            }
        }

        ClientMessage::OnIceCandidate { candidate, .. } => {
            if let Err(e) = registry.add_ice_candidate(connection_id, candidate).await {
                debug!("Failed to add ICE candidate from {}: {}", connection_id, e);
            }
        }

        ClientMessage::Stop { session_number } => {
            debug!(
                "Stop requested by connection {} for session {}",
                connection_id, session_number
            );
            metrics.inc_stops();
            registry.stop(connection_id).await;
        }
    }

    Ok(())
}

/// Maps engine failures onto the wire: capacity rejections become
/// `notEnoughResources`, everything else an `error` notice. Either way the
/// connection's role (if it got as far as holding one) is stopped.
async fn reject_on_engine_error(
    error: SessionError,
    connection_id: &str,
    sender: &mpsc::Sender<Arc<String>>,
    registry: &Arc<SessionRegistry>,
    metrics: &ServerMetrics,
) -> anyhow::Result<()> {
    metrics.inc_errors();
    if error.is_resource_exhaustion() {
        warn!("Engine capacity rejected request from {}: {}", connection_id, error);
        send_json(sender, &ServerMessage::NotEnoughResources)?;
    } else {
        warn!("Engine failure for {}: {}", connection_id, error);
        send_json(sender, &ServerMessage::Error {
            message: error.to_string(),
        })?;
    }
    registry.stop(connection_id).await;
    Ok(())
}
