//! `/ws` duplex channel.
//!
//! Each connection runs a reader loop in the upgrade task and a writer task
//! draining a bounded frame queue. Sessions the connection prompts or
//! subscribes to feed that queue through their forwarders; when the channel
//! drops, the connection is detached everywhere and output queues on the
//! session again.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

use super::AppState;
use crate::models::frame::{ClientFrame, ServerFrame};
use crate::session::manager::ChannelPrompt;
use crate::session::Subscriber;
use crate::AppError;

/// Upgrade handler mounted at `/ws`.
pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| serve_channel(socket, state))
}

async fn serve_channel(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = state.next_connection_id();
    let span = info_span!("channel", connection_id);
    async move {
        info!("channel opened");
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::channel::<ServerFrame>(state.config.stream.channel_capacity);

        let mut writer = tokio::spawn(
            async move {
                while let Some(frame) = rx.recv().await {
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(%err, "failed to encode frame");
                            continue;
                        }
                    };
                    if let Err(err) = sink.send(Message::Text(text.into())).await {
                        debug!(%err, "channel write failed");
                        break;
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
            }
            .in_current_span(),
        );

        let shutdown = state.shutdown().clone();
        loop {
            let message = tokio::select! {
                () = shutdown.cancelled() => break,
                message = stream.next() => message,
            };
            match message {
                Some(Ok(Message::Text(text))) => {
                    handle_text(&state, connection_id, &tx, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Binary(_))) => {
                    let err = AppError::BadRequest("binary frames are not supported".into());
                    let _ = tx.send(ServerFrame::error(None, None, &err)).await;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(%err, "channel read failed");
                    break;
                }
            }
        }

        let detached = state.manager.detach_connection(connection_id).await;
        drop(tx);
        if tokio::time::timeout(std::time::Duration::from_secs(1), &mut writer)
            .await
            .is_err()
        {
            writer.abort();
            debug!("channel writer did not drain in time");
        }
        info!(detached, "channel closed");
    }
    .instrument(span)
    .await;
}

async fn handle_text(
    state: &AppState,
    connection_id: u64,
    tx: &mpsc::Sender<ServerFrame>,
    text: &str,
) {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(err) => {
            let err = AppError::BadRequest(format!("invalid frame: {err}"));
            let _ = tx.send(ServerFrame::error(None, None, &err)).await;
            return;
        }
    };

    let subscriber = || Subscriber {
        connection_id,
        sender: tx.clone(),
    };

    let failure = match frame {
        ClientFrame::Prompt {
            request_id,
            prompt,
            session_id,
            working_directory,
            format,
        } => {
            if prompt.trim().is_empty() {
                Some((
                    session_id,
                    Some(request_id),
                    AppError::BadRequest("missing prompt".into()),
                ))
            } else {
                let submitted = state
                    .manager
                    .submit_channel_prompt(
                        ChannelPrompt {
                            request_id: request_id.clone(),
                            prompt,
                            session_id: session_id.clone(),
                            working_directory,
                            format,
                        },
                        subscriber(),
                    )
                    .await;
                submitted
                    .err()
                    .map(|err| (session_id, Some(request_id), err))
            }
        }
        ClientFrame::Subscribe { session_id } => state
            .manager
            .subscribe(&session_id, subscriber())
            .await
            .err()
            .map(|err| (Some(session_id), None, err)),
        ClientFrame::Permission {
            session_id,
            response,
        } => state
            .manager
            .handle_permission_prompt(&session_id, &response)
            .await
            .err()
            .map(|err| (Some(session_id), None, err)),
        ClientFrame::Ping => {
            let _ = tx.send(ServerFrame::Pong).await;
            None
        }
    };

    if let Some((session_id, request_id, err)) = failure {
        debug!(?session_id, ?request_id, %err, "channel request failed");
        let _ = tx
            .send(ServerFrame::error(session_id, request_id, &err))
            .await;
    }
}
