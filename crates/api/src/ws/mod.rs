//! Live job telemetry over WebSocket.
//!
//! The job is looked up before the upgrade so an unknown id is a plain
//! 404. After the upgrade every frame published on the job's channel is
//! forwarded verbatim as a text message until either side closes. The
//! subscription is released on every exit path.

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use futures::{Sink, SinkExt, Stream, StreamExt};
use spektra_core::types::JobId;
use spektra_telemetry::Subscription;

use crate::error::AppResult;
use crate::state::AppState;

/// GET /api/v1/ws/jobs/{id}
pub async fn stream_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> AppResult<Response> {
    let subscription = state.submitter.subscribe(job_id).await?;
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    tracing::info!(job_id = %job_id, "Telemetry stream opened");
    Ok(upgrade.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        forward(sink, stream, subscription).await;
        tracing::info!(job_id = %job_id, "Telemetry stream closed");
    }))
}

/// Pump channel frames into `sink` until the client goes away or the feed
/// ends. Inbound messages other than close are ignored.
pub async fn forward<S, R, E>(mut sink: S, mut inbound: R, mut subscription: Subscription)
where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    loop {
        tokio::select! {
            frame = subscription.next() => {
                let Some(frame) = frame else { break };
                if sink.send(Message::Text(frame.into())).await.is_err() {
                    tracing::debug!(channel = %subscription.channel(), "WebSocket sink closed");
                    break;
                }
            }
            message = inbound.next() => match message {
                None | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(channel = %subscription.channel(), error = %e, "WebSocket receive error");
                    break;
                }
            },
        }
    }

    subscription.close();
    let _ = sink.close().await;
}
