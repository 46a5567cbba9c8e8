//! WebSocket endpoints for log tails and shells.
//!
//! Both start with a `session` control message carrying the session id. Log frames are sent
//! as JSON text. Shell output is sent as binary messages, with dropped and end markers as JSON
//! text; anything the client sends is written to the terminal.

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Serialize;

use super::{
    data::ControlMessage,
    handlers::ApiResult,
    state::ServerState,
};
use crate::{
    models::{Caller, SessionFrame, SessionInfo},
    session::{LogTail, SessionMultiplexer, ShellAttachment},
};

//--------------------------------------------------------------------------------------------------
// Functions: Handlers
//--------------------------------------------------------------------------------------------------

/// Handler for `GET /instances/{id}/logs`
pub async fn log_tail(
    State(state): State<ServerState>,
    caller: Caller,
    Path(id): Path<String>,
    upgrade: WebSocketUpgrade,
) -> ApiResult<Response> {
    state.host().instance_for(&caller, &id)?;
    let multiplexer = state.host().get_multiplexer().clone();
    let tail = multiplexer.attach_log_tail(&id)?;

    Ok(upgrade.on_upgrade(move |socket| run_log_tail(socket, tail, multiplexer)))
}

/// Handler for `GET /instances/{id}/shell`
pub async fn shell(
    State(state): State<ServerState>,
    caller: Caller,
    Path(id): Path<String>,
    upgrade: WebSocketUpgrade,
) -> ApiResult<Response> {
    state.host().instance_for(&caller, &id)?;
    let multiplexer = state.host().get_multiplexer().clone();
    let attachment = multiplexer.attach_shell(&id).await?;

    Ok(upgrade.on_upgrade(move |socket| run_shell(socket, attachment, multiplexer)))
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

async fn run_log_tail(socket: WebSocket, tail: LogTail, multiplexer: SessionMultiplexer) {
    let (mut sink, mut incoming) = socket.split();
    let LogTail { info, mut events } = tail;

    if let Some(info) = &info {
        if send_json(&mut sink, &ControlMessage::Session(info.clone()))
            .await
            .is_err()
        {
            detach(&multiplexer, info);
            return;
        }
    }

    loop {
        tokio::select! {
            frame = events.next() => {
                let Some(frame) = frame else { break };
                let end = frame.is_end();
                if send_json(&mut sink, &frame).await.is_err() || end {
                    break;
                }
            }
            message = incoming.next() => match message {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    if let Some(info) = &info {
        detach(&multiplexer, info);
    }
}

async fn run_shell(socket: WebSocket, attachment: ShellAttachment, multiplexer: SessionMultiplexer) {
    let (mut sink, mut incoming) = socket.split();
    let ShellAttachment {
        info,
        mut output,
        input,
    } = attachment;

    if send_json(&mut sink, &ControlMessage::Session(info.clone()))
        .await
        .is_err()
    {
        detach(&multiplexer, &info);
        return;
    }

    loop {
        tokio::select! {
            frame = output.next() => {
                let sent = match frame {
                    Some(SessionFrame::Event(chunk)) => sink.send(Message::Binary(chunk)).await.is_ok(),
                    Some(SessionFrame::Dropped { count }) => {
                        send_json(&mut sink, &SessionFrame::<()>::Dropped { count }).await.is_ok()
                    }
                    Some(SessionFrame::End) => {
                        let _ = send_json(&mut sink, &SessionFrame::<()>::End).await;
                        false
                    }
                    None => false,
                };
                if !sent {
                    break;
                }
            }
            message = incoming.next() => {
                let written = match message {
                    Some(Ok(Message::Text(text))) => {
                        input.send(Bytes::copy_from_slice(text.as_str().as_bytes()))
                    }
                    Some(Ok(Message::Binary(data))) => input.send(data),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => Ok(()),
                };
                if let Err(e) = written {
                    tracing::debug!(session_id = %info.session_id, error = %e, "shell input rejected");
                }
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    detach(&multiplexer, &info);
}

async fn send_json<T>(sink: &mut SplitSink<WebSocket, Message>, value: &T) -> Result<(), ()>
where
    T: Serialize,
{
    let text = serde_json::to_string(value).map_err(|e| {
        tracing::error!(error = %e, "failed to encode session message");
    })?;

    sink.send(Message::Text(text.into())).await.map_err(|_| ())
}

fn detach(multiplexer: &SessionMultiplexer, info: &SessionInfo) {
    if multiplexer.detach(info.session_id).is_ok() {
        tracing::debug!(session_id = %info.session_id, instance_id = %info.instance_id, "websocket closed");
    }
}
