use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse, get, web};
use actix_ws::{Message, MessageStream, Session};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use futures_util::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::RunRequest;
use crate::session::{
    ExecutionRequest, OutputChunk, OutputSink, SessionController, StatusReport, StreamOrigin,
    TransportError,
};

/// Frames sent to the client, one JSON text message each
#[derive(Serialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsEvent {
    Started { session: String },
    /// `data` is base64, since program output need not be UTF-8
    Output { stream: StreamOrigin, data: String },
    End,
    Status { status: StatusReport },
    Error { message: String },
}

impl WsEvent {
    fn to_text(&self) -> String {
        // Serializing these plain enums cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Pushes output to the client as it is produced
struct WsSink {
    session: Session,
}

impl WsSink {
    async fn send(&mut self, event: WsEvent) -> Result<(), TransportError> {
        self.session
            .text(event.to_text())
            .await
            .map_err(|_| TransportError("websocket closed by peer".to_string()))
    }
}

#[async_trait]
impl OutputSink for WsSink {
    async fn session_started(&mut self, session_id: &str) -> Result<(), TransportError> {
        self.send(WsEvent::Started {
            session: session_id.to_string(),
        })
        .await
    }

    async fn push_chunk(&mut self, chunk: &OutputChunk) -> Result<(), TransportError> {
        self.send(WsEvent::Output {
            stream: chunk.origin,
            data: BASE64.encode(&chunk.bytes),
        })
        .await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.send(WsEvent::End).await
    }
}

/// Live run over a WebSocket
///
/// The first text frame carries a [`RunRequest`]; output frames follow while
/// the program runs, then the final status, then the socket is closed.
#[get("/run/ws")]
pub async fn run_ws_handler(
    req: HttpRequest,
    body: web::Payload,
    controller: web::Data<SessionController>,
) -> actix_web::Result<HttpResponse> {
    let (response, session, msg_stream) = actix_ws::handle(&req, body)?;
    actix_web::rt::spawn(serve_run(controller.into_inner(), session, msg_stream));
    Ok(response)
}

async fn serve_run(
    controller: Arc<SessionController>,
    mut session: Session,
    mut msg_stream: MessageStream,
) {
    let request = match receive_request(&mut session, &mut msg_stream).await {
        Ok(Some(request)) => request,
        Ok(None) => return,
        Err(message) => {
            log::debug!("Rejected websocket run request: {message}");
            let _ = session.text(WsEvent::Error { message }.to_text()).await;
            let _ = session.close(None).await;
            return;
        }
    };

    let disconnected = CancellationToken::new();
    let watcher = actix_web::rt::spawn(watch_peer(
        msg_stream,
        session.clone(),
        disconnected.clone(),
    ));

    let mut sink = WsSink {
        session: session.clone(),
    };
    let status = controller
        .run_session_with(request, &mut sink, &disconnected)
        .await;
    watcher.abort();

    let _ = session
        .text(
            WsEvent::Status {
                status: StatusReport::from(&status),
            }
            .to_text(),
        )
        .await;
    let _ = session.close(None).await;
}

/// Waits for the first text frame and decodes it
///
/// `Ok(None)` means the peer left before sending anything.
async fn receive_request(
    session: &mut Session,
    msg_stream: &mut MessageStream,
) -> Result<Option<ExecutionRequest>, String> {
    while let Some(msg) = msg_stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let request: RunRequest =
                    serde_json::from_str(&text).map_err(|e| format!("Invalid request: {e}"))?;
                return request
                    .into_execution_request()
                    .map(Some)
                    .map_err(|e| format!("Invalid base64 input: {e}"));
            }
            Ok(Message::Ping(bytes)) => {
                if session.pong(&bytes).await.is_err() {
                    return Ok(None);
                }
            }
            Ok(Message::Close(_)) | Err(_) => return Ok(None),
            Ok(_) => {}
        }
    }
    Ok(None)
}

/// Answers pings and cancels `disconnected` once the peer goes away
async fn watch_peer(
    mut msg_stream: MessageStream,
    mut session: Session,
    disconnected: CancellationToken,
) {
    while let Some(msg) = msg_stream.next().await {
        match msg {
            Ok(Message::Ping(bytes)) => {
                if session.pong(&bytes).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
    disconnected.cancel();
}
