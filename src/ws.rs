//! WebSocket ingress speaking the EVENT/OK subset of the relay protocol.

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};

use crate::admission::{AdmissionPipeline, ClientContext};
use crate::protocol::{parse_message, ClientMessage, CommandSink};

/// Start the WebSocket server feeding the admission pipeline.
pub async fn serve_ws(
    addr: SocketAddr,
    pipeline: Arc<AdmissionPipeline>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = Router::new().route("/", get(handler)).with_state(pipeline);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

/// Handle the HTTP upgrade and spawn the connection processor.
async fn handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(pipeline): State<Arc<AdmissionPipeline>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move { process(socket, pipeline, peer).await })
}

/// Process one connection: admissions run strictly in arrival order, and the
/// writer task drains acknowledgements in the order they were produced.
async fn process(socket: WebSocket, pipeline: Arc<AdmissionPipeline>, peer: SocketAddr) {
    let (sink, mut rx) = CommandSink::channel();
    let (mut outbound, mut inbound) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if outbound.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    let ctx = ClientContext {
        ip: peer.ip(),
        sink,
    };
    while let Some(Ok(msg)) = inbound.next().await {
        if let Message::Text(txt) = msg {
            match parse_message(&txt) {
                Some(ClientMessage::Event(event)) => {
                    // A transport fault mid-admission closes the connection;
                    // the client received no acknowledgement for this event.
                    if let Err(e) = pipeline.handle(event, &ctx).await {
                        tracing::error!(%peer, error = %e, "admission failed, closing connection");
                        break;
                    }
                }
                None => {
                    // Unknown or malformed frames are ignored.
                }
            }
        }
    }

    // Dropping the last sink ends the writer once queued frames are flushed.
    drop(ctx);
    let _ = writer.await;
}
