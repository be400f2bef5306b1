use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::Message;

use nrp_protocol::{decode_ws_message, encode_ws_message, Frame, FrameFlag, FrameType, RequestHead};

use crate::forwarder::{normalize_path, LocalRelay, LOCAL_HOST};

/// Bridge one tunnel stream to a local WebSocket
///
/// Runs until either side closes. A close from the tunnel is not echoed back,
/// so each direction carries at most one terminator.
pub(crate) async fn forward(
    relay: Arc<LocalRelay>,
    stream_id: u32,
    port: u16,
    head: RequestHead,
    mut frames: mpsc::UnboundedReceiver<Frame>,
) {
    let data_kind = FrameType::ws_data(relay.revision());
    let url = format!("ws://{}:{}{}", LOCAL_HOST, port, normalize_path(&head.path));

    let mut request = match url.as_str().into_client_request() {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("Invalid websocket target {} for stream {}: {}", url, stream_id, e);
            relay.send(Frame::end_data(data_kind, stream_id));
            relay.finish(stream_id);
            return;
        }
    };
    if let Some(protocol) = head
        .headers
        .get("sec-websocket-protocol")
        .and_then(|p| HeaderValue::from_str(p).ok())
    {
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, protocol);
    }

    let ws = match connect_async(request).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            tracing::warn!("Local websocket {} failed for stream {}: {}", url, stream_id, e);
            relay.send(Frame::end_data(data_kind, stream_id));
            relay.finish(stream_id);
            return;
        }
    };
    tracing::debug!("Stream {}: websocket connected to {}", stream_id, url);

    let (mut sink, mut source) = ws.split();
    loop {
        tokio::select! {
            message = source.next() => {
                let payload = match message {
                    Some(Ok(Message::Text(text))) => encode_ws_message(false, text.as_bytes()),
                    Some(Ok(Message::Binary(data))) => encode_ws_message(true, &data),
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::debug!("Local websocket closed on stream {}", stream_id);
                        relay.send(Frame::end_data(data_kind, stream_id));
                        let _ = sink.close().await;
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!("Local websocket error on stream {}: {}", stream_id, e);
                        relay.send(Frame::end_data(data_kind, stream_id));
                        break;
                    }
                };
                if !relay.send(Frame::new(data_kind, FrameFlag::Padded, stream_id, payload)) {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
            frame = frames.recv() => {
                match frame {
                    Some(frame) if frame.is_data_end() => {
                        tracing::debug!("Public side closed websocket on stream {}", stream_id);
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    Some(frame) => {
                        let (binary, body) = decode_ws_message(frame.payload());
                        let message = if binary {
                            Message::binary(body)
                        } else {
                            Message::text(String::from_utf8_lossy(&body).into_owned())
                        };
                        if let Err(e) = sink.send(message).await {
                            tracing::debug!("Local websocket write failed on stream {}: {}", stream_id, e);
                            relay.send(Frame::end_data(data_kind, stream_id));
                            break;
                        }
                    }
                    None => {
                        let _ = sink.close().await;
                        break;
                    }
                }
            }
        }
    }

    relay.finish(stream_id);
}
