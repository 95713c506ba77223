/// WebSocket connection handler
///
/// One task per socket. It owns both halves of the socket and:
/// - Registers with the broker, which assigns the connection id
/// - Writes frames, probes and close requests coming from the broker
/// - Forwards client text to the inbound queue and pongs to the liveness table
/// - Reports the disconnect exactly once when the socket ends
use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::{
    arguments::is_debug_transport_enabled,
    broker::{ConnectionId, FrameMode, InboundMessage, Outgoing},
    logger::{self, LogTag},
    webserver::state::AppState,
};

/// How a write burst ended
#[derive(Debug, PartialEq)]
enum BurstOutcome {
    /// Everything buffered was written and flushed
    Written,
    /// The broker asked for the socket to be closed
    Closed,
    Failed(String),
    /// The peer stopped reading; the socket is abandoned
    TimedOut,
}

/// Handle a WebSocket connection subscribed to `topic`
pub async fn handle_connection(socket: WebSocket, topic: String, state: Arc<AppState>) {
    let broker = state.broker.clone();
    let write_timeout = Duration::from_secs(state.config.write_timeout_secs.max(1));
    let (tx, mut rx) = mpsc::channel::<Outgoing>(state.transport_buffer);

    let conn_id = match broker.connect(&topic, tx).await {
        Ok(id) => id,
        Err(e) => {
            logger::warning(
                LogTag::Transport,
                &format!("Connection on '{}' not registered: {}", topic, e),
            );
            return;
        }
    };

    let (mut ws_tx, mut ws_rx) = socket.split();

    if is_debug_transport_enabled() {
        logger::debug(
            LogTag::Transport,
            &format!("Connection {} started on '{}'", conn_id, topic),
        );
    }

    loop {
        tokio::select! {
            biased;

            // Frames and control from the broker
            outgoing = rx.recv() => {
                let Some(item) = outgoing else {
                    // Broker dropped the connection
                    break;
                };
                match send_burst(&mut ws_tx, &mut rx, item, conn_id, write_timeout).await {
                    BurstOutcome::Written => broker.writable(conn_id),
                    BurstOutcome::Closed => break,
                    BurstOutcome::Failed(e) => {
                        logger::warning(
                            LogTag::Transport,
                            &format!("Connection {}: failed to send: {}", conn_id, e),
                        );
                        break;
                    }
                    BurstOutcome::TimedOut => {
                        logger::warning(
                            LogTag::Transport,
                            &format!(
                                "Connection {}: write stalled for {}s, closing",
                                conn_id,
                                write_timeout.as_secs()
                            ),
                        );
                        break;
                    }
                }
            }

            // Messages from the client
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        submit(&state, InboundMessage::text(&topic, conn_id, text));
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        submit(&state, InboundMessage {
                            topic: topic.clone(),
                            source: conn_id,
                            payload: bytes,
                            mode: FrameMode::Binary,
                        });
                    }
                    Some(Ok(Message::Pong(_))) => {
                        broker.pong(conn_id).await;
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // axum answers pings itself
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        if is_debug_transport_enabled() {
                            logger::debug(
                                LogTag::Transport,
                                &format!("Connection {}: client closed", conn_id),
                            );
                        }
                        break;
                    }
                    Some(Err(e)) => {
                        logger::warning(
                            LogTag::Transport,
                            &format!("Connection {}: websocket error: {}", conn_id, e),
                        );
                        break;
                    }
                }
            }
        }
    }

    broker.disconnect(conn_id).await;
    let _ = tokio::time::timeout(write_timeout, ws_tx.close()).await;

    if is_debug_transport_enabled() {
        logger::debug(LogTag::Transport, &format!("Connection {} closed", conn_id));
    }
}

/// Write a burst, giving up once `deadline` passes
async fn send_burst<S>(
    sink: &mut S,
    rx: &mut mpsc::Receiver<Outgoing>,
    first: Outgoing,
    conn_id: ConnectionId,
    deadline: Duration,
) -> BurstOutcome
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    match tokio::time::timeout(deadline, write_burst(sink, rx, first, conn_id)).await {
        Ok(Ok(true)) => BurstOutcome::Written,
        Ok(Ok(false)) => BurstOutcome::Closed,
        Ok(Err(e)) => BurstOutcome::Failed(e.to_string()),
        Err(_) => BurstOutcome::TimedOut,
    }
}

/// Write `first` and everything else already buffered
///
/// Returns false when the broker asked for the socket to be closed.
async fn write_burst<S>(
    sink: &mut S,
    rx: &mut mpsc::Receiver<Outgoing>,
    first: Outgoing,
    conn_id: ConnectionId,
) -> Result<bool, S::Error>
where
    S: Sink<Message> + Unpin,
{
    let mut next = Some(first);
    while let Some(item) = next.take() {
        match item {
            Outgoing::Frame(frame) => {
                let message = match frame.mode {
                    FrameMode::Text => match frame.as_text() {
                        Some(text) => Message::Text(text.to_string()),
                        None => {
                            logger::warning(
                                LogTag::Transport,
                                &format!("Connection {}: text frame is not UTF-8, skipped", conn_id),
                            );
                            next = rx.try_recv().ok();
                            continue;
                        }
                    },
                    FrameMode::Binary => Message::Binary(frame.payload.to_vec()),
                };
                sink.feed(message).await?;
            }
            Outgoing::Ping => {
                sink.feed(Message::Ping(Vec::new())).await?;
            }
            Outgoing::Close => {
                sink.send(Message::Close(None)).await?;
                return Ok(false);
            }
        }
        next = rx.try_recv().ok();
    }
    sink.flush().await?;
    Ok(true)
}

fn submit(state: &AppState, msg: InboundMessage) {
    let source = msg.source;
    match state.broker.submit_inbound(msg) {
        Ok(()) => {}
        Err(e) if e.is_dropped_message() => {
            if is_debug_transport_enabled() {
                logger::debug(
                    LogTag::Transport,
                    &format!("Connection {}: inbound frame dropped: {}", source, e),
                );
            }
        }
        Err(e) => logger::warning(
            LogTag::Transport,
            &format!("Connection {}: inbound frame not accepted: {}", source, e),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{
        shared, update_field, Broker, Frame, StateBody, StateUpdateResult, TopicRegistry,
        TopicState,
    };
    use crate::config::{BrokerConfig, WebserverConfig};
    use serde_json::{json, Value};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::net::TcpListener;
    use tokio_tungstenite::{connect_async, tungstenite::Message as ClientMessage};

    #[derive(Default)]
    struct Light {
        on: bool,
    }

    impl TopicState for Light {
        fn read(&self, root: &mut StateBody) {
            root.insert("on".to_string(), json!(self.on));
        }

        fn update(&mut self, root: &StateBody) -> StateUpdateResult {
            StateUpdateResult::from_changed(update_field(root, "on", &mut self.on))
        }
    }

    async fn next_json<S>(stream: &mut S) -> Value
    where
        S: futures::Stream<Item = Result<ClientMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            match stream.next().await {
                Some(Ok(ClientMessage::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("unexpected socket item: {:?}", other),
            }
        }
    }

    /// Sink whose peer never reads
    struct StalledSink;

    impl Sink<Message> for StalledSink {
        type Error = std::convert::Infallible;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_times_out() {
        let (_tx, mut rx) = mpsc::channel::<Outgoing>(4);
        let start = tokio::time::Instant::now();

        let outcome = send_burst(&mut StalledSink, &mut rx, Outgoing::Ping, 1, Duration::from_secs(10)).await;

        assert_eq!(outcome, BurstOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_burst_writes_buffered_items() {
        let (tx, mut rx) = mpsc::channel::<Outgoing>(4);
        tx.try_send(Outgoing::Frame(Frame::text("{}"))).unwrap();
        tx.try_send(Outgoing::Ping).unwrap();

        let mut sink = futures::sink::drain::<Message>();
        let first = Outgoing::Frame(Frame::text("{}"));
        let outcome = send_burst(&mut sink, &mut rx, first, 1, Duration::from_secs(10)).await;
        assert_eq!(outcome, BurstOutcome::Written);
        assert!(rx.try_recv().is_err());

        tx.try_send(Outgoing::Close).unwrap();
        let outcome = send_burst(&mut sink, &mut rx, Outgoing::Ping, 1, Duration::from_secs(10)).await;
        assert_eq!(outcome, BurstOutcome::Closed);
    }

    #[tokio::test]
    async fn test_socket_roundtrip() {
        let mut registry = TopicRegistry::new();
        let light = shared(Light::default());
        registry.register_state("light", light.clone()).unwrap();

        let (broker, handle) = Broker::new(&BrokerConfig::default(), Arc::new(registry));
        broker.spawn();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(AppState::new(handle, WebserverConfig::default(), 4));
        tokio::spawn(crate::webserver::serve(listener, state));

        let (mut socket, _) = connect_async(format!("ws://{}/ws/light", addr)).await.unwrap();

        assert_eq!(
            next_json(&mut socket).await,
            json!({"type": "id", "origin_id": "", "id": "ws:1"})
        );
        assert_eq!(
            next_json(&mut socket).await,
            json!({"type": "p", "origin_id": "", "p": {"on": false}})
        );

        socket
            .send(ClientMessage::Text(r#"{"on":true}"#.to_string()))
            .await
            .unwrap();
        assert_eq!(
            next_json(&mut socket).await,
            json!({"type": "p", "origin_id": "ws:1", "p": {"on": true}})
        );
        assert!(light.read().on);

        assert!(connect_async(format!("ws://{}/ws/unknown", addr)).await.is_err());
    }
}
