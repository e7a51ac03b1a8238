//! WebSocket transport.
//!
//! A [`SocketChannel`] wraps one `tokio-tungstenite` stream, either dialled with
//! [`SocketChannel::connect`] or accepted by a [`SocketListener`]. The stream is
//! split into a reader task that dispatches inbound text frames and a writer
//! task fed by an unbounded queue, so `send` never blocks.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::WebSocketStream;

use super::mailbox::Subscription;
use super::{Channel, ChannelCore, ChannelError, ConnectionState, Message, MessageHandler, TransportKind};
use crate::sync::lock;

/// How long `close` waits for the close frame to flush.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// One WebSocket connection.
#[derive(Debug)]
pub struct SocketChannel {
    peer: String,
    core: Arc<ChannelCore>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl SocketChannel {
    /// Dial a `ws://` or `wss://` URL.
    pub async fn connect(url: &str) -> Result<Arc<Self>, ChannelError> {
        log::info!("Connecting to {}", url);
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ChannelError::ConnectionFailed(format!("{url}: {e}")))?;
        Ok(Self::from_stream(stream, url.to_string()))
    }

    /// Complete the server handshake on an accepted TCP connection.
    pub async fn accept(tcp: TcpStream) -> Result<Arc<Self>, ChannelError> {
        let peer = tcp
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let stream = tokio_tungstenite::accept_async(tcp)
            .await
            .map_err(|e| ChannelError::ConnectionFailed(format!("handshake with {peer}: {e}")))?;
        log::info!("Accepted panel connection from {}", peer);
        Ok(Self::from_stream(stream, peer))
    }

    fn from_stream<S>(stream: WebSocketStream<S>, peer: String) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let core = ChannelCore::new(ConnectionState::Connected);
        let (mut sink, mut source) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let writer_peer = peer.clone();
        let writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(e) = sink.send(tungstenite::Message::Text(text)).await {
                    log::warn!("WebSocket send to {} failed: {}", writer_peer, e);
                    return;
                }
            }
            // Queue dropped: the channel was closed locally.
            let _ = sink.send(tungstenite::Message::Close(None)).await;
            let _ = sink.close().await;
        });

        let reader_core = Arc::clone(&core);
        let reader_peer = peer.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                match source.next().await {
                    Some(Ok(tungstenite::Message::Text(text))) => match Message::decode(&text) {
                        Ok(message) => reader_core.dispatch(&message),
                        Err(e) => log::warn!("Dropping frame from {}: {}", reader_peer, e),
                    },
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        let code: u16 = frame.map(|cf| cf.code.into()).unwrap_or(1005);
                        break format!("closed by peer ({code})");
                    }
                    // Pings are answered by tungstenite on the next write.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("read error: {e}"),
                    None => break "stream ended".to_string(),
                }
            };
            if !reader_core.is_closed() {
                log::info!("Connection to {} lost: {}", reader_peer, reason);
                reader_core.set_state(ConnectionState::Error(reason));
            }
        });

        Arc::new(Self {
            peer,
            core,
            outbound: Mutex::new(Some(tx)),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Remote address or URL.
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

#[async_trait]
impl Channel for SocketChannel {
    fn transport(&self) -> TransportKind {
        TransportKind::Socket
    }

    fn send(&self, message: &Message) -> Result<(), ChannelError> {
        let text = message.encode()?;
        match lock(&self.outbound).as_ref() {
            None => Ok(()),
            Some(tx) => tx
                .send(text)
                .map_err(|e| ChannelError::SendFailed(format!("writer for {} stopped: {e}", self.peer))),
        }
    }

    fn on_message(&self, handler: MessageHandler) -> Subscription {
        self.core.subscribe(handler)
    }

    fn state(&self) -> ConnectionState {
        self.core.state()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.core.watch_state()
    }

    async fn close(&self) {
        if !self.core.mark_closed() {
            return;
        }
        drop(lock(&self.outbound).take());
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        self.core.set_state(ConnectionState::Disconnected);

        let writer = lock(&self.writer).take();
        if let Some(writer) = writer {
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, writer).await.is_err() {
                log::debug!("Close frame to {} not flushed in time", self.peer);
            }
        }
        log::debug!("Socket channel to {} closed", self.peer);
    }
}

/// Accepts panel connections.
#[derive(Debug)]
pub struct SocketListener {
    listener: TcpListener,
}

impl SocketListener {
    /// Bind to `addr`. Port 0 picks a free port.
    pub async fn bind(addr: &str) -> Result<Self, ChannelError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ChannelError::ConnectionFailed(format!("bind {addr}: {e}")))?;
        Ok(Self { listener })
    }

    /// Bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, ChannelError> {
        self.listener
            .local_addr()
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))
    }

    /// Wait for the next connection and complete its handshake.
    pub async fn accept(&self) -> Result<Arc<SocketChannel>, ChannelError> {
        let (tcp, _addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| ChannelError::ConnectionFailed(format!("accept: {e}")))?;
        SocketChannel::accept(tcp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn pair() -> (Arc<SocketChannel>, Arc<SocketChannel>) {
        let listener = SocketListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (server, client) = tokio::join!(listener.accept(), SocketChannel::connect(&url));
        (server.unwrap(), client.unwrap())
    }

    fn collect(channel: &SocketChannel) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        channel.on_message(Arc::new(move |m: &Message| {
            let _ = tx.send(m.clone());
        }));
        rx
    }

    #[tokio::test]
    async fn test_messages_cross_the_socket_in_order() {
        let (server, client) = pair().await;
        let mut server_rx = collect(&server);

        for i in 0..5 {
            client.send(&Message::response(i.to_string(), json!(i))).unwrap();
        }
        for i in 0..5 {
            assert_eq!(server_rx.recv().await.unwrap().id, i.to_string());
        }
        assert_eq!(client.transport(), TransportKind::Socket);
    }

    #[tokio::test]
    async fn test_remote_close_moves_peer_to_error() {
        let (server, client) = pair().await;
        let mut state = server.watch_state();

        client.close().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.send(&Message::response("late", json!(null))).is_ok());

        let lost = state
            .wait_for(|s| matches!(s, ConnectionState::Error(_)))
            .await
            .is_ok();
        assert!(lost);
    }

    #[tokio::test]
    async fn test_connect_to_nothing_fails() {
        let listener = SocketListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = SocketChannel::connect(&format!("ws://{addr}")).await.unwrap_err();
        assert!(matches!(err, ChannelError::ConnectionFailed(_)));
    }
}
