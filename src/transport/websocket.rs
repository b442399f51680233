use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::{WebSocketStream, accept_async, connect_async};
use tracing::{debug, error, info, trace, warn};
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::broker::Broker;
use crate::transport::address::Address;
use crate::transport::connection::{Frame, Transport, TransportReceiver, TransportSender};
use crate::utils::error::{Error, TransportError};

/// Binds the broker's listening socket. This is the only fatal startup error.
pub async fn bind(addr: &Address) -> Result<TcpListener, Error> {
    TcpListener::bind((addr.host.as_str(), addr.port))
        .await
        .map_err(|source| Error::Bind {
            addr: addr.to_string(),
            source,
        })
}

/// Accepts connections forever, handing each one to `broker` on its own task.
pub async fn start_websocket_server(listener: TcpListener, broker: Broker) {
    match listener.local_addr() {
        Ok(addr) => info!("WebSocket server listening on ws://{addr}"),
        Err(e) => warn!("WebSocket server listening on unknown address: {e}"),
    }

    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Failed to accept connection: {e}");
                continue;
            }
        };
        let broker = broker.clone();
        let capacity = broker.settings().channel_capacity;

        spawn(async move {
            let transport = match accept(stream, capacity).await {
                Ok(transport) => transport,
                Err(e) => {
                    warn!("WebSocket handshake error from {remote}: {e}");
                    return;
                }
            };
            info!("Accepted connection {} from {remote}", transport.id());
            broker.handle_connection(transport).await;
        });
    }
}

/// Completes the server side of the WebSocket handshake.
pub async fn accept(stream: TcpStream, capacity: usize) -> Result<Transport, TransportError> {
    let _ = stream.set_nodelay(true);
    let ws = accept_async(stream).await?;
    Ok(bridge(ws, capacity))
}

/// Dials `addr`, giving up after `limit`.
pub async fn connect(
    addr: &Address,
    capacity: usize,
    limit: Duration,
) -> Result<Transport, TransportError> {
    let (ws, _response) = tokio::time::timeout(limit, connect_async(addr.to_url()))
        .await
        .map_err(|_| TransportError::Timeout(limit))??;
    Ok(bridge(ws, capacity))
}

/// Spawns the send and receive loops that move frames between the socket and
/// the transport's queues.
fn bridge<S>(ws: WebSocketStream<S>, capacity: usize) -> Transport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let id = Uuid::new_v4();
    let (mut ws_sender, mut ws_receiver) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(capacity);
    let (in_tx, in_rx) = mpsc::channel::<Frame>(capacity);

    spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            match frame {
                Frame::Data(data) => {
                    if let Err(e) = ws_sender.send(WsMessage::Binary(data)).await {
                        debug!("Failed to send frame on {id}: {e}");
                        break;
                    }
                }
                Frame::Close => {
                    let _ = ws_sender.close().await;
                    break;
                }
            }
        }
        trace!("Send loop closed for {id}");
    });

    spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            let data = match msg {
                Ok(WsMessage::Binary(data)) => data,
                Ok(WsMessage::Text(text)) => Bytes::copy_from_slice(text.as_bytes()),
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!("Receive error on {id}: {e}");
                    break;
                }
            };
            if in_tx.send(Frame::Data(data)).await.is_err() {
                break;
            }
        }
        trace!("Receive loop closed for {id}");
    });

    Transport::from_parts(
        TransportSender::new(id, out_tx),
        TransportReceiver::new(in_rx),
    )
}
