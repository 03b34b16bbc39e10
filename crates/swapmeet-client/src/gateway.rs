use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use swapmeet_types::events::{ClientCommand, ServerEvent};

use crate::error::ClientError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Buffered server events per subscriber before it starts lagging.
const EVENT_BUFFER: usize = 256;

/// Outbound half of the realtime channel, as the controllers see it.
///
/// `emit` only queues; it never waits on the network, so it is safe to call
/// from `Drop`.
pub trait EventChannel: Send + Sync {
    fn emit(&self, command: ClientCommand) -> Result<(), ClientError>;
}

impl<T: EventChannel + ?Sized> EventChannel for Arc<T> {
    fn emit(&self, command: ClientCommand) -> Result<(), ClientError> {
        (**self).emit(command)
    }
}

/// Reconnect schedule after the socket drops. Delays double from
/// `initial_delay` up to `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the zero-based `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// One realtime connection to the server, owned by whoever created it.
///
/// Subscribe with [`events`](Self::events) before [`connect`](Self::connect)
/// to see the first `ready`. Every reconnect delivers another `ready`, which
/// is the cue for controllers to rejoin their rooms.
pub struct GatewayClient {
    url: String,
    policy: ReconnectPolicy,
    events_tx: broadcast::Sender<ServerEvent>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientCommand>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
}

impl GatewayClient {
    /// `base_url` is the HTTP origin; the socket goes to `/gateway` on the
    /// same host.
    pub fn new(base_url: &str, token: &str, policy: ReconnectPolicy) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            url: gateway_url(base_url, token),
            policy,
            events_tx,
            outbound: Mutex::new(None),
            task: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Open the socket and start the background task. The first handshake is
    /// awaited so a bad token or an unreachable server surfaces here; later
    /// drops are retried per the [`ReconnectPolicy`].
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.disconnect();

        let (ws, _) = connect_async(self.url.as_str()).await?;
        info!("Gateway connected");
        self.connected.store(true, Ordering::Release);

        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.outbound) = Some(tx);

        let handle = tokio::spawn(run(
            self.url.clone(),
            self.policy.clone(),
            ws,
            rx,
            self.events_tx.clone(),
            self.connected.clone(),
        ));
        *lock(&self.task) = Some(handle);
        Ok(())
    }

    /// Close the socket and stop reconnecting. Commands emitted afterwards
    /// fail with [`ClientError::ChannelClosed`].
    pub fn disconnect(&self) {
        let had_sender = lock(&self.outbound).take().is_some();
        if let Some(handle) = lock(&self.task).take() {
            handle.abort();
        }
        if had_sender {
            info!("Gateway disconnected");
        }
        self.connected.store(false, Ordering::Release);
    }
}

impl EventChannel for GatewayClient {
    fn emit(&self, command: ClientCommand) -> Result<(), ClientError> {
        match lock(&self.outbound).as_ref() {
            Some(tx) => tx.send(command).map_err(|_| ClientError::ChannelClosed),
            None => Err(ClientError::ChannelClosed),
        }
    }
}

impl Drop for GatewayClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn gateway_url(base_url: &str, token: &str) -> String {
    let base = base_url
        .trim_end_matches('/')
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    format!("{}/gateway?token={}", base, token)
}

enum SessionEnd {
    /// The owner dropped the command queue.
    Stopped,
    /// The socket closed or errored.
    Lost,
}

/// Socket task: pump one session, then reconnect until the policy gives up.
/// Commands queued while reconnecting go out on the next socket.
async fn run(
    url: String,
    policy: ReconnectPolicy,
    first: WsStream,
    mut outbound: mpsc::UnboundedReceiver<ClientCommand>,
    events: broadcast::Sender<ServerEvent>,
    connected: Arc<AtomicBool>,
) {
    let mut next = Some(first);

    loop {
        let ws = match next.take() {
            Some(ws) => ws,
            None => match reconnect(&url, &policy).await {
                Some(ws) => ws,
                None => {
                    warn!(
                        "Gateway unreachable after {} attempts, giving up",
                        policy.max_attempts
                    );
                    break;
                }
            },
        };
        connected.store(true, Ordering::Release);

        let end = pump(ws, &mut outbound, &events).await;
        connected.store(false, Ordering::Release);
        match end {
            SessionEnd::Stopped => break,
            SessionEnd::Lost => warn!("Gateway connection lost, reconnecting"),
        }
    }
}

async fn reconnect(url: &str, policy: &ReconnectPolicy) -> Option<WsStream> {
    for attempt in 0..policy.max_attempts {
        tokio::time::sleep(policy.delay_for(attempt)).await;
        match connect_async(url).await {
            Ok((ws, _)) => {
                info!("Gateway reconnected (attempt {})", attempt + 1);
                return Some(ws);
            }
            Err(e) => debug!("Reconnect attempt {} failed: {}", attempt + 1, e),
        }
    }
    None
}

async fn pump(
    ws: WsStream,
    outbound: &mut mpsc::UnboundedReceiver<ClientCommand>,
    events: &broadcast::Sender<ServerEvent>,
) -> SessionEnd {
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            command = outbound.recv() => {
                let Some(command) = command else {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return SessionEnd::Stopped;
                };
                let text = match serde_json::to_string(&command) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Dropping unserializable command: {}", e);
                        continue;
                    }
                };
                if write.send(WsMessage::Text(text.into())).await.is_err() {
                    return SessionEnd::Lost;
                }
            }
            frame = read.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    match serde_json::from_str::<ServerEvent>(text.as_str()) {
                        // no subscribers is fine
                        Ok(event) => { let _ = events.send(event); }
                        Err(e) => warn!("Invalid server event: {}", e),
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => return SessionEnd::Lost,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Gateway read error: {}", e);
                    return SessionEnd::Lost;
                }
            }
        }
    }
}
