use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{info, warn};

use algotrade_core::*;

use crate::protocol::*;

/// Replies larger than this are treated as protocol corruption.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Configuration for connecting to the MetaTrader 5 bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaTraderConfig {
    /// Host the MQL5 bridge is listening on.
    pub host: String,
    pub port: u16,
    /// Per-request timeout; a timed-out call counts as a failed call.
    pub request_timeout_secs: u64,
}

impl Default for MetaTraderConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5556,
            request_timeout_secs: 5,
        }
    }
}

/// MetaTrader 5 broker adapter.
///
/// Talks to an MQL5 bridge over TCP using length-prefixed JSON in strict
/// request/response order; the stream sits behind an async mutex so only one
/// request is in flight at a time.
pub struct MetaTraderBroker {
    config: MetaTraderConfig,
    stream: Mutex<Option<TcpStream>>,
    connected: AtomicBool,
}

impl MetaTraderBroker {
    pub fn new(config: MetaTraderConfig) -> Self {
        Self {
            config,
            stream: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs.max(1))
    }

    /// Send one request and read its reply. Any transport failure or timeout
    /// poisons the stream, so the connection is dropped and must be
    /// re-established by the caller's reconnect loop.
    async fn request(&self, msg: &OutboundMessage) -> Result<InboundMessage, BrokerError> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(BrokerError::NotConnected)?;

        let exchange = async {
            send_framed(stream, msg).await?;
            read_framed(stream).await
        };
        let reply = match timeout(self.request_timeout(), exchange).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => {
                self.drop_connection(&mut guard);
                return Err(err);
            }
            Err(_) => {
                self.drop_connection(&mut guard);
                return Err(BrokerError::Timeout);
            }
        };

        if let InboundMessage::Error { message } = reply {
            return Err(BrokerError::Rejected(message));
        }
        Ok(reply)
    }

    fn drop_connection(&self, guard: &mut Option<TcpStream>) {
        *guard = None;
        self.connected.store(false, Ordering::SeqCst);
        warn!("MetaTrader bridge connection dropped");
    }
}

async fn send_framed(stream: &mut TcpStream, msg: &OutboundMessage) -> Result<(), BrokerError> {
    let json = serde_json::to_vec(msg)
        .map_err(|err| BrokerError::Protocol(format!("encode error: {err}")))?;
    let framed = frame_message(&json);
    stream
        .write_all(&framed)
        .await
        .map_err(|err| BrokerError::Transport(format!("write error: {err}")))?;
    Ok(())
}

async fn read_framed(stream: &mut TcpStream) -> Result<InboundMessage, BrokerError> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|err| BrokerError::Transport(format!("read error: {err}")))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(BrokerError::Protocol(format!("oversized frame: {len} bytes")));
    }

    let mut body = vec![0u8; len];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|err| BrokerError::Transport(format!("read error: {err}")))?;
    serde_json::from_slice(&body)
        .map_err(|err| BrokerError::Protocol(format!("decode error: {err}")))
}

#[async_trait]
impl Broker for MetaTraderBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        let mut guard = self.stream.lock().await;
        if guard.is_some() && self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!(%addr, "connecting to MetaTrader bridge");
        let mut stream = timeout(self.request_timeout(), TcpStream::connect(&addr))
            .await
            .map_err(|_| BrokerError::Timeout)?
            .map_err(|err| BrokerError::Transport(format!("tcp connect: {err}")))?;

        let hello = timeout(self.request_timeout(), read_framed(&mut stream))
            .await
            .map_err(|_| BrokerError::Timeout)??;
        match hello {
            InboundMessage::Connected { version } => {
                info!(%version, "MetaTrader bridge connected");
            }
            InboundMessage::Error { message } => {
                return Err(BrokerError::Rejected(message));
            }
            other => {
                return Err(BrokerError::Protocol(format!(
                    "unexpected handshake reply: {other:?}"
                )));
            }
        }

        *guard = Some(stream);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        let mut guard = self.stream.lock().await;
        if let Some(mut stream) = guard.take() {
            let _ = stream.shutdown().await;
        }
        self.connected.store(false, Ordering::SeqCst);
        info!("disconnected from MetaTrader bridge");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn account_info(&self) -> Result<AccountInfo, BrokerError> {
        match self.request(&OutboundMessage::AccountRequest).await? {
            InboundMessage::Account { account } => Ok(account),
            other => Err(unexpected_reply("account_request", &other)),
        }
    }

    async fn symbols(&self) -> Result<Vec<SymbolInfo>, BrokerError> {
        match self.request(&OutboundMessage::SymbolsRequest).await? {
            InboundMessage::Symbols { symbols } => Ok(symbols),
            other => Err(unexpected_reply("symbols_request", &other)),
        }
    }

    async fn symbol_tick(&self, symbol: &str) -> Result<Tick, BrokerError> {
        let request = OutboundMessage::TickRequest {
            symbol: symbol.to_string(),
        };
        match self.request(&request).await? {
            InboundMessage::TickReply { tick } => Ok(tick),
            other => Err(unexpected_reply("tick_request", &other)),
        }
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        match self.request(&OutboundMessage::PositionsRequest).await? {
            InboundMessage::Positions { positions } => Ok(positions),
            other => Err(unexpected_reply("positions_request", &other)),
        }
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderReceipt, BrokerError> {
        let msg = OutboundMessage::OrderSubmit {
            symbol: request.symbol.clone(),
            side: request.side,
            volume: request.volume,
            price: request.price,
            stop_loss: request.stop_loss,
            take_profit: request.take_profit,
            comment: request.comment.clone(),
        };
        match self.request(&msg).await? {
            InboundMessage::OrderAck { receipt } => Ok(receipt),
            other => Err(unexpected_reply("order_submit", &other)),
        }
    }

    async fn close_position(
        &self,
        ticket: u64,
        volume: Option<Decimal>,
    ) -> Result<CloseResult, BrokerError> {
        let msg = OutboundMessage::PositionClose { ticket, volume };
        match self.request(&msg).await? {
            InboundMessage::CloseAck { result } => Ok(result),
            other => Err(unexpected_reply("position_close", &other)),
        }
    }

    async fn modify_position(
        &self,
        ticket: u64,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<(), BrokerError> {
        let msg = OutboundMessage::PositionModify {
            ticket,
            stop_loss,
            take_profit,
        };
        match self.request(&msg).await? {
            InboundMessage::ModifyAck { .. } => Ok(()),
            other => Err(unexpected_reply("position_modify", &other)),
        }
    }
}

fn unexpected_reply(request: &str, reply: &InboundMessage) -> BrokerError {
    BrokerError::Protocol(format!("unexpected reply to {request}: {reply:?}"))
}
