use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use algotrade_core::{
    AccountInfo, BrokerPosition, CloseResult, OrderReceipt, Side, SymbolInfo, Tick,
};

/// Requests sent from this client TO the MQL5 bridge. Each request receives
/// exactly one reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    /// Request the current account snapshot.
    #[serde(rename = "account_request")]
    AccountRequest,
    /// Request the tradeable symbol set.
    #[serde(rename = "symbols_request")]
    SymbolsRequest,
    /// Request the current quote for a symbol.
    #[serde(rename = "tick_request")]
    TickRequest { symbol: String },
    /// Request all open positions.
    #[serde(rename = "positions_request")]
    PositionsRequest,
    /// Submit an order.
    #[serde(rename = "order_submit")]
    OrderSubmit {
        symbol: String,
        side: Side,
        volume: Decimal,
        price: Decimal,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
        comment: String,
    },
    /// Close a position, fully or partially.
    #[serde(rename = "position_close")]
    PositionClose {
        ticket: u64,
        volume: Option<Decimal>,
    },
    /// Modify a position's protective levels.
    #[serde(rename = "position_modify")]
    PositionModify {
        ticket: u64,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    },
}

/// Replies received FROM the MQL5 bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    /// Connection established.
    #[serde(rename = "connected")]
    Connected { version: String },
    #[serde(rename = "account")]
    Account { account: AccountInfo },
    #[serde(rename = "symbols")]
    Symbols { symbols: Vec<SymbolInfo> },
    #[serde(rename = "tick")]
    TickReply { tick: Tick },
    #[serde(rename = "positions")]
    Positions { positions: Vec<BrokerPosition> },
    /// Order accepted and filled.
    #[serde(rename = "order_ack")]
    OrderAck { receipt: OrderReceipt },
    /// Close request processed; the retcode carries the venue's verdict.
    #[serde(rename = "close_ack")]
    CloseAck { result: CloseResult },
    #[serde(rename = "modify_ack")]
    ModifyAck { ticket: u64 },
    /// Request-level failure, detail verbatim from the terminal.
    #[serde(rename = "error")]
    Error { message: String },
}

/// Frame a message with a 4-byte length prefix (big-endian).
pub fn frame_message(msg: &[u8]) -> Vec<u8> {
    let len = msg.len() as u32;
    let mut framed = Vec::with_capacity(4 + msg.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(msg);
    framed
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[test]
    fn frame_prepends_big_endian_length() {
        let framed = frame_message(b"hello");
        assert_eq!(&framed[..4], &5u32.to_be_bytes());
        assert_eq!(&framed[4..], b"hello");
    }

    #[test]
    fn order_submit_round_trips() {
        let msg = OutboundMessage::OrderSubmit {
            symbol: "EURUSD".to_string(),
            side: Side::Buy,
            volume: dec!(0.10),
            price: dec!(1.1002),
            stop_loss: Some(dec!(1.0950)),
            take_profit: None,
            comment: "scanner".to_string(),
        };
        let json = serde_json::to_string(&msg).expect("encode");
        assert!(json.contains("\"type\":\"order_submit\""));
        let decoded: OutboundMessage = serde_json::from_str(&json).expect("decode");
        match decoded {
            OutboundMessage::OrderSubmit { symbol, volume, .. } => {
                assert_eq!(symbol, "EURUSD");
                assert_eq!(volume, dec!(0.10));
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn close_ack_carries_retcode() {
        let json = serde_json::to_string(&InboundMessage::CloseAck {
            result: CloseResult {
                retcode: 10009,
                profit: dec!(12.5),
            },
        })
        .expect("encode");
        let decoded: InboundMessage = serde_json::from_str(&json).expect("decode");
        match decoded {
            InboundMessage::CloseAck { result } => {
                assert_eq!(result.retcode, 10009);
                assert_eq!(result.profit, dec!(12.5));
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn tick_reply_decodes() {
        let tick = Tick {
            symbol: "EURUSD".to_string(),
            bid: dec!(1.1000),
            ask: dec!(1.1002),
            time: Utc::now(),
            volume: dec!(120),
        };
        let json = serde_json::to_string(&InboundMessage::TickReply { tick }).expect("encode");
        let decoded: InboundMessage = serde_json::from_str(&json).expect("decode");
        assert!(matches!(decoded, InboundMessage::TickReply { .. }));
    }
}
