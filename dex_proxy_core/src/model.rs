//! The `Request` data model (spec §3): the tagged union the rest of the
//! core operates on, plus its variant payloads and the `Trade` type.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Opaque, client-chosen idempotency key. Unique per process lifetime.
pub type ClientRequestId = String;

/// One of `NEW -> SUBMITTED -> MINED -> {terminal}`. `CancelRequested` and
/// `AmendRequested` are orthogonal intents tracked on `Request::cancel_requested`
/// / `Request::amend_requested`, not as states here — spec §3 is explicit
/// that they "do not move status until a replacement mines".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    New,
    Submitted,
    Mined,
    Succeeded,
    Failed,
    Rejected,
    Cancelled,
    Expired,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Rejected | Self::Cancelled | Self::Expired
        )
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::Submitted => "SUBMITTED",
            Self::Mined => "MINED",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Rejected => "REJECTED",
            Self::Cancelled => "CANCELLED",
            Self::Expired => "EXPIRED",
        };
        f.write_str(s)
    }
}

/// Discriminant for the `Request` tagged union. Also used as the `by_kind`
/// index key (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    Order,
    Transfer,
    Approve,
    WrapUnwrap,
    Bridge,
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Order => "ORDER",
            Self::Transfer => "TRANSFER",
            Self::Approve => "APPROVE",
            Self::WrapUnwrap => "WRAP_UNWRAP",
            Self::Bridge => "BRIDGE",
        };
        f.write_str(s)
    }
}

/// Accepts the wire spelling used by `?request_type=...` query params
/// (spec §6 `get-all-open-requests`), case-insensitively.
impl std::str::FromStr for RequestKind {
    type Err = crate::errors::DexProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ORDER" => Ok(Self::Order),
            "TRANSFER" => Ok(Self::Transfer),
            "APPROVE" => Ok(Self::Approve),
            "WRAP_UNWRAP" => Ok(Self::WrapUnwrap),
            "BRIDGE" => Ok(Self::Bridge),
            other => Err(crate::errors::DexProxyError::BadRequest(
                format!("unknown request_type {other}").into(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Gtc,
    GtcPostOnly,
    Ioc,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WrapDirection {
    Wrap,
    Unwrap,
}

/// Purpose of a recorded transaction hash. Only the last *mined* hash is
/// authoritative (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxPurpose {
    Submit,
    Amend,
    Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxHashEntry {
    pub hash: String,
    pub purpose: TxPurpose,
    pub mined: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Liquidity {
    Maker,
    Taker,
}

/// A single fill on an `Order`. `trade_id` is the de-dup key: applying the
/// same trade twice must be a no-op (spec §4.5, invariant 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub exec_price: Decimal,
    pub exec_qty: Decimal,
    pub liquidity: Liquidity,
    pub exch_timestamp_ns: u64,
    /// Supplemented field (SPEC_FULL §C.5); absent for adapters that don't
    /// report per-fill fees.
    pub fee: Option<Decimal>,
    pub fee_ccy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFields {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Decimal,
    pub quantity: Decimal,
    pub exchange_order_id: Option<String>,
    pub total_executed_qty: Decimal,
    pub trades: Vec<Trade>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferFields {
    pub symbol: String,
    pub amount: Decimal,
    pub address_to: Option<String>,
    pub gas_limit: Option<u64>,
    pub request_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApproveFields {
    pub symbol: String,
    pub amount: Decimal,
    pub approve_contract_address: String,
    pub gas_limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrapUnwrapFields {
    pub symbol: String,
    pub amount: Decimal,
    pub direction: WrapDirection,
    pub gas_limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeFields {
    pub symbol: String,
    pub amount: Decimal,
    pub source_chain: String,
    pub destination_chain: String,
    pub gas_limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestVariant {
    Order(OrderFields),
    Transfer(TransferFields),
    Approve(ApproveFields),
    WrapUnwrap(WrapUnwrapFields),
    Bridge(BridgeFields),
}

impl RequestVariant {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Order(_) => RequestKind::Order,
            Self::Transfer(_) => RequestKind::Transfer,
            Self::Approve(_) => RequestKind::Approve,
            Self::WrapUnwrap(_) => RequestKind::WrapUnwrap,
            Self::Bridge(_) => RequestKind::Bridge,
        }
    }

    pub fn as_order(&self) -> Option<&OrderFields> {
        match self {
            Self::Order(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_order_mut(&mut self) -> Option<&mut OrderFields> {
        match self {
            Self::Order(o) => Some(o),
            _ => None,
        }
    }
}

/// The full `Request` record (spec §3). Mutated only by the DEX Core or the
/// Status Poller, never by an adapter directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub client_request_id: ClientRequestId,
    pub variant: RequestVariant,
    pub status: RequestStatus,
    pub nonce: Option<u64>,
    pub tx_hashes: Vec<TxHashEntry>,
    pub used_gas_prices_wei: Vec<u128>,
    pub received_at_ms: i64,
    pub finalised_at_ms: Option<i64>,
    pub cancel_requested: bool,
    pub amend_requested: bool,
    /// Opaque per-adapter bag (e.g. `{"chain": "L2"}` for Paradex). The core
    /// never interprets this beyond the `is_l2` convenience below.
    pub adapter_specific: serde_json::Value,
    /// Blockchain-specific logical time (Solana slot); opaque outside the
    /// adapter and the poller's deadline rule (spec §4.5).
    pub slot: Option<u64>,
}

impl Request {
    pub fn new(client_request_id: ClientRequestId, variant: RequestVariant, received_at_ms: i64) -> Self {
        Self {
            client_request_id,
            variant,
            status: RequestStatus::New,
            nonce: None,
            tx_hashes: Vec::new(),
            used_gas_prices_wei: Vec::new(),
            received_at_ms,
            finalised_at_ms: None,
            cancel_requested: false,
            amend_requested: false,
            adapter_specific: serde_json::Value::Null,
            slot: None,
        }
    }

    pub fn kind(&self) -> RequestKind {
        self.variant.kind()
    }

    pub fn is_l2(&self) -> bool {
        self.adapter_specific
            .get("chain")
            .and_then(|v| v.as_str())
            .map(|s| s.eq_ignore_ascii_case("L2"))
            .unwrap_or(false)
    }

    /// Last *mined* hash is authoritative (spec §3).
    pub fn authoritative_tx_hash(&self) -> Option<&str> {
        self.tx_hashes
            .iter()
            .rev()
            .find(|entry| entry.mined)
            .map(|entry| entry.hash.as_str())
    }

    pub fn last_tx_hash(&self) -> Option<&str> {
        self.tx_hashes.last().map(|entry| entry.hash.as_str())
    }

    pub fn last_used_gas_price_wei(&self) -> Option<u128> {
        self.used_gas_prices_wei.last().copied()
    }

    /// Gas-bump rule (spec §4.6, §8 invariant 4): `new >= ceil(1.1 * prev)`.
    pub fn gas_bump_floor(prev: u128) -> u128 {
        // ceil(1.1 * prev) computed in integer arithmetic to avoid floats on wei amounts
        (prev * 11).div_ceil(10)
    }

    pub fn accepts_gas_bump(&self, new_gas_price_wei: u128) -> bool {
        match self.last_used_gas_price_wei() {
            Some(prev) => new_gas_price_wei >= Self::gas_bump_floor(prev),
            None => true,
        }
    }

    pub fn push_gas_price(&mut self, gas_price_wei: u128) {
        self.used_gas_prices_wei.push(gas_price_wei);
    }

    pub fn push_tx_hash(&mut self, hash: String, purpose: TxPurpose) {
        self.tx_hashes.push(TxHashEntry {
            hash,
            purpose,
            mined: false,
        });
    }

    pub fn mark_tx_mined(&mut self, hash: &str) {
        if let Some(entry) = self.tx_hashes.iter_mut().find(|e| e.hash == hash) {
            entry.mined = true;
        }
    }

    /// Moves the request to a terminal status. No-op (per spec §3/§8
    /// invariant 5) if already terminal.
    pub fn finalise(&mut self, status: RequestStatus, now_ms: i64, reason: Option<String>) {
        if self.status.is_terminal() {
            return;
        }

        debug_assert!(status.is_terminal(), "finalise must target a terminal status");

        self.status = status;
        self.finalised_at_ms = Some(now_ms);

        if let Some(order) = self.variant.as_order_mut() {
            if reason.is_some() {
                order.reason = reason;
            }
        }
    }

    /// Applies a fill idempotently. Returns `true` if the trade was newly
    /// applied (spec §4.5: "idempotent by trade_id... new trades are
    /// appended").
    pub fn apply_trade(&mut self, trade: Trade) -> bool {
        let Some(order) = self.variant.as_order_mut() else {
            return false;
        };

        if order.trades.iter().any(|t| t.trade_id == trade.trade_id) {
            return false;
        }

        order.total_executed_qty += trade.exec_qty;
        debug_assert!(
            order.total_executed_qty <= order.quantity,
            "total_executed_qty must never exceed quantity"
        );
        order.trades.push(trade);

        true
    }

    pub fn is_fully_filled(&self) -> bool {
        self.variant
            .as_order()
            .map(|o| o.total_executed_qty >= o.quantity)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_order(qty: &str) -> Request {
        Request::new(
            "id-1".into(),
            RequestVariant::Order(OrderFields {
                symbol: "SOL-PERP".into(),
                side: Side::Sell,
                order_type: OrderType::GtcPostOnly,
                price: "999".parse().unwrap(),
                quantity: qty.parse().unwrap(),
                exchange_order_id: None,
                total_executed_qty: Decimal::ZERO,
                trades: Vec::new(),
                reason: None,
            }),
            0,
        )
    }

    #[test]
    fn finalise_is_sticky() {
        let mut req = sample_order("0.01");
        req.finalise(RequestStatus::Cancelled, 100, None);
        assert_eq!(req.finalised_at_ms, Some(100));

        req.finalise(RequestStatus::Succeeded, 200, None);
        assert_eq!(req.status, RequestStatus::Cancelled);
        assert_eq!(req.finalised_at_ms, Some(100));
    }

    #[test]
    fn trade_applied_at_most_once() {
        let mut req = sample_order("0.02");
        let trade = Trade {
            trade_id: "t1".into(),
            exec_price: "999".parse().unwrap(),
            exec_qty: "0.01".parse().unwrap(),
            liquidity: Liquidity::Taker,
            exch_timestamp_ns: 1,
            fee: None,
            fee_ccy: None,
        };

        assert!(req.apply_trade(trade.clone()));
        assert!(!req.apply_trade(trade));
        assert_eq!(
            req.variant.as_order().unwrap().total_executed_qty,
            "0.01".parse::<Decimal>().unwrap()
        );
    }

    #[test]
    fn gas_bump_floor_rounds_up() {
        assert_eq!(Request::gas_bump_floor(1_000_000_000), 1_100_000_000);
        assert_eq!(Request::gas_bump_floor(10), 11);
        assert_eq!(Request::gas_bump_floor(1), 2);
    }

    #[test]
    fn gas_bump_rejects_equal_price() {
        let mut req = sample_order("0.01");
        req.push_gas_price(1_000_000_000);
        assert!(!req.accepts_gas_bump(1_000_000_000));
        assert!(req.accepts_gas_bump(1_100_000_000));
    }
}
