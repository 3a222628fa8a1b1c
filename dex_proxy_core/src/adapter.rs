//! The adapter contract (spec §6, §9): the capability set every concrete
//! DEX backend (Drift, Kuru, Paradex, Hyperliquid, Dexalot, GTE, Harbor,
//! ...) must implement. The DEX Core holds exactly one `Arc<dyn DexAdapter>`
//! per configured venue and never downcasts it.
//!
//! Concrete adapters are out of scope here (spec §1); this module defines
//! only the interface and a `MockAdapter` used by the core's own tests.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::errors::DexProxyResult;
use crate::model::{OrderType, Side, WrapDirection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    Success,
    Reverted,
    Pending,
}

#[derive(Debug, Clone)]
pub struct TransactionReceipt {
    pub status: ReceiptStatus,
    pub block_number: Option<u64>,
    pub revert_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub client_request_id: String,
    pub exchange_order_id: String,
    pub slot: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum OrderActionKind {
    Fill {
        trade_id: String,
        exec_price: Decimal,
        exec_qty: Decimal,
        liquidity: crate::model::Liquidity,
        exch_timestamp_ns: u64,
        fee: Option<Decimal>,
        fee_ccy: Option<String>,
    },
    Cancel,
    Trigger,
}

#[derive(Debug, Clone)]
pub struct OrderActionRecord {
    pub exchange_order_id: String,
    pub action: OrderActionKind,
    pub slot: Option<u64>,
}

/// A single page of a paginated adapter listing. `next_page` mirrors the
/// original schemas' cursor convention.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_page: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SubmitOutcome {
    pub tx_hash: String,
    pub exchange_order_id: Option<String>,
}

/// The capability set consumed from each concrete DEX backend (spec §6).
/// Not every venue supports every verb (e.g. an off-chain exchange has no
/// nonce); unsupported verbs return `DexProxyError::NoAdapterForVenue` or
/// a adapter-specific `NOT_SUPPORTED` classification, never panic.
#[async_trait]
pub trait DexAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Channels this adapter publishes to; must include `ORDER` and
    /// `TRADE` where orders and trades exist (spec §6).
    fn channels(&self) -> Vec<String>;

    async fn submit_order(
        &self,
        client_request_id: &str,
        symbol: &str,
        side: Side,
        order_type: OrderType,
        price: Decimal,
        quantity: Decimal,
        nonce: Option<u64>,
        gas_price_wei: Option<u128>,
    ) -> DexProxyResult<SubmitOutcome>;

    async fn cancel_order(
        &self,
        client_request_id: &str,
        exchange_order_id: Option<&str>,
        nonce: Option<u64>,
        gas_price_wei: Option<u128>,
    ) -> DexProxyResult<SubmitOutcome>;

    async fn amend_order(
        &self,
        client_request_id: &str,
        exchange_order_id: Option<&str>,
        nonce: Option<u64>,
        new_gas_price_wei: u128,
    ) -> DexProxyResult<SubmitOutcome>;

    async fn submit_approval(
        &self,
        client_request_id: &str,
        symbol: &str,
        amount: Decimal,
        approve_contract_address: &str,
        nonce: Option<u64>,
        gas_price_wei: Option<u128>,
    ) -> DexProxyResult<SubmitOutcome>;

    async fn submit_transfer(
        &self,
        client_request_id: &str,
        symbol: &str,
        amount: Decimal,
        address_to: Option<&str>,
        nonce: Option<u64>,
        gas_price_wei: Option<u128>,
    ) -> DexProxyResult<SubmitOutcome>;

    async fn submit_wrap_unwrap(
        &self,
        client_request_id: &str,
        symbol: &str,
        amount: Decimal,
        direction: WrapDirection,
        nonce: Option<u64>,
        gas_price_wei: Option<u128>,
    ) -> DexProxyResult<SubmitOutcome>;

    async fn submit_bridge(
        &self,
        client_request_id: &str,
        symbol: &str,
        amount: Decimal,
        source_chain: &str,
        destination_chain: &str,
        nonce: Option<u64>,
        gas_price_wei: Option<u128>,
    ) -> DexProxyResult<SubmitOutcome>;

    async fn get_transaction_receipt(&self, tx_hash: &str) -> DexProxyResult<TransactionReceipt>;

    async fn get_order_records(
        &self,
        symbol: &str,
        market_type: &str,
        since_slot: Option<u64>,
        page: Option<&str>,
    ) -> DexProxyResult<Page<OrderRecord>>;

    async fn get_order_action_records(
        &self,
        exchange_order_id: &str,
        page: Option<&str>,
    ) -> DexProxyResult<Page<OrderActionRecord>>;

    /// Replacement cancel addressed by nonce rather than order id, for
    /// chains where a gas-bumped empty transaction cancels the pending one.
    async fn cancel_transaction(&self, nonce: u64, new_gas_price_wei: u128) -> DexProxyResult<SubmitOutcome>;
}

#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    use std::sync::Mutex;

    use super::*;

    /// A scripted adapter for core-level tests: every call returns the next
    /// queued response regardless of its arguments.
    #[derive(Default)]
    pub struct MockAdapter {
        name: String,
        channels: Vec<String>,
        submit_outcomes: Mutex<Vec<DexProxyResult<SubmitOutcome>>>,
        receipts: Mutex<Vec<DexProxyResult<TransactionReceipt>>>,
    }

    impl MockAdapter {
        pub fn new(name: impl Into<String>, channels: Vec<String>) -> Self {
            Self {
                name: name.into(),
                channels,
                submit_outcomes: Mutex::new(Vec::new()),
                receipts: Mutex::new(Vec::new()),
            }
        }

        pub fn push_submit_outcome(&self, outcome: DexProxyResult<SubmitOutcome>) {
            self.submit_outcomes.lock().unwrap().push(outcome);
        }

        pub fn push_receipt(&self, receipt: DexProxyResult<TransactionReceipt>) {
            self.receipts.lock().unwrap().push(receipt);
        }

        fn next_submit_outcome(&self) -> DexProxyResult<SubmitOutcome> {
            let mut queue = self.submit_outcomes.lock().unwrap();
            if queue.is_empty() {
                return Ok(SubmitOutcome {
                    tx_hash: "0xmock".into(),
                    exchange_order_id: None,
                });
            }
            queue.remove(0)
        }
    }

    #[async_trait]
    impl DexAdapter for MockAdapter {
        fn name(&self) -> &str {
            &self.name
        }

        fn channels(&self) -> Vec<String> {
            self.channels.clone()
        }

        async fn submit_order(
            &self,
            _client_request_id: &str,
            _symbol: &str,
            _side: Side,
            _order_type: OrderType,
            _price: Decimal,
            _quantity: Decimal,
            _nonce: Option<u64>,
            _gas_price_wei: Option<u128>,
        ) -> DexProxyResult<SubmitOutcome> {
            self.next_submit_outcome()
        }

        async fn cancel_order(
            &self,
            _client_request_id: &str,
            _exchange_order_id: Option<&str>,
            _nonce: Option<u64>,
            _gas_price_wei: Option<u128>,
        ) -> DexProxyResult<SubmitOutcome> {
            self.next_submit_outcome()
        }

        async fn amend_order(
            &self,
            _client_request_id: &str,
            _exchange_order_id: Option<&str>,
            _nonce: Option<u64>,
            _new_gas_price_wei: u128,
        ) -> DexProxyResult<SubmitOutcome> {
            self.next_submit_outcome()
        }

        async fn submit_approval(
            &self,
            _client_request_id: &str,
            _symbol: &str,
            _amount: Decimal,
            _approve_contract_address: &str,
            _nonce: Option<u64>,
            _gas_price_wei: Option<u128>,
        ) -> DexProxyResult<SubmitOutcome> {
            self.next_submit_outcome()
        }

        async fn submit_transfer(
            &self,
            _client_request_id: &str,
            _symbol: &str,
            _amount: Decimal,
            _address_to: Option<&str>,
            _nonce: Option<u64>,
            _gas_price_wei: Option<u128>,
        ) -> DexProxyResult<SubmitOutcome> {
            self.next_submit_outcome()
        }

        async fn submit_wrap_unwrap(
            &self,
            _client_request_id: &str,
            _symbol: &str,
            _amount: Decimal,
            _direction: WrapDirection,
            _nonce: Option<u64>,
            _gas_price_wei: Option<u128>,
        ) -> DexProxyResult<SubmitOutcome> {
            self.next_submit_outcome()
        }

        async fn submit_bridge(
            &self,
            _client_request_id: &str,
            _symbol: &str,
            _amount: Decimal,
            _source_chain: &str,
            _destination_chain: &str,
            _nonce: Option<u64>,
            _gas_price_wei: Option<u128>,
        ) -> DexProxyResult<SubmitOutcome> {
            self.next_submit_outcome()
        }

        async fn get_transaction_receipt(&self, _tx_hash: &str) -> DexProxyResult<TransactionReceipt> {
            let mut queue = self.receipts.lock().unwrap();
            if queue.is_empty() {
                return Ok(TransactionReceipt {
                    status: ReceiptStatus::Pending,
                    block_number: None,
                    revert_reason: None,
                });
            }
            queue.remove(0)
        }

        async fn get_order_records(
            &self,
            _symbol: &str,
            _market_type: &str,
            _since_slot: Option<u64>,
            _page: Option<&str>,
        ) -> DexProxyResult<Page<OrderRecord>> {
            Ok(Page {
                items: Vec::new(),
                next_page: None,
            })
        }

        async fn get_order_action_records(
            &self,
            _exchange_order_id: &str,
            _page: Option<&str>,
        ) -> DexProxyResult<Page<OrderActionRecord>> {
            Ok(Page {
                items: Vec::new(),
                next_page: None,
            })
        }

        async fn cancel_transaction(&self, _nonce: u64, _new_gas_price_wei: u128) -> DexProxyResult<SubmitOutcome> {
            self.next_submit_outcome()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockAdapter;
    use super::*;

    #[tokio::test]
    async fn mock_adapter_defaults_to_a_stub_submit_outcome() {
        let adapter = MockAdapter::new("mock", vec!["ORDER".into(), "TRADE".into()]);

        let outcome = adapter
            .submit_order(
                "id-1",
                "SOL-PERP",
                Side::Buy,
                OrderType::Gtc,
                Decimal::ONE,
                Decimal::ONE,
                Some(1),
                Some(1_000_000_000),
            )
            .await
            .unwrap();

        assert_eq!(outcome.tx_hash, "0xmock");
    }

    #[tokio::test]
    async fn mock_adapter_plays_back_queued_outcomes_in_order() {
        let adapter = MockAdapter::new("mock", vec![]);
        adapter.push_submit_outcome(Ok(SubmitOutcome {
            tx_hash: "0xaaa".into(),
            exchange_order_id: Some("e1".into()),
        }));

        let outcome = adapter
            .submit_order("id-1", "SOL-PERP", Side::Buy, OrderType::Gtc, Decimal::ONE, Decimal::ONE, None, None)
            .await
            .unwrap();

        assert_eq!(outcome.tx_hash, "0xaaa");
    }
}
