//! The Status Poller (spec §4.5): drives in-flight requests to terminal
//! states by reconciling three independent sources per adapter --- place
//! transaction receipts, exchange-side order records, and order action
//! records (fills/cancels/triggers).
//!
//! Grounded on the three independent poll loops of the original Python
//! syncer (`__poll_for_order_records`, `__poll_for_order_action_records`,
//! `__poll_for_finalising_rejected_inserts`); here they're three
//! `tokio::spawn`ed tasks sharing the cache through the core's actor
//! handle rather than free-threaded access, matching spec §5's
//! single-owner rule.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::adapter::{DexAdapter, OrderActionKind, ReceiptStatus};
use crate::classify::classify_insert_error;
use crate::config::PollerConfig;
use crate::model::{RequestStatus, Trade};

/// Core operations the poller needs from the DEX Core's actor handle.
/// Kept as a narrow trait so the poller can be unit-tested against an
/// in-memory fake instead of the full app wiring.
#[async_trait::async_trait]
pub trait PollerHost: Send + Sync {
    async fn open_orders_awaiting_exchange_id(&self) -> Vec<OpenOrderSnapshot>;
    async fn open_orders_with_exchange_id(&self, refresh_after_s: u64) -> Vec<OpenOrderSnapshot>;
    async fn open_requests_awaiting_confirmation(&self) -> Vec<PendingTxSnapshot>;

    async fn apply_exchange_order_id(&self, client_request_id: &str, exchange_order_id: String, slot: Option<u64>);
    async fn apply_fill(&self, exchange_order_id: &str, trade: Trade) -> bool;
    async fn apply_cancel(&self, exchange_order_id: &str);
    async fn apply_receipt_success(&self, client_request_id: &str, tx_hash: &str);
    async fn apply_receipt_reverted(&self, client_request_id: &str, revert_reason: &str);
    async fn apply_insert_deadline_expired(&self, client_request_id: &str);

    /// Current wall-clock time in milliseconds, routed through the host so
    /// the deadline rule below can be driven by a fake clock in tests.
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone)]
pub struct OpenOrderSnapshot {
    pub client_request_id: String,
    pub symbol: String,
    pub market_type: String,
    pub exchange_order_id: Option<String>,
    pub slot: Option<u64>,
    pub received_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct PendingTxSnapshot {
    pub client_request_id: String,
    pub tx_hash: String,
}

pub struct StatusPoller<A: DexAdapter + ?Sized> {
    adapter: Arc<A>,
    config: PollerConfig,
}

impl<A: DexAdapter + ?Sized + 'static> StatusPoller<A> {
    pub fn new(adapter: Arc<A>, config: PollerConfig) -> Self {
        Self { adapter, config }
    }

    /// Spawns the three independent periodic tasks (spec §4.5). Returns
    /// their join handles so callers can await a clean shutdown.
    pub fn spawn<H: PollerHost + 'static>(&self, host: Arc<H>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        handles.push(tokio::spawn(Self::poll_order_records_loop(
            self.adapter.clone(),
            host.clone(),
            self.config.clone(),
        )));

        handles.push(tokio::spawn(Self::poll_order_action_records_loop(
            self.adapter.clone(),
            host.clone(),
            self.config.clone(),
        )));

        handles.push(tokio::spawn(Self::poll_place_transactions_loop(
            self.adapter.clone(),
            host,
            self.config.clone(),
        )));

        handles
    }

    async fn poll_order_records_loop<H: PollerHost>(adapter: Arc<A>, host: Arc<H>, config: PollerConfig) {
        let mut ticker = tokio::time::interval(Duration::from_millis(config.order_records_poll_interval_ms));
        loop {
            ticker.tick().await;

            let candidates = host.open_orders_awaiting_exchange_id().await;
            if candidates.is_empty() {
                continue;
            }

            // coalesce by (symbol, market_type), tracking the earliest
            // request's slot so we know how far back to page (spec §4.5
            // "coalesces by (symbol, market_type)... pagination schedules
            // follow-up pages only when the oldest record on the page is
            // at or after the earliest request's slot").
            let mut groups: HashMap<(String, String), u64> = HashMap::new();
            for order in &candidates {
                if let Some(slot) = order.slot {
                    let entry = groups.entry((order.symbol.clone(), order.market_type.clone())).or_insert(slot);
                    *entry = (*entry).min(slot);
                }
            }

            let now_ms = host.now_ms();

            for ((symbol, market_type), fetch_till_slot) in groups {
                match Self::fetch_order_records_page(&adapter, host.as_ref(), &symbol, &market_type, fetch_till_slot).await {
                    Ok(latest_observed_slot) => {
                        for order in candidates.iter().filter(|o| o.symbol == symbol && o.market_type == market_type) {
                            if has_insert_failed(
                                order.received_at_ms,
                                now_ms,
                                config.mark_insert_failed_only_after_s,
                                order.slot,
                                latest_observed_slot,
                            ) {
                                host.apply_insert_deadline_expired(&order.client_request_id).await;
                            }
                        }
                    }
                    Err(err) => warn!(?err, %symbol, %market_type, "order records poll failed"),
                }
            }
        }
    }

    /// Pages through `get_order_records` for one (symbol, market_type) group
    /// until a page's oldest record falls behind `fetch_till_slot`, applying
    /// every exchange order id observed along the way. Returns the highest
    /// slot seen across all pages, used by the caller to evaluate the
    /// insert-deadline rule against the group's current watermark.
    async fn fetch_order_records_page<H: PollerHost>(
        adapter: &Arc<A>,
        host: &H,
        symbol: &str,
        market_type: &str,
        fetch_till_slot: u64,
    ) -> crate::errors::DexProxyResult<Option<u64>> {
        let mut page: Option<String> = None;
        let mut max_seen_slot: Option<u64> = None;

        loop {
            let result = adapter
                .get_order_records(symbol, market_type, Some(fetch_till_slot), page.as_deref())
                .await?;

            let mut min_seen_slot: Option<u64> = None;

            for record in &result.items {
                host.apply_exchange_order_id(&record.client_request_id, record.exchange_order_id.clone(), record.slot)
                    .await;

                if let Some(slot) = record.slot {
                    min_seen_slot = Some(min_seen_slot.map_or(slot, |m: u64| m.min(slot)));
                    max_seen_slot = Some(max_seen_slot.map_or(slot, |m: u64| m.max(slot)));
                }
            }

            match (min_seen_slot, result.next_page.clone()) {
                (Some(min_seen_slot), Some(next_page)) if min_seen_slot >= fetch_till_slot => {
                    trace!(symbol, market_type, next_page, "fetching next page of order records");
                    page = Some(next_page);
                }
                _ => break,
            }
        }

        Ok(max_seen_slot)
    }

    async fn poll_order_action_records_loop<H: PollerHost>(adapter: Arc<A>, host: Arc<H>, config: PollerConfig) {
        let mut ticker = tokio::time::interval(Duration::from_millis(config.order_action_records_poll_interval_ms));
        loop {
            ticker.tick().await;

            let candidates = host.open_orders_with_exchange_id(config.refetch_order_action_records_after_s).await;

            for order in candidates {
                let Some(exchange_order_id) = order.exchange_order_id.clone() else {
                    continue;
                };

                if let Err(err) =
                    Self::fetch_and_apply_order_actions(&adapter, host.as_ref(), &exchange_order_id).await
                {
                    warn!(?err, %exchange_order_id, "order action records poll failed");
                }
            }
        }
    }

    async fn fetch_and_apply_order_actions<H: PollerHost>(
        adapter: &Arc<A>,
        host: &H,
        exchange_order_id: &str,
    ) -> crate::errors::DexProxyResult<()> {
        let mut page: Option<String> = None;

        loop {
            let result = adapter.get_order_action_records(exchange_order_id, page.as_deref()).await?;

            for record in &result.items {
                match &record.action {
                    OrderActionKind::Fill {
                        trade_id,
                        exec_price,
                        exec_qty,
                        liquidity,
                        exch_timestamp_ns,
                        fee,
                        fee_ccy,
                    } => {
                        let trade = Trade {
                            trade_id: trade_id.clone(),
                            exec_price: *exec_price,
                            exec_qty: *exec_qty,
                            liquidity: *liquidity,
                            exch_timestamp_ns: *exch_timestamp_ns,
                            fee: *fee,
                            fee_ccy: fee_ccy.clone(),
                        };
                        host.apply_fill(exchange_order_id, trade).await;
                    }
                    OrderActionKind::Cancel => {
                        host.apply_cancel(exchange_order_id).await;
                    }
                    OrderActionKind::Trigger => {
                        debug!(%exchange_order_id, "trigger action observed, metadata only");
                    }
                }
            }

            match result.next_page {
                Some(next) if !result.items.is_empty() => page = Some(next),
                _ => break,
            }
        }

        Ok(())
    }

    async fn poll_place_transactions_loop<H: PollerHost>(adapter: Arc<A>, host: Arc<H>, config: PollerConfig) {
        let mut ticker = tokio::time::interval(Duration::from_millis(config.finalising_rejected_inserts_poll_interval_ms));
        loop {
            ticker.tick().await;

            let pending = host.open_requests_awaiting_confirmation().await;

            for req in pending {
                match adapter.get_transaction_receipt(&req.tx_hash).await {
                    Ok(receipt) => match receipt.status {
                        ReceiptStatus::Success => {
                            host.apply_receipt_success(&req.client_request_id, &req.tx_hash).await;
                        }
                        ReceiptStatus::Reverted => {
                            let raw = receipt.revert_reason.unwrap_or_default();
                            let _ = classify_insert_error(&raw);
                            host.apply_receipt_reverted(&req.client_request_id, &raw).await;
                        }
                        ReceiptStatus::Pending => {}
                    },
                    Err(err) => warn!(?err, id = %req.client_request_id, "receipt lookup failed"),
                }
            }
        }
    }
}

/// Deadline rule (spec §4.5): an insert that still lacks an
/// `exchange_order_id` after `mark_insert_failed_only_after_s` and whose
/// request slot has fallen behind the latest observed slot by the poll
/// window is rejected as a transport failure.
pub fn has_insert_failed(
    received_at_ms: i64,
    now_ms: i64,
    mark_insert_failed_only_after_s: u64,
    request_slot: Option<u64>,
    latest_observed_slot: Option<u64>,
) -> bool {
    let deadline_ms = mark_insert_failed_only_after_s as i64 * 1000;
    if now_ms - received_at_ms < deadline_ms {
        return false;
    }

    match (request_slot, latest_observed_slot) {
        (Some(req_slot), Some(latest)) => latest > req_slot,
        _ => true,
    }
}

/// Tie-break rule (spec §4.5, §9): a fill and a cancel racing for the same
/// order --- `EXPIRED` (fully filled) wins over `CANCELLED`.
pub fn reconcile_fill_cancel_race(is_fully_filled: bool) -> RequestStatus {
    if is_fully_filled {
        RequestStatus::Expired
    } else {
        RequestStatus::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_not_reached_before_configured_window() {
        assert!(!has_insert_failed(0, 30_000, 60, None, None));
    }

    #[test]
    fn deadline_reached_without_slot_info_rejects() {
        assert!(has_insert_failed(0, 70_000, 60, None, None));
    }

    #[test]
    fn deadline_reached_but_slot_not_advanced_waits() {
        assert!(!has_insert_failed(0, 70_000, 60, Some(100), Some(100)));
    }

    #[test]
    fn deadline_reached_and_slot_advanced_rejects() {
        assert!(has_insert_failed(0, 70_000, 60, Some(100), Some(150)));
    }

    #[test]
    fn fully_filled_wins_fill_cancel_race() {
        assert_eq!(reconcile_fill_cancel_race(true), RequestStatus::Expired);
        assert_eq!(reconcile_fill_cancel_race(false), RequestStatus::Cancelled);
    }
}
