//! The DEX Core (spec §4.6): the orchestrator. For every verb it performs,
//! in order: idempotency check -> validation -> nonce reservation (if
//! on-chain) -> adapter call -> record tx hash -> enqueue for polling.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{instrument, trace, warn};

use crate::adapter::{DexAdapter, SubmitOutcome};
use crate::config::AppConfig;
use crate::errors::{DexProxyError, DexProxyResult};
use crate::model::{
    ApproveFields, BridgeFields, OrderFields, OrderType, Request, RequestKind, RequestStatus, RequestVariant, Side,
    Trade, TransferFields, TxPurpose, WrapDirection, WrapUnwrapFields,
};
use crate::nonce_manager::NonceManager;
use crate::poller::{OpenOrderSnapshot, PendingTxSnapshot, PollerHost};
use crate::request_cache::RequestCache;
use crate::subscriptions::SubscriptionRegistry;

/// Default retention of finalised requests kept around for idempotent
/// re-lookup after they leave the open indices (spec §3).
const DEFAULT_FINALISED_RETENTION: usize = 10_000;

pub struct DexProxyApp {
    config: AppConfig,
    cache: Mutex<RequestCache>,
    nonce_managers: Mutex<HashMap<String, NonceManager>>,
    pub subscriptions: Arc<SubscriptionRegistry>,
    adapters: HashMap<String, Arc<dyn DexAdapter>>,
    redis: Option<Arc<redis_store::RedisStore>>,
    clock: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl fmt::Debug for DexProxyApp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DexProxyApp").finish_non_exhaustive()
    }
}

fn system_now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl DexProxyApp {
    pub fn new(
        config: AppConfig,
        adapters: HashMap<String, Arc<dyn DexAdapter>>,
        redis: Option<Arc<redis_store::RedisStore>>,
    ) -> Self {
        let mut known_channels = Vec::new();
        for adapter in adapters.values() {
            known_channels.extend(adapter.channels());
        }
        known_channels.sort();
        known_channels.dedup();

        Self {
            config,
            cache: Mutex::new(RequestCache::new(DEFAULT_FINALISED_RETENTION)),
            nonce_managers: Mutex::new(HashMap::new()),
            subscriptions: Arc::new(SubscriptionRegistry::new(known_channels)),
            adapters,
            redis,
            clock: Box::new(system_now_ms),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    fn now_ms(&self) -> i64 {
        (self.clock)()
    }

    fn adapter(&self, venue: &str) -> DexProxyResult<&Arc<dyn DexAdapter>> {
        self.adapters
            .get(venue)
            .ok_or_else(|| DexProxyError::NoAdapterForVenue(venue.to_string().into()))
    }

    fn venue_gas_cap(&self, venue: &str) -> Option<u128> {
        self.config.venues.get(venue).and_then(|v| v.max_gas_price_wei)
    }

    fn check_gas_cap(&self, venue: &str, gas_price_wei: Option<u128>) -> DexProxyResult<()> {
        if let (Some(cap), Some(requested)) = (self.venue_gas_cap(venue), gas_price_wei) {
            if requested > cap {
                return Err(DexProxyError::GasCapExceeded {
                    cap_wei: cap,
                    requested_wei: requested,
                });
            }
        }
        Ok(())
    }

    fn reserve_nonce(&self, venue: &str) -> u64 {
        let mut managers = self.nonce_managers.lock();
        managers.entry(venue.to_string()).or_insert_with(|| NonceManager::new(0)).get()
    }

    fn release_nonce(&self, venue: &str, nonce: u64) {
        let mut managers = self.nonce_managers.lock();
        if let Some(mgr) = managers.get_mut(venue) {
            mgr.put(nonce);
        }
    }

    fn persist(&self, request: &Request) {
        if let Some(redis) = self.redis.clone() {
            let request = request.clone();
            tokio::spawn(async move {
                if let Err(err) = redis.put(&request.client_request_id, &request).await {
                    warn!(?err, id = %request.client_request_id, "write-through persistence failed");
                }
            });
        }
    }

    fn publish_order_update(&self, request: &Request) {
        if let Ok(value) = serde_json::to_value(OrderSnapshot::from(request)) {
            self.subscriptions.publish("ORDER", value);
        }
    }

    fn publish_trade(&self, client_request_id: &str, trade: &Trade) {
        let value = serde_json::json!({
            "client_request_id": client_request_id,
            "trade_id": trade.trade_id,
            "exec_price": trade.exec_price,
            "exec_qty": trade.exec_qty,
        });
        self.subscriptions.publish("TRADE", value);
    }

    /// Reloads the cache from the optional write-through store at startup
    /// and drains any request whose terminal status was already observed
    /// (spec §4.3 "finalise_at_startup").
    pub async fn reload_from_storage(&self) -> DexProxyResult<()> {
        let Some(redis) = self.redis.clone() else {
            return Ok(());
        };

        let requests: Vec<Request> = redis.scan_all().await.map_err(DexProxyError::Redis)?;

        let mut cache = self.cache.lock();
        for request in requests {
            trace!(id = %request.client_request_id, "reloaded request from storage");
            let _ = cache.add(request);
        }

        if let Some(max_nonce) = cache.max_nonce() {
            drop(cache);
            let mut managers = self.nonce_managers.lock();
            for mgr in managers.values_mut() {
                *mgr = NonceManager::resume_from(Some(max_nonce));
            }
        }

        Ok(())
    }

    #[instrument(skip_all, fields(client_request_id = %client_request_id))]
    pub async fn submit_order(
        &self,
        venue: &str,
        client_request_id: String,
        symbol: String,
        side: Side,
        order_type: OrderType,
        price: Decimal,
        quantity: Decimal,
        gas_price_wei: Option<u128>,
    ) -> DexProxyResult<SubmitOutcome> {
        self.check_gas_cap(venue, gas_price_wei)?;

        let adapter = self.adapter(venue)?.clone();
        let is_onchain = gas_price_wei.is_some();
        let nonce = is_onchain.then(|| self.reserve_nonce(venue));

        let mut reservation = Request::new(
            client_request_id.clone(),
            RequestVariant::Order(OrderFields {
                symbol: symbol.clone(),
                side,
                order_type,
                price,
                quantity,
                exchange_order_id: None,
                total_executed_qty: Decimal::ZERO,
                trades: Vec::new(),
                reason: None,
            }),
            self.now_ms(),
        );
        reservation.nonce = nonce;

        // reserved under the lock before the adapter call, so a concurrent
        // submit with the same id is rejected here rather than racing this
        // call to the adapter (spec §3: at most one submission per
        // client_request_id)
        if let Err(err) = self.cache.lock().add(reservation) {
            if let Some(nonce) = nonce {
                self.release_nonce(venue, nonce);
            }
            return Err(err);
        }

        let outcome = adapter
            .submit_order(&client_request_id, &symbol, side, order_type, price, quantity, nonce, gas_price_wei)
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                self.cache.lock().remove(&client_request_id);
                if let Some(nonce) = nonce {
                    self.release_nonce(venue, nonce);
                }
                return Err(err);
            }
        };

        let request = {
            let mut cache = self.cache.lock();
            let request = cache.get_mut(&client_request_id).expect("reservation still present");
            if let Some(order) = request.variant.as_order_mut() {
                order.exchange_order_id = outcome.exchange_order_id.clone();
            }
            request.push_tx_hash(outcome.tx_hash.clone(), TxPurpose::Submit);
            if let Some(gas_price_wei) = gas_price_wei {
                request.push_gas_price(gas_price_wei);
            }
            request.status = RequestStatus::Submitted;
            request.clone()
        };

        self.persist(&request);
        self.publish_order_update(&request);

        Ok(outcome)
    }

    /// Cancel, amend share the gas-bump enforcement and "already in
    /// flight at this gas or better" short-circuit (spec §4.6).
    fn check_gas_bump(&self, request: &Request, new_gas_price_wei: Option<u128>) -> DexProxyResult<()> {
        let Some(new_gas_price_wei) = new_gas_price_wei else {
            return Ok(());
        };

        if !request.accepts_gas_bump(new_gas_price_wei) {
            return Err(DexProxyError::GasBumpTooSmall {
                previous_wei: request.last_used_gas_price_wei().unwrap_or(0),
                requested_wei: new_gas_price_wei,
            });
        }

        Ok(())
    }

    #[instrument(skip_all, fields(client_request_id = %client_request_id))]
    pub async fn cancel_request(
        &self,
        venue: &str,
        client_request_id: &str,
        gas_price_wei: Option<u128>,
    ) -> DexProxyResult<SubmitOutcome> {
        let request = {
            let cache = self.cache.lock();
            cache
                .get(client_request_id)
                .cloned()
                .ok_or_else(|| DexProxyError::RequestNotFound(client_request_id.to_string().into()))?
        };

        if request.status.is_terminal() {
            return Err(DexProxyError::RequestAlreadyFinalised(client_request_id.to_string().into()));
        }

        if request.is_l2() {
            return Err(DexProxyError::BadRequest(
                "NOT_SUPPORTED: cancel on an already-mined L2 request".into(),
            ));
        }

        if request.cancel_requested && self.check_gas_bump(&request, gas_price_wei).is_err() {
            return Err(DexProxyError::BadRequest(
                "a cancel at this gas price or better is already in flight".into(),
            ));
        }

        self.check_gas_bump(&request, gas_price_wei)?;
        self.check_gas_cap(venue, gas_price_wei)?;

        let adapter = self.adapter(venue)?.clone();
        let exchange_order_id = request.variant.as_order().and_then(|o| o.exchange_order_id.as_deref());

        let outcome = match adapter.cancel_order(client_request_id, exchange_order_id, request.nonce, gas_price_wei).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let message = err.to_string();
                if !crate::classify::should_report_cancel_error(&message) {
                    trace!(%client_request_id, %message, "suppressing cancel error that races a fill/expiry");
                    return Ok(SubmitOutcome {
                        tx_hash: String::new(),
                        exchange_order_id: None,
                    });
                }

                let reason = crate::classify::classify_cancel_error(&message);
                warn!(%client_request_id, %reason, "cancel rejected by adapter");
                return Err(err);
            }
        };

        let mut cache = self.cache.lock();
        if let Some(req) = cache.get_mut(client_request_id) {
            req.cancel_requested = true;
            req.push_tx_hash(outcome.tx_hash.clone(), TxPurpose::Cancel);
            if let Some(gas_price_wei) = gas_price_wei {
                req.push_gas_price(gas_price_wei);
            }
        }
        drop(cache);

        Ok(outcome)
    }

    #[instrument(skip_all, fields(client_request_id = %client_request_id))]
    pub async fn amend_request(
        &self,
        venue: &str,
        client_request_id: &str,
        gas_price_wei: u128,
    ) -> DexProxyResult<SubmitOutcome> {
        let request = {
            let cache = self.cache.lock();
            cache
                .get(client_request_id)
                .cloned()
                .ok_or_else(|| DexProxyError::RequestNotFound(client_request_id.to_string().into()))?
        };

        if request.status.is_terminal() {
            return Err(DexProxyError::RequestAlreadyFinalised(client_request_id.to_string().into()));
        }

        if request.is_l2() {
            return Err(DexProxyError::BadRequest(
                "NOT_SUPPORTED: amend on an already-mined L2 request".into(),
            ));
        }

        self.check_gas_bump(&request, Some(gas_price_wei))?;
        self.check_gas_cap(venue, Some(gas_price_wei))?;

        let adapter = self.adapter(venue)?.clone();
        let exchange_order_id = request.variant.as_order().and_then(|o| o.exchange_order_id.as_deref());

        let outcome = adapter
            .amend_order(client_request_id, exchange_order_id, request.nonce, gas_price_wei)
            .await?;

        let mut cache = self.cache.lock();
        if let Some(req) = cache.get_mut(client_request_id) {
            req.amend_requested = true;
            req.push_tx_hash(outcome.tx_hash.clone(), TxPurpose::Amend);
            req.push_gas_price(gas_price_wei);
        }
        drop(cache);

        Ok(outcome)
    }

    /// Cancel-all by kind (spec §4.6): iterates open requests of the kind,
    /// skipping ones whose most recent cancel intent already matches or
    /// beats the fast-priority gas price, and aggregates results.
    #[instrument(skip_all)]
    pub async fn cancel_all(&self, venue: &str, kind: RequestKind, fast_priority_gas_price_wei: Option<u128>) -> CancelAllResult {
        let ids: Vec<String> = {
            let cache = self.cache.lock();
            cache
                .iter_kind(kind, true)
                .filter(|req| {
                    fast_priority_gas_price_wei
                        .map(|target| req.last_used_gas_price_wei().map(|g| g < target).unwrap_or(true))
                        .unwrap_or(true)
                })
                .map(|req| req.client_request_id.clone())
                .collect()
        };

        let mut cancelled = Vec::new();
        let mut failed = Vec::new();

        for id in ids {
            match self.cancel_request(venue, &id, fast_priority_gas_price_wei).await {
                Ok(_) => cancelled.push(id),
                Err(err) => {
                    warn!(?err, %id, "cancel-all: individual cancel failed");
                    failed.push(id);
                }
            }
        }

        CancelAllResult {
            cancelled,
            failed,
            send_timestamp_ns: self.now_ms() as u128 * 1_000_000,
        }
    }

    /// Idempotency + nonce reservation shared by every non-order on-chain
    /// verb. Reserves `request` in the cache (holding the lock) before the
    /// adapter is ever called, so a concurrent submit with the same
    /// `client_request_id` is rejected immediately rather than racing this
    /// call to the adapter (spec §3: at most one submission per
    /// client_request_id). Returns the reserved nonce, if any, so the
    /// caller can release it on adapter failure.
    fn begin_onchain_verb(&self, venue: &str, mut request: Request, gas_price_wei: Option<u128>) -> DexProxyResult<Option<u64>> {
        self.check_gas_cap(venue, gas_price_wei)?;

        let nonce = gas_price_wei.is_some().then(|| self.reserve_nonce(venue));
        request.nonce = nonce;

        if let Err(err) = self.cache.lock().add(request) {
            if let Some(nonce) = nonce {
                self.release_nonce(venue, nonce);
            }
            return Err(err);
        }

        Ok(nonce)
    }

    /// Releases a reservation made by [`Self::begin_onchain_verb`] after the
    /// adapter call it was guarding fails, freeing the id for a genuine retry.
    fn abort_onchain_verb(&self, venue: &str, client_request_id: &str, nonce: Option<u64>) {
        self.cache.lock().remove(client_request_id);
        if let Some(nonce) = nonce {
            self.release_nonce(venue, nonce);
        }
    }

    /// Fills in the tx hash/gas price/status on a reservation after the
    /// adapter call it was guarding succeeds, and persists the result.
    fn finish_onchain_verb(&self, client_request_id: &str, outcome: &SubmitOutcome, gas_price_wei: Option<u128>) -> Request {
        let request = {
            let mut cache = self.cache.lock();
            let request = cache.get_mut(client_request_id).expect("reservation still present");
            request.push_tx_hash(outcome.tx_hash.clone(), TxPurpose::Submit);
            if let Some(gas_price_wei) = gas_price_wei {
                request.push_gas_price(gas_price_wei);
            }
            request.status = RequestStatus::Submitted;
            request.clone()
        };

        self.persist(&request);
        request
    }

    pub async fn submit_approval(
        &self,
        venue: &str,
        client_request_id: String,
        symbol: String,
        amount: Decimal,
        approve_contract_address: String,
        gas_price_wei: Option<u128>,
    ) -> DexProxyResult<SubmitOutcome> {
        let reservation = Request::new(
            client_request_id.clone(),
            RequestVariant::Approve(ApproveFields {
                symbol: symbol.clone(),
                amount,
                approve_contract_address: approve_contract_address.clone(),
                gas_limit: None,
            }),
            self.now_ms(),
        );
        let nonce = self.begin_onchain_verb(venue, reservation, gas_price_wei)?;
        let adapter = self.adapter(venue)?.clone();

        let outcome = match adapter
            .submit_approval(&client_request_id, &symbol, amount, &approve_contract_address, nonce, gas_price_wei)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                self.abort_onchain_verb(venue, &client_request_id, nonce);
                return Err(err);
            }
        };

        self.finish_onchain_verb(&client_request_id, &outcome, gas_price_wei);

        Ok(outcome)
    }

    pub async fn submit_transfer(
        &self,
        venue: &str,
        client_request_id: String,
        symbol: String,
        amount: Decimal,
        address_to: Option<String>,
        request_path: String,
        gas_price_wei: Option<u128>,
    ) -> DexProxyResult<SubmitOutcome> {
        let reservation = Request::new(
            client_request_id.clone(),
            RequestVariant::Transfer(TransferFields {
                symbol: symbol.clone(),
                amount,
                address_to: address_to.clone(),
                gas_limit: None,
                request_path,
            }),
            self.now_ms(),
        );
        let nonce = self.begin_onchain_verb(venue, reservation, gas_price_wei)?;
        let adapter = self.adapter(venue)?.clone();

        let outcome = match adapter
            .submit_transfer(&client_request_id, &symbol, amount, address_to.as_deref(), nonce, gas_price_wei)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                self.abort_onchain_verb(venue, &client_request_id, nonce);
                return Err(err);
            }
        };

        self.finish_onchain_verb(&client_request_id, &outcome, gas_price_wei);

        Ok(outcome)
    }

    pub async fn submit_wrap_unwrap(
        &self,
        venue: &str,
        client_request_id: String,
        symbol: String,
        amount: Decimal,
        direction: WrapDirection,
        gas_price_wei: Option<u128>,
    ) -> DexProxyResult<SubmitOutcome> {
        let reservation = Request::new(
            client_request_id.clone(),
            RequestVariant::WrapUnwrap(WrapUnwrapFields {
                symbol: symbol.clone(),
                amount,
                direction,
                gas_limit: None,
            }),
            self.now_ms(),
        );
        let nonce = self.begin_onchain_verb(venue, reservation, gas_price_wei)?;
        let adapter = self.adapter(venue)?.clone();

        let outcome = match adapter.submit_wrap_unwrap(&client_request_id, &symbol, amount, direction, nonce, gas_price_wei).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.abort_onchain_verb(venue, &client_request_id, nonce);
                return Err(err);
            }
        };

        self.finish_onchain_verb(&client_request_id, &outcome, gas_price_wei);

        Ok(outcome)
    }

    pub async fn submit_bridge(
        &self,
        venue: &str,
        client_request_id: String,
        symbol: String,
        amount: Decimal,
        source_chain: String,
        destination_chain: String,
        gas_price_wei: Option<u128>,
    ) -> DexProxyResult<SubmitOutcome> {
        let reservation = Request::new(
            client_request_id.clone(),
            RequestVariant::Bridge(BridgeFields {
                symbol: symbol.clone(),
                amount,
                source_chain: source_chain.clone(),
                destination_chain: destination_chain.clone(),
                gas_limit: None,
            }),
            self.now_ms(),
        );
        let nonce = self.begin_onchain_verb(venue, reservation, gas_price_wei)?;
        let adapter = self.adapter(venue)?.clone();

        let outcome = match adapter
            .submit_bridge(&client_request_id, &symbol, amount, &source_chain, &destination_chain, nonce, gas_price_wei)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                self.abort_onchain_verb(venue, &client_request_id, nonce);
                return Err(err);
            }
        };

        self.finish_onchain_verb(&client_request_id, &outcome, gas_price_wei);

        Ok(outcome)
    }

    pub fn get_request_status(&self, client_request_id: &str) -> DexProxyResult<Request> {
        self.cache
            .lock()
            .get(client_request_id)
            .cloned()
            .ok_or_else(|| DexProxyError::RequestNotFound(client_request_id.to_string().into()))
    }

    pub fn get_all_open_requests(&self, kind: RequestKind) -> Vec<Request> {
        self.cache.lock().iter_kind(kind, true).cloned().collect()
    }

    /// Cursor-paginated variant of [`Self::get_all_open_requests`] (spec
    /// supplement: list endpoints carry a `next_page` cursor).
    pub fn get_all_open_requests_page(&self, kind: RequestKind, after: Option<&str>, limit: usize) -> (Vec<Request>, Option<String>) {
        self.cache.lock().page_kind(kind, true, after, limit)
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CancelAllResult {
    pub cancelled: Vec<String>,
    pub failed: Vec<String>,
    pub send_timestamp_ns: u128,
}

#[derive(Debug, Clone, serde::Serialize)]
struct OrderSnapshot {
    client_request_id: String,
    status: RequestStatus,
    total_exec_quantity: Option<Decimal>,
}

impl From<&Request> for OrderSnapshot {
    fn from(req: &Request) -> Self {
        Self {
            client_request_id: req.client_request_id.clone(),
            status: req.status,
            total_exec_quantity: req.variant.as_order().map(|o| o.total_executed_qty),
        }
    }
}

#[async_trait::async_trait]
impl PollerHost for DexProxyApp {
    async fn open_orders_awaiting_exchange_id(&self) -> Vec<OpenOrderSnapshot> {
        let cache = self.cache.lock();
        cache
            .iter_kind(RequestKind::Order, true)
            .filter(|req| req.variant.as_order().map(|o| o.exchange_order_id.is_none()).unwrap_or(false))
            .map(|req| OpenOrderSnapshot {
                client_request_id: req.client_request_id.clone(),
                symbol: req.variant.as_order().map(|o| o.symbol.clone()).unwrap_or_default(),
                market_type: "PERP".to_string(),
                exchange_order_id: None,
                slot: req.slot,
                received_at_ms: req.received_at_ms,
            })
            .collect()
    }

    async fn open_orders_with_exchange_id(&self, refresh_after_s: u64) -> Vec<OpenOrderSnapshot> {
        let now = self.now_ms();
        let cache = self.cache.lock();
        cache
            .iter_kind(RequestKind::Order, true)
            .filter_map(|req| {
                let order = req.variant.as_order()?;
                let exchange_order_id = order.exchange_order_id.clone()?;
                if (now - req.received_at_ms) < (refresh_after_s as i64 * 1000) {
                    return None;
                }
                Some(OpenOrderSnapshot {
                    client_request_id: req.client_request_id.clone(),
                    symbol: order.symbol.clone(),
                    market_type: "PERP".to_string(),
                    exchange_order_id: Some(exchange_order_id),
                    slot: req.slot,
                    received_at_ms: req.received_at_ms,
                })
            })
            .collect()
    }

    async fn open_requests_awaiting_confirmation(&self) -> Vec<PendingTxSnapshot> {
        let cache = self.cache.lock();
        cache
            .iter_kind(RequestKind::Order, true)
            .filter(|req| req.status == RequestStatus::Submitted)
            .filter_map(|req| {
                req.last_tx_hash().map(|hash| PendingTxSnapshot {
                    client_request_id: req.client_request_id.clone(),
                    tx_hash: hash.to_string(),
                })
            })
            .collect()
    }

    async fn apply_exchange_order_id(&self, client_request_id: &str, exchange_order_id: String, slot: Option<u64>) {
        let mut cache = self.cache.lock();
        if cache.set_exchange_order_id(client_request_id, exchange_order_id).is_ok() {
            if let Some(req) = cache.get_mut(client_request_id) {
                if req.slot.is_none() {
                    req.slot = slot;
                }
            }
            if let Some(req) = cache.get(client_request_id).cloned() {
                drop(cache);
                self.publish_order_update(&req);
            }
        }
    }

    async fn apply_fill(&self, exchange_order_id: &str, trade: Trade) -> bool {
        let client_request_id = {
            let cache = self.cache.lock();
            cache.get_by_exchange_order_id(exchange_order_id).map(|r| r.client_request_id.clone())
        };

        let Some(client_request_id) = client_request_id else {
            return false;
        };

        let applied = {
            let mut cache = self.cache.lock();
            cache.apply_trade(&client_request_id, trade.clone()).unwrap_or(false)
        };

        if applied {
            self.publish_trade(&client_request_id, &trade);

            let fully_filled = {
                let cache = self.cache.lock();
                cache.get(&client_request_id).map(|r| r.is_fully_filled()).unwrap_or(false)
            };

            if fully_filled {
                let mut cache = self.cache.lock();
                let _ = cache.finalise(&client_request_id, RequestStatus::Expired, self.now_ms(), None);
                if let Some(req) = cache.get(&client_request_id).cloned() {
                    drop(cache);
                    self.publish_order_update(&req);
                }
            }
        }

        applied
    }

    async fn apply_cancel(&self, exchange_order_id: &str) {
        let client_request_id = {
            let cache = self.cache.lock();
            cache.get_by_exchange_order_id(exchange_order_id).map(|r| r.client_request_id.clone())
        };

        let Some(client_request_id) = client_request_id else {
            return;
        };

        let mut cache = self.cache.lock();
        let already_terminal = cache.get(&client_request_id).map(|r| r.status.is_terminal()).unwrap_or(true);
        if already_terminal {
            return;
        }

        let fully_filled = cache.get(&client_request_id).map(|r| r.is_fully_filled()).unwrap_or(false);
        let status = crate::poller::reconcile_fill_cancel_race(fully_filled);

        let _ = cache.finalise(&client_request_id, status, self.now_ms(), None);
        if let Some(req) = cache.get(&client_request_id).cloned() {
            drop(cache);
            self.publish_order_update(&req);
        }
    }

    async fn apply_receipt_success(&self, client_request_id: &str, tx_hash: &str) {
        let mut cache = self.cache.lock();
        let _ = cache.mark_mined(client_request_id, tx_hash);
    }

    async fn apply_receipt_reverted(&self, client_request_id: &str, revert_reason: &str) {
        let reason = crate::classify::classify_insert_error(revert_reason).to_string();

        let mut cache = self.cache.lock();
        let already_terminal = cache.get(client_request_id).map(|r| r.status.is_terminal()).unwrap_or(true);
        if already_terminal {
            return;
        }

        let _ = cache.finalise(client_request_id, RequestStatus::Rejected, self.now_ms(), Some(reason));
        if let Some(req) = cache.get(client_request_id).cloned() {
            drop(cache);
            self.publish_order_update(&req);
        }
    }

    async fn apply_insert_deadline_expired(&self, client_request_id: &str) {
        let mut cache = self.cache.lock();
        let _ = cache.finalise(
            client_request_id,
            RequestStatus::Rejected,
            self.now_ms(),
            Some("TRANSPORT_FAILURE".to_string()),
        );
    }

    fn now_ms(&self) -> i64 {
        self.now_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::mock::MockAdapter;
    use crate::config::{PollerConfig, VenueConfig};

    fn config() -> AppConfig {
        let mut venues = HashMap::new();
        venues.insert(
            "drift".to_string(),
            VenueConfig {
                kind: "drift".into(),
                max_gas_price_wei: Some(5_000_000_000),
                nonce_pool_size: None,
                extra: None,
            },
        );

        AppConfig {
            listen_addr: "127.0.0.1:0".into(),
            redis: None,
            poller: PollerConfig::default(),
            venues,
        }
    }

    fn app() -> DexProxyApp {
        let mock = Arc::new(MockAdapter::new("drift", vec!["ORDER".into(), "TRADE".into()]));
        let mut adapters: HashMap<String, Arc<dyn DexAdapter>> = HashMap::new();
        adapters.insert("drift".to_string(), mock);
        DexProxyApp::new(config(), adapters, None)
    }

    fn app_with_mock() -> (DexProxyApp, Arc<MockAdapter>) {
        let mock = Arc::new(MockAdapter::new("drift", vec!["ORDER".into(), "TRADE".into()]));
        let mut adapters: HashMap<String, Arc<dyn DexAdapter>> = HashMap::new();
        adapters.insert("drift".to_string(), mock.clone());
        (DexProxyApp::new(config(), adapters, None), mock)
    }

    #[tokio::test]
    async fn duplicate_submit_is_rejected() {
        let app = app();

        app.submit_order(
            "drift",
            "abc".into(),
            "SOL-PERP".into(),
            Side::Sell,
            OrderType::GtcPostOnly,
            Decimal::new(999, 0),
            Decimal::new(1, 2),
            None,
        )
        .await
        .unwrap();

        let err = app
            .submit_order(
                "drift",
                "abc".into(),
                "SOL-PERP".into(),
                Side::Sell,
                OrderType::GtcPostOnly,
                Decimal::new(999, 0),
                Decimal::new(1, 2),
                None,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DexProxyError::DuplicateClientRequestId(_)));
    }

    #[tokio::test]
    async fn gas_cap_exceeded_rejects_before_submission() {
        let app = app();

        let err = app
            .submit_order(
                "drift",
                "abc".into(),
                "SOL-PERP".into(),
                Side::Sell,
                OrderType::GtcPostOnly,
                Decimal::new(999, 0),
                Decimal::new(1, 2),
                Some(10_000_000_000),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DexProxyError::GasCapExceeded { .. }));
    }

    #[tokio::test]
    async fn gas_bump_scenario() {
        let app = app();

        app.submit_approval(
            "drift",
            "approve-1".into(),
            "USDC".into(),
            Decimal::new(100, 0),
            "0xcontract".into(),
            Some(1_000_000_000),
        )
        .await
        .unwrap();

        let err = app.amend_request("drift", "approve-1", 1_000_000_000).await.unwrap_err();
        assert!(matches!(err, DexProxyError::GasBumpTooSmall { .. }));

        app.amend_request("drift", "approve-1", 2_000_000_000).await.unwrap();

        let req = app.get_request_status("approve-1").unwrap();
        assert_eq!(req.used_gas_prices_wei, vec![1_000_000_000, 2_000_000_000]);
    }

    #[tokio::test]
    async fn gtc_then_cancel_scenario() {
        let app = app();

        app.submit_order(
            "drift",
            "123".into(),
            "SOL-PERP".into(),
            Side::Sell,
            OrderType::GtcPostOnly,
            Decimal::new(999, 0),
            Decimal::new(1, 2),
            None,
        )
        .await
        .unwrap();

        app.cancel_request("drift", "123", None).await.unwrap();

        let req = app.get_request_status("123").unwrap();
        assert_eq!(req.status, RequestStatus::Submitted);
        assert!(req.cancel_requested);
    }

    #[tokio::test]
    async fn cancel_error_racing_a_fill_is_suppressed_not_reported() {
        let (app, mock) = app_with_mock();

        app.submit_order(
            "drift",
            "456".into(),
            "SOL-PERP".into(),
            Side::Sell,
            OrderType::GtcPostOnly,
            Decimal::new(999, 0),
            Decimal::new(1, 2),
            None,
        )
        .await
        .unwrap();

        mock.push_submit_outcome(Err(DexProxyError::BadRequest(
            "Order not open for cancellation".into(),
        )));

        let outcome = app.cancel_request("drift", "456", None).await.unwrap();
        assert_eq!(outcome.tx_hash, "");

        let req = app.get_request_status("456").unwrap();
        assert!(!req.cancel_requested, "suppressed cancel errors never mark cancel_requested");
    }

    #[tokio::test]
    async fn genuine_cancel_rejection_is_reported() {
        let (app, mock) = app_with_mock();

        app.submit_order(
            "drift",
            "789".into(),
            "SOL-PERP".into(),
            Side::Sell,
            OrderType::GtcPostOnly,
            Decimal::new(999, 0),
            Decimal::new(1, 2),
            None,
        )
        .await
        .unwrap();

        mock.push_submit_outcome(Err(DexProxyError::BadRequest("venue rejected the request".into())));

        let err = app.cancel_request("drift", "789", None).await.unwrap_err();
        assert!(matches!(err, DexProxyError::BadRequest(_)));
    }
}
