//! The Request Cache (spec §4.3): the authoritative in-memory store of
//! every outstanding request, indexed for O(1) lookup by the keys the
//! Status Poller and DEX Core need.
//!
//! Owned exclusively by the DEX Core task; every mutating method takes
//! `&mut self` so serialization is structural, not lock-based, matching
//! spec §5's "owned by the main loop... serialised by virtue of the
//! single-thread model".

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use crate::errors::{DexProxyError, DexProxyResult};
use crate::model::{ClientRequestId, Request, RequestKind, RequestStatus, Trade};

#[derive(Default)]
pub struct RequestCache {
    by_client_request_id: HashMap<ClientRequestId, Request>,
    by_nonce: HashMap<u64, ClientRequestId>,
    by_exchange_order_id: HashMap<String, ClientRequestId>,
    by_kind: HashMap<RequestKind, HashSet<ClientRequestId>>,
    /// Bounded retention of finalised requests for idempotent re-lookup
    /// (spec §3 "a bounded window of finalised requests is retained").
    finalised_order: std::collections::VecDeque<ClientRequestId>,
    finalised_retention: usize,
}

impl RequestCache {
    pub fn new(finalised_retention: usize) -> Self {
        Self {
            finalised_retention,
            ..Default::default()
        }
    }

    pub fn add(&mut self, request: Request) -> DexProxyResult<()> {
        if self.by_client_request_id.contains_key(&request.client_request_id) {
            return Err(DexProxyError::DuplicateClientRequestId(
                request.client_request_id.clone().into(),
            ));
        }

        self.by_kind
            .entry(request.kind())
            .or_default()
            .insert(request.client_request_id.clone());

        if let Some(nonce) = request.nonce {
            self.by_nonce.insert(nonce, request.client_request_id.clone());
        }

        trace!(id = %request.client_request_id, kind = %request.kind(), "request added to cache");

        self.by_client_request_id.insert(request.client_request_id.clone(), request);

        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Request> {
        self.by_client_request_id.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Request> {
        self.by_client_request_id.get_mut(id)
    }

    pub fn get_by_nonce(&self, nonce: u64) -> Option<&Request> {
        self.by_nonce.get(&nonce).and_then(|id| self.get(id))
    }

    pub fn get_by_exchange_order_id(&self, exchange_order_id: &str) -> Option<&Request> {
        self.by_exchange_order_id
            .get(exchange_order_id)
            .and_then(|id| self.get(id))
    }

    /// Links an adapter-assigned order id to the client id once it's known
    /// (spec §4.5 "an order record reveals the exchange_order_id").
    pub fn set_exchange_order_id(&mut self, id: &str, exchange_order_id: String) -> DexProxyResult<()> {
        let req = self
            .by_client_request_id
            .get_mut(id)
            .ok_or_else(|| DexProxyError::RequestNotFound(id.to_string().into()))?;

        if let Some(order) = req.variant.as_order_mut() {
            order.exchange_order_id = Some(exchange_order_id.clone());
        }

        self.by_exchange_order_id.insert(exchange_order_id, id.to_string());

        Ok(())
    }

    pub fn mark_submitted(&mut self, id: &str, tx_hash: String, gas_price_wei: Option<u128>) -> DexProxyResult<()> {
        let req = self
            .by_client_request_id
            .get_mut(id)
            .ok_or_else(|| DexProxyError::RequestNotFound(id.to_string().into()))?;

        req.push_tx_hash(tx_hash, crate::model::TxPurpose::Submit);
        if let Some(gas_price_wei) = gas_price_wei {
            req.push_gas_price(gas_price_wei);
        }
        req.status = RequestStatus::Submitted;

        Ok(())
    }

    pub fn mark_mined(&mut self, id: &str, mined_hash: &str) -> DexProxyResult<()> {
        let req = self
            .by_client_request_id
            .get_mut(id)
            .ok_or_else(|| DexProxyError::RequestNotFound(id.to_string().into()))?;

        req.mark_tx_mined(mined_hash);
        if req.status == RequestStatus::Submitted {
            req.status = RequestStatus::Mined;
        }

        Ok(())
    }

    pub fn apply_trade(&mut self, id: &str, trade: Trade) -> DexProxyResult<bool> {
        let req = self
            .by_client_request_id
            .get_mut(id)
            .ok_or_else(|| DexProxyError::RequestNotFound(id.to_string().into()))?;

        Ok(req.apply_trade(trade))
    }

    /// Moves a request to a terminal state. No-op if already terminal
    /// (spec §8 invariant 5).
    pub fn finalise(&mut self, id: &str, status: RequestStatus, now_ms: i64, reason: Option<String>) -> DexProxyResult<()> {
        let req = self
            .by_client_request_id
            .get_mut(id)
            .ok_or_else(|| DexProxyError::RequestNotFound(id.to_string().into()))?;

        let was_terminal = req.status.is_terminal();
        req.finalise(status, now_ms, reason);

        if !was_terminal {
            debug!(%id, %status, "request finalised");
            self.retire_from_open_indices(id);
            self.finalised_order.push_back(id.to_string());
            self.evict_old_finalised();
        }

        Ok(())
    }

    /// Removes a request outright, dropping it from every index. Used to
    /// release a reservation placeholder (see [`Self::add`]) when the
    /// adapter call it was guarding fails, so the id becomes available for
    /// a genuine retry rather than being stuck behind a phantom duplicate.
    pub fn remove(&mut self, id: &str) -> Option<Request> {
        let req = self.by_client_request_id.remove(id)?;

        if let Some(set) = self.by_kind.get_mut(&req.kind()) {
            set.remove(id);
        }
        if let Some(nonce) = req.nonce {
            self.by_nonce.remove(&nonce);
        }
        if let Some(order) = req.variant.as_order() {
            if let Some(exch_id) = &order.exchange_order_id {
                self.by_exchange_order_id.remove(exch_id);
            }
        }

        Some(req)
    }

    fn retire_from_open_indices(&mut self, id: &str) {
        if let Some(req) = self.by_client_request_id.get(id) {
            if let Some(nonce) = req.nonce {
                self.by_nonce.remove(&nonce);
            }
        }
    }

    fn evict_old_finalised(&mut self) {
        while self.finalised_order.len() > self.finalised_retention {
            if let Some(oldest) = self.finalised_order.pop_front() {
                if let Some(req) = self.by_client_request_id.get(&oldest) {
                    if req.status.is_terminal() {
                        self.by_kind.get_mut(&req.kind()).map(|set| set.remove(&oldest));
                        if let Some(order) = req.variant.as_order() {
                            if let Some(exch_id) = &order.exchange_order_id {
                                self.by_exchange_order_id.remove(exch_id);
                            }
                        }
                        self.by_client_request_id.remove(&oldest);
                    }
                }
            }
        }
    }

    /// Iterates requests of a kind; `open_only` restricts to non-terminal
    /// requests (spec §4.3, used by cancel-all and the poller's sweeps).
    pub fn iter_kind(&self, kind: RequestKind, open_only: bool) -> impl Iterator<Item = &Request> {
        self.by_kind
            .get(&kind)
            .into_iter()
            .flatten()
            .filter_map(move |id| self.by_client_request_id.get(id))
            .filter(move |req| !open_only || !req.status.is_terminal())
    }

    /// A cursor-paginated page of `iter_kind`, ordered by `client_request_id`
    /// so the cursor is stable across calls even as the underlying `HashSet`
    /// iteration order isn't (the list endpoints' `next_page` cursor,
    /// supplemented from the original schemas' paging convention).
    pub fn page_kind(&self, kind: RequestKind, open_only: bool, after: Option<&str>, limit: usize) -> (Vec<Request>, Option<String>) {
        let mut matching: Vec<&Request> = self.iter_kind(kind, open_only).collect();
        matching.sort_by(|a, b| a.client_request_id.cmp(&b.client_request_id));

        let start = match after {
            Some(cursor) => matching.partition_point(|req| req.client_request_id.as_str() <= cursor),
            None => 0,
        };

        let page: Vec<Request> = matching[start..].iter().take(limit).map(|req| (*req).clone()).collect();

        let next_page = if start + page.len() < matching.len() {
            page.last().map(|req| req.client_request_id.clone())
        } else {
            None
        };

        (page, next_page)
    }

    pub fn max_nonce(&self) -> Option<u64> {
        self.by_client_request_id.values().filter_map(|r| r.nonce).max()
    }

    pub fn len(&self) -> usize {
        self.by_client_request_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_client_request_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OrderFields, OrderType, RequestVariant, Side};
    use rust_decimal::Decimal;

    fn sample(id: &str) -> Request {
        let mut req = Request::new(
            id.into(),
            RequestVariant::Order(OrderFields {
                symbol: "SOL-PERP".into(),
                side: Side::Sell,
                order_type: OrderType::Gtc,
                price: Decimal::new(999, 0),
                quantity: Decimal::new(1, 2),
                exchange_order_id: None,
                total_executed_qty: Decimal::ZERO,
                trades: Vec::new(),
                reason: None,
            }),
            0,
        );
        req.nonce = Some(1);
        req
    }

    #[test]
    fn duplicate_client_request_id_rejected() {
        let mut cache = RequestCache::new(100);
        cache.add(sample("a")).unwrap();
        let err = cache.add(sample("a")).unwrap_err();
        assert!(matches!(err, DexProxyError::DuplicateClientRequestId(_)));
    }

    #[test]
    fn remove_frees_the_id_for_a_retry() {
        let mut cache = RequestCache::new(100);
        cache.add(sample("a")).unwrap();
        assert!(cache.remove("a").is_some());
        assert!(cache.get("a").is_none());
        assert!(cache.get_by_nonce(1).is_none());
        cache.add(sample("a")).unwrap();
    }

    #[test]
    fn finalise_removes_nonce_index_but_keeps_lookup() {
        let mut cache = RequestCache::new(100);
        cache.add(sample("a")).unwrap();
        cache.finalise("a", RequestStatus::Cancelled, 5, None).unwrap();

        assert!(cache.get_by_nonce(1).is_none());
        assert_eq!(cache.get("a").unwrap().status, RequestStatus::Cancelled);
    }

    #[test]
    fn finalise_is_idempotent() {
        let mut cache = RequestCache::new(100);
        cache.add(sample("a")).unwrap();
        cache.finalise("a", RequestStatus::Cancelled, 5, None).unwrap();
        cache.finalise("a", RequestStatus::Succeeded, 10, None).unwrap();

        let req = cache.get("a").unwrap();
        assert_eq!(req.status, RequestStatus::Cancelled);
        assert_eq!(req.finalised_at_ms, Some(5));
    }

    #[test]
    fn iter_kind_open_only_excludes_terminal() {
        let mut cache = RequestCache::new(100);
        cache.add(sample("a")).unwrap();
        cache.add(sample("b")).unwrap();
        cache.finalise("a", RequestStatus::Cancelled, 1, None).unwrap();

        let open: Vec<_> = cache.iter_kind(RequestKind::Order, true).collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].client_request_id, "b");
    }

    #[test]
    fn page_kind_paginates_in_client_request_id_order() {
        let mut cache = RequestCache::new(100);
        for (id, nonce) in [("a", 1), ("b", 2), ("c", 3)] {
            let mut req = sample(id);
            req.nonce = Some(nonce);
            cache.add(req).unwrap();
        }

        let (first_page, cursor) = cache.page_kind(RequestKind::Order, true, None, 2);
        assert_eq!(first_page.iter().map(|r| r.client_request_id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(cursor.as_deref(), Some("b"));

        let (second_page, cursor) = cache.page_kind(RequestKind::Order, true, cursor.as_deref(), 2);
        assert_eq!(second_page.iter().map(|r| r.client_request_id.as_str()).collect::<Vec<_>>(), vec!["c"]);
        assert_eq!(cursor, None);
    }

    #[test]
    fn old_finalised_requests_are_evicted_beyond_retention_window() {
        let mut cache = RequestCache::new(1);
        cache.add(sample("a")).unwrap();
        cache.add(sample("b")).unwrap();
        cache.finalise("a", RequestStatus::Cancelled, 1, None).unwrap();
        cache.finalise("b", RequestStatus::Cancelled, 2, None).unwrap();

        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
    }

    #[test]
    fn max_nonce_reflects_in_flight_requests() {
        let mut cache = RequestCache::new(100);
        let mut req = sample("a");
        req.nonce = Some(7);
        cache.add(req).unwrap();
        assert_eq!(cache.max_nonce(), Some(7));
    }
}
