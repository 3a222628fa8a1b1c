//! HTTP/WS transport (spec §4.1): a thin axum front end over the DEX Core.

pub mod http;
pub mod routes;
pub mod ws;

use std::sync::Arc;

use axum::routing::{delete, get, post, MethodRouter};
use axum::{Extension, Router};
use tower_http::trace::TraceLayer;

use crate::app::DexProxyApp;
pub use routes::{RouteRegistry, RouteSpec};
pub use ws::ShutdownSignal;

/// Resolves one active [`RouteSpec`] to its handler. Routes deregistered
/// from the registry are simply absent from the built router.
fn method_router(spec: &RouteSpec) -> Option<MethodRouter> {
    Some(match (spec.method, spec.path) {
        ("POST", "/private/insert-order") => post(http::insert_order),
        ("DELETE", "/private/cancel-order") => delete(http::cancel_order),
        ("DELETE", "/private/cancel-all-orders") => delete(http::cancel_all_orders),
        ("GET", "/public/order") => get(http::get_order),
        ("GET", "/public/orders") => get(http::get_orders),
        ("POST", "/private/approve-token") => post(http::approve_token),
        ("POST", "/private/withdraw") => post(http::withdraw),
        ("POST", "/private/deposit-token") => post(http::deposit),
        ("POST", "/private/transfer-token") => post(http::transfer_token),
        ("POST", "/private/wrap-unwrap-eth") => post(http::wrap_unwrap_eth),
        ("POST", "/private/bridge") => post(http::bridge),
        ("POST", "/private/amend-request") => post(http::amend_request),
        ("POST", "/private/cancel-request") => post(http::cancel_request),
        ("GET", "/public/get-request-status") => get(http::get_request_status),
        ("GET", "/public/get-all-open-requests") => get(http::get_all_open_requests),
        ("GET", "/public/status") => get(http::status),
        _ => return None,
    })
}

pub fn router(app: Arc<DexProxyApp>, shutdown: ShutdownSignal, registry: &RouteRegistry) -> Router {
    let mut router = Router::new().route("/private/ws", get(ws::ws_handler));

    for spec in registry.active() {
        if let Some(handler) = method_router(&spec) {
            router = router.route(spec.path, handler);
        }
    }

    router
        .fallback(http::handler_404)
        .layer(TraceLayer::new_for_http())
        .layer(Extension(app))
        .layer(Extension(shutdown))
}
