//! Route registry (spec supplement: adapters may register/deregister REST
//! routes at runtime, and flag a subset for OpenAPI publication), grounded
//! on the original router's `register`/`deregister` pair and `oapi_in`
//! registration option.

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteSpec {
    pub method: &'static str,
    pub path: &'static str,
    /// Whether this route is included in the generated OpenAPI document.
    /// The schema generator itself lives adapter-side and is out of scope
    /// here; the registry only tracks the flag.
    pub oapi_in: bool,
}

/// Every route this gateway serves by default, with its OpenAPI visibility.
pub const DEFAULT_ROUTES: &[RouteSpec] = &[
    RouteSpec { method: "POST", path: "/private/insert-order", oapi_in: true },
    RouteSpec { method: "DELETE", path: "/private/cancel-order", oapi_in: true },
    RouteSpec { method: "DELETE", path: "/private/cancel-all-orders", oapi_in: true },
    RouteSpec { method: "GET", path: "/public/order", oapi_in: true },
    RouteSpec { method: "GET", path: "/public/orders", oapi_in: true },
    RouteSpec { method: "POST", path: "/private/approve-token", oapi_in: true },
    RouteSpec { method: "POST", path: "/private/withdraw", oapi_in: true },
    RouteSpec { method: "POST", path: "/private/deposit-token", oapi_in: true },
    RouteSpec { method: "POST", path: "/private/transfer-token", oapi_in: true },
    RouteSpec { method: "POST", path: "/private/wrap-unwrap-eth", oapi_in: true },
    RouteSpec { method: "POST", path: "/private/bridge", oapi_in: true },
    RouteSpec { method: "POST", path: "/private/amend-request", oapi_in: true },
    RouteSpec { method: "POST", path: "/private/cancel-request", oapi_in: true },
    RouteSpec { method: "GET", path: "/public/get-request-status", oapi_in: false },
    RouteSpec { method: "GET", path: "/public/get-all-open-requests", oapi_in: false },
    RouteSpec { method: "GET", path: "/public/status", oapi_in: false },
];

/// Tracks which of the known routes are currently active. Deregistering a
/// route removes it the next time the router is (re)built from this
/// registry; this gateway doesn't hot-swap a live `axum::Router`, matching
/// axum's static routing model, but the registry itself is fully dynamic.
pub struct RouteRegistry {
    active: Mutex<Vec<RouteSpec>>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(DEFAULT_ROUTES.to_vec()),
        }
    }

    pub fn register(&self, spec: RouteSpec) {
        let mut active = self.active.lock();
        if !active.iter().any(|r| r.method == spec.method && r.path == spec.path) {
            active.push(spec);
        }
    }

    pub fn deregister(&self, method: &str, path: &str) {
        self.active.lock().retain(|r| !(r.method == method && r.path == path));
    }

    pub fn active(&self) -> Vec<RouteSpec> {
        self.active.lock().clone()
    }

    pub fn oapi_routes(&self) -> Vec<RouteSpec> {
        self.active.lock().iter().filter(|r| r.oapi_in).cloned().collect()
    }
}

impl Default for RouteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deregistered_route_is_excluded_from_active() {
        let registry = RouteRegistry::new();
        registry.deregister("POST", "/private/bridge");

        assert!(!registry.active().iter().any(|r| r.path == "/private/bridge"));
    }

    #[test]
    fn registering_twice_does_not_duplicate() {
        let registry = RouteRegistry::new();
        let spec = RouteSpec { method: "GET", path: "/public/custom", oapi_in: false };
        registry.register(spec);
        registry.register(spec);

        assert_eq!(registry.active().iter().filter(|r| r.path == "/public/custom").count(), 1);
    }

    #[test]
    fn oapi_routes_excludes_unflagged_routes() {
        let registry = RouteRegistry::new();
        assert!(!registry.oapi_routes().iter().any(|r| r.path == "/public/status"));
        assert!(registry.oapi_routes().iter().any(|r| r.path == "/private/insert-order"));
    }
}
