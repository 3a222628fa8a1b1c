//! Utilities for logging errors for admins and displaying errors to clients.

use std::borrow::Cow;
use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use derive_more::{Display, Error, From};
use rust_decimal::Error as DecimalError;
use tracing::{debug, error, trace, warn};

use serde::Serialize;

use crate::jsonrpc::JsonRpcErrorData;

pub type DexProxyResult<T> = Result<T, DexProxyError>;
pub type DexProxyResponse = DexProxyResult<Response>;

impl From<DexProxyError> for DexProxyResult<()> {
    fn from(value: DexProxyError) -> Self {
        Err(value)
    }
}

#[derive(Debug, Display, Error, From)]
pub enum DexProxyError {
    #[error(ignore)]
    Anyhow(anyhow::Error),
    Arc(Arc<Self>),
    #[error(ignore)]
    #[from(ignore)]
    BadRequest(Cow<'static, str>),
    #[error(ignore)]
    #[from(ignore)]
    BadResponse(Cow<'static, str>),
    Decimal(DecimalError),
    FlumeRecv(flume::RecvError),
    #[error(ignore)]
    #[from(ignore)]
    DuplicateClientRequestId(Cow<'static, str>),
    #[display(fmt = "{} does not beat {}", requested_wei, previous_wei)]
    #[error(ignore)]
    #[from(ignore)]
    GasBumpTooSmall { previous_wei: u128, requested_wei: u128 },
    #[display(fmt = "{} > cap {}", requested_wei, cap_wei)]
    #[error(ignore)]
    #[from(ignore)]
    GasCapExceeded { cap_wei: u128, requested_wei: u128 },
    Io(std::io::Error),
    JoinError(tokio::task::JoinError),
    #[display(fmt = "{:?}", _0)]
    #[error(ignore)]
    JsonRpcErrorData(JsonRpcErrorData),
    #[error(ignore)]
    #[from(ignore)]
    NoAdapterForVenue(Cow<'static, str>),
    #[error(ignore)]
    #[from(ignore)]
    NonceExhausted(Cow<'static, str>),
    #[error(ignore)]
    #[from(ignore)]
    RequestAlreadyFinalised(Cow<'static, str>),
    #[error(ignore)]
    #[from(ignore)]
    RequestNotFound(Cow<'static, str>),
    #[error(ignore)]
    #[from(ignore)]
    Redis(anyhow::Error),
    Serde(serde_json::Error),
    #[error(ignore)]
    #[from(ignore)]
    SubscriptionChannelUnknown(Cow<'static, str>),
    Timeout(tokio::time::error::Elapsed),
    #[error(ignore)]
    #[from(ignore)]
    Unauthorized(Cow<'static, str>),
    WatchRecvError(tokio::sync::watch::error::RecvError),
    #[error(ignore)]
    #[from(ignore)]
    WithContext(Option<Box<DexProxyError>>, Cow<'static, str>),
}

/// REST error body (spec §6/§7): `{error_code, error_message}` for domain
/// errors, distinct from the JSON-RPC `{error: {code?, message}}` envelope
/// the WebSocket transport uses.
#[derive(Debug, Clone, Serialize)]
pub struct RestErrorBody {
    pub error_code: &'static str,
    pub error_message: Cow<'static, str>,
}

impl DexProxyError {
    /// Resolves this error to its REST `(status, error_code, error_message)`
    /// triple, logging at the level appropriate to the error's severity.
    pub fn as_rest_parts(&self) -> (StatusCode, &'static str, Cow<'static, str>) {
        match self {
            Self::Anyhow(err) => {
                error!(?err, "anyhow");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_SERVER_ERROR", "internal server error".into())
            }
            Self::Arc(err) => err.as_rest_parts(),
            Self::BadRequest(msg) => {
                trace!(%msg, "bad request");
                (StatusCode::BAD_REQUEST, "INVALID_REQUEST", msg.clone())
            }
            Self::BadResponse(msg) => {
                warn!(%msg, "bad response from adapter");
                (StatusCode::BAD_GATEWAY, "TRANSPORT_FAILURE", format!("bad response from venue: {msg}").into())
            }
            Self::Decimal(err) => {
                debug!(?err, "decimal parse error");
                (StatusCode::BAD_REQUEST, "INVALID_REQUEST", format!("invalid decimal: {err}").into())
            }
            Self::FlumeRecv(err) => {
                error!(?err, "flume recv error");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_SERVER_ERROR", "internal channel closed".into())
            }
            Self::DuplicateClientRequestId(id) => {
                trace!(%id, "duplicate client_request_id");
                (StatusCode::BAD_REQUEST, "DUPLICATE_REQUEST", format!("client_request_id {id} is already known").into())
            }
            Self::GasBumpTooSmall {
                previous_wei,
                requested_wei,
            } => {
                trace!(%previous_wei, %requested_wei, "gas bump rejected");
                (
                    StatusCode::BAD_REQUEST,
                    "GAS_BUMP_TOO_SMALL",
                    format!("gas_price_wei {requested_wei} does not exceed previous {previous_wei} by the required margin").into(),
                )
            }
            Self::GasCapExceeded { cap_wei, requested_wei } => {
                trace!(%cap_wei, %requested_wei, "gas cap exceeded");
                (
                    StatusCode::BAD_REQUEST,
                    "GAS_CAP_EXCEEDED",
                    format!("gas_price_wei {requested_wei} exceeds configured cap {cap_wei}").into(),
                )
            }
            Self::Io(err) => {
                error!(?err, "io error");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_SERVER_ERROR", "internal server error".into())
            }
            Self::JoinError(err) => {
                error!(?err, "task join error");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_SERVER_ERROR", "internal server error".into())
            }
            Self::JsonRpcErrorData(err) => (StatusCode::BAD_GATEWAY, "EXCHANGE_REJECTION", err.message.clone()),
            Self::NoAdapterForVenue(venue) => {
                debug!(%venue, "no adapter for venue");
                (StatusCode::BAD_REQUEST, "NO_ADAPTER_FOR_VENUE", format!("no adapter configured for venue {venue}").into())
            }
            Self::NonceExhausted(venue) => {
                warn!(%venue, "nonce pool exhausted");
                (StatusCode::SERVICE_UNAVAILABLE, "NONCE_EXHAUSTED", format!("no nonce available for {venue}").into())
            }
            Self::RequestAlreadyFinalised(id) => {
                trace!(%id, "request already finalised");
                (StatusCode::CONFLICT, "REQUEST_ALREADY_FINALISED", format!("request {id} is already finalised").into())
            }
            Self::RequestNotFound(id) => {
                trace!(%id, "request not found");
                (StatusCode::NOT_FOUND, "ORDER_NOT_FOUND", format!("request {id} not found").into())
            }
            Self::Redis(err) => {
                warn!(?err, "redis error");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_SERVER_ERROR", "internal server error".into())
            }
            Self::Serde(err) => {
                debug!(?err, "serde error");
                (StatusCode::BAD_REQUEST, "INVALID_REQUEST", format!("invalid json: {err}").into())
            }
            Self::SubscriptionChannelUnknown(channel) => {
                trace!(%channel, "unknown subscription channel");
                (StatusCode::BAD_REQUEST, "INVALID_REQUEST", format!("Channel {channel} does not exist").into())
            }
            Self::Timeout(err) => {
                warn!(?err, "adapter call timed out");
                (StatusCode::GATEWAY_TIMEOUT, "TRANSPORT_FAILURE", "venue call timed out".into())
            }
            Self::Unauthorized(msg) => {
                trace!(%msg, "unauthorized");
                (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", format!("unauthorized: {msg}").into())
            }
            Self::WatchRecvError(err) => {
                error!(?err, "watch recv error");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_SERVER_ERROR", "internal watch channel closed".into())
            }
            Self::WithContext(err, msg) => match err {
                Some(err) => {
                    warn!(?err, %msg, "error with context");
                    err.as_rest_parts()
                }
                None => {
                    warn!(%msg, "error with context");
                    (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_SERVER_ERROR", msg.clone())
                }
            },
        }
    }
}

impl From<tokio::time::error::Elapsed> for DexProxyError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::Timeout(err)
    }
}

impl IntoResponse for DexProxyError {
    #[inline]
    fn into_response(self) -> Response {
        let (status, error_code, error_message) = self.as_rest_parts();
        (status, Json(RestErrorBody { error_code, error_message })).into_response()
    }
}

pub trait DexProxyErrorContext<T> {
    fn dex_context<S: Into<Cow<'static, str>>>(self, msg: S) -> Result<T, DexProxyError>;
}

impl<T> DexProxyErrorContext<T> for Option<T> {
    fn dex_context<S: Into<Cow<'static, str>>>(self, msg: S) -> Result<T, DexProxyError> {
        self.ok_or(DexProxyError::WithContext(None, msg.into()))
    }
}

impl<T, E> DexProxyErrorContext<T> for Result<T, E>
where
    E: Into<DexProxyError>,
{
    fn dex_context<S: Into<Cow<'static, str>>>(self, msg: S) -> Result<T, DexProxyError> {
        self.map_err(|err| DexProxyError::WithContext(Some(Box::new(err.into())), msg.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        let err = DexProxyError::RequestNotFound("abc".into());
        let (status, error_code, _) = err.as_rest_parts();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(error_code, "ORDER_NOT_FOUND");
    }

    #[test]
    fn gas_bump_too_small_maps_to_400() {
        let err = DexProxyError::GasBumpTooSmall {
            previous_wei: 100,
            requested_wei: 101,
        };
        let (status, error_code, _) = err.as_rest_parts();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_code, "GAS_BUMP_TOO_SMALL");
    }

    #[test]
    fn context_unwraps_to_inner_response() {
        let inner = DexProxyError::RequestNotFound("abc".into());
        let wrapped = DexProxyError::WithContext(Some(Box::new(inner)), "while cancelling".into());
        let (status, _, _) = wrapped.as_rest_parts();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn duplicate_request_maps_to_400_and_already_known_message() {
        let err = DexProxyError::DuplicateClientRequestId("abc".into());
        let (status, error_code, message) = err.as_rest_parts();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error_code, "DUPLICATE_REQUEST");
        assert!(message.contains("already known"));
    }
}
