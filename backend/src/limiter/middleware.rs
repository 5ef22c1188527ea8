use actix_web::{
    Error, ResponseError,
    body::EitherBody,
    dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready},
};
use futures::future::{Ready, ok};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::window::{FixedWindowLimiter, RateLimit};
use crate::error::ApiError;

/// Key used when the peer address is unknown (e.g. unix sockets).
const UNKNOWN_CLIENT: &str = "unknown";

/// Applies a per-client-address request budget to the wrapped service.
/// Clones share the same counters.
#[derive(Clone)]
pub struct RateLimitMiddleware {
    limiter: Arc<FixedWindowLimiter>,
}

impl RateLimitMiddleware {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limiter: Arc::new(FixedWindowLimiter::new(limit)),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimitMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = RateLimitMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(RateLimitMiddlewareService {
            service: Arc::new(service),
            limiter: self.limiter.clone(),
        })
    }
}

pub struct RateLimitMiddlewareService<S> {
    service: Arc<S>,
    limiter: Arc<FixedWindowLimiter>,
}

fn client_key(req: &ServiceRequest) -> String {
    req.peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

impl<S, B> Service<ServiceRequest> for RateLimitMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let client = client_key(&req);
        let verdict = self.limiter.check(&client);

        Box::pin(async move {
            match verdict {
                Ok(()) => {
                    let res = service.call(req).await?;
                    Ok(res.map_into_left_body())
                }
                Err(limited) => {
                    log::warn!(
                        "Rate limit hit for {} on {}, retry in {}s",
                        client,
                        req.path(),
                        limited.retry_after_secs()
                    );
                    let (http_req, _payload) = req.into_parts();
                    let response = ApiError::RateLimited(limited)
                        .error_response()
                        .map_into_right_body();
                    Ok(ServiceResponse::new(http_req, response))
                }
            }
        })
    }
}
