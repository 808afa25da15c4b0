//! Request client port: issues stream requests and datagram probes.

use std::future::Future;

use devicepilot_domain::conditioning::{Request, Response, TimeoutPolicy};
use devicepilot_domain::error::ConditioningError;

pub trait RequestClient: Send + Sync {
    /// Issue `request` once, bounded by `timeouts`.
    fn issue(
        &self,
        request: &Request,
        timeouts: TimeoutPolicy,
    ) -> impl Future<Output = Result<Response, ConditioningError>> + Send;
}
