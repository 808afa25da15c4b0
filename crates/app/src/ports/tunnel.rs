//! Tunnel transport port: the narrow capability to open and close a tunnel.
//!
//! Platform resolver-override mechanisms live behind this trait. A host
//! without one reports [`TunnelError::Unavailable`]; there is no fallback.

use std::future::Future;

use devicepilot_domain::error::TunnelError;
use devicepilot_domain::tunnel::{TunnelConfig, TunnelHandle};

pub trait TunnelTransport: Send + Sync {
    /// Open a tunnel applying `config`.
    fn open(
        &self,
        config: &TunnelConfig,
    ) -> impl Future<Output = Result<TunnelHandle, TunnelError>> + Send;

    /// Close a previously opened tunnel.
    fn close(&self, handle: &TunnelHandle) -> impl Future<Output = Result<(), TunnelError>> + Send;
}

impl<T: TunnelTransport> TunnelTransport for std::sync::Arc<T> {
    fn open(
        &self,
        config: &TunnelConfig,
    ) -> impl Future<Output = Result<TunnelHandle, TunnelError>> + Send {
        (**self).open(config)
    }

    fn close(&self, handle: &TunnelHandle) -> impl Future<Output = Result<(), TunnelError>> + Send {
        (**self).close(handle)
    }
}
