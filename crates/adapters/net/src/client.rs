//! HTTP and UDP request client.

use std::time::Duration;

use tokio::net::UdpSocket;

use devicepilot_app::ports::RequestClient;
use devicepilot_domain::conditioning::{Request, RequestMethod, Response, TimeoutPolicy};
use devicepilot_domain::error::ConditioningError;

use crate::error::NetError;

/// Issues conditioning requests over the host network stack.
///
/// The connect timeout is fixed when the client is built; the read timeout
/// is applied per request on top of it.
#[derive(Clone)]
pub struct NetRequestClient {
    http: reqwest::Client,
    connect_timeout: Duration,
}

impl NetRequestClient {
    /// Build a client whose connections give up after `connect_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Client`] if the TLS backend cannot be initialised.
    pub fn new(connect_timeout: Duration) -> Result<Self, NetError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("devicepilot/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(NetError::Client)?;
        Ok(Self {
            http,
            connect_timeout,
        })
    }

    async fn stream(
        &self,
        address: &str,
        method: RequestMethod,
        timeouts: TimeoutPolicy,
    ) -> Result<Response, NetError> {
        let budget = self.connect_timeout + timeouts.read;
        let response = self
            .http
            .request(http_method(method), address)
            .timeout(budget)
            .send()
            .await
            .map_err(|err| self.classify(err, timeouts))?;
        let status = response.status().as_u16();

        // A full fetch drains the body; HEAD and OPTIONS have none worth reading.
        if method == RequestMethod::Get {
            let body = response
                .bytes()
                .await
                .map_err(|err| self.classify(err, timeouts))?;
            tracing::trace!(%address, status, bytes = body.len(), "fetched");
        } else {
            tracing::trace!(%address, status, %method, "probed");
        }

        Ok(Response {
            status: Some(status),
        })
    }

    async fn datagram(
        &self,
        address: &str,
        payload: &[u8],
        timeouts: TimeoutPolicy,
    ) -> Result<Response, NetError> {
        let target = tokio::net::lookup_host(address)
            .await?
            .next()
            .ok_or_else(|| NetError::Unresolved(address.to_string()))?;
        let bind_addr = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await?;

        match tokio::time::timeout(timeouts.connect, socket.send_to(payload, target)).await {
            Ok(sent) => {
                let sent = sent?;
                tracing::trace!(%target, bytes = sent, "datagram sent");
                Ok(Response { status: None })
            }
            Err(_) => Err(NetError::ConnectTimeout(timeouts.connect)),
        }
    }

    fn classify(&self, err: reqwest::Error, timeouts: TimeoutPolicy) -> NetError {
        if err.is_timeout() {
            if err.is_connect() {
                NetError::ConnectTimeout(self.connect_timeout)
            } else {
                NetError::ReadTimeout(timeouts.read)
            }
        } else {
            NetError::Http(err)
        }
    }
}

impl RequestClient for NetRequestClient {
    async fn issue(
        &self,
        request: &Request,
        timeouts: TimeoutPolicy,
    ) -> Result<Response, ConditioningError> {
        let result = match request {
            Request::Stream { address, method } => self.stream(address, *method, timeouts).await,
            Request::Datagram { address, payload } => {
                self.datagram(address, payload, timeouts).await
            }
        };
        result.map_err(ConditioningError::from)
    }
}

fn http_method(method: RequestMethod) -> reqwest::Method {
    match method {
        RequestMethod::Head => reqwest::Method::HEAD,
        RequestMethod::Get => reqwest::Method::GET,
        RequestMethod::Options => reqwest::Method::OPTIONS,
    }
}
