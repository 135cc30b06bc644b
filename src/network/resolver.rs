//! Host name resolution
//!
//! The connector resolves every [`Endpoint`] through a [`Resolver`] and then
//! tries only the first returned address.

use crate::error::NetworkError;
use crate::network::authority::Endpoint;
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::net::SocketAddr;

/// Asynchronous endpoint resolution
pub trait Resolver: Send + Sync + 'static {
    /// Resolve to an ordered list of candidate addresses
    fn resolve(&self, endpoint: &Endpoint) -> BoxFuture<'static, Result<Vec<SocketAddr>, NetworkError>>;
}

/// System resolver (DNS and literal addresses)
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsResolver;

impl Resolver for DnsResolver {
    fn resolve(&self, endpoint: &Endpoint) -> BoxFuture<'static, Result<Vec<SocketAddr>, NetworkError>> {
        let host = endpoint.host().to_string();
        let port = endpoint.port();

        async move {
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
                .await
                .map_err(|e| NetworkError::ResolveFailure(format!("{}: {}", host, e)))?
                .collect();

            if addrs.is_empty() {
                return Err(NetworkError::ResolveFailure(format!("{}: no addresses", host)));
            }

            Ok(addrs)
        }
        .boxed()
    }
}

/// Fixed endpoint table, for seeding and tests
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    table: HashMap<Endpoint, Vec<SocketAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `endpoint` to `addrs`, in order
    pub fn with(mut self, endpoint: impl Into<Endpoint>, addrs: Vec<SocketAddr>) -> Self {
        self.table.insert(endpoint.into(), addrs);
        self
    }
}

impl Resolver for StaticResolver {
    fn resolve(&self, endpoint: &Endpoint) -> BoxFuture<'static, Result<Vec<SocketAddr>, NetworkError>> {
        let result = match self.table.get(endpoint) {
            Some(addrs) if !addrs.is_empty() => Ok(addrs.clone()),
            _ => Err(NetworkError::ResolveFailure(format!("{}: unknown host", endpoint))),
        };
        futures::future::ready(result).boxed()
    }
}
