use async_trait::async_trait;
use std::sync::Arc;
use trust_dns_resolver::{TokioAsyncResolver, error::ResolveError};

use crate::error::VerifyError;

/// A mail exchanger as delivered by the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    pub preference: u16,
    /// Exchange name as returned by DNS, usually with a trailing dot.
    pub exchange: String,
}

impl MxRecord {
    pub fn new(preference: u16, exchange: impl Into<String>) -> Self {
        Self {
            preference,
            exchange: exchange.into(),
        }
    }

    /// Connection target: the exchange with one trailing `.` removed.
    pub fn hostname(&self) -> &str {
        self.exchange.strip_suffix('.').unwrap_or(&self.exchange)
    }
}

/// Resolver trait for real or mock DNS
#[async_trait]
pub trait ResolverTrait {
    /// MX records for `domain`, most preferred first.
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<MxRecord>, ResolveError>;
}

/// DNS resolver wrapper
#[derive(Clone)]
pub struct DnsResolver {
    inner: Arc<TokioAsyncResolver>,
}

impl DnsResolver {
    /// Builds a resolver from the host's system configuration.
    pub fn new() -> anyhow::Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
        Ok(Self {
            inner: Arc::new(resolver),
        })
    }
}

#[async_trait]
impl ResolverTrait for DnsResolver {
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<MxRecord>, ResolveError> {
        let ascii_domain = idna::domain_to_ascii(domain).unwrap_or_else(|_| domain.to_string());
        let lookup = self.inner.mx_lookup(ascii_domain).await?;
        let mut records: Vec<MxRecord> = lookup
            .iter()
            .map(|mx| MxRecord::new(mx.preference(), mx.exchange().to_utf8()))
            .collect();
        // trust-dns hands back wire order; callers rely on preference order.
        records.sort_by_key(|r| r.preference);
        Ok(records)
    }
}

/// Resolve the exchangers for `domain`. An empty answer is fatal.
pub async fn resolve_mx_hosts<R: ResolverTrait + Sync + Send>(
    resolver: &R,
    domain: &str,
) -> Result<Vec<MxRecord>, VerifyError> {
    let records = resolver
        .resolve_mx(domain)
        .await
        .map_err(|e| VerifyError::resolution(domain, e))?;
    if records.is_empty() {
        return Err(VerifyError::ResolutionFailure {
            domain: domain.to_string(),
            cause: "no MX records returned".to_string(),
        });
    }
    log::debug!("{} MX records for {}", records.len(), domain);
    Ok(records)
}
