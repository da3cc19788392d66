//! DNS utilities for outbound mail routing.

use crate::error::Result;
use tracing::{debug, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

/// Resolve the mail exchangers for a domain, lowest preference first.
///
/// Returns bare hostnames; the delivery pipeline decides which submission
/// ports to try against each exchanger. When no MX record exists the domain
/// itself is returned as the only candidate (implicit MX).
pub async fn lookup_mx(domain: &str) -> Result<Vec<String>> {
    debug!("Looking up MX records for {}", domain);

    let resolver =
        TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());

    let mx_lookup = match resolver.mx_lookup(domain).await {
        Ok(lookup) => lookup,
        Err(e) => {
            warn!("MX lookup failed for {}: {}", domain, e);
            return Ok(vec![domain.to_string()]);
        }
    };

    let mut mx_records: Vec<(u16, String)> = mx_lookup
        .iter()
        .map(|mx| {
            let exchange = mx.exchange().to_string().trim_end_matches('.').to_string();
            (mx.preference(), exchange)
        })
        .collect();

    mx_records.sort_by_key(|(preference, _)| *preference);

    debug!("Found {} MX records for {}", mx_records.len(), domain);

    let servers: Vec<String> = mx_records.into_iter().map(|(_, host)| host).collect();

    if servers.is_empty() {
        warn!("No MX records found for {}, using implicit MX", domain);
        return Ok(vec![domain.to_string()]);
    }

    Ok(servers)
}
