use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use libp2p::multiaddr::{Multiaddr, Protocol};
use maxminddb::geoip2;
use tracing::warn;

const CITY_DB_FILE: &str = "GeoLite2-City.mmdb";
const ASN_DB_FILE: &str = "GeoLite2-ASN.mmdb";

/// Location and network attributes of one IP address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaddrInfo {
    pub country: String,
    pub continent: String,
    pub asn: u32,
}

/// GeoIP resolver backed by the MaxMind GeoLite2 databases.
///
/// Missing database files degrade lookups to empty attributes instead of
/// failing the probe; address collection still works without them.
#[derive(Default)]
pub struct GeoClient {
    city: Option<maxminddb::Reader<Vec<u8>>>,
    asn: Option<maxminddb::Reader<Vec<u8>>>,
}

impl std::fmt::Debug for GeoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoClient")
            .field("city", &self.city.is_some())
            .field("asn", &self.asn.is_some())
            .finish()
    }
}

impl GeoClient {
    /// Loads `GeoLite2-City.mmdb` and `GeoLite2-ASN.mmdb` from the given
    /// directory.
    pub fn open(dir: &Path) -> Self {
        let city = open_reader(&dir.join(CITY_DB_FILE));
        let asn = open_reader(&dir.join(ASN_DB_FILE));
        GeoClient { city, asn }
    }

    /// A resolver without databases; every IP maps to empty attributes.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Resolves a multiaddr to the attributes of each IP address it points
    /// at. DNS multiaddrs can resolve to several addresses.
    pub async fn maddr_info(&self, maddr: &Multiaddr) -> Result<HashMap<String, MaddrInfo>> {
        let ips = resolve_addrs(maddr).await?;

        let mut infos = HashMap::with_capacity(ips.len());
        for ip in ips {
            infos.insert(ip.to_string(), self.lookup(ip));
        }
        Ok(infos)
    }

    fn lookup(&self, ip: IpAddr) -> MaddrInfo {
        let mut info = MaddrInfo::default();

        if let Some(reader) = &self.city {
            if let Ok(city) = reader.lookup::<geoip2::City>(ip) {
                info.country = city
                    .country
                    .and_then(|c| c.iso_code)
                    .unwrap_or_default()
                    .to_string();
                info.continent = city
                    .continent
                    .and_then(|c| c.code)
                    .unwrap_or_default()
                    .to_string();
            }
        }
        if let Some(reader) = &self.asn {
            if let Ok(asn) = reader.lookup::<geoip2::Asn>(ip) {
                info.asn = asn.autonomous_system_number.unwrap_or_default();
            }
        }

        info
    }
}

fn open_reader(path: &Path) -> Option<maxminddb::Reader<Vec<u8>>> {
    match maxminddb::Reader::open_readfile(path) {
        Ok(reader) => Some(reader),
        Err(err) => {
            warn!(path = %path.display(), "geo database unavailable: {err}");
            None
        }
    }
}

/// The IP addresses a multiaddr points at, resolving DNS components.
async fn resolve_addrs(maddr: &Multiaddr) -> Result<Vec<IpAddr>> {
    match maddr.iter().next() {
        Some(Protocol::Ip4(addr)) => Ok(vec![IpAddr::V4(addr)]),
        Some(Protocol::Ip6(addr)) => Ok(vec![IpAddr::V6(addr)]),
        Some(
            Protocol::Dns(host)
            | Protocol::Dns4(host)
            | Protocol::Dns6(host)
            | Protocol::Dnsaddr(host),
        ) => {
            let addrs = tokio::net::lookup_host((host.as_ref(), 0u16))
                .await
                .with_context(|| format!("resolve {host}"))?
                .map(|sock| sock.ip())
                .collect();
            Ok(addrs)
        }
        other => anyhow::bail!("multiaddr starts with no address component: {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ip_maddrs_resolve_without_databases() {
        let geo = GeoClient::empty();
        let maddr: Multiaddr = "/ip4/1.2.3.4/tcp/4001".parse().unwrap();

        let infos = geo.maddr_info(&maddr).await.unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos["1.2.3.4"], MaddrInfo::default());
    }

    #[tokio::test]
    async fn non_ip_maddrs_are_rejected() {
        let geo = GeoClient::empty();
        let maddr: Multiaddr = "/p2p-circuit".parse().unwrap();
        assert!(geo.maddr_info(&maddr).await.is_err());
    }
}
