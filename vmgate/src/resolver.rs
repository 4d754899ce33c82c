use std::io;
use std::net::IpAddr;
use std::time::Duration;

use tracing::trace;

/// Name lookups needed by the proxy and the firewall engine.
#[async_trait::async_trait]
pub trait Resolver: Send + Sync {
    /// Forward lookup of a domain-name CONNECT target.
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>>;

    /// Best-effort PTR lookup. `None` on failure, timeout or no record.
    async fn reverse(&self, ip: IpAddr) -> Option<String>;
}

/// The host's resolver (`getaddrinfo` / `getnameinfo`), bounded by timeouts.
#[derive(Debug, Clone)]
pub struct SystemResolver {
    forward_timeout: Duration,
    reverse_timeout: Duration,
}

impl SystemResolver {
    pub fn new(forward_timeout: Duration, reverse_timeout: Duration) -> Self {
        Self {
            forward_timeout,
            reverse_timeout,
        }
    }
}

#[async_trait::async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>> {
        let lookup = tokio::net::lookup_host((host, port));
        let addrs = tokio::time::timeout(self.forward_timeout, lookup)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "name lookup timed out"))??;
        let ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
        if ips.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses for {}", host),
            ));
        }
        Ok(ips)
    }

    async fn reverse(&self, ip: IpAddr) -> Option<String> {
        let lookup = tokio::task::spawn_blocking(move || reverse_dns_lookup(&ip));
        match tokio::time::timeout(self.reverse_timeout, lookup).await {
            Ok(Ok(name)) => name,
            Ok(Err(e)) => {
                trace!(%ip, error = %e, "reverse lookup task failed");
                None
            }
            Err(_) => {
                trace!(%ip, "reverse lookup timed out");
                None
            }
        }
    }
}

/// PTR lookup through `getnameinfo(NI_NAMEREQD)`, which fails instead of
/// echoing the numeric address back when there is no record.
fn reverse_dns_lookup(ip: &IpAddr) -> Option<String> {
    let mut host_buf = [0u8; 1025]; // NI_MAXHOST

    // SAFETY: the sockaddr structs are fully initialized (zeroed, then the
    // family and address set) and the buffer pointer/length pair is valid.
    let ret = unsafe {
        match ip {
            IpAddr::V4(v4) => {
                let mut sa: libc::sockaddr_in = std::mem::zeroed();
                sa.sin_family = libc::AF_INET as libc::sa_family_t;
                sa.sin_addr.s_addr = u32::from_ne_bytes(v4.octets());
                libc::getnameinfo(
                    &sa as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    host_buf.as_mut_ptr() as *mut libc::c_char,
                    host_buf.len() as libc::socklen_t,
                    std::ptr::null_mut(),
                    0,
                    libc::NI_NAMEREQD,
                )
            }
            IpAddr::V6(v6) => {
                let mut sa: libc::sockaddr_in6 = std::mem::zeroed();
                sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sa.sin6_addr.s6_addr = v6.octets();
                libc::getnameinfo(
                    &sa as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                    host_buf.as_mut_ptr() as *mut libc::c_char,
                    host_buf.len() as libc::socklen_t,
                    std::ptr::null_mut(),
                    0,
                    libc::NI_NAMEREQD,
                )
            }
        }
    };
    if ret != 0 {
        return None;
    }

    let end = host_buf.iter().position(|&b| b == 0).unwrap_or(host_buf.len());
    let name = std::str::from_utf8(&host_buf[..end]).ok()?;
    if name.is_empty() || name.parse::<IpAddr>().is_ok() {
        return None;
    }
    Some(name.to_string())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Table-driven resolver. Unknown names fail with `NotFound`; unknown
    /// addresses have no PTR record.
    #[derive(Default)]
    pub struct StaticResolver {
        pub forward: HashMap<String, Vec<IpAddr>>,
        pub reverse: HashMap<IpAddr, String>,
        pub reverse_calls: AtomicUsize,
    }

    impl StaticResolver {
        pub fn with_forward(mut self, host: &str, ip: &str) -> Self {
            self.forward
                .entry(host.to_string())
                .or_default()
                .push(ip.parse().unwrap());
            self
        }

        pub fn with_reverse(mut self, ip: &str, host: &str) -> Self {
            self.reverse.insert(ip.parse().unwrap(), host.to_string());
            self
        }

        pub fn reverse_calls(&self) -> usize {
            self.reverse_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Resolver for StaticResolver {
        async fn resolve(&self, host: &str, _port: u16) -> io::Result<Vec<IpAddr>> {
            self.forward
                .get(host)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, host.to_string()))
        }

        async fn reverse(&self, ip: IpAddr) -> Option<String> {
            self.reverse_calls.fetch_add(1, Ordering::SeqCst);
            self.reverse.get(&ip).cloned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_literal_address() {
        let r = SystemResolver::new(Duration::from_secs(2), Duration::from_millis(200));
        let ips = r.resolve("127.0.0.1", 80).await.unwrap();
        assert_eq!(ips, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn reverse_of_documentation_address_is_none() {
        // 192.0.2.0/24 (TEST-NET-1) has no PTR records.
        let r = SystemResolver::new(Duration::from_secs(2), Duration::from_millis(500));
        assert_eq!(r.reverse("192.0.2.1".parse().unwrap()).await, None);
    }
}
