//! Connectivity probe for the configured remote.
//!
//! A single TCP connect with a short timeout; the caller decides whether and
//! when to retry. Remotes without a TCP endpoint (local paths, `file://`)
//! count as online.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::debug;
use regex::Regex;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub fn online(remote_url: &str) -> bool {
    match probe_endpoint(remote_url) {
        Some((host, port)) => {
            let reachable = can_connect(&host, port, PROBE_TIMEOUT);
            debug!("probe {host}:{port} -> {}", if reachable { "online" } else { "offline" });
            reachable
        }
        None => true,
    }
}

/// Derives the `(host, port)` to probe from a git remote URL.
/// Returns `None` for remotes that have no network endpoint.
pub(crate) fn probe_endpoint(remote_url: &str) -> Option<(String, u16)> {
    let url = remote_url.trim();
    if url.is_empty() || url.starts_with("file://") {
        return None;
    }
    if let Some(rest) = url.strip_prefix("ssh://") {
        return split_host_port(rest, 22);
    }
    if let Some(rest) = url.strip_prefix("git://") {
        return split_host_port(rest, 9418);
    }
    if let Some(rest) = url.strip_prefix("https://") {
        return split_host_port(rest, 443);
    }
    if let Some(rest) = url.strip_prefix("http://") {
        return split_host_port(rest, 80);
    }

    // scp-style SSH: git@github.com:user/repo.git
    let scp = Regex::new(r"^(?:[A-Za-z0-9_.-]+@)?([A-Za-z0-9_.-]+):").ok()?;
    let captures = scp.captures(url)?;
    let host = captures.get(1)?.as_str();
    // A single letter followed by a path separator is a Windows drive path.
    if host.len() == 1 {
        return None;
    }
    Some((host.to_owned(), 22))
}

fn split_host_port(rest: &str, default_port: u16) -> Option<(String, u16)> {
    let authority = rest.split(['/', '?']).next()?;
    let authority = authority.rsplit('@').next()?;
    if authority.is_empty() {
        return None;
    }
    match authority.split_once(':') {
        Some((host, port)) => Some((host.to_owned(), port.parse().ok()?)),
        None => Some((authority.to_owned(), default_port)),
    }
}

fn can_connect(host: &str, port: u16, timeout: Duration) -> bool {
    let Ok(addrs) = (host, port).to_socket_addrs() else {
        return false;
    };
    for addr in addrs {
        if TcpStream::connect_timeout(&addr, timeout).is_ok() {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_probe_endpoint_scp_style() {
        assert_eq!(
            probe_endpoint("git@github.com:user/vault.git"),
            Some(("github.com".to_string(), 22))
        );
    }

    #[test]
    fn test_probe_endpoint_url_styles() {
        assert_eq!(
            probe_endpoint("ssh://git@github.com/user/vault.git"),
            Some(("github.com".to_string(), 22))
        );
        assert_eq!(
            probe_endpoint("ssh://git@example.com:2222/vault.git"),
            Some(("example.com".to_string(), 2222))
        );
        assert_eq!(
            probe_endpoint("https://github.com/user/vault.git"),
            Some(("github.com".to_string(), 443))
        );
        assert_eq!(
            probe_endpoint("git://example.com/vault.git"),
            Some(("example.com".to_string(), 9418))
        );
    }

    #[test]
    fn test_probe_endpoint_local_remotes() {
        assert_eq!(probe_endpoint("/srv/git/vault.git"), None);
        assert_eq!(probe_endpoint("file:///srv/git/vault.git"), None);
        assert_eq!(probe_endpoint(r"C:\vaults\notes"), None);
        assert_eq!(probe_endpoint(""), None);
    }

    #[test]
    fn test_online_for_local_path() {
        assert!(online("/srv/git/vault.git"));
    }

    #[test]
    fn test_online_against_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(online(&format!("ssh://127.0.0.1:{port}/vault.git")));
    }

    #[test]
    fn test_offline_against_closed_port() {
        // Port 1 is reserved and virtually never listening.
        assert!(!online("ssh://127.0.0.1:1/vault.git"));
    }
}
