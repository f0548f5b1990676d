//! Extraction protocol/host/port depuis un lien d'abonnement proxy.
//!
//! Formats reconnus : `scheme://[userinfo@]host:port[/path][?query][#fragment]`
//! (trojan, vless, socks, http(s), hysteria2, tuic), `ss://` en clair ou base64,
//! et `vmess://` dont le corps est un JSON base64 (`add` / `port`).

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEndpoint {
    pub protocol: String,
    pub host: String,
    pub port: u16,
}

pub fn extract(link: &str) -> Option<LinkEndpoint> {
    let (scheme, rest) = link.trim().split_once("://")?;
    let protocol = scheme.to_ascii_lowercase();

    let (host, port) = match protocol.as_str() {
        "vmess" => vmess_endpoint(rest)?,
        "ss" => shadowsocks_endpoint(rest)?,
        "trojan" | "vless" | "socks" | "socks5" | "http" | "https" | "hysteria2" | "hy2"
        | "tuic" => host_port(authority(rest))?,
        _ => return None,
    };

    Some(LinkEndpoint { protocol, host, port })
}

/// Partie `[userinfo@]host:port` débarrassée du userinfo.
fn authority(rest: &str) -> &str {
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let auth = &rest[..end];
    match auth.rfind('@') {
        Some(at) => &auth[at + 1..],
        None => auth,
    }
}

fn host_port(authority: &str) -> Option<(String, u16)> {
    let (host, port) = if let Some(stripped) = authority.strip_prefix('[') {
        let (host, tail) = stripped.split_once(']')?;
        (host, tail.strip_prefix(':')?)
    } else {
        authority.rsplit_once(':')?
    };

    let host = host.trim().to_ascii_lowercase();
    let port = port.trim().parse::<u16>().ok().filter(|p| *p > 0)?;
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}

fn vmess_endpoint(rest: &str) -> Option<(String, u16)> {
    let body = rest.split(['?', '#']).next().unwrap_or_default();
    let decoded = decode_base64(body)?;
    let json: Value = serde_json::from_slice(&decoded).ok()?;

    let host = json.get("add")?.as_str()?.trim().to_ascii_lowercase();
    let port = match json.get("port")? {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    let port = u16::try_from(port).ok().filter(|p| *p > 0)?;
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}

fn shadowsocks_endpoint(rest: &str) -> Option<(String, u16)> {
    let body = rest.split(['?', '#']).next().unwrap_or_default();
    if body.contains('@') {
        return host_port(authority(body));
    }
    // Forme legacy : base64("method:password@host:port")
    let decoded = String::from_utf8(decode_base64(body.trim_end_matches('/'))?).ok()?;
    host_port(authority(&decoded))
}

fn decode_base64(input: &str) -> Option<Vec<u8>> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    [STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(cleaned.as_bytes()).ok())
}
