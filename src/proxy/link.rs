//! Parsing of proxy share links.
//!
//! Supported forms:
//! - `http://`, `https://`, `socks4://`, `socks5://` with optional `user:pass@`
//! - bare `host:port` (SOCKS5)
//! - `vless://uuid@host:port?type=ws&security=tls&sni=...#name`
//! - `trojan://password@host:port?...#name`
//! - `vmess://<base64 json>`
//! - `ss://<base64 method:password>@host:port#name` or `ss://<base64 all>#name`

use std::path::Path;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use serde_json::Value;
use tracing::warn;
use url::Url;

use super::record::{
    Credentials, ProxyProtocol, ProxyRecord, Security, Transport, V2RayProtocol, V2RaySettings,
};
use crate::{PipelineError, Result};

impl ProxyRecord {
    /// Parses a proxy share link.
    pub fn from_link(link: &str) -> Result<Self> {
        let link = clean_link(link)?;
        let (scheme, rest) = match link.split_once("://") {
            Some((scheme, rest)) => (scheme.to_lowercase(), rest.to_string()),
            None => return parse_standard(ProxyProtocol::Socks5, &link),
        };

        match scheme.as_str() {
            "http" => parse_standard(ProxyProtocol::Http, &rest),
            "https" => parse_standard(ProxyProtocol::Https, &rest),
            "socks4" => parse_standard(ProxyProtocol::Socks4, &rest),
            "socks5" | "socks" => parse_standard(ProxyProtocol::Socks5, &rest),
            "vless" => parse_url_style(V2RayProtocol::Vless, &link),
            "trojan" => parse_url_style(V2RayProtocol::Trojan, &link),
            "vmess" => parse_vmess(&rest),
            "ss" => parse_shadowsocks(&rest),
            other => Err(PipelineError::InvalidProxy(format!(
                "unsupported scheme: {}",
                other
            ))),
        }
    }
}

/// Parses every link in a text blob, one per line.
///
/// Blank lines and lines starting with `#` are ignored; lines that fail
/// to parse are logged and skipped.
pub fn parse_proxy_list(text: &str) -> Vec<ProxyRecord> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match ProxyRecord::from_link(line) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Skipping proxy line: {}", e);
                None
            }
        })
        .collect()
}

/// Reads and parses a proxy list file.
pub fn load_proxy_file(path: impl AsRef<Path>) -> Result<Vec<ProxyRecord>> {
    let text = std::fs::read_to_string(path)?;
    Ok(parse_proxy_list(&text))
}

/// Trims the link and turns a trailing space-separated comment into a
/// fragment for V2Ray links, or drops it for standard ones.
fn clean_link(raw: &str) -> Result<String> {
    let link = raw.trim();
    if link.is_empty() {
        return Err(PipelineError::InvalidProxy("empty proxy link".to_string()));
    }

    let Some(space) = link.find(char::is_whitespace) else {
        return Ok(link.to_string());
    };

    let is_v2ray = ["vless://", "vmess://", "ss://", "trojan://"]
        .iter()
        .any(|prefix| link.starts_with(prefix));
    let (main, comment) = link.split_at(space);

    if !is_v2ray {
        return Ok(main.to_string());
    }
    if main.contains('#') {
        // the space sits inside the fragment
        return Ok(link.to_string());
    }
    let comment = comment.trim().trim_start_matches(['#', ' ']).trim();
    if comment.is_empty() {
        Ok(main.to_string())
    } else {
        Ok(format!("{}#{}", main, urlencoding::encode(comment)))
    }
}

fn parse_standard(protocol: ProxyProtocol, rest: &str) -> Result<ProxyRecord> {
    let rest = rest.trim_end_matches('/');
    let (auth, host_port) = match rest.rsplit_once('@') {
        Some((auth, host_port)) => (Some(auth), host_port),
        None => (None, rest),
    };
    let (host, port) = split_host_port(host_port)?;
    let mut record = ProxyRecord::standard(protocol, host, port)?;
    if let Some(auth) = auth {
        record.credentials = Some(match auth.split_once(':') {
            Some((user, pass)) => Credentials::new(unescape(user), unescape(pass)),
            None => Credentials {
                username: unescape(auth),
                password: None,
            },
        });
    }
    Ok(record)
}

fn unescape(value: &str) -> String {
    urlencoding::decode(value)
        .map(|v| v.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

fn split_host_port(value: &str) -> Result<(String, u16)> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| PipelineError::InvalidProxy(format!("missing port in '{}'", value)))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| PipelineError::InvalidProxy(format!("invalid port in '{}'", value)))?;
    Ok((host.trim_matches(['[', ']']).to_string(), port))
}

fn parse_url_style(protocol: V2RayProtocol, link: &str) -> Result<ProxyRecord> {
    let url = Url::parse(link)?;
    let host = url
        .host_str()
        .ok_or_else(|| PipelineError::InvalidProxy("missing host".to_string()))?;
    let port = url
        .port()
        .ok_or_else(|| PipelineError::InvalidProxy("missing port".to_string()))?;
    let secret = urlencoding::decode(url.username())
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| url.username().to_string());

    let mut settings = V2RaySettings::default();
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "type" => settings.transport = Transport::parse(&value),
            "security" => settings.security = Security::parse(&value),
            "sni" | "peer" => settings.sni = Some(value.into_owned()),
            "path" | "serviceName" => settings.path = Some(value.into_owned()),
            "encryption" => settings.encryption = Some(value.into_owned()),
            _ => {}
        }
    }

    let mut credentials = None;
    match protocol {
        V2RayProtocol::Trojan => {
            if secret.is_empty() {
                return Err(PipelineError::InvalidProxy(
                    "trojan link has no password".to_string(),
                ));
            }
            credentials = Some(Credentials {
                username: String::new(),
                password: Some(secret),
            });
        }
        _ => settings.uuid = Some(secret).filter(|s| !s.is_empty()),
    }

    let mut record = ProxyRecord::v2ray(protocol, host, port, settings)?;
    record.credentials = credentials;
    record.description = fragment(&url);
    Ok(record)
}

fn parse_vmess(body: &str) -> Result<ProxyRecord> {
    let body = body.split('#').next().unwrap_or_default();
    let decoded = decode_base64(body)?;
    let json: Value = serde_json::from_str(&decoded)?;

    let field = |name: &str| -> Option<String> {
        match json.get(name)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    };

    let host = field("add").ok_or_else(|| PipelineError::InvalidProxy("vmess: no address".into()))?;
    let port = field("port")
        .and_then(|p| p.parse::<u16>().ok())
        .ok_or_else(|| PipelineError::InvalidProxy("vmess: no port".into()))?;

    let settings = V2RaySettings {
        uuid: field("id"),
        encryption: field("scy").or_else(|| Some("auto".to_string())),
        transport: field("net").map(|n| Transport::parse(&n)).unwrap_or_default(),
        security: field("tls").map(|t| Security::parse(&t)).unwrap_or_default(),
        sni: field("sni"),
        path: field("path"),
        local_port: None,
    };

    let mut record = ProxyRecord::v2ray(V2RayProtocol::Vmess, host, port, settings)?;
    record.description = field("ps");
    Ok(record)
}

fn parse_shadowsocks(body: &str) -> Result<ProxyRecord> {
    let (body, name) = match body.split_once('#') {
        Some((body, name)) => (
            body,
            urlencoding::decode(name).ok().map(|n| n.into_owned()),
        ),
        None => (body, None),
    };
    let body = body.split('?').next().unwrap_or_default();

    // Either base64(method:password)@host:port or base64(method:password@host:port).
    let plain = match body.rsplit_once('@') {
        Some((userinfo, host_port)) => {
            let userinfo = match decode_base64(userinfo) {
                Ok(decoded) => decoded,
                Err(_) => urlencoding::decode(userinfo)
                    .map_err(|e| PipelineError::InvalidProxy(format!("ss userinfo: {}", e)))?
                    .into_owned(),
            };
            format!("{}@{}", userinfo, host_port.trim_end_matches('/'))
        }
        None => decode_base64(body)?,
    };

    let (userinfo, host_port) = plain
        .rsplit_once('@')
        .ok_or_else(|| PipelineError::InvalidProxy("ss: missing server".into()))?;
    let (method, password) = userinfo
        .split_once(':')
        .ok_or_else(|| PipelineError::InvalidProxy("ss: missing method".into()))?;
    let (host, port) = split_host_port(host_port)?;

    let settings = V2RaySettings::default().with_encryption(method);
    let mut record = ProxyRecord::v2ray(V2RayProtocol::Shadowsocks, host, port, settings)?;
    record.credentials = Some(Credentials {
        username: String::new(),
        password: Some(password.to_string()),
    });
    record.description = name.filter(|n| !n.is_empty());
    Ok(record)
}

fn fragment(url: &Url) -> Option<String> {
    url.fragment()
        .filter(|f| !f.is_empty())
        .map(|f| {
            urlencoding::decode(f)
                .map(|d| d.into_owned())
                .unwrap_or_else(|_| f.to_string())
        })
}

fn decode_base64(input: &str) -> Result<String> {
    let input = input.trim();
    let bytes = [STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(input).ok())
        .ok_or_else(|| PipelineError::InvalidProxy("invalid base64 payload".to_string()))?;
    String::from_utf8(bytes)
        .map_err(|_| PipelineError::InvalidProxy("payload is not UTF-8".to_string()))
}
