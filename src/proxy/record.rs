//! Proxy records and their health metrics.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{PipelineError, Result};

/// Identifier of a proxy record.
pub type ProxyId = Uuid;

/// Protocol spoken by a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    /// HTTP proxy
    Http,
    /// HTTPS proxy
    Https,
    /// SOCKS4 proxy
    Socks4,
    /// SOCKS5 proxy
    #[default]
    Socks5,
    /// V2Ray VLESS
    Vless,
    /// V2Ray VMess
    Vmess,
    /// Shadowsocks
    Shadowsocks,
    /// Trojan
    Trojan,
}

impl ProxyProtocol {
    /// Returns whether the protocol belongs to the V2Ray family.
    pub fn is_v2ray(self) -> bool {
        matches!(
            self,
            Self::Vless | Self::Vmess | Self::Shadowsocks | Self::Trojan
        )
    }

    /// Returns the URL scheme of the protocol.
    pub fn scheme(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Socks4 => "socks4",
            Self::Socks5 => "socks5",
            Self::Vless => "vless",
            Self::Vmess => "vmess",
            Self::Shadowsocks => "ss",
            Self::Trojan => "trojan",
        }
    }
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// Health status of a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyStatus {
    /// Never used since it was added or since its last ban expired.
    #[default]
    Untested,
    /// Working normally.
    Healthy,
    /// Failing often; still eligible but scored lower.
    Degraded,
    /// Excluded from selection until the ban window elapses.
    BannedTemp,
}

impl ProxyStatus {
    /// Returns whether proxies in this status may be selected.
    pub fn is_eligible(self) -> bool {
        !matches!(self, Self::BannedTemp)
    }
}

/// Username/password pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Some(password.into()),
        }
    }
}

/// V2Ray transport kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tcp,
    Ws,
    Grpc,
    Http,
    Quic,
}

impl Transport {
    /// Parses a transport name, falling back to TCP for unknown values.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "ws" | "websocket" => Self::Ws,
            "grpc" => Self::Grpc,
            "http" | "h2" => Self::Http,
            "quic" => Self::Quic,
            _ => Self::Tcp,
        }
    }
}

/// V2Ray security layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    #[default]
    None,
    Tls,
    Reality,
}

impl Security {
    /// Parses a security name, falling back to none for unknown values.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "tls" | "xtls" => Self::Tls,
            "reality" => Self::Reality,
            _ => Self::None,
        }
    }
}

/// Connection parameters shared by the V2Ray-family protocols.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct V2RaySettings {
    /// User id for VLESS/VMess.
    pub uuid: Option<String>,
    /// Cipher or encryption method.
    pub encryption: Option<String>,
    pub transport: Transport,
    pub security: Security,
    /// Server name indication for TLS.
    pub sni: Option<String>,
    /// WebSocket path or gRPC service name.
    pub path: Option<String>,
    /// Local port of the multiplexing client that tunnels this proxy.
    pub local_port: Option<u16>,
}

impl V2RaySettings {
    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    pub fn with_encryption(mut self, encryption: impl Into<String>) -> Self {
        self.encryption = Some(encryption.into());
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }

    pub fn with_sni(mut self, sni: impl Into<String>) -> Self {
        self.sni = Some(sni.into());
        self
    }

    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }
}

/// Protocol of a plain proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StandardProtocol {
    Http,
    Https,
    Socks4,
    Socks5,
}

impl From<StandardProtocol> for ProxyProtocol {
    fn from(protocol: StandardProtocol) -> Self {
        match protocol {
            StandardProtocol::Http => Self::Http,
            StandardProtocol::Https => Self::Https,
            StandardProtocol::Socks4 => Self::Socks4,
            StandardProtocol::Socks5 => Self::Socks5,
        }
    }
}

impl TryFrom<ProxyProtocol> for StandardProtocol {
    type Error = PipelineError;

    fn try_from(protocol: ProxyProtocol) -> Result<Self> {
        match protocol {
            ProxyProtocol::Http => Ok(Self::Http),
            ProxyProtocol::Https => Ok(Self::Https),
            ProxyProtocol::Socks4 => Ok(Self::Socks4),
            ProxyProtocol::Socks5 => Ok(Self::Socks5),
            other => Err(PipelineError::InvalidProxy(format!(
                "{} requires V2Ray settings",
                other
            ))),
        }
    }
}

/// V2Ray-family protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum V2RayProtocol {
    Vless,
    Vmess,
    Shadowsocks,
    Trojan,
}

impl From<V2RayProtocol> for ProxyProtocol {
    fn from(protocol: V2RayProtocol) -> Self {
        match protocol {
            V2RayProtocol::Vless => Self::Vless,
            V2RayProtocol::Vmess => Self::Vmess,
            V2RayProtocol::Shadowsocks => Self::Shadowsocks,
            V2RayProtocol::Trojan => Self::Trojan,
        }
    }
}

/// Protocol-specific parameters. V2Ray settings exist only on V2Ray variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "lowercase")]
pub enum ProtocolParams {
    /// Plain HTTP(S)/SOCKS proxy.
    Standard { protocol: StandardProtocol },
    /// Proxy reached through a local V2Ray client.
    V2Ray {
        protocol: V2RayProtocol,
        settings: V2RaySettings,
    },
}

impl ProtocolParams {
    pub fn protocol(&self) -> ProxyProtocol {
        match self {
            Self::Standard { protocol } => (*protocol).into(),
            Self::V2Ray { protocol, .. } => (*protocol).into(),
        }
    }

    pub fn v2ray_settings(&self) -> Option<&V2RaySettings> {
        match self {
            Self::Standard { .. } => None,
            Self::V2Ray { settings, .. } => Some(settings),
        }
    }
}

/// Live health metrics of a proxy. Only the pool mutates these.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProxyHealth {
    pub status: ProxyStatus,
    pub last_tested_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Total successful attempts.
    pub success_count: u64,
    /// Total failed attempts.
    pub failure_count: u64,
    /// Moving average of successful response times.
    pub avg_response_time_ms: Option<u64>,
    /// Decayed success counter used for scoring.
    pub recent_successes: f64,
    /// Decayed failure counter used for scoring.
    pub recent_failures: f64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// End of the current temporary ban.
    pub banned_until: Option<DateTime<Utc>>,
}

/// A network egress point.
///
/// Deserialization validates the protocol parameters like the constructors
/// do and always starts from fresh health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoredProxy")]
pub struct ProxyRecord {
    pub id: ProxyId,
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
    params: ProtocolParams,
    pub description: Option<String>,
    health: ProxyHealth,
}

/// Serialized form of a record as accepted on input. Health is ignored.
#[derive(Deserialize)]
struct StoredProxy {
    id: ProxyId,
    host: String,
    port: u16,
    #[serde(default)]
    credentials: Option<Credentials>,
    params: ProtocolParams,
    #[serde(default)]
    description: Option<String>,
}

impl TryFrom<StoredProxy> for ProxyRecord {
    type Error = PipelineError;

    fn try_from(stored: StoredProxy) -> Result<Self> {
        let mut record = match stored.params {
            ProtocolParams::Standard { protocol } => {
                Self::standard(protocol.into(), stored.host, stored.port)?
            }
            ProtocolParams::V2Ray { protocol, settings } => {
                Self::v2ray(protocol, stored.host, stored.port, settings)?
            }
        };
        record.id = stored.id;
        record.credentials = stored.credentials;
        record.description = stored.description;
        Ok(record)
    }
}

impl ProxyRecord {
    /// Creates a plain HTTP(S)/SOCKS proxy.
    ///
    /// Fails when `protocol` belongs to the V2Ray family, which needs
    /// [`ProxyRecord::v2ray`].
    pub fn standard(protocol: ProxyProtocol, host: impl Into<String>, port: u16) -> Result<Self> {
        let protocol = StandardProtocol::try_from(protocol)?;
        Self::build(host.into(), port, ProtocolParams::Standard { protocol })
    }

    /// Creates a V2Ray-family proxy, validating the settings it requires.
    pub fn v2ray(
        protocol: V2RayProtocol,
        host: impl Into<String>,
        port: u16,
        settings: V2RaySettings,
    ) -> Result<Self> {
        match protocol {
            V2RayProtocol::Vless | V2RayProtocol::Vmess if settings.uuid.is_none() => {
                return Err(PipelineError::InvalidProxy(format!(
                    "{} requires a uuid",
                    ProxyProtocol::from(protocol)
                )));
            }
            V2RayProtocol::Shadowsocks if settings.encryption.is_none() => {
                return Err(PipelineError::InvalidProxy(
                    "shadowsocks requires an encryption method".to_string(),
                ));
            }
            _ => {}
        }
        Self::build(host.into(), port, ProtocolParams::V2Ray { protocol, settings })
    }

    fn build(host: String, port: u16, params: ProtocolParams) -> Result<Self> {
        if host.trim().is_empty() {
            return Err(PipelineError::InvalidProxy("host is empty".to_string()));
        }
        if port == 0 {
            return Err(PipelineError::InvalidProxy("port is zero".to_string()));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            host: host.trim().to_string(),
            port,
            credentials: None,
            params,
            description: None,
            health: ProxyHealth::default(),
        })
    }

    /// Sets authentication credentials.
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials::new(username, password));
        self
    }

    /// Sets a display description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Overrides the generated id.
    pub fn with_id(mut self, id: ProxyId) -> Self {
        self.id = id;
        self
    }

    pub fn protocol(&self) -> ProxyProtocol {
        self.params.protocol()
    }

    pub fn params(&self) -> &ProtocolParams {
        &self.params
    }

    /// V2Ray settings, present exactly for V2Ray-family records.
    pub fn v2ray_settings(&self) -> Option<&V2RaySettings> {
        self.params.v2ray_settings()
    }

    pub fn is_v2ray(&self) -> bool {
        self.protocol().is_v2ray()
    }

    /// Returns the health metrics as last recorded by the pool.
    pub fn health(&self) -> &ProxyHealth {
        &self.health
    }

    pub(crate) fn health_mut(&mut self) -> &mut ProxyHealth {
        &mut self.health
    }

    /// Returns the URL traffic is sent to.
    ///
    /// V2Ray-family proxies are reached through the local SOCKS5 port of
    /// their client, which must already be assigned.
    pub fn egress_url(&self) -> Result<String> {
        if let ProtocolParams::V2Ray { settings, .. } = &self.params {
            let port = settings.local_port.ok_or_else(|| {
                PipelineError::InvalidProxy(format!(
                    "{} has no local port assigned",
                    self.display_name()
                ))
            })?;
            return Ok(format!("socks5://127.0.0.1:{}", port));
        }

        let scheme = self.protocol().scheme();
        match &self.credentials {
            Some(Credentials {
                username,
                password: Some(password),
            }) if !username.is_empty() => Ok(format!(
                "{}://{}:{}@{}:{}",
                scheme,
                urlencoding::encode(username),
                urlencoding::encode(password),
                self.host,
                self.port
            )),
            Some(Credentials { username, .. }) if !username.is_empty() => Ok(format!(
                "{}://{}@{}:{}",
                scheme,
                urlencoding::encode(username),
                self.host,
                self.port
            )),
            _ => Ok(format!("{}://{}:{}", scheme, self.host, self.port)),
        }
    }

    /// Returns a log-friendly name that never contains credentials.
    pub fn display_name(&self) -> String {
        match &self.description {
            Some(d) if !d.is_empty() => {
                format!("{} {}:{} ({})", self.protocol(), self.host, self.port, d)
            }
            _ => format!("{} {}:{}", self.protocol(), self.host, self.port),
        }
    }

    /// Returns the observability view of this proxy.
    pub fn snapshot(&self) -> ProxyHealthSnapshot {
        ProxyHealthSnapshot {
            id: self.id,
            status: self.health.status,
            success_count: self.health.success_count,
            failure_count: self.health.failure_count,
            avg_response_time_ms: self.health.avg_response_time_ms,
            last_tested_at: self.health.last_tested_at,
            last_used_at: self.health.last_used_at,
        }
    }
}

/// Inbound admin definition of a proxy. Health is not settable here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub protocol: ProxyProtocol,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Required iff the protocol is in the V2Ray family.
    #[serde(default)]
    pub v2ray: Option<V2RaySettings>,
}

impl TryFrom<ProxyRequest> for ProxyRecord {
    type Error = PipelineError;

    fn try_from(request: ProxyRequest) -> Result<Self> {
        let mut record = match (request.protocol, request.v2ray) {
            (ProxyProtocol::Vless, Some(s)) => {
                Self::v2ray(V2RayProtocol::Vless, request.host, request.port, s)?
            }
            (ProxyProtocol::Vmess, Some(s)) => {
                Self::v2ray(V2RayProtocol::Vmess, request.host, request.port, s)?
            }
            (ProxyProtocol::Shadowsocks, Some(s)) => {
                Self::v2ray(V2RayProtocol::Shadowsocks, request.host, request.port, s)?
            }
            (ProxyProtocol::Trojan, Some(s)) => {
                Self::v2ray(V2RayProtocol::Trojan, request.host, request.port, s)?
            }
            (protocol, None) => Self::standard(protocol, request.host, request.port)?,
            (protocol, Some(_)) => {
                return Err(PipelineError::InvalidProxy(format!(
                    "{} does not take V2Ray settings",
                    protocol
                )));
            }
        };
        if let Some(username) = request.username {
            record.credentials = Some(Credentials {
                username,
                password: request.password,
            });
        } else if let Some(password) = request.password {
            record.credentials = Some(Credentials {
                username: String::new(),
                password: Some(password),
            });
        }
        if record.protocol() == ProxyProtocol::Trojan
            && record
                .credentials
                .as_ref()
                .and_then(|c| c.password.as_ref())
                .is_none()
        {
            return Err(PipelineError::InvalidProxy(
                "trojan requires a password".to_string(),
            ));
        }
        record.description = request.description;
        Ok(record)
    }
}

/// Read-only health view exposed for observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyHealthSnapshot {
    pub id: ProxyId,
    pub status: ProxyStatus,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_response_time_ms: Option<u64>,
    pub last_tested_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}
