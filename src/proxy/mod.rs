//! Proxy records, share-link parsing and the health-aware pool.

mod checker;
mod link;
mod pool;
mod record;

pub use checker::{ProxyCheck, ProxyChecker};
pub use link::{load_proxy_file, parse_proxy_list};
pub use pool::{FileProxySource, ProxyPool, ProxySource, StaticProxySource};
pub use record::{
    Credentials, ProtocolParams, ProxyHealth, ProxyHealthSnapshot, ProxyId, ProxyProtocol,
    ProxyRecord, ProxyRequest, ProxyStatus, Security, StandardProtocol, Transport, V2RayProtocol,
    V2RaySettings,
};
