//! Node address parsing (`host`, `host:port`, `http://host:port/`)

/// Port the node API listens on
pub const DEFAULT_API_PORT: u16 = 1323;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}/api", self.host, self.port)
    }

    pub fn socket(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub fn parse_node_address(s: &str, default_port: u16) -> Option<NodeAddress> {
    let s_trim = s.trim();
    let lower = s_trim.to_ascii_lowercase();
    let mut rest = s_trim;
    if let Some(scheme_end) = lower.find("://") {
        if &lower[..scheme_end] != "http" {
            return None;
        }
        rest = &s_trim[scheme_end + 3..];
    }
    let hp = rest.split('/').next().unwrap_or(rest);
    if hp.is_empty() {
        return None;
    }
    let (host, port) = match hp.rsplit_once(':') {
        Some((h, pr)) if !h.contains(':') => (h.to_string(), pr.parse().ok()?),
        _ => (hp.to_string(), default_port),
    };
    if host.is_empty() {
        return None;
    }
    Some(NodeAddress { host, port })
}
