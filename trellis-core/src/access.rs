//! IPv4 access control and credential allowlists.
//!
//! Three independent gates, all of which must pass: CIDR allow/deny
//! lists, a token header allowlist and an API key header allowlist.
//! Only IPv4 is matched; a non-IPv4 peer fails any configured CIDR mode.

/// CIDR list interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpMode {
    #[default]
    Off,
    /// Only listed networks may connect.
    AllowList,
    /// Listed networks are refused.
    DenyList,
}

impl IpMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(IpMode::Off),
            "allow" => Some(IpMode::AllowList),
            "deny" => Some(IpMode::DenyList),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AccessConfig {
    pub ip_mode: IpMode,
    pub cidrs: Vec<String>,
    pub require_token: bool,
    pub token_header: String,
    pub valid_tokens: Vec<String>,
    pub require_api_key: bool,
    pub api_key_header: String,
    pub valid_api_keys: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct CidrNet {
    network: u32,
    mask: u32,
}

/// Compiled access policy.
#[derive(Debug, Clone)]
pub struct AccessControl {
    cfg: AccessConfig,
    nets: Vec<CidrNet>,
}

impl AccessControl {
    /// Compile the configuration; invalid CIDRs are skipped (validation
    /// happens at config load).
    pub fn new(cfg: AccessConfig) -> Self {
        let nets = cfg
            .cidrs
            .iter()
            .filter_map(|c| parse_cidr(c))
            .map(|(network, mask)| CidrNet { network, mask })
            .collect();
        Self { cfg, nets }
    }

    /// True when nothing is enforced at all.
    pub fn is_noop(&self) -> bool {
        self.cfg.ip_mode == IpMode::Off && !self.cfg.require_token && !self.cfg.require_api_key
    }

    pub fn token_header(&self) -> &str {
        &self.cfg.token_header
    }

    pub fn api_key_header(&self) -> &str {
        &self.cfg.api_key_header
    }

    /// Full admission decision for one request.
    pub fn allow(&self, peer_ip: &str, token: Option<&str>, api_key: Option<&str>) -> bool {
        self.ip_allowed(peer_ip) && self.token_allowed(token) && self.api_key_allowed(api_key)
    }

    fn ip_allowed(&self, peer_ip: &str) -> bool {
        match self.cfg.ip_mode {
            IpMode::Off => true,
            mode => {
                let ip = match parse_ipv4(peer_ip) {
                    Some(ip) => ip,
                    None => return false,
                };
                let listed = self.nets.iter().any(|n| ip & n.mask == n.network);
                match mode {
                    IpMode::AllowList => listed,
                    IpMode::DenyList => !listed,
                    IpMode::Off => true,
                }
            }
        }
    }

    fn token_allowed(&self, token: Option<&str>) -> bool {
        if !self.cfg.require_token {
            return true;
        }
        token
            .map(|t| self.cfg.valid_tokens.iter().any(|v| v == t))
            .unwrap_or(false)
    }

    fn api_key_allowed(&self, api_key: Option<&str>) -> bool {
        if !self.cfg.require_api_key {
            return true;
        }
        api_key
            .map(|k| self.cfg.valid_api_keys.iter().any(|v| v == k))
            .unwrap_or(false)
    }
}

/// Dotted-quad to host-order u32.
pub fn parse_ipv4(s: &str) -> Option<u32> {
    let mut octets = [0u8; 4];
    let mut parts = s.split('.');
    for octet in &mut octets {
        *octet = parts.next()?.parse().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(u32::from_be_bytes(octets))
}

/// `a.b.c.d/len` (bare address implies /32) to (network, mask).
pub fn parse_cidr(s: &str) -> Option<(u32, u32)> {
    let (ip, len) = match s.split_once('/') {
        Some((ip, len)) => (ip, len.parse::<u8>().ok()?),
        None => (s, 32),
    };
    if len > 32 {
        return None;
    }
    let ip = parse_ipv4(ip)?;
    let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
    Some((ip & mask, mask))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control(mode: IpMode, cidrs: &[&str]) -> AccessControl {
        AccessControl::new(AccessConfig {
            ip_mode: mode,
            cidrs: cidrs.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
    }

    #[test]
    fn test_parse_ipv4() {
        assert_eq!(parse_ipv4("127.0.0.1"), Some(0x7f000001));
        assert_eq!(parse_ipv4("10.1.2.3"), Some(0x0a010203));
        assert_eq!(parse_ipv4("256.0.0.1"), None);
        assert_eq!(parse_ipv4("1.2.3"), None);
        assert_eq!(parse_ipv4("1.2.3.4.5"), None);
    }

    #[test]
    fn test_parse_cidr() {
        assert_eq!(parse_cidr("10.0.0.0/8"), Some((0x0a000000, 0xff000000)));
        assert_eq!(parse_cidr("127.0.0.1"), Some((0x7f000001, u32::MAX)));
        assert_eq!(parse_cidr("0.0.0.0/0"), Some((0, 0)));
        assert_eq!(parse_cidr("10.0.0.0/33"), None);
    }

    #[test]
    fn test_deny_list() {
        let acl = control(IpMode::DenyList, &["10.0.0.0/8"]);
        assert!(acl.allow("127.0.0.1", None, None));
        assert!(!acl.allow("10.1.2.3", None, None));
    }

    #[test]
    fn test_allow_list() {
        let acl = control(IpMode::AllowList, &["192.168.0.0/16"]);
        assert!(acl.allow("192.168.5.5", None, None));
        assert!(!acl.allow("8.8.8.8", None, None));
    }

    #[test]
    fn test_token_gate() {
        let acl = AccessControl::new(AccessConfig {
            require_token: true,
            token_header: "X-Api-Token".into(),
            valid_tokens: vec!["t2".into()],
            ..Default::default()
        });
        assert!(acl.allow("127.0.0.1", Some("t2"), None));
        assert!(!acl.allow("127.0.0.1", Some("bad"), None));
        assert!(!acl.allow("127.0.0.1", None, None));
    }

    #[test]
    fn test_deny_beats_valid_token() {
        // S4: valid token from a denied network is still refused.
        let acl = AccessControl::new(AccessConfig {
            ip_mode: IpMode::DenyList,
            cidrs: vec!["10.0.0.0/8".into()],
            require_token: true,
            token_header: "X-Api-Token".into(),
            valid_tokens: vec!["t2".into()],
            ..Default::default()
        });
        assert!(acl.allow("127.0.0.1", Some("t2"), None));
        assert!(!acl.allow("127.0.0.1", None, None));
        assert!(!acl.allow("10.1.2.3", Some("t2"), None));
    }

    #[test]
    fn test_api_key_gate() {
        let acl = AccessControl::new(AccessConfig {
            require_api_key: true,
            api_key_header: "X-Api-Key".into(),
            valid_api_keys: vec!["k1".into()],
            ..Default::default()
        });
        assert!(acl.allow("1.1.1.1", None, Some("k1")));
        assert!(!acl.allow("1.1.1.1", None, Some("nope")));
    }

    #[test]
    fn test_noop() {
        assert!(control(IpMode::Off, &[]).is_noop());
        assert!(!control(IpMode::DenyList, &["1.2.3.4/32"]).is_noop());
    }
}
