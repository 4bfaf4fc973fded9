// Dry-run validation for `trellis-proxy -C`.

use crate::error::{ConfigError, Result};
use crate::Settings;

const STRATEGIES: &[&str] = &[
    "roundrobin",
    "weighted",
    "leastconn",
    "ewma",
    "ai-load",
    "consistent-hash",
];

const HEALTH_MODES: &[&str] = &["off", "tcp", "http", "script"];
const AFFINITY_MODES: &[&str] = &["ip", "header", "cookie"];
const SCHED_MODES: &[&str] = &["off", "priority", "fair", "edf"];
const IP_MODES: &[&str] = &["off", "allow", "deny"];

/// Validate everything the server would otherwise reject at startup.
///
/// Collects all problems instead of stopping at the first so a `-C` run
/// reports the whole file.
pub fn validate(settings: &Settings) -> Result<()> {
    let mut problems: Vec<String> = Vec::new();

    check_port(settings, "global", "listen_port", true, &mut problems);
    check_port(settings, "l4", "listen_port", false, &mut problems);
    check_port(settings, "udp", "listen_port", false, &mut problems);

    let threads = settings.get_i64("global", "threads", 4);
    if !(1..=512).contains(&threads) {
        problems.push(format!("[global] threads out of range: {threads}"));
    }

    let strategy = settings.get_str("global", "strategy", "roundrobin");
    if !STRATEGIES.contains(&strategy.as_str()) {
        problems.push(format!("[global] unknown strategy: {strategy}"));
    }

    let io_model = settings.get_str("global", "io_model", "multi");
    if !["multi", "single"].contains(&io_model.as_str()) {
        problems.push(format!("[global] unknown io_model: {io_model}"));
    }

    let health_mode = settings.get_str("health_check", "mode", "tcp");
    if !HEALTH_MODES.contains(&health_mode.as_str()) {
        problems.push(format!("[health_check] unknown mode: {health_mode}"));
    }

    let affinity = settings.get_str("session_affinity", "mode", "ip");
    if !AFFINITY_MODES.contains(&affinity.as_str()) {
        problems.push(format!("[session_affinity] unknown mode: {affinity}"));
    }

    let sched = settings.get_str("priority", "mode", "off");
    if !SCHED_MODES.contains(&sched.as_str()) {
        problems.push(format!("[priority] unknown mode: {sched}"));
    }

    let ip_mode = settings.get_str("access_control", "ip_mode", "off");
    if !IP_MODES.contains(&ip_mode.as_str()) {
        problems.push(format!("[access_control] unknown ip_mode: {ip_mode}"));
    }
    for cidr in settings.get_list("access_control", "cidrs") {
        if !cidr_looks_valid(&cidr) {
            problems.push(format!("[access_control] bad cidr: {cidr}"));
        }
    }

    for (name, value) in settings.section("backends") {
        if parse_backend_value(&value).is_none() {
            problems.push(format!("[backends] {name}: bad backend spec: {value}"));
        }
    }

    check_nonneg_f64(settings, "rate_limit", "qps", &mut problems);
    check_nonneg_f64(settings, "rate_limit", "burst", &mut problems);
    check_nonneg_f64(settings, "ddos", "accept_qps", &mut problems);

    let beta = settings.get_f64("congestion", "multiplicative_decrease", 0.7);
    if !(0.0..=1.0).contains(&beta) {
        problems.push(format!(
            "[congestion] multiplicative_decrease must be in [0,1]: {beta}"
        ));
    }
    let min_w = settings.get_i64("congestion", "min_window", 1);
    let max_w = settings.get_i64("congestion", "max_window", 1024);
    if min_w < 1 || max_w < min_w {
        problems.push(format!(
            "[congestion] window bounds invalid: min={min_w} max={max_w}"
        ));
    }

    if settings.get_bool("tls", "enable", false) {
        if settings.get("tls", "cert_path").is_none() {
            problems.push("[tls] enable=1 requires cert_path".into());
        }
        if settings.get("tls", "key_path").is_none() {
            problems.push("[tls] enable=1 requires key_path".into());
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        for problem in &problems {
            tracing::warn!(%problem, "config validation");
        }
        Err(ConfigError::Validation(problems.join("; ")))
    }
}

/// `ip:port [weight=N]` as used by the `[backends]` section.
pub fn parse_backend_value(value: &str) -> Option<(String, u16, u32)> {
    let mut parts = value.split_whitespace();
    let addr = parts.next()?;
    let (ip, port) = addr.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if port == 0 || ip.is_empty() {
        return None;
    }
    let mut weight = 1u32;
    for extra in parts {
        if let Some(w) = extra.strip_prefix("weight=") {
            weight = w.parse().ok()?;
            if weight == 0 {
                return None;
            }
        }
    }
    Some((ip.to_string(), port, weight))
}

fn check_port(
    settings: &Settings,
    section: &str,
    key: &str,
    required: bool,
    problems: &mut Vec<String>,
) {
    match settings.get(section, key) {
        // Port 0 is allowed and means "ephemeral".
        Some(v) => {
            if v.trim().parse::<u16>().is_err() {
                problems.push(format!("[{section}] {key}: bad port: {v}"));
            }
        }
        None if required => problems.push(format!("[{section}] {key} is required")),
        None => {}
    }
}

fn check_nonneg_f64(settings: &Settings, section: &str, key: &str, problems: &mut Vec<String>) {
    if let Some(v) = settings.get(section, key) {
        match v.trim().parse::<f64>() {
            Ok(f) if f >= 0.0 => {}
            _ => problems.push(format!("[{section}] {key}: bad number: {v}")),
        }
    }
}

fn cidr_looks_valid(cidr: &str) -> bool {
    let (ip, prefix) = match cidr.split_once('/') {
        Some(pair) => pair,
        None => (cidr, "32"),
    };
    let prefix_ok = prefix.parse::<u8>().map(|p| p <= 32).unwrap_or(false);
    let octets: Vec<_> = ip.split('.').collect();
    prefix_ok && octets.len() == 4 && octets.iter().all(|o| o.parse::<u8>().is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Settings {
        Settings::parse("[global]\nlisten_port = 8080\n").unwrap()
    }

    #[test]
    fn test_minimal_config_passes() {
        assert!(validate(&base()).is_ok());
    }

    #[test]
    fn test_missing_listen_port_fails() {
        let s = Settings::parse("[global]\nthreads = 2\n").unwrap();
        assert!(validate(&s).is_err());
    }

    #[test]
    fn test_bad_strategy_fails() {
        let mut s = base();
        s.set("global", "strategy", "fastest");
        let err = validate(&s).unwrap_err();
        assert!(err.to_string().contains("strategy"));
    }

    #[test]
    fn test_bad_cidr_fails() {
        let mut s = base();
        s.set("access_control", "cidrs", "10.0.0.0/8, 300.1.2.3/4");
        assert!(validate(&s).is_err());
    }

    #[test]
    fn test_backend_spec() {
        assert_eq!(
            parse_backend_value("10.0.0.1:9000 weight=3"),
            Some(("10.0.0.1".into(), 9000, 3))
        );
        assert_eq!(
            parse_backend_value("10.0.0.1:9000"),
            Some(("10.0.0.1".into(), 9000, 1))
        );
        assert!(parse_backend_value("10.0.0.1").is_none());
        assert!(parse_backend_value("10.0.0.1:0").is_none());
        assert!(parse_backend_value("10.0.0.1:9000 weight=0").is_none());
    }

    #[test]
    fn test_congestion_bounds() {
        let mut s = base();
        s.set("congestion", "min_window", "10");
        s.set("congestion", "max_window", "4");
        assert!(validate(&s).is_err());
    }

    #[test]
    fn test_tls_requires_paths() {
        let mut s = base();
        s.set("tls", "enable", "1");
        assert!(validate(&s).is_err());
        s.set("tls", "cert_path", "/tmp/cert.pem");
        s.set("tls", "key_path", "/tmp/key.pem");
        assert!(validate(&s).is_ok());
    }
}
