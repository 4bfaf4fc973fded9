//! Header and body rewrite rules.
//!
//! Rules match on a path prefix and an optional method; the first match
//! wins. Request mutations run before forwarding; response mutations run
//! only in transform mode, when the body is available as identity bytes.

use trellis_proto::http1::Request;
use trellis_proto::Headers;

/// One rewrite rule from `[rewrite]` config.
#[derive(Debug, Clone, Default)]
pub struct RewriteRule {
    pub path_prefix: String,
    /// Uppercase method; empty matches any.
    pub method: String,

    pub req_set_headers: Vec<(String, String)>,
    pub req_del_headers: Vec<String>,
    pub req_body_replaces: Vec<(String, String)>,

    pub resp_set_headers: Vec<(String, String)>,
    pub resp_del_headers: Vec<String>,
    pub resp_body_replaces: Vec<(String, String)>,
}

impl RewriteRule {
    pub fn has_response_mutations(&self) -> bool {
        !self.resp_set_headers.is_empty()
            || !self.resp_del_headers.is_empty()
            || !self.resp_body_replaces.is_empty()
    }

    fn matches(&self, method: &str, path: &str) -> bool {
        path.starts_with(&self.path_prefix)
            && (self.method.is_empty() || self.method.eq_ignore_ascii_case(method))
    }
}

/// The compiled rule set.
#[derive(Debug, Clone, Default)]
pub struct RewriteEngine {
    rules: Vec<RewriteRule>,
}

impl RewriteEngine {
    pub fn new(rules: Vec<RewriteRule>) -> Self {
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Index of the first matching rule.
    pub fn match_rule(&self, method: &str, path: &str) -> Option<usize> {
        self.rules.iter().position(|r| r.matches(method, path))
    }

    /// True when `rule_idx` wants to touch the response.
    pub fn rule_mutates_response(&self, rule_idx: usize) -> bool {
        self.rules
            .get(rule_idx)
            .map(RewriteRule::has_response_mutations)
            .unwrap_or(false)
    }

    /// Apply request-side mutations in place. Returns true if anything
    /// changed.
    pub fn apply_request(&self, rule_idx: usize, request: &mut Request) -> bool {
        let rule = match self.rules.get(rule_idx) {
            Some(r) => r,
            None => return false,
        };
        let mut changed = false;
        for (name, value) in &rule.req_set_headers {
            request.headers.set(name, value.clone());
            changed = true;
        }
        for name in &rule.req_del_headers {
            changed |= request.headers.remove(name);
        }
        if !rule.req_body_replaces.is_empty() && !request.body.is_empty() {
            // Substitutions apply only to text bodies; binary stays as-is.
            match String::from_utf8(std::mem::take(&mut request.body)) {
                Ok(mut body) => {
                    for (from, to) in &rule.req_body_replaces {
                        if body.contains(from.as_str()) {
                            body = body.replace(from.as_str(), to);
                            changed = true;
                        }
                    }
                    request.body = body.into_bytes();
                }
                Err(err) => request.body = err.into_bytes(),
            }
        }
        changed
    }

    /// Apply response-side mutations to detached head/body parts.
    pub fn apply_response(
        &self,
        rule_idx: usize,
        headers: &mut Headers,
        body: &mut Vec<u8>,
    ) -> bool {
        let rule = match self.rules.get(rule_idx) {
            Some(r) => r,
            None => return false,
        };
        let mut changed = false;
        for (name, value) in &rule.resp_set_headers {
            headers.set(name, value.clone());
            changed = true;
        }
        for name in &rule.resp_del_headers {
            changed |= headers.remove(name);
        }
        if !rule.resp_body_replaces.is_empty() && !body.is_empty() {
            match String::from_utf8(std::mem::take(body)) {
                Ok(mut text) => {
                    for (from, to) in &rule.resp_body_replaces {
                        if text.contains(from.as_str()) {
                            text = text.replace(from.as_str(), to);
                            changed = true;
                        }
                    }
                    *body = text.into_bytes();
                }
                Err(err) => *body = err.into_bytes(),
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_proto::http1::Version;

    fn request(method: &str, path: &str) -> Request {
        Request {
            method: method.into(),
            path: path.into(),
            query: String::new(),
            version: Version::Http11,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    fn engine() -> RewriteEngine {
        RewriteEngine::new(vec![
            RewriteRule {
                path_prefix: "/api/".into(),
                method: "POST".into(),
                req_set_headers: vec![("X-Rewritten".into(), "1".into())],
                req_del_headers: vec!["X-Internal".into()],
                req_body_replaces: vec![("old".into(), "new".into())],
                resp_set_headers: vec![("X-Served-By".into(), "trellis".into())],
                resp_body_replaces: vec![("secret".into(), "***".into())],
                ..Default::default()
            },
            RewriteRule {
                path_prefix: "/".into(),
                ..Default::default()
            },
        ])
    }

    #[test]
    fn test_first_match_wins() {
        let e = engine();
        assert_eq!(e.match_rule("POST", "/api/users"), Some(0));
        assert_eq!(e.match_rule("GET", "/api/users"), Some(1));
        assert_eq!(e.match_rule("GET", "/other"), Some(1));
    }

    #[test]
    fn test_apply_request() {
        let e = engine();
        let mut req = request("POST", "/api/x");
        req.headers.set("X-Internal", "remove-me");
        req.body = b"some old data".to_vec();
        assert!(e.apply_request(0, &mut req));
        assert_eq!(req.headers.get("X-Rewritten"), Some("1"));
        assert!(req.headers.get("X-Internal").is_none());
        assert_eq!(req.body, b"some new data");
    }

    #[test]
    fn test_apply_response() {
        let e = engine();
        let mut headers = Headers::new();
        let mut body = b"the secret value".to_vec();
        assert!(e.apply_response(0, &mut headers, &mut body));
        assert_eq!(headers.get("X-Served-By"), Some("trellis"));
        assert_eq!(body, b"the *** value");
    }

    #[test]
    fn test_response_mutation_flag() {
        let e = engine();
        assert!(e.rule_mutates_response(0));
        assert!(!e.rule_mutates_response(1));
    }

    #[test]
    fn test_non_utf8_body_untouched() {
        let e = engine();
        let mut req = request("POST", "/api/x");
        req.body = vec![0xff, 0xfe, 0x00];
        e.apply_request(0, &mut req);
        assert_eq!(req.body, vec![0xff, 0xfe, 0x00]);
    }
}
