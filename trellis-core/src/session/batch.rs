//! Request aggregation: batch split and batch coalescing.
//!
//! *Split*: a client POST with `X-Batch-Split: 1` and a JSON array body
//! fans out into one upstream request per element, answered as
//! `{"results":[{status,body}...]}` in order.
//!
//! *Coalescing*: the shard-local batcher parks batchable requests for a
//! short window, joins their JSON bodies into a single array POST with
//! `X-Batched: <n>`, and demultiplexes the JSON-array response one
//! element per caller. Arity mismatches fail every member with 502, the
//! same as the upstream call itself failing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use trellis_balance::BackendAddr;
use trellis_proto::http1::{Request, Version};
use trellis_proto::Headers;

use crate::session::forward::{self};
use crate::session::ProxyContext;

/// Largest per-item body echoed back in a split reply.
const SPLIT_ITEM_BODY_CAP: usize = 16 * 1024;
/// Cap on elements in a split request.
pub const MAX_SPLIT_ITEMS: usize = 64;

// ============================================================================
// Batch split
// ============================================================================

/// Top-level JSON array -> raw JSON text per element.
pub fn split_json_array_items(body: &[u8]) -> Option<Vec<String>> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Array(items)) => Some(items.iter().map(Value::to_string).collect()),
        _ => None,
    }
}

/// Forward each element as its own POST and collect the results. The
/// elements go to the same backend sequentially, preserving order.
pub async fn split_and_reply(
    ctx: &Arc<ProxyContext>,
    backend: &BackendAddr,
    route: &str,
    items: Vec<String>,
    peer_ip: &str,
) -> Vec<u8> {
    let mut results = Vec::with_capacity(items.len());
    for item in items {
        let wire = build_item_request(route, item.into_bytes(), peer_ip, None);
        let result = forward::fetch_buffered(ctx, backend, &wire, false, ctx.cfg.transform_max_bytes)
            .await;
        match result {
            Ok((head, mut body)) => {
                body.truncate(SPLIT_ITEM_BODY_CAP);
                results.push(json!({
                    "status": head.status,
                    "body": String::from_utf8_lossy(&body),
                }));
            }
            Err(err) => {
                debug!(%err, "batch split item failed");
                results.push(json!({"status": 502, "body": ""}));
            }
        }
    }
    json!({ "results": results }).to_string().into_bytes()
}

fn build_item_request(route: &str, body: Vec<u8>, peer_ip: &str, batched: Option<usize>) -> Vec<u8> {
    let (path, query) = match route.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (route.to_string(), String::new()),
    };
    let mut request = Request {
        method: "POST".to_string(),
        path,
        query,
        version: Version::Http11,
        headers: Headers::new(),
        body,
    };
    request.headers.set("Content-Type", "application/json");
    if let Some(n) = batched {
        request.headers.set("X-Batched", n.to_string());
    }
    forward::normalize_upstream_request(&mut request, peer_ip, None);
    request.to_wire()
}

// ============================================================================
// Batch coalescing
// ============================================================================

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub window: Duration,
    pub max_batch_size: usize,
    pub max_batch_bytes: usize,
    pub max_response_bytes: usize,
    pub require_header: bool,
    pub header_name: String,
    /// Exact paths that may be coalesced.
    pub paths: Vec<String>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(5),
            max_batch_size: 16,
            max_batch_bytes: 256 * 1024,
            max_response_bytes: 1024 * 1024,
            require_header: true,
            header_name: "X-Batch".to_string(),
            paths: Vec::new(),
        }
    }
}

impl BatchConfig {
    /// May this request be coalesced at all?
    pub fn is_batchable(&self, method: &str, path: &str, header_value: Option<&str>) -> bool {
        if method != "POST" || !self.paths.iter().any(|p| p == path) {
            return false;
        }
        if self.require_header {
            matches!(header_value, Some(v) if matches!(v, "1" | "true" | "yes" | "on"))
        } else {
            true
        }
    }
}

struct PendingItem {
    body: Vec<u8>,
    reply: oneshot::Sender<(u16, Vec<u8>)>,
}

struct Group {
    backend: BackendAddr,
    route: String,
    peer_ip: String,
    items: Vec<PendingItem>,
    bytes: usize,
}

/// Shard-local batcher; groups are keyed by (backend, route).
pub struct Batcher {
    cfg: BatchConfig,
    groups: Mutex<HashMap<(String, String), Group>>,
}

impl Batcher {
    fn new(cfg: BatchConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            groups: Mutex::new(HashMap::new()),
        })
    }

    /// Park one request. The receiver resolves with (status, body) once
    /// the batch round-trips. `None` means the request is too large to
    /// coalesce and must be forwarded directly.
    pub fn enqueue(
        self: &Arc<Self>,
        ctx: &Arc<ProxyContext>,
        backend: BackendAddr,
        route: String,
        peer_ip: &str,
        body: Vec<u8>,
    ) -> Option<oneshot::Receiver<(u16, Vec<u8>)>> {
        if body.len() > self.cfg.max_batch_bytes {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        let key = (backend.id(), route.clone());

        let flush_now = {
            let mut groups = self.groups.lock();
            let group = groups.entry(key.clone()).or_insert_with(|| Group {
                backend,
                route,
                peer_ip: peer_ip.to_string(),
                items: Vec::new(),
                bytes: 0,
            });
            let first = group.items.is_empty();
            group.bytes += body.len();
            group.items.push(PendingItem { body, reply: tx });

            if first {
                // Arm the window timer for this group.
                let batcher = Arc::clone(self);
                let ctx = Arc::clone(ctx);
                let timer_key = key.clone();
                let window = self.cfg.window;
                tokio::spawn(async move {
                    tokio::time::sleep(window).await;
                    batcher.flush(&ctx, &timer_key).await;
                });
            }
            group.items.len() >= self.cfg.max_batch_size || group.bytes >= self.cfg.max_batch_bytes
        };

        if flush_now {
            let batcher = Arc::clone(self);
            let ctx = Arc::clone(ctx);
            tokio::spawn(async move {
                batcher.flush(&ctx, &key).await;
            });
        }
        Some(rx)
    }

    /// Take the group (if still pending) and run the batched exchange.
    /// Safe to call twice; the second call finds nothing.
    async fn flush(self: &Arc<Self>, ctx: &Arc<ProxyContext>, key: &(String, String)) {
        let group = match self.groups.lock().remove(key) {
            Some(g) => g,
            None => return,
        };
        let count = group.items.len();
        debug!(backend = %key.0, route = %key.1, count, "flushing batch");

        let joined = join_bodies(&group.items);
        let wire = build_item_request(&group.route, joined, &group.peer_ip, Some(count));
        let result = forward::fetch_buffered(
            ctx,
            &group.backend,
            &wire,
            false,
            self.cfg.max_response_bytes,
        )
        .await;

        match result {
            Ok((head, body)) => distribute(group.items, head.status, &body),
            Err(err) => {
                warn!(%err, "batched upstream call failed");
                fail_all(group.items);
            }
        }
    }
}

/// `[body1,body2,...]`; non-JSON bodies are embedded as JSON strings.
fn join_bodies(items: &[PendingItem]) -> Vec<u8> {
    let values: Vec<Value> = items
        .iter()
        .map(|item| {
            serde_json::from_slice::<Value>(&item.body)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&item.body).into_owned()))
        })
        .collect();
    Value::Array(values).to_string().into_bytes()
}

/// The upstream reply must be a JSON array of the batch arity; element
/// `i` becomes the body of request `i`.
fn distribute(items: Vec<PendingItem>, status: u16, body: &[u8]) {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Array(elements)) if elements.len() == items.len() => {
            for (item, element) in items.into_iter().zip(elements) {
                let _ = item.reply.send((status, element.to_string().into_bytes()));
            }
        }
        _ => {
            warn!("batched response arity mismatch");
            fail_all(items);
        }
    }
}

fn fail_all(items: Vec<PendingItem>) {
    for item in items {
        let _ = item
            .reply
            .send((502, br#"{"error":"batch upstream failed"}"#.to_vec()));
    }
}

/// One batcher per shard, mirroring the per-loop batchers of the
/// original reactor design.
pub struct BatcherSet {
    cfg: BatchConfig,
    shards: Vec<Arc<Batcher>>,
}

impl BatcherSet {
    pub fn new(cfg: BatchConfig, shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Batcher::new(cfg.clone())).collect(),
            cfg,
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.cfg
    }

    pub fn for_shard(&self, shard: usize) -> &Arc<Batcher> {
        &self.shards[shard % self.shards.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_json_array_items() {
        let items = split_json_array_items(br#"[{"a":1}, "two", 3]"#).unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], r#"{"a":1}"#);
        assert_eq!(items[1], r#""two""#);
        assert_eq!(items[2], "3");

        assert!(split_json_array_items(br#"{"not":"array"}"#).is_none());
        assert!(split_json_array_items(b"garbage").is_none());
    }

    #[test]
    fn test_is_batchable() {
        let cfg = BatchConfig {
            paths: vec!["/infer".to_string()],
            require_header: true,
            header_name: "X-Batch".to_string(),
            ..Default::default()
        };
        assert!(cfg.is_batchable("POST", "/infer", Some("1")));
        assert!(!cfg.is_batchable("POST", "/infer", None));
        assert!(!cfg.is_batchable("POST", "/infer", Some("0")));
        assert!(!cfg.is_batchable("GET", "/infer", Some("1")));
        assert!(!cfg.is_batchable("POST", "/other", Some("1")));

        let lax = BatchConfig {
            paths: vec!["/infer".to_string()],
            require_header: false,
            ..Default::default()
        };
        assert!(lax.is_batchable("POST", "/infer", None));
    }

    #[test]
    fn test_join_bodies_mixed() {
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        let items = vec![
            PendingItem {
                body: br#"{"x":1}"#.to_vec(),
                reply: tx1,
            },
            PendingItem {
                body: b"plain text".to_vec(),
                reply: tx2,
            },
        ];
        let joined = join_bodies(&items);
        let parsed: Value = serde_json::from_slice(&joined).unwrap();
        assert_eq!(parsed[0]["x"], 1);
        assert_eq!(parsed[1], "plain text");
    }

    #[tokio::test]
    async fn test_distribute_arity() {
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        let items = vec![
            PendingItem {
                body: b"1".to_vec(),
                reply: tx1,
            },
            PendingItem {
                body: b"2".to_vec(),
                reply: tx2,
            },
        ];
        distribute(items, 200, br#"[{"r":1},{"r":2}]"#);
        assert_eq!(rx1.await.unwrap(), (200, br#"{"r":1}"#.to_vec()));
        assert_eq!(rx2.await.unwrap(), (200, br#"{"r":2}"#.to_vec()));
    }

    #[tokio::test]
    async fn test_distribute_mismatch_fails_all() {
        let (tx, rx) = oneshot::channel();
        let items = vec![PendingItem {
            body: b"1".to_vec(),
            reply: tx,
        }];
        distribute(items, 200, br#"[1, 2, 3]"#);
        let (status, _) = rx.await.unwrap();
        assert_eq!(status, 502);
    }
}
