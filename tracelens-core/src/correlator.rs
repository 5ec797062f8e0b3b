//! Traffic correlator — reconstructs per-request call-chain records from
//! observed console exchanges
//!
//! Two independent exchanges feed two keyed stores:
//! - the **detail** exchange: the outgoing request body names a chain key
//!   (`condition.guid`), the response body is the raw chain record
//! - the **search** exchange: the response body maps chain keys to
//!   comma-delimited category labels (`idInfo.guid` → `layers.ProductType`)
//!
//! Capture is best-effort: malformed JSON on either side is logged and
//! ignored, and never affects the proxied exchange itself. Both stores are
//! append/overwrite only; a re-captured key is last-write-wins.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Deserialize;

/// One completed request/response pair as seen by the transport tap.
#[derive(Debug, Clone)]
pub struct ObservedExchange {
    /// Request path, without query string.
    pub path: String,
    pub request_body: String,
    pub status: u16,
    pub response_body: String,
}

/// Post-receive hook of the transport tap. The proxy depends on this
/// interface only; it never knows what the correlator does with an exchange.
pub trait ExchangeObserver: Send + Sync {
    fn on_exchange(&self, exchange: &ObservedExchange);
}

// ============================================================================
// Wire shapes (capture side, private)
// ============================================================================

#[derive(Debug, Deserialize)]
struct DetailRequest {
    condition: Option<DetailCondition>,
}

#[derive(Debug, Deserialize)]
struct DetailCondition {
    guid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    data: Option<Vec<SearchHit>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct SearchHit {
    #[serde(rename = "idInfo")]
    id_info: Option<SearchIdInfo>,
    layers: Option<SearchLayers>,
}

#[derive(Debug, Deserialize)]
struct SearchIdInfo {
    guid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchLayers {
    #[serde(rename = "ProductType")]
    product_type: Option<String>,
}

// ============================================================================
// TraceCorrelator
// ============================================================================

/// Owns the two keyed stores and knows which console paths feed them.
#[derive(Debug)]
pub struct TraceCorrelator {
    detail_path: String,
    search_path: String,
    chains: Mutex<HashMap<String, String>>,
    categories: Mutex<HashMap<String, String>>,
}

impl TraceCorrelator {
    pub fn new(detail_path: impl Into<String>, search_path: impl Into<String>) -> Self {
        Self {
            detail_path: detail_path.into(),
            search_path: search_path.into(),
            chains: Mutex::new(HashMap::new()),
            categories: Mutex::new(HashMap::new()),
        }
    }

    /// Capture a detail exchange: when the request body carries
    /// `condition.guid` and the response completed with 200, store the raw
    /// response text under that key. Last-write-wins on re-capture.
    pub fn record_detail(&self, request_body: &str, status: u16, response_body: &str) {
        if status != 200 {
            return;
        }

        let guid = match serde_json::from_str::<DetailRequest>(request_body) {
            Ok(req) => req.condition.and_then(|c| c.guid),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to parse detail request body, capture skipped");
                return;
            }
        };

        if let Some(guid) = guid {
            tracing::debug!(guid = %guid, bytes = response_body.len(), "Captured chain record");
            self.chains
                .lock()
                .expect("chain store poisoned")
                .insert(guid, response_body.to_string());
        }
    }

    /// Capture a search exchange: every element of `data` that carries both
    /// `idInfo.guid` and `layers.ProductType` updates the category index.
    pub fn record_search_results(&self, status: u16, response_body: &str) {
        if status != 200 {
            return;
        }

        let hits = match serde_json::from_str::<SearchResponse>(response_body) {
            Ok(resp) => resp.data.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to parse search response body, capture skipped");
                return;
            }
        };

        let mut categories = self.categories.lock().expect("category store poisoned");
        for hit in hits {
            let guid = hit.id_info.and_then(|i| i.guid);
            let product_type = hit.layers.and_then(|l| l.product_type);
            if let (Some(guid), Some(product_type)) = (guid, product_type) {
                categories.insert(guid, product_type);
            }
        }
    }

    /// Raw chain record for a key, if one was captured.
    pub fn lookup(&self, guid: &str) -> Option<String> {
        self.chains
            .lock()
            .expect("chain store poisoned")
            .get(guid)
            .cloned()
    }

    /// Category labels for a key: the stored comma-delimited string split,
    /// trimmed, empty segments dropped. Empty when the key was never seen.
    pub fn categories_for(&self, guid: &str) -> Vec<String> {
        self.categories
            .lock()
            .expect("category store poisoned")
            .get(guid)
            .map(|raw| split_categories(raw))
            .unwrap_or_default()
    }

    /// All captured chain keys.
    pub fn chain_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .chains
            .lock()
            .expect("chain store poisoned")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

impl ExchangeObserver for TraceCorrelator {
    fn on_exchange(&self, exchange: &ObservedExchange) {
        if exchange.path == self.detail_path {
            self.record_detail(&exchange.request_body, exchange.status, &exchange.response_body);
        } else if exchange.path == self.search_path {
            self.record_search_results(exchange.status, &exchange.response_body);
        }
    }
}

/// Split a comma-delimited category string, trimming whitespace and dropping
/// empty segments.
pub fn split_categories(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn correlator() -> TraceCorrelator {
        TraceCorrelator::new("/api/trace/detail", "/api/trace/search")
    }

    #[test]
    fn detail_capture_stores_raw_response() {
        let c = correlator();
        c.record_detail(r#"{"condition":{"guid":"g1"}}"#, 200, r#"{"data":[1]}"#);
        assert_eq!(c.lookup("g1").as_deref(), Some(r#"{"data":[1]}"#));
        assert!(c.lookup("g2").is_none());
    }

    #[test]
    fn detail_capture_last_write_wins() {
        let c = correlator();
        c.record_detail(r#"{"condition":{"guid":"g1"}}"#, 200, "first");
        c.record_detail(r#"{"condition":{"guid":"g1"}}"#, 200, "second");
        assert_eq!(c.lookup("g1").as_deref(), Some("second"));
    }

    #[test]
    fn detail_capture_requires_200() {
        let c = correlator();
        c.record_detail(r#"{"condition":{"guid":"g1"}}"#, 500, "body");
        assert!(c.lookup("g1").is_none());
    }

    #[test]
    fn malformed_detail_request_is_swallowed() {
        let c = correlator();
        c.record_detail("{not json", 200, "body");
        c.record_detail(r#"{"condition":{}}"#, 200, "body");
        c.record_detail(r#"{"other":true}"#, 200, "body");
        assert!(c.chain_keys().is_empty());
    }

    #[test]
    fn search_capture_populates_category_index() {
        let c = correlator();
        c.record_search_results(
            200,
            r#"{"data":[
                {"idInfo":{"guid":"g1"},"layers":{"ProductType":"Flight,Hotel"}},
                {"idInfo":{"guid":"g2"},"layers":{}},
                {"layers":{"ProductType":"Train"}},
                {}
            ]}"#,
        );
        assert_eq!(c.categories_for("g1"), vec!["Flight", "Hotel"]);
        assert!(c.categories_for("g2").is_empty());
    }

    #[test]
    fn malformed_search_response_is_swallowed() {
        let c = correlator();
        c.record_search_results(200, "<html>gateway error</html>");
        c.record_search_results(200, r#"{"data":"not a list"}"#);
        assert!(c.categories_for("g1").is_empty());
    }

    #[test]
    fn category_splitting_trims_and_drops_empties() {
        assert_eq!(split_categories("A, B,,C "), vec!["A", "B", "C"]);
        assert_eq!(split_categories(" , ,"), Vec::<String>::new());
        assert_eq!(split_categories("Solo"), vec!["Solo"]);
    }

    #[test]
    fn observer_dispatches_on_path() {
        let c = correlator();
        c.on_exchange(&ObservedExchange {
            path: "/api/trace/detail".to_string(),
            request_body: r#"{"condition":{"guid":"g1"}}"#.to_string(),
            status: 200,
            response_body: "record".to_string(),
        });
        c.on_exchange(&ObservedExchange {
            path: "/api/trace/search".to_string(),
            request_body: String::new(),
            status: 200,
            response_body: r#"{"data":[{"idInfo":{"guid":"g1"},"layers":{"ProductType":"Flight"}}]}"#
                .to_string(),
        });
        c.on_exchange(&ObservedExchange {
            path: "/api/other".to_string(),
            request_body: r#"{"condition":{"guid":"g9"}}"#.to_string(),
            status: 200,
            response_body: "ignored".to_string(),
        });

        assert_eq!(c.lookup("g1").as_deref(), Some("record"));
        assert_eq!(c.categories_for("g1"), vec!["Flight"]);
        assert!(c.lookup("g9").is_none());
    }
}
