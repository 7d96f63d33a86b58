use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::Value;

use crate::dispatch::DispatchOptions;
use crate::error::KernelError;
use crate::message::{Message, MessagePath};

/// Captured path variables, keyed by the `{name}` that captured them.
pub type PathParams = HashMap<String, String>;

/// What a handler resolves to: a result payload, or an error the processor
/// records and surfaces. Resolving to `Value::Null` means "accepted with
/// empty result".
pub type HandlerResult = Result<Value, KernelError>;

type BoxHandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// A route handler: `(message, params, options) -> future<result>`.
pub type Handler =
    Arc<dyn Fn(Message, PathParams, DispatchOptions) -> BoxHandlerFuture + Send + Sync>;

/// Wrap an async closure into a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Message, PathParams, DispatchOptions) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |message, params, options| Box::pin(f(message, params, options)))
}

/// What a registered pattern represents.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteKind {
    #[default]
    Route,
    Query,
    Command,
}

/// Free-form metadata attached at registration.
#[derive(Clone, Debug, Default)]
pub struct RouteMetadata {
    pub kind: RouteKind,
    pub extra: Option<Value>,
}

impl RouteMetadata {
    pub fn of_kind(kind: RouteKind) -> Self {
        Self { kind, extra: None }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum SegmentPattern {
    Literal(String),
    Param(String),
    Wildcard,
}

/// A parsed route pattern: literal segments, `{name}` captures, and an
/// optional `*` tail wildcard.
#[derive(Clone, Debug)]
struct RoutePattern {
    raw: String,
    segments: Vec<SegmentPattern>,
    literal_count: usize,
    param_count: usize,
    has_wildcard: bool,
}

impl RoutePattern {
    fn parse(raw: &str) -> Result<Self, KernelError> {
        let trimmed = raw.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(KernelError::validation("route pattern is empty"));
        }

        let parts: Vec<&str> = trimmed.split('/').collect();
        let mut segments = Vec::with_capacity(parts.len());
        let mut literal_count = 0;
        let mut param_count = 0;
        let mut has_wildcard = false;

        for (index, part) in parts.iter().enumerate() {
            if part.is_empty() {
                return Err(KernelError::validation(format!(
                    "pattern '{}' contains an empty segment",
                    raw
                )));
            }
            if *part == "*" {
                if index != parts.len() - 1 {
                    return Err(KernelError::validation(format!(
                        "pattern '{}' has a wildcard before the tail",
                        raw
                    )));
                }
                has_wildcard = true;
                segments.push(SegmentPattern::Wildcard);
            } else if let Some(name) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    return Err(KernelError::validation(format!(
                        "pattern '{}' has an invalid capture '{}'",
                        raw, part
                    )));
                }
                param_count += 1;
                segments.push(SegmentPattern::Param(name.to_string()));
            } else if part.contains('{') || part.contains('}') {
                return Err(KernelError::validation(format!(
                    "pattern '{}' has a malformed capture '{}'",
                    raw, part
                )));
            } else {
                literal_count += 1;
                segments.push(SegmentPattern::Literal(part.to_string()));
            }
        }

        Ok(Self {
            raw: trimmed.to_string(),
            segments,
            literal_count,
            param_count,
            has_wildcard,
        })
    }

    fn matches(&self, path_segments: &[String]) -> Option<PathParams> {
        if self.has_wildcard {
            // Tail wildcard matches one or more remaining segments.
            if path_segments.len() < self.segments.len() {
                return None;
            }
        } else if path_segments.len() != self.segments.len() {
            return None;
        }

        let mut params = PathParams::new();
        for (pattern, segment) in self.segments.iter().zip(path_segments) {
            match pattern {
                SegmentPattern::Literal(text) => {
                    if text != segment {
                        return None;
                    }
                }
                SegmentPattern::Param(name) => {
                    params.insert(name.clone(), segment.clone());
                }
                SegmentPattern::Wildcard => break,
            }
        }
        Some(params)
    }

    /// Lower ranks are more specific: exact beats parameterised beats
    /// wildcard.
    fn class_rank(&self) -> u8 {
        if self.has_wildcard {
            2
        } else if self.param_count > 0 {
            1
        } else {
            0
        }
    }
}

struct RouteEntry {
    pattern: RoutePattern,
    handler: Handler,
    metadata: RouteMetadata,
    registration_index: usize,
}

/// Snapshot of one registered route, for introspection.
#[derive(Clone, Debug, Serialize)]
pub struct RouteInfo {
    pub pattern: String,
    pub kind: RouteKind,
}

/// The result of a successful match: the handler plus captured params.
pub struct RouteMatch {
    pub handler: Handler,
    pub params: PathParams,
    pub pattern: String,
    pub kind: RouteKind,
}

/// Matches scheme-less route paths against registered patterns.
///
/// Registration order is preserved, but matches tie-break on specificity
/// first: an exact pattern wins over a parameterised one, a parameterised
/// one over a wildcard, and within a class more literal segments win. Only
/// when two patterns are equally specific does earlier registration decide.
pub struct Router {
    routes: RwLock<Vec<RouteEntry>>,
    next_index: std::sync::atomic::AtomicUsize,
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(Vec::new()),
            next_index: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Register `(pattern, handler, metadata)`. The pattern is validated
    /// here; malformed patterns never enter the table.
    pub fn register(
        &self,
        pattern: &str,
        handler: Handler,
        metadata: RouteMetadata,
    ) -> Result<(), KernelError> {
        let pattern = RoutePattern::parse(pattern)?;
        let registration_index = self
            .next_index
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.routes
            .write()
            .expect("router table poisoned")
            .push(RouteEntry {
                pattern,
                handler,
                metadata,
                registration_index,
            });
        Ok(())
    }

    /// Remove all routes registered under exactly this pattern text.
    /// Returns whether anything was removed.
    pub fn unregister(&self, pattern: &str) -> bool {
        let normalised = pattern.trim_end_matches('/');
        let mut routes = self.routes.write().expect("router table poisoned");
        let before = routes.len();
        routes.retain(|entry| entry.pattern.raw != normalised);
        routes.len() != before
    }

    /// Match a message path (scheme already stripped by [`MessagePath`])
    /// against the table.
    pub fn match_path(&self, path: &MessagePath) -> Option<RouteMatch> {
        self.match_segments(path.segments())
    }

    /// Match a scheme-less route string such as `layers/42`.
    pub fn match_route(&self, route: &str) -> Option<RouteMatch> {
        let segments: Vec<String> = route
            .trim_end_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        self.match_segments(&segments)
    }

    fn match_segments(&self, segments: &[String]) -> Option<RouteMatch> {
        let routes = self.routes.read().expect("router table poisoned");
        let mut best: Option<(&RouteEntry, PathParams)> = None;
        for entry in routes.iter() {
            let Some(params) = entry.pattern.matches(segments) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some((current, _)) => {
                    let lhs = (
                        entry.pattern.class_rank(),
                        usize::MAX - entry.pattern.literal_count,
                        entry.registration_index,
                    );
                    let rhs = (
                        current.pattern.class_rank(),
                        usize::MAX - current.pattern.literal_count,
                        current.registration_index,
                    );
                    lhs < rhs
                }
            };
            if better {
                best = Some((entry, params));
            }
        }
        best.map(|(entry, params)| RouteMatch {
            handler: Arc::clone(&entry.handler),
            params,
            pattern: entry.pattern.raw.clone(),
            kind: entry.metadata.kind,
        })
    }

    /// Snapshot of all registered routes, in registration order.
    pub fn routes(&self) -> Vec<RouteInfo> {
        self.routes
            .read()
            .expect("router table poisoned")
            .iter()
            .map(|entry| RouteInfo {
                pattern: entry.pattern.raw.clone(),
                kind: entry.metadata.kind,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.routes.read().expect("router table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::{CreateOptions, MessageFactory};
    use serde_json::json;

    fn noop() -> Handler {
        handler(|_msg, _params, _opts| async { Ok(Value::Null) })
    }

    fn tagged(tag: &'static str) -> Handler {
        handler(move |_msg, params, _opts| async move {
            Ok(json!({"tag": tag, "params": params}))
        })
    }

    async fn invoke(m: RouteMatch) -> Value {
        let factory = MessageFactory::new();
        let msg = factory
            .create("t://x", Value::Null, CreateOptions::default())
            .unwrap();
        (m.handler)(msg, m.params, DispatchOptions::default())
            .await
            .unwrap()
    }

    #[test]
    fn literal_match() {
        let router = Router::new();
        router
            .register("layers/list", noop(), RouteMetadata::default())
            .unwrap();
        assert!(router.match_route("layers/list").is_some());
        assert!(router.match_route("layers/other").is_none());
    }

    #[tokio::test]
    async fn params_are_captured() {
        let router = Router::new();
        router
            .register("layers/{id}", tagged("param"), RouteMetadata::default())
            .unwrap();
        let m = router.match_route("layers/42").unwrap();
        assert_eq!(m.params.get("id").map(String::as_str), Some("42"));
        let out = invoke(m).await;
        assert_eq!(out["params"]["id"], "42");
    }

    #[test]
    fn exact_beats_parameterised() {
        let router = Router::new();
        router
            .register("layers/{id}", tagged("param"), RouteMetadata::default())
            .unwrap();
        router
            .register("layers/special", tagged("exact"), RouteMetadata::default())
            .unwrap();
        let m = router.match_route("layers/special").unwrap();
        assert_eq!(m.pattern, "layers/special");
    }

    #[test]
    fn parameterised_beats_wildcard() {
        let router = Router::new();
        router.register("*", tagged("wild"), RouteMetadata::default()).unwrap();
        router
            .register("items/{id}", tagged("param"), RouteMetadata::default())
            .unwrap();
        let m = router.match_route("items/7").unwrap();
        assert_eq!(m.pattern, "items/{id}");
    }

    #[test]
    fn more_literals_win_within_class() {
        let router = Router::new();
        router
            .register("a/{x}/{y}", tagged("one-literal"), RouteMetadata::default())
            .unwrap();
        router
            .register("a/b/{y}", tagged("two-literals"), RouteMetadata::default())
            .unwrap();
        let m = router.match_route("a/b/c").unwrap();
        assert_eq!(m.pattern, "a/b/{y}");
    }

    #[test]
    fn registration_order_breaks_final_ties() {
        let router = Router::new();
        router
            .register("a/{x}", tagged("first"), RouteMetadata::default())
            .unwrap();
        router
            .register("a/{y}", tagged("second"), RouteMetadata::default())
            .unwrap();
        let m = router.match_route("a/z").unwrap();
        assert_eq!(m.pattern, "a/{x}");
    }

    #[test]
    fn wildcard_matches_tail() {
        let router = Router::new();
        router
            .register("files/*", noop(), RouteMetadata::default())
            .unwrap();
        assert!(router.match_route("files/a").is_some());
        assert!(router.match_route("files/a/b/c").is_some());
        assert!(router.match_route("files").is_none());
    }

    #[test]
    fn unregister_by_exact_pattern() {
        let router = Router::new();
        router
            .register("layers/{id}", noop(), RouteMetadata::default())
            .unwrap();
        assert!(!router.unregister("layers/{other}"));
        assert!(router.unregister("layers/{id}"));
        assert!(router.match_route("layers/42").is_none());
    }

    #[test]
    fn malformed_patterns_are_rejected() {
        let router = Router::new();
        assert!(router.register("", noop(), RouteMetadata::default()).is_err());
        assert!(router
            .register("a//b", noop(), RouteMetadata::default())
            .is_err());
        assert!(router
            .register("a/*/b", noop(), RouteMetadata::default())
            .is_err());
        assert!(router
            .register("a/{bad", noop(), RouteMetadata::default())
            .is_err());
        assert!(router
            .register("a/{}", noop(), RouteMetadata::default())
            .is_err());
    }

    #[test]
    fn trailing_slash_is_normalised() {
        let router = Router::new();
        router
            .register("layers/list/", noop(), RouteMetadata::default())
            .unwrap();
        assert!(router.match_route("layers/list").is_some());
        assert!(router.match_route("layers/list/").is_some());
    }

    #[test]
    fn routes_snapshot_reports_kind() {
        let router = Router::new();
        router
            .register(
                "query/layers",
                noop(),
                RouteMetadata::of_kind(RouteKind::Query),
            )
            .unwrap();
        let routes = router.routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].kind, RouteKind::Query);
    }

    #[test]
    fn match_path_uses_segments() {
        let router = Router::new();
        router
            .register("layers/{id}", noop(), RouteMetadata::default())
            .unwrap();
        let path = MessagePath::parse("canvas://layers/42").unwrap();
        let m = router.match_path(&path).unwrap();
        assert_eq!(m.params.get("id").map(String::as_str), Some("42"));
    }
}
