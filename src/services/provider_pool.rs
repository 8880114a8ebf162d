//! Provider selection and runtime state.
//!
//! The pool ranks candidates for a model and tracks per-provider failure
//! state. Selection filters out disabled and cooling providers, groups the
//! rest by priority (descending) and shuffles uniformly within each group on
//! every call so equal-priority upstreams share load. Cooldown bookkeeping is
//! advisory: reads may race updates, a stale read just defers eligibility by
//! one request.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use rand::seq::SliceRandom;
use regex::Regex;
use std::sync::Arc;

use crate::core::config::{AppConfig, ModelEntry, ProviderConfig};

/// Outcome of matching a requested model against a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelMatch {
    /// Model name to send upstream.
    pub effective_model: String,
    /// True when an alias mapping applies and the request body's `model`
    /// field must be rewritten.
    pub rewritten: bool,
}

/// One compiled entry from a provider's `model` list.
#[derive(Debug, Clone)]
enum ModelMatcher {
    Pattern { regex: Regex },
    Alias { regex: Regex, upstream: String },
}

/// A provider from the active snapshot with its matchers precompiled.
#[derive(Debug, Clone)]
pub struct ProviderSpec {
    pub config: ProviderConfig,
    matchers: Vec<ModelMatcher>,
}

impl ProviderSpec {
    fn compile(config: ProviderConfig) -> Self {
        let matchers = config
            .models
            .iter()
            .filter_map(|entry| match entry {
                ModelEntry::Pattern(pattern) => {
                    wildcard_regex(pattern).map(|regex| ModelMatcher::Pattern { regex })
                }
                ModelEntry::Alias(map) => map.iter().next().and_then(|(alias, upstream)| {
                    wildcard_regex(alias).map(|regex| ModelMatcher::Alias {
                        regex,
                        upstream: upstream.clone(),
                    })
                }),
            })
            .collect();
        Self { config, matchers }
    }

    /// Whether this provider relies on upstream model discovery.
    pub fn needs_discovery(&self) -> bool {
        self.matchers.is_empty()
    }

    /// Match `requested` against the explicit list first (in listed order),
    /// then against the discovered list when no explicit entries exist.
    pub fn match_model(&self, requested: &str, discovered: Option<&[String]>) -> Option<ModelMatch> {
        for matcher in &self.matchers {
            match matcher {
                ModelMatcher::Pattern { regex } if regex.is_match(requested) => {
                    return Some(ModelMatch {
                        effective_model: requested.to_string(),
                        rewritten: false,
                    });
                }
                ModelMatcher::Alias { regex, upstream } if regex.is_match(requested) => {
                    return Some(ModelMatch {
                        effective_model: upstream.clone(),
                        rewritten: upstream != requested,
                    });
                }
                _ => {}
            }
        }
        if self.matchers.is_empty() {
            if discovered?.iter().any(|m| m == requested) {
                return Some(ModelMatch {
                    effective_model: requested.to_string(),
                    rewritten: false,
                });
            }
        }
        None
    }
}

/// Compile a `*`/`?` wildcard into an anchored, case-sensitive regex.
fn wildcard_regex(pattern: &str) -> Option<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).ok()
}

/// Volatile per-provider runtime record.
#[derive(Debug, Clone, Default)]
pub struct ProviderRuntime {
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_latency_ms: Option<u64>,
    pub last_checked_at: Option<DateTime<Utc>>,
    /// `None` until discovery ran; `Some(vec![])` after a failed or empty
    /// discovery (the cache stays empty rather than refetching per request).
    pub discovered_models: Option<Vec<String>>,
}

impl ProviderRuntime {
    pub fn is_on_cooldown(&self, now: DateTime<Utc>) -> bool {
        matches!(self.cooldown_until, Some(until) if now < until)
    }

    /// Remaining cooldown in whole seconds, zero when not cooling.
    pub fn cooldown_remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        self.cooldown_until
            .map(|until| (until - now).num_seconds().max(0))
            .unwrap_or(0)
    }
}

/// Ranks and hands out candidates for a model; tracks failures.
pub struct ProviderPool {
    specs: arc_swap::ArcSwap<Vec<Arc<ProviderSpec>>>,
    runtime: DashMap<String, ProviderRuntime>,
    cooldown_period: arc_swap::ArcSwap<f64>,
}

impl ProviderPool {
    pub fn new(config: &AppConfig) -> Self {
        let pool = Self {
            specs: arc_swap::ArcSwap::from_pointee(Vec::new()),
            runtime: DashMap::new(),
            cooldown_period: arc_swap::ArcSwap::from_pointee(config.preferences.cooldown_period),
        };
        pool.rebuild(config);
        pool
    }

    /// Recompile lookup tables from a new snapshot. Runtime records survive
    /// for providers whose configuration entry is unchanged; records for
    /// changed or removed providers are dropped (cooldown and discovered
    /// models included).
    pub fn rebuild(&self, config: &AppConfig) {
        let previous = self.specs.load_full();
        let specs: Vec<Arc<ProviderSpec>> = config
            .providers
            .iter()
            .cloned()
            .map(|p| Arc::new(ProviderSpec::compile(p)))
            .collect();

        self.runtime.retain(|name, _| {
            let old = previous.iter().find(|s| &s.config.name == name);
            let new = specs.iter().find(|s| &s.config.name == name);
            matches!((old, new), (Some(old), Some(new)) if old.config == new.config)
        });

        self.cooldown_period
            .store(Arc::new(config.preferences.cooldown_period));
        self.specs.store(Arc::new(specs));
    }

    /// All providers from the active snapshot, configuration order.
    pub fn specs(&self) -> Arc<Vec<Arc<ProviderSpec>>> {
        self.specs.load_full()
    }

    /// Ordered candidates for `model`: eligible (enabled, not cooling) and
    /// supporting providers, priority tiers descending, shuffled within each
    /// tier on every call.
    pub fn candidates(&self, model: &str) -> Vec<Arc<ProviderSpec>> {
        let now = Utc::now();
        let specs = self.specs.load();
        let mut available: Vec<Arc<ProviderSpec>> = specs
            .iter()
            .filter(|spec| spec.config.enabled)
            .filter(|spec| !self.is_on_cooldown(&spec.config.name, now))
            .filter(|spec| self.supports(spec, model))
            .cloned()
            .collect();

        available.sort_by_key(|spec| std::cmp::Reverse(spec.config.priority));

        let mut rng = rand::thread_rng();
        let mut start = 0;
        while start < available.len() {
            let priority = available[start].config.priority;
            let mut end = start;
            while end < available.len() && available[end].config.priority == priority {
                end += 1;
            }
            available[start..end].shuffle(&mut rng);
            start = end;
        }
        available
    }

    fn supports(&self, spec: &ProviderSpec, model: &str) -> bool {
        let discovered = self
            .runtime
            .get(&spec.config.name)
            .and_then(|r| r.discovered_models.clone());
        spec.match_model(model, discovered.as_deref()).is_some()
    }

    /// Match `model` against a specific provider, using cached discovery.
    pub fn match_model(&self, spec: &ProviderSpec, model: &str) -> Option<ModelMatch> {
        let discovered = self
            .runtime
            .get(&spec.config.name)
            .and_then(|r| r.discovered_models.clone());
        spec.match_model(model, discovered.as_deref())
    }

    fn is_on_cooldown(&self, name: &str, now: DateTime<Utc>) -> bool {
        self.runtime
            .get(name)
            .map(|r| r.is_on_cooldown(now))
            .unwrap_or(false)
    }

    /// Record a successful attempt: clears cooldown and last error, stores
    /// the observed latency.
    pub fn mark_success(&self, name: &str, latency_ms: u64) {
        let mut entry = self
            .runtime
            .entry(name.to_string())
            .or_insert_with(ProviderRuntime::default);
        entry.cooldown_until = None;
        entry.last_error = None;
        entry.last_latency_ms = Some(latency_ms);
        entry.last_checked_at = Some(Utc::now());
    }

    /// Record a failed attempt: starts (or extends, never shortens) the
    /// cooldown window and remembers the reason. A zero cooldown period
    /// disables the window entirely.
    pub fn mark_failure(&self, name: &str, reason: &str) {
        let period = **self.cooldown_period.load();
        let mut entry = self
            .runtime
            .entry(name.to_string())
            .or_insert_with(ProviderRuntime::default);
        entry.last_error = Some(reason.to_string());
        entry.last_checked_at = Some(Utc::now());
        if period <= 0.0 {
            tracing::debug!(provider = name, "Cooldown disabled; failure recorded only");
            return;
        }
        let until = Utc::now() + ChronoDuration::milliseconds((period * 1000.0) as i64);
        if entry.cooldown_until.map_or(true, |existing| until > existing) {
            entry.cooldown_until = Some(until);
        }
        tracing::warn!(
            provider = name,
            cooldown_secs = period,
            reason = reason,
            "Provider entering cooldown"
        );
    }

    /// Clear a provider's cooldown unconditionally.
    pub fn reset(&self, name: &str) {
        if let Some(mut entry) = self.runtime.get_mut(name) {
            entry.cooldown_until = None;
            entry.last_error = None;
        }
    }

    /// Store the result of a discovery fetch.
    pub fn set_discovered_models(&self, name: &str, models: Vec<String>) {
        self.runtime
            .entry(name.to_string())
            .or_insert_with(ProviderRuntime::default)
            .discovered_models = Some(models);
    }

    /// Cached discovery result, `None` when discovery has not run.
    pub fn discovered_models(&self, name: &str) -> Option<Vec<String>> {
        self.runtime.get(name).and_then(|r| r.discovered_models.clone())
    }

    /// Copy of a provider's runtime record.
    pub fn runtime(&self, name: &str) -> Option<ProviderRuntime> {
        self.runtime.get(name).map(|r| r.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::PreferencesConfig;
    use std::collections::BTreeMap;
    use std::collections::HashSet;

    fn provider(name: &str, priority: i64, models: Vec<ModelEntry>) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            base_url: format!("https://{name}.example.com"),
            api_key: format!("key-{name}"),
            priority,
            enabled: true,
            models_endpoint: "/v1/models".to_string(),
            models,
        }
    }

    fn config(providers: Vec<ProviderConfig>, cooldown: f64) -> AppConfig {
        AppConfig {
            api_key: "local".to_string(),
            preferences: PreferencesConfig {
                model_timeout: 20.0,
                cooldown_period: cooldown,
                proxy: None,
            },
            providers,
        }
    }

    fn pattern(p: &str) -> ModelEntry {
        ModelEntry::Pattern(p.to_string())
    }

    fn alias(a: &str, upstream: &str) -> ModelEntry {
        ModelEntry::Alias(BTreeMap::from([(a.to_string(), upstream.to_string())]))
    }

    #[test]
    fn test_wildcard_matching() {
        let spec = ProviderSpec::compile(provider(
            "p",
            0,
            vec![pattern("gpt-4*"), pattern("claude-?-sonnet")],
        ));
        assert!(spec.match_model("gpt-4", None).is_some());
        assert!(spec.match_model("gpt-4-turbo", None).is_some());
        assert!(spec.match_model("gpt-3.5", None).is_none());
        assert!(spec.match_model("claude-3-sonnet", None).is_some());
        assert!(spec.match_model("claude-35-sonnet", None).is_none());
        // Case-sensitive.
        assert!(spec.match_model("GPT-4", None).is_none());
    }

    #[test]
    fn test_wildcard_escapes_regex_metacharacters() {
        let spec = ProviderSpec::compile(provider("p", 0, vec![pattern("gpt-3.5-turbo")]));
        assert!(spec.match_model("gpt-3.5-turbo", None).is_some());
        assert!(spec.match_model("gpt-3x5-turbo", None).is_none());
    }

    #[test]
    fn test_alias_match_rewrites() {
        let spec = ProviderSpec::compile(provider(
            "p",
            0,
            vec![alias("my-claude", "claude-3-5-sonnet")],
        ));
        let matched = spec.match_model("my-claude", None).unwrap();
        assert_eq!(matched.effective_model, "claude-3-5-sonnet");
        assert!(matched.rewritten);
        assert!(spec.match_model("claude-3-5-sonnet", None).is_none());
    }

    #[test]
    fn test_explicit_list_beats_discovery() {
        let spec = ProviderSpec::compile(provider("p", 0, vec![pattern("gpt-4")]));
        let discovered = vec!["other-model".to_string()];
        // Discovery is only consulted when the explicit list is empty.
        assert!(spec.match_model("other-model", Some(&discovered)).is_none());
    }

    #[test]
    fn test_discovery_match_when_list_empty() {
        let spec = ProviderSpec::compile(provider("p", 0, vec![]));
        let discovered = vec!["gpt-4".to_string()];
        assert!(spec.match_model("gpt-4", Some(&discovered)).is_some());
        assert!(spec.match_model("gpt-5", Some(&discovered)).is_none());
        assert!(spec.match_model("gpt-4", None).is_none());
    }

    #[test]
    fn test_candidates_filter_and_order() {
        let pool = ProviderPool::new(&config(
            vec![
                provider("low", 1, vec![pattern("gpt-4")]),
                provider("high", 10, vec![pattern("gpt-4")]),
                provider("other", 99, vec![pattern("claude-*")]),
            ],
            300.0,
        ));
        let candidates = pool.candidates("gpt-4");
        let names: Vec<&str> = candidates.iter().map(|c| c.config.name.as_str()).collect();
        assert_eq!(names, vec!["high", "low"]);
    }

    #[test]
    fn test_candidates_exclude_disabled() {
        let mut disabled = provider("off", 10, vec![pattern("gpt-4")]);
        disabled.enabled = false;
        let pool = ProviderPool::new(&config(
            vec![disabled, provider("on", 1, vec![pattern("gpt-4")])],
            300.0,
        ));
        let names: Vec<String> = pool
            .candidates("gpt-4")
            .iter()
            .map(|c| c.config.name.clone())
            .collect();
        assert_eq!(names, vec!["on"]);
    }

    #[test]
    fn test_candidates_exclude_cooling() {
        let pool = ProviderPool::new(&config(
            vec![
                provider("a", 10, vec![pattern("gpt-4")]),
                provider("b", 5, vec![pattern("gpt-4")]),
            ],
            300.0,
        ));
        pool.mark_failure("a", "HTTP 500");
        let names: Vec<String> = pool
            .candidates("gpt-4")
            .iter()
            .map(|c| c.config.name.clone())
            .collect();
        assert_eq!(names, vec!["b"]);
    }

    #[test]
    fn test_equal_priority_shuffles() {
        let pool = ProviderPool::new(&config(
            vec![
                provider("a", 5, vec![pattern("gpt-4")]),
                provider("b", 5, vec![pattern("gpt-4")]),
                provider("c", 5, vec![pattern("gpt-4")]),
            ],
            300.0,
        ));
        let mut seen_first: HashSet<String> = HashSet::new();
        for _ in 0..200 {
            let candidates = pool.candidates("gpt-4");
            assert_eq!(candidates.len(), 3);
            seen_first.insert(candidates[0].config.name.clone());
        }
        // Uniform shuffling makes all three leaders appear over 200 draws.
        assert_eq!(seen_first.len(), 3);
    }

    #[test]
    fn test_shuffle_stays_within_tier() {
        let pool = ProviderPool::new(&config(
            vec![
                provider("t1-a", 10, vec![pattern("m")]),
                provider("t1-b", 10, vec![pattern("m")]),
                provider("t2-a", 1, vec![pattern("m")]),
            ],
            300.0,
        ));
        for _ in 0..50 {
            let candidates = pool.candidates("m");
            assert!(candidates[0].config.name.starts_with("t1-"));
            assert!(candidates[1].config.name.starts_with("t1-"));
            assert_eq!(candidates[2].config.name, "t2-a");
        }
    }

    #[test]
    fn test_mark_failure_sets_cooldown() {
        let pool = ProviderPool::new(&config(vec![provider("p", 0, vec![])], 300.0));
        pool.mark_failure("p", "HTTP 503");
        let runtime = pool.runtime("p").unwrap();
        assert!(runtime.is_on_cooldown(Utc::now()));
        assert_eq!(runtime.last_error.as_deref(), Some("HTTP 503"));
        assert!(runtime.cooldown_remaining_secs(Utc::now()) > 290);
    }

    #[test]
    fn test_cooldown_disabled_when_period_zero() {
        let pool = ProviderPool::new(&config(vec![provider("p", 0, vec![])], 0.0));
        pool.mark_failure("p", "HTTP 503");
        let runtime = pool.runtime("p").unwrap();
        assert!(!runtime.is_on_cooldown(Utc::now()));
        assert_eq!(runtime.last_error.as_deref(), Some("HTTP 503"));
    }

    #[test]
    fn test_cooldown_is_monotonic() {
        let pool = ProviderPool::new(&config(vec![provider("p", 0, vec![])], 300.0));
        pool.mark_failure("p", "first");
        let first = pool.runtime("p").unwrap().cooldown_until.unwrap();
        pool.mark_failure("p", "second");
        let second = pool.runtime("p").unwrap().cooldown_until.unwrap();
        assert!(second >= first);
    }

    #[test]
    fn test_mark_success_clears_cooldown() {
        let pool = ProviderPool::new(&config(vec![provider("p", 0, vec![])], 300.0));
        pool.mark_failure("p", "HTTP 500");
        pool.mark_success("p", 120);
        let runtime = pool.runtime("p").unwrap();
        assert!(runtime.cooldown_until.is_none());
        assert!(runtime.last_error.is_none());
        assert_eq!(runtime.last_latency_ms, Some(120));
        assert!(runtime.last_checked_at.is_some());
    }

    #[test]
    fn test_reset_clears_cooldown() {
        let pool = ProviderPool::new(&config(vec![provider("p", 0, vec![])], 300.0));
        pool.mark_failure("p", "HTTP 500");
        pool.reset("p");
        assert!(!pool.runtime("p").unwrap().is_on_cooldown(Utc::now()));
    }

    #[test]
    fn test_rebuild_keeps_runtime_for_unchanged_providers() {
        let initial = config(
            vec![
                provider("stable", 0, vec![pattern("m")]),
                provider("changing", 0, vec![pattern("m")]),
            ],
            300.0,
        );
        let pool = ProviderPool::new(&initial);
        pool.mark_failure("stable", "HTTP 500");
        pool.set_discovered_models("changing", vec!["m".to_string()]);

        let mut updated = initial.clone();
        updated.providers[1].base_url = "https://moved.example.com".to_string();
        pool.rebuild(&updated);

        // Unchanged provider keeps its cooldown; the changed one starts fresh.
        assert!(pool.runtime("stable").unwrap().is_on_cooldown(Utc::now()));
        assert!(pool.runtime("changing").is_none());
    }

    #[test]
    fn test_rebuild_drops_removed_providers() {
        let initial = config(vec![provider("gone", 0, vec![pattern("m")])], 300.0);
        let pool = ProviderPool::new(&initial);
        pool.mark_failure("gone", "HTTP 500");

        let updated = config(vec![provider("new", 0, vec![pattern("m")])], 300.0);
        pool.rebuild(&updated);
        assert!(pool.runtime("gone").is_none());
    }
}
