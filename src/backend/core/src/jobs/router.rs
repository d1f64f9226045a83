//! Queue routing by task type name.
//!
//! Rules are glob patterns over type names, e.g. `tts.*` or `media.extract_*`.
//! `*` matches any run of characters, dots included. Rules are tried in order
//! and the first match decides the queue; unmatched names go to the default
//! queue.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{Result, VisionaryError};

/// A static routing rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Glob over task type names
    pub pattern: String,
    /// Queue receiving matching tasks
    pub queue: String,
}

impl RoutingRule {
    pub fn new(pattern: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            queue: queue.into(),
        }
    }
}

#[derive(Debug)]
struct CompiledRule {
    matcher: Regex,
    queue: String,
}

/// Ordered, immutable set of routing rules.
#[derive(Debug)]
pub struct QueueRouter {
    rules: Vec<CompiledRule>,
    default_queue: String,
}

impl QueueRouter {
    /// Compile `rules`; fails on empty patterns or targets.
    pub fn new(rules: &[RoutingRule], default_queue: impl Into<String>) -> Result<Self> {
        let default_queue = default_queue.into();
        if default_queue.trim().is_empty() {
            return Err(VisionaryError::invalid_routing_rule("<default>", "default queue is empty"));
        }

        let rules = rules
            .iter()
            .map(|rule| {
                if rule.pattern.trim().is_empty() {
                    return Err(VisionaryError::invalid_routing_rule(&rule.pattern, "pattern is empty"));
                }
                if rule.queue.trim().is_empty() {
                    return Err(VisionaryError::invalid_routing_rule(&rule.pattern, "target queue is empty"));
                }
                Ok(CompiledRule {
                    matcher: glob_to_regex(&rule.pattern)?,
                    queue: rule.queue.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { rules, default_queue })
    }

    /// Queue for `type_name`. Pure: the answer never changes for a router.
    pub fn route(&self, type_name: &str) -> &str {
        self.rules
            .iter()
            .find(|rule| rule.matcher.is_match(type_name))
            .map(|rule| rule.queue.as_str())
            .unwrap_or(&self.default_queue)
    }

    pub fn default_queue(&self) -> &str {
        &self.default_queue
    }

    /// Every queue a job can be routed to, sorted.
    pub fn queues(&self) -> Vec<String> {
        let mut set: BTreeSet<&str> = self.rules.iter().map(|r| r.queue.as_str()).collect();
        set.insert(&self.default_queue);
        set.into_iter().map(str::to_string).collect()
    }
}

fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{}$", body))
        .map_err(|e| VisionaryError::invalid_routing_rule(pattern, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> QueueRouter {
        QueueRouter::new(
            &[
                RoutingRule::new("tts.*", "tts"),
                RoutingRule::new("knowledge.*", "knowledge"),
                RoutingRule::new("media.*", "media"),
                RoutingRule::new("study.*", "study"),
            ],
            "default",
        )
        .unwrap()
    }

    #[test]
    fn test_prefix_routes() {
        let router = router();
        assert_eq!(router.route("tts.generate"), "tts");
        assert_eq!(router.route("media.process_upload"), "media");
        assert_eq!(router.route("knowledge.update_statistics"), "knowledge");
        assert_eq!(router.route("study.flashcards.build"), "study");
    }

    #[test]
    fn test_unmatched_goes_to_default() {
        let router = router();
        assert_eq!(router.route("system.health_check"), "default");
        assert_eq!(router.route("tts"), "default");
        assert_eq!(router.route("xtts.generate"), "default");
    }

    #[test]
    fn test_first_match_wins() {
        let router = QueueRouter::new(
            &[
                RoutingRule::new("media.extract_*", "extraction"),
                RoutingRule::new("media.*", "media"),
            ],
            "default",
        )
        .unwrap();
        assert_eq!(router.route("media.extract_metadata"), "extraction");
        assert_eq!(router.route("media.process_upload"), "media");
    }

    #[test]
    fn test_dots_are_literal() {
        let router = QueueRouter::new(&[RoutingRule::new("a.b", "q")], "default").unwrap();
        assert_eq!(router.route("a.b"), "q");
        assert_eq!(router.route("axb"), "default");
    }

    #[test]
    fn test_routing_is_stable() {
        let router = router();
        let first = router.route("tts.generate").to_string();
        for _ in 0..100 {
            assert_eq!(router.route("tts.generate"), first);
        }
    }

    #[test]
    fn test_queues_include_default() {
        assert_eq!(
            router().queues(),
            vec!["default", "knowledge", "media", "study", "tts"]
        );
    }

    #[test]
    fn test_invalid_rules_rejected() {
        assert!(QueueRouter::new(&[RoutingRule::new("", "q")], "default").is_err());
        assert!(QueueRouter::new(&[RoutingRule::new("a.*", " ")], "default").is_err());
        assert!(QueueRouter::new(&[], "").is_err());
    }
}
