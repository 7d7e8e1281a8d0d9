//! Keyword discovery and token-budgeted provisioning.
//!
//! Discovery is lexical: the lowercased query is compared against each
//! tool's name, description, categories, and capabilities. Provisioning is
//! first-fit under a token budget, preserving relevance order; it is not an
//! optimal knapsack.

use std::sync::Arc;

use toolgate_types::events::{GateEvent, GatingMetrics};
use toolgate_types::tool::ToolDescriptor;
use toolgate_types::traits::EventBus;

use crate::repository::ToolRepository;

/// Score for an exact case-insensitive name match.
const SCORE_EXACT_NAME: u32 = 100;
/// Score for a name substring match.
const SCORE_NAME_SUBSTRING: u32 = 50;
/// Score for a description substring match.
const SCORE_DESCRIPTION: u32 = 25;
/// Score for any category substring match.
const SCORE_CATEGORY: u32 = 10;
/// Score for any capability substring match.
const SCORE_CAPABILITY: u32 = 10;

/// Rank tools against a query, keeping each tool's score.
///
/// Empty or whitespace query yields nothing, as does `limit ≤ 0`. Results
/// sort by score descending, stable on ties (repository insertion order),
/// truncated to `max(0, floor(limit))`.
pub fn discover_scored(
    repo: &ToolRepository,
    query: &str,
    limit: f64,
) -> Vec<(u32, ToolDescriptor)> {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return Vec::new();
    }
    if !(limit > 0.0) {
        return Vec::new();
    }

    let mut scored: Vec<(u32, &ToolDescriptor)> = repo
        .all()
        .iter()
        .filter_map(|tool| {
            let score = score_tool(tool, &query);
            (score > 0).then_some((score, tool))
        })
        .collect();

    // Stable sort keeps insertion order on equal scores.
    scored.sort_by(|a, b| b.0.cmp(&a.0));

    let cap = if limit.is_infinite() {
        usize::MAX
    } else {
        limit.floor() as usize
    };

    scored
        .into_iter()
        .take(cap)
        .map(|(score, tool)| (score, tool.clone()))
        .collect()
}

/// Rank tools against a query. See [`discover_scored`].
pub fn discover(repo: &ToolRepository, query: &str, limit: f64) -> Vec<ToolDescriptor> {
    discover_scored(repo, query, limit)
        .into_iter()
        .map(|(_, tool)| tool)
        .collect()
}

fn score_tool(tool: &ToolDescriptor, query: &str) -> u32 {
    let mut score = 0;
    let name = tool.name.to_lowercase();
    if name == *query {
        score += SCORE_EXACT_NAME;
    } else if name.contains(query) {
        score += SCORE_NAME_SUBSTRING;
    }
    if tool.description.to_lowercase().contains(query) {
        score += SCORE_DESCRIPTION;
    }
    if tool
        .categories
        .iter()
        .any(|c| c.to_lowercase().contains(query))
    {
        score += SCORE_CATEGORY;
    }
    if tool
        .capabilities
        .iter()
        .any(|c| c.to_lowercase().contains(query))
    {
        score += SCORE_CAPABILITY;
    }
    score
}

/// Estimated token cost of a descriptor.
///
/// Always `max(1, ceil(len(JSON(descriptor)) / 4))`. An externally supplied
/// `tokenCount` never enters this math; the estimate must be reproducible
/// within a process.
pub fn estimate_tokens(tool: &ToolDescriptor) -> u64 {
    let encoded_len = serde_json::to_string(tool).map(|s| s.len()).unwrap_or(0) as u64;
    encoded_len.div_ceil(4).max(1)
}

/// First-fit selection under a token budget.
///
/// A non-finite or non-positive budget yields nothing. Tools are taken in
/// the given order; a tool whose own estimate exceeds the budget is
/// skipped, and iteration continues so a small tool can fill leftover
/// budget after a too-big one.
pub fn provision(tools: Vec<ToolDescriptor>, max_tokens: f64) -> Vec<ToolDescriptor> {
    if !max_tokens.is_finite() || max_tokens <= 0.0 {
        return Vec::new();
    }

    let mut selected = Vec::new();
    let mut used: u64 = 0;
    for tool in tools {
        let estimate = estimate_tokens(&tool);
        if estimate as f64 > max_tokens {
            continue;
        }
        if (used + estimate) as f64 <= max_tokens {
            used += estimate;
            selected.push(tool);
        }
    }
    selected
}

/// Discovery + provisioning over a repository, with metrics emission.
pub struct GatingService {
    events: Arc<dyn EventBus>,
}

impl GatingService {
    /// Create a service publishing metrics on the given bus.
    pub fn new(events: Arc<dyn EventBus>) -> Self {
        Self { events }
    }

    /// Rank tools against a query.
    pub fn discover(&self, repo: &ToolRepository, query: &str, limit: f64) -> Vec<ToolDescriptor> {
        discover(repo, query, limit)
    }

    /// Discover everything matching `query`, then first-fit it under
    /// `max_tokens`. Emits a `gating.metrics` event.
    pub fn provision_query(
        &self,
        repo: &ToolRepository,
        query: &str,
        max_tokens: f64,
    ) -> Vec<ToolDescriptor> {
        let discovered = discover(repo, query, f64::INFINITY);
        let discovered_count = discovered.len();
        let provisioned = provision(discovered, max_tokens);
        let tokens_used: u64 = provisioned.iter().map(estimate_tokens).sum();

        tracing::debug!(
            query = query,
            discovered = discovered_count,
            provisioned = provisioned.len(),
            tokens_used = tokens_used,
            "provisioning complete"
        );
        self.events.publish(GateEvent::GatingMetrics(GatingMetrics {
            tools_discovered: discovered_count,
            tools_provisioned: provisioned.len(),
            tokens_budgeted: max_tokens,
            tokens_used,
        }));

        provisioned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use toolgate_types::events::GateEventKind;
    use toolgate_types::traits::EventHandler;
    use toolgate_types::InMemoryEventBus;

    fn repo_with(tools: Vec<ToolDescriptor>) -> ToolRepository {
        let mut repo = ToolRepository::new();
        for tool in tools {
            repo.add_tool(tool).unwrap();
        }
        repo
    }

    fn tool_with_description(name: &str, description: &str) -> ToolDescriptor {
        ToolDescriptor::new(name, description)
    }

    /// Pad a tool's description until its estimate hits `target` tokens.
    fn tool_with_estimate(name: &str, target: u64) -> ToolDescriptor {
        let mut tool = ToolDescriptor::new(name, "");
        let base = estimate_tokens(&tool);
        assert!(base < target, "base estimate already exceeds target");
        // Each 4 description bytes cost ~1 token.
        tool.description = "y".repeat(((target - base) * 4) as usize);
        let adjusted = estimate_tokens(&tool);
        // Nudge down if rounding overshot.
        if adjusted > target {
            tool.description
                .truncate(tool.description.len() - ((adjusted - target) * 4) as usize);
        }
        assert_eq!(estimate_tokens(&tool), target);
        tool
    }

    // ---- Discovery scoring ----

    #[test]
    fn test_empty_query_short_circuits() {
        let repo = repo_with(vec![tool_with_description("ops/restart", "operations")]);
        assert!(discover(&repo, "", 5.0).is_empty());
        assert!(discover(&repo, "   ", 5.0).is_empty());
    }

    #[test]
    fn test_limit_zero_or_negative_is_empty() {
        let repo = repo_with(vec![tool_with_description("ops/restart", "operations")]);
        assert!(discover(&repo, "ops", 0.0).is_empty());
        assert!(discover(&repo, "ops", -3.0).is_empty());
    }

    #[test]
    fn test_exact_name_outranks_substring() {
        let repo = repo_with(vec![
            tool_with_description("deploy-service", ""),
            tool_with_description("deploy", ""),
        ]);
        let hits = discover(&repo, "Deploy", 10.0);
        assert_eq!(hits[0].name, "deploy");
        assert_eq!(hits[1].name, "deploy-service");
    }

    #[test]
    fn test_description_and_category_scores_accumulate() {
        let mut by_category = tool_with_description("a/one", "nothing");
        by_category.categories = vec!["operations".to_string()];
        let by_description = tool_with_description("b/two", "handles operations daily");
        let mut both = tool_with_description("c/operations-helper", "operations toolkit");
        both.categories = vec!["operations".to_string()];

        let repo = repo_with(vec![by_category, by_description, both]);
        let hits = discover(&repo, "operations", 10.0);

        // both: 50 (name substring) + 25 + 10 = 85; description: 25; category: 10.
        assert_eq!(hits[0].name, "c/operations-helper");
        assert_eq!(hits[1].name, "b/two");
        assert_eq!(hits[2].name, "a/one");
    }

    #[test]
    fn test_capability_only_match_is_discovered() {
        let mut by_capability = tool_with_description("a/one", "nothing relevant");
        by_capability.capabilities = vec!["operations".to_string()];
        let unrelated = tool_with_description("b/two", "nothing relevant");

        let repo = repo_with(vec![by_capability, unrelated]);
        let hits = discover_scored(&repo, "operations", 10.0);

        // The capability match alone keeps the tool in the result.
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 10);
        assert_eq!(hits[0].1.name, "a/one");
    }

    #[test]
    fn test_capability_score_accumulates_with_other_fields() {
        let mut both = tool_with_description("c/operations-helper", "operations toolkit");
        both.categories = vec!["operations".to_string()];
        both.capabilities = vec!["operations-read".to_string()];

        let repo = repo_with(vec![both]);
        let hits = discover_scored(&repo, "operations", 10.0);

        // name substring 50 + description 25 + category 10 + capability 10.
        assert_eq!(hits[0].0, 95);
    }

    #[test]
    fn test_zero_score_excluded_and_ties_stable() {
        let repo = repo_with(vec![
            tool_with_description("x/alpha", "shared term"),
            tool_with_description("x/beta", "shared term"),
            tool_with_description("x/gamma", "unrelated"),
        ]);
        let hits = discover(&repo, "term", 10.0);
        let names: Vec<&str> = hits.iter().map(|t| t.name.as_str()).collect();
        // gamma excluded; alpha before beta (insertion order on tied 25s).
        assert_eq!(names, vec!["x/alpha", "x/beta"]);
    }

    #[test]
    fn test_fractional_limit_floors() {
        let repo = repo_with(vec![
            tool_with_description("t/one", "query"),
            tool_with_description("t/two", "query"),
            tool_with_description("t/three", "query"),
        ]);
        assert_eq!(discover(&repo, "query", 2.9).len(), 2);
    }

    // ---- Token estimation ----

    #[test]
    fn test_estimate_is_ceil_of_quarter_length() {
        let tool = ToolDescriptor::new("t", "");
        let encoded_len = serde_json::to_string(&tool).unwrap().len() as u64;
        assert_eq!(estimate_tokens(&tool), encoded_len.div_ceil(4));
    }

    #[test]
    fn test_estimate_floor_is_one() {
        // No real descriptor encodes under 4 bytes, but the floor is part
        // of the contract.
        let tool = ToolDescriptor::new("t", "");
        assert!(estimate_tokens(&tool) >= 1);
    }

    #[test]
    fn test_estimate_deterministic_within_process() {
        let tool = tool_with_description("fs/read", "reads files");
        assert_eq!(estimate_tokens(&tool), estimate_tokens(&tool));
    }

    #[test]
    fn test_external_token_count_does_not_change_budget_math() {
        let mut tool = tool_with_estimate("t/fixed", 200);
        let without = estimate_tokens(&tool);
        tool.token_count = Some(1.0);
        // The tokenCount field itself lengthens the JSON, so re-derive; the
        // point is that the claimed "1 token" is not believed.
        let with = estimate_tokens(&tool);
        assert!(with >= without);
        assert!(with > 1);
    }

    // ---- Provisioning ----

    #[test]
    fn test_provision_fits_two_excludes_third() {
        let tools = vec![
            tool_with_estimate("tool-a", 300),
            tool_with_estimate("tool-b", 400),
            tool_with_estimate("tool-c", 500),
        ];
        let selected = provision(tools, 700.0);
        let names: Vec<&str> = selected.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["tool-a", "tool-b"]);
        let used: u64 = selected.iter().map(estimate_tokens).sum();
        assert_eq!(used, 700);
    }

    #[test]
    fn test_provision_continues_after_too_big_tool() {
        let tools = vec![
            tool_with_estimate("big", 600),
            tool_with_estimate("small", 100),
        ];
        let selected = provision(tools, 200.0);
        let names: Vec<&str> = selected.iter().map(|t| t.name.as_str()).collect();
        // big alone exceeds the budget and is skipped; small still fits.
        assert_eq!(names, vec!["small"]);
    }

    #[test]
    fn test_provision_budget_never_exceeded() {
        let tools = vec![
            tool_with_estimate("a", 90),
            tool_with_estimate("b", 90),
            tool_with_estimate("c", 90),
        ];
        let selected = provision(tools, 200.0);
        let used: u64 = selected.iter().map(estimate_tokens).sum();
        assert!(used <= 200);
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn test_provision_rejects_bad_budgets() {
        let tools = vec![tool_with_estimate("a", 50)];
        assert!(provision(tools.clone(), 0.0).is_empty());
        assert!(provision(tools.clone(), -10.0).is_empty());
        assert!(provision(tools.clone(), f64::NAN).is_empty());
        assert!(provision(tools, f64::INFINITY).is_empty());
    }

    // ---- GatingService ----

    struct MetricsCapture {
        records: Mutex<Vec<GatingMetrics>>,
    }

    impl EventHandler for MetricsCapture {
        fn on_event(&self, event: &GateEvent) {
            if let GateEvent::GatingMetrics(metrics) = event {
                self.records.lock().unwrap().push(metrics.clone());
            }
        }
    }

    #[test]
    fn test_provision_query_emits_metrics() {
        let bus = Arc::new(InMemoryEventBus::new());
        let capture = Arc::new(MetricsCapture {
            records: Mutex::new(Vec::new()),
        });
        bus.subscribe(GateEventKind::GatingMetrics, capture.clone());

        let repo = repo_with(vec![
            {
                let mut t = tool_with_estimate("ops/restart", 300);
                t.description = format!("operations {}", t.description);
                t
            },
            {
                let mut t = tool_with_estimate("ops/scale", 400);
                t.description = format!("operations {}", t.description);
                t
            },
        ]);

        let service = GatingService::new(bus);
        let selected = service.provision_query(&repo, "operations", 500.0);

        let records = capture.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tools_discovered, 2);
        assert_eq!(records[0].tools_provisioned, selected.len());
        assert_eq!(records[0].tokens_budgeted, 500.0);
        assert!(records[0].tokens_used as f64 <= 500.0);
    }
}
