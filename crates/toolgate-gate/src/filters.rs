//! Ordered filter chain over a tool view.
//!
//! A filter is a pure mapping from an ordered tool list to another ordered
//! tool list. Three concrete filters apply in a fixed order: task type,
//! resource cap, security blocklist. The chain never mutates its input and
//! is idempotent on fixed input.

use std::collections::HashSet;

use toolgate_types::config::FilterConfig;
use toolgate_types::tool::ToolDescriptor;

/// Per-request context the filters consult.
#[derive(Debug, Clone, Default)]
pub struct FilterContext {
    /// Task type declared by the session, if any.
    pub task_type: Option<String>,
}

/// A pure view filter.
trait ToolFilter: Send + Sync {
    fn apply(&self, tools: Vec<ToolDescriptor>, ctx: &FilterContext) -> Vec<ToolDescriptor>;
}

/// Intersects the view with the allowed names for the context's task type.
///
/// A missing task type or a task type without a map entry passes the input
/// through unchanged. Input iteration order is preserved.
struct TaskTypeFilter {
    map: std::collections::HashMap<String, Vec<String>>,
}

impl ToolFilter for TaskTypeFilter {
    fn apply(&self, tools: Vec<ToolDescriptor>, ctx: &FilterContext) -> Vec<ToolDescriptor> {
        let Some(task_type) = &ctx.task_type else {
            return tools;
        };
        let Some(allowed) = self.map.get(task_type) else {
            return tools;
        };
        let allowed: HashSet<&str> = allowed.iter().map(String::as_str).collect();
        tools
            .into_iter()
            .filter(|tool| allowed.contains(tool.name.as_str()))
            .collect()
    }
}

/// Truncates the view to the first `max_tools` entries.
///
/// A configured value ≤ 0 drops everything; the filter is simply absent
/// when no limit is configured.
struct ResourceFilter {
    max_tools: i64,
}

impl ToolFilter for ResourceFilter {
    fn apply(&self, tools: Vec<ToolDescriptor>, _ctx: &FilterContext) -> Vec<ToolDescriptor> {
        if self.max_tools <= 0 {
            return Vec::new();
        }
        let cap = self.max_tools as usize;
        tools.into_iter().take(cap).collect()
    }
}

/// Removes tools whose name is on the blocklist.
struct SecurityFilter {
    blocked: HashSet<String>,
}

impl ToolFilter for SecurityFilter {
    fn apply(&self, tools: Vec<ToolDescriptor>, _ctx: &FilterContext) -> Vec<ToolDescriptor> {
        tools
            .into_iter()
            .filter(|tool| !self.blocked.contains(&tool.name))
            .collect()
    }
}

/// The configured chain, applied in fixed order:
/// task type → resource → security.
pub struct FilterChain {
    filters: Vec<Box<dyn ToolFilter>>,
}

impl FilterChain {
    /// Build the chain from a filter configuration. Disabled sections do
    /// not participate.
    pub fn from_config(config: &FilterConfig) -> Self {
        let mut filters: Vec<Box<dyn ToolFilter>> = Vec::new();
        if config.task_type.enabled {
            filters.push(Box::new(TaskTypeFilter {
                map: config.task_type.map.clone(),
            }));
        }
        if config.resource.enabled {
            if let Some(max_tools) = config.resource.max_tools {
                filters.push(Box::new(ResourceFilter { max_tools }));
            }
        }
        if config.security.enabled {
            filters.push(Box::new(SecurityFilter {
                blocked: config.security.blocked.iter().cloned().collect(),
            }));
        }
        Self { filters }
    }

    /// An empty chain (identity).
    pub fn identity() -> Self {
        Self {
            filters: Vec::new(),
        }
    }

    /// Run the chain over an ordered view.
    pub fn apply(&self, tools: Vec<ToolDescriptor>, ctx: &FilterContext) -> Vec<ToolDescriptor> {
        self.filters
            .iter()
            .fold(tools, |view, filter| filter.apply(view, ctx))
    }
}
