//! Tool repository.
//!
//! In-memory store of every known tool descriptor with three indexes:
//! by name, by category, and by capability. Insertion order is preserved
//! so discovery scoring can break ties deterministically.

use std::collections::{HashMap, HashSet};

use toolgate_types::errors::GateError;
use toolgate_types::tool::ToolDescriptor;

/// Search criteria applied with intersection semantics.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Case-sensitive substring of the tool name.
    pub name: Option<String>,
    /// Exact category match.
    pub category: Option<String>,
    /// Exact capability match.
    pub capability: Option<String>,
    /// Include deprecated tools in the result.
    pub include_deprecated: bool,
}

/// Indexed, insertion-ordered store of tool descriptors.
///
/// Duplicate names overwrite the prior descriptor in place (the original
/// position is kept) and the secondary indexes are updated.
#[derive(Default)]
pub struct ToolRepository {
    /// Descriptors in insertion order.
    tools: Vec<ToolDescriptor>,
    /// name → slot in `tools`.
    by_name: HashMap<String, usize>,
    /// category → names.
    by_category: HashMap<String, HashSet<String>>,
    /// capability → names.
    by_capability: HashMap<String, HashSet<String>>,
}

impl ToolRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored descriptors.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// True when the repository holds no descriptors.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Add or overwrite a descriptor.
    ///
    /// Fails with `InvalidInput` if the name is empty. Overwriting keeps
    /// the descriptor's original position and re-indexes categories and
    /// capabilities.
    pub fn add_tool(&mut self, tool: ToolDescriptor) -> Result<(), GateError> {
        if tool.name.is_empty() {
            return Err(GateError::InvalidInput(
                "tool name must not be empty".to_string(),
            ));
        }

        match self.by_name.get(&tool.name).copied() {
            Some(slot) => {
                self.deindex(&self.tools[slot].clone());
                self.index(&tool);
                self.tools[slot] = tool;
            }
            None => {
                self.index(&tool);
                self.by_name.insert(tool.name.clone(), self.tools.len());
                self.tools.push(tool);
            }
        }
        Ok(())
    }

    /// Remove a descriptor by name. Returns whether something was deleted.
    pub fn remove_tool(&mut self, name: &str) -> bool {
        let Some(slot) = self.by_name.remove(name) else {
            return false;
        };
        let removed = self.tools.remove(slot);
        self.deindex(&removed);
        // Slots after the removed one shift down by one.
        for (_, idx) in self.by_name.iter_mut() {
            if *idx > slot {
                *idx -= 1;
            }
        }
        true
    }

    /// Look up a descriptor by exact name.
    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.by_name.get(name).map(|&slot| &self.tools[slot])
    }

    /// All descriptors in insertion order.
    pub fn all(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    /// Search with intersection semantics over the optional criteria.
    ///
    /// Results come back in insertion order. Deprecated tools are excluded
    /// unless `include_deprecated` is set.
    pub fn search(&self, opts: &SearchOptions) -> Vec<&ToolDescriptor> {
        self.tools
            .iter()
            .filter(|tool| {
                if tool.deprecated && !opts.include_deprecated {
                    return false;
                }
                if let Some(fragment) = &opts.name {
                    if !tool.name.contains(fragment.as_str()) {
                        return false;
                    }
                }
                if let Some(category) = &opts.category {
                    if !tool.categories.iter().any(|c| c == category) {
                        return false;
                    }
                }
                if let Some(capability) = &opts.capability {
                    if !tool.capabilities.iter().any(|c| c == capability) {
                        return false;
                    }
                }
                true
            })
            .collect()
    }

    /// Names registered under a category.
    pub fn names_in_category(&self, category: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .by_category
            .get(category)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Names registered with a capability.
    pub fn names_with_capability(&self, capability: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .by_capability
            .get(capability)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Reset every index atomically.
    pub fn clear(&mut self) {
        self.tools.clear();
        self.by_name.clear();
        self.by_category.clear();
        self.by_capability.clear();
    }

    fn index(&mut self, tool: &ToolDescriptor) {
        for category in &tool.categories {
            self.by_category
                .entry(category.clone())
                .or_default()
                .insert(tool.name.clone());
        }
        for capability in &tool.capabilities {
            self.by_capability
                .entry(capability.clone())
                .or_default()
                .insert(tool.name.clone());
        }
    }

    fn deindex(&mut self, tool: &ToolDescriptor) {
        for category in &tool.categories {
            if let Some(set) = self.by_category.get_mut(category) {
                set.remove(&tool.name);
                if set.is_empty() {
                    self.by_category.remove(category);
                }
            }
        }
        for capability in &tool.capabilities {
            if let Some(set) = self.by_capability.get_mut(capability) {
                set.remove(&tool.name);
                if set.is_empty() {
                    self.by_capability.remove(capability);
                }
            }
        }
    }
}
