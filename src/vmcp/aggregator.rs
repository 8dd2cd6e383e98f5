//! Capability aggregation for virtual servers.
//!
//! Applies a definition's selection rules to the current catalog, producing
//! the merged capability arrays and the authoritative routing map. The view
//! is computed once at instance start and immutable afterwards.

use crate::catalog::CapabilityCatalog;
use crate::types::{CapabilityKind, Prompt, Resource, Tool};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// One selection rule. Multiple rules combine by union.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AggregationRule {
    AggregateAll,
    IncludeTools { names: Vec<String> },
    IncludePrompts { names: Vec<String> },
    IncludeResources { uris: Vec<String> },
}

/// Per-kind selection after rule expansion.
#[derive(Debug, Clone, PartialEq)]
enum Selection {
    /// No rule named this kind; it contributes nothing.
    None,
    All,
    Named(HashSet<String>),
}

impl Selection {
    fn active(&self) -> bool {
        !matches!(self, Selection::None)
    }

    fn allows(&self, identifier: &str) -> bool {
        match self {
            Selection::None => false,
            Selection::All => true,
            Selection::Named(names) => names.contains(identifier),
        }
    }

    fn include(&mut self, identifiers: &[String]) {
        match self {
            Selection::All => {},
            Selection::Named(names) => names.extend(identifiers.iter().cloned()),
            Selection::None => {
                *self = Selection::Named(identifiers.iter().cloned().collect());
            },
        }
    }
}

#[derive(Debug)]
struct RuleSet {
    tools: Selection,
    prompts: Selection,
    resources: Selection,
}

fn expand_rules(rules: &[AggregationRule]) -> RuleSet {
    let mut set = RuleSet {
        tools: Selection::None,
        prompts: Selection::None,
        resources: Selection::None,
    };
    for rule in rules {
        match rule {
            AggregationRule::AggregateAll => {
                set.tools = Selection::All;
                set.prompts = Selection::All;
                set.resources = Selection::All;
            },
            AggregationRule::IncludeTools { names } => set.tools.include(names),
            AggregationRule::IncludePrompts { names } => set.prompts.include(names),
            AggregationRule::IncludeResources { uris } => set.resources.include(uris),
        }
    }
    set
}

/// Where a published identifier routes to.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteTarget {
    pub source: String,
    pub identifier: String,
}

/// `(kind, identifier)` → `(source, original identifier)`.
#[derive(Debug, Clone, Default)]
pub struct RoutingMap {
    routes: HashMap<(CapabilityKind, String), RouteTarget>,
}

impl RoutingMap {
    pub fn get(&self, kind: CapabilityKind, identifier: &str) -> Option<&RouteTarget> {
        self.routes.get(&(kind, identifier.to_string()))
    }

    pub fn contains(&self, kind: CapabilityKind, identifier: &str) -> bool {
        self.routes.contains_key(&(kind, identifier.to_string()))
    }

    fn insert(&mut self, kind: CapabilityKind, identifier: String, target: RouteTarget) {
        self.routes.insert((kind, identifier), target);
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// The merged, filtered capability view of one virtual server.
#[derive(Debug, Clone, Default)]
pub struct AggregatedView {
    pub tools: Vec<Tool>,
    pub prompts: Vec<Prompt>,
    pub resources: Vec<Resource>,
    pub routing: RoutingMap,
    /// Cross-source identifier collisions dropped by first-wins.
    pub duplicates_dropped: usize,
}

impl AggregatedView {
    /// The view is empty iff the routing map is empty.
    pub fn is_empty(&self) -> bool {
        self.routing.is_empty()
    }
}

/// Build the aggregated view for `source_ids` under `rules`.
///
/// Entries are emitted in source order, then identifier order (the catalog
/// returns per-source entries sorted). On identifier collision across
/// sources the first listed source wins; later duplicates are dropped and
/// counted.
pub fn aggregate(
    source_ids: &[String],
    rules: &[AggregationRule],
    catalog: &CapabilityCatalog,
) -> AggregatedView {
    let rule_set = expand_rules(rules);
    let mut view = AggregatedView::default();

    for source in source_ids {
        if rule_set.tools.active() {
            for tool in catalog.tools_for_source(source) {
                if !rule_set.tools.allows(&tool.name) {
                    continue;
                }
                if view.routing.contains(CapabilityKind::Tool, &tool.name) {
                    view.duplicates_dropped += 1;
                    debug!(source, tool = %tool.name, "dropping duplicate tool");
                    continue;
                }
                view.routing.insert(
                    CapabilityKind::Tool,
                    tool.name.clone(),
                    RouteTarget {
                        source: source.clone(),
                        identifier: tool.name.clone(),
                    },
                );
                view.tools.push(tool);
            }
        }

        if rule_set.prompts.active() {
            for prompt in catalog.prompts_for_source(source) {
                if !rule_set.prompts.allows(&prompt.name) {
                    continue;
                }
                if view.routing.contains(CapabilityKind::Prompt, &prompt.name) {
                    view.duplicates_dropped += 1;
                    debug!(source, prompt = %prompt.name, "dropping duplicate prompt");
                    continue;
                }
                view.routing.insert(
                    CapabilityKind::Prompt,
                    prompt.name.clone(),
                    RouteTarget {
                        source: source.clone(),
                        identifier: prompt.name.clone(),
                    },
                );
                view.prompts.push(prompt);
            }
        }

        if rule_set.resources.active() {
            for resource in catalog.resources_for_source(source) {
                if !rule_set.resources.allows(&resource.uri) {
                    continue;
                }
                if view.routing.contains(CapabilityKind::Resource, &resource.uri) {
                    view.duplicates_dropped += 1;
                    debug!(source, resource = %resource.uri, "dropping duplicate resource");
                    continue;
                }
                view.routing.insert(
                    CapabilityKind::Resource,
                    resource.uri.clone(),
                    RouteTarget {
                        source: source.clone(),
                        identifier: resource.uri.clone(),
                    },
                );
                view.resources.push(resource);
            }
        }
    }

    view
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(source: &str, name: &str) -> Tool {
        Tool {
            name: name.to_string(),
            description: None,
            input_schema: json!({"type": "object"}),
            source: source.to_string(),
        }
    }

    fn prompt(source: &str, name: &str) -> Prompt {
        Prompt {
            name: name.to_string(),
            description: None,
            template: None,
            arguments: Vec::new(),
            source: source.to_string(),
        }
    }

    fn resource(source: &str, uri: &str) -> Resource {
        Resource {
            uri: uri.to_string(),
            name: None,
            mime_type: None,
            source: source.to_string(),
        }
    }

    fn sources(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_aggregate_all_pulls_everything() {
        let catalog = CapabilityCatalog::new();
        catalog.register_tool(tool("u1", "a")).unwrap();
        catalog.register_prompt(prompt("u1", "p")).unwrap();
        catalog.register_resource(resource("u1", "mcp://u1/r")).unwrap();

        let view = aggregate(
            &sources(&["u1"]),
            &[AggregationRule::AggregateAll],
            &catalog,
        );

        assert_eq!(view.tools.len(), 1);
        assert_eq!(view.prompts.len(), 1);
        assert_eq!(view.resources.len(), 1);
        assert_eq!(view.routing.len(), 3);
        assert!(!view.is_empty());
    }

    #[test]
    fn test_include_tools_filters_and_orders() {
        let catalog = CapabilityCatalog::new();
        for name in ["a", "b", "c"] {
            catalog.register_tool(tool("u1", name)).unwrap();
        }

        let view = aggregate(
            &sources(&["u1"]),
            &[AggregationRule::IncludeTools {
                names: vec!["a".to_string(), "c".to_string()],
            }],
            &catalog,
        );

        let names: Vec<&str> = view.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
        // no rule named prompts or resources, so they contribute nothing
        assert!(view.prompts.is_empty());
        assert!(view.resources.is_empty());
        assert!(!view.routing.contains(CapabilityKind::Tool, "b"));
    }

    #[test]
    fn test_rules_union() {
        let catalog = CapabilityCatalog::new();
        for name in ["a", "b", "c"] {
            catalog.register_tool(tool("u1", name)).unwrap();
        }
        catalog.register_prompt(prompt("u1", "p")).unwrap();

        let view = aggregate(
            &sources(&["u1"]),
            &[
                AggregationRule::IncludeTools {
                    names: vec!["a".to_string()],
                },
                AggregationRule::IncludeTools {
                    names: vec!["b".to_string()],
                },
                AggregationRule::IncludePrompts {
                    names: vec!["p".to_string()],
                },
            ],
            &catalog,
        );

        let names: Vec<&str> = view.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(view.prompts.len(), 1);
    }

    #[test]
    fn test_first_source_wins_on_collision() {
        let catalog = CapabilityCatalog::new();
        catalog.register_tool(tool("u1", "echo")).unwrap();
        catalog.register_tool(tool("u2", "echo")).unwrap();
        catalog.register_tool(tool("u2", "only2")).unwrap();

        let view = aggregate(
            &sources(&["u1", "u2"]),
            &[AggregationRule::AggregateAll],
            &catalog,
        );

        let names: Vec<&str> = view.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "only2"]);
        assert_eq!(view.duplicates_dropped, 1);

        let target = view.routing.get(CapabilityKind::Tool, "echo").unwrap();
        assert_eq!(target.source, "u1");
    }

    #[test]
    fn test_source_order_decides_winner() {
        let catalog = CapabilityCatalog::new();
        catalog.register_tool(tool("u1", "echo")).unwrap();
        catalog.register_tool(tool("u2", "echo")).unwrap();

        let view = aggregate(
            &sources(&["u2", "u1"]),
            &[AggregationRule::AggregateAll],
            &catalog,
        );

        let target = view.routing.get(CapabilityKind::Tool, "echo").unwrap();
        assert_eq!(target.source, "u2");
    }

    #[test]
    fn test_every_emitted_entry_is_routed() {
        let catalog = CapabilityCatalog::new();
        catalog.register_tool(tool("u1", "a")).unwrap();
        catalog.register_tool(tool("u2", "b")).unwrap();
        catalog.register_resource(resource("u1", "mcp://u1/r")).unwrap();

        let view = aggregate(
            &sources(&["u1", "u2"]),
            &[AggregationRule::AggregateAll],
            &catalog,
        );

        for tool in &view.tools {
            assert!(view.routing.contains(CapabilityKind::Tool, &tool.name));
        }
        for resource in &view.resources {
            assert!(view.routing.contains(CapabilityKind::Resource, &resource.uri));
        }
        assert_eq!(
            view.routing.len(),
            view.tools.len() + view.prompts.len() + view.resources.len()
        );
    }

    #[test]
    fn test_empty_view_iff_routing_empty() {
        let catalog = CapabilityCatalog::new();
        catalog.register_tool(tool("u1", "a")).unwrap();

        // rule matches nothing
        let view = aggregate(
            &sources(&["u1"]),
            &[AggregationRule::IncludeTools {
                names: vec!["missing".to_string()],
            }],
            &catalog,
        );
        assert!(view.is_empty());
        assert!(view.tools.is_empty());

        // unrestricted but source empty
        let view = aggregate(
            &sources(&["empty"]),
            &[AggregationRule::AggregateAll],
            &catalog,
        );
        assert!(view.is_empty());
    }

    #[test]
    fn test_rule_wire_format() {
        let rule: AggregationRule =
            serde_json::from_value(json!({"type": "include_tools", "names": ["a"]})).unwrap();
        assert_eq!(
            rule,
            AggregationRule::IncludeTools {
                names: vec!["a".to_string()]
            }
        );

        let all: AggregationRule = serde_json::from_value(json!({"type": "aggregate_all"})).unwrap();
        assert_eq!(all, AggregationRule::AggregateAll);
    }
}
