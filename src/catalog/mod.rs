//! Capability catalog: per-upstream indexed sets of tools, prompts, and
//! resources with source attribution.
//!
//! Shared and read-mostly. Writes come only from the discoverer and from
//! source removal; a single lock around the two-level maps keeps writes to
//! one source from interleaving with reads on it.

use crate::error::{Error, Result};
use crate::types::{Prompt, Resource, Tool};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct SourceCatalog {
    tools: HashMap<String, Tool>,
    prompts: HashMap<String, Prompt>,
    resources: HashMap<String, Resource>,
}

/// Registry of discovered capabilities, keyed source → identifier.
#[derive(Debug, Default)]
pub struct CapabilityCatalog {
    sources: RwLock<HashMap<String, SourceCatalog>>,
}

impl CapabilityCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a single tool. Fails on schema violations and on per-source
    /// name conflicts.
    pub fn register_tool(&self, tool: Tool) -> Result<()> {
        tool.validate().map_err(Error::InvalidTool)?;

        let mut sources = self.sources.write();
        let source = sources.entry(tool.source.clone()).or_default();
        if source.tools.contains_key(&tool.name) {
            return Err(Error::DuplicateTool {
                source_name: tool.source,
                name: tool.name,
            });
        }
        source.tools.insert(tool.name.clone(), tool);
        Ok(())
    }

    pub fn register_prompt(&self, prompt: Prompt) -> Result<()> {
        prompt.validate().map_err(Error::InvalidPrompt)?;

        let mut sources = self.sources.write();
        let source = sources.entry(prompt.source.clone()).or_default();
        if source.prompts.contains_key(&prompt.name) {
            return Err(Error::DuplicatePrompt {
                source_name: prompt.source,
                name: prompt.name,
            });
        }
        source.prompts.insert(prompt.name.clone(), prompt);
        Ok(())
    }

    pub fn register_resource(&self, resource: Resource) -> Result<()> {
        resource.validate().map_err(Error::InvalidResource)?;

        let mut sources = self.sources.write();
        let source = sources.entry(resource.source.clone()).or_default();
        if source.resources.contains_key(&resource.uri) {
            return Err(Error::DuplicateResource {
                source_name: resource.source,
                uri: resource.uri,
            });
        }
        source.resources.insert(resource.uri.clone(), resource);
        Ok(())
    }

    /// Atomically replace every tool registered for a source.
    ///
    /// The batch is validated in full before the swap so a bad record leaves
    /// the previous registration intact.
    pub fn replace_tools(&self, source_name: &str, tools: Vec<Tool>) -> Result<()> {
        let mut replacement = HashMap::with_capacity(tools.len());
        for tool in tools {
            tool.validate().map_err(Error::InvalidTool)?;
            if replacement.contains_key(&tool.name) {
                return Err(Error::DuplicateTool {
                    source_name: source_name.to_string(),
                    name: tool.name,
                });
            }
            replacement.insert(tool.name.clone(), tool);
        }

        let mut sources = self.sources.write();
        sources.entry(source_name.to_string()).or_default().tools = replacement;
        Ok(())
    }

    pub fn replace_prompts(&self, source_name: &str, prompts: Vec<Prompt>) -> Result<()> {
        let mut replacement = HashMap::with_capacity(prompts.len());
        for prompt in prompts {
            prompt.validate().map_err(Error::InvalidPrompt)?;
            if replacement.contains_key(&prompt.name) {
                return Err(Error::DuplicatePrompt {
                    source_name: source_name.to_string(),
                    name: prompt.name,
                });
            }
            replacement.insert(prompt.name.clone(), prompt);
        }

        let mut sources = self.sources.write();
        sources.entry(source_name.to_string()).or_default().prompts = replacement;
        Ok(())
    }

    pub fn replace_resources(&self, source_name: &str, resources: Vec<Resource>) -> Result<()> {
        let mut replacement = HashMap::with_capacity(resources.len());
        for resource in resources {
            resource.validate().map_err(Error::InvalidResource)?;
            if replacement.contains_key(&resource.uri) {
                return Err(Error::DuplicateResource {
                    source_name: source_name.to_string(),
                    uri: resource.uri,
                });
            }
            replacement.insert(resource.uri.clone(), resource);
        }

        let mut sources = self.sources.write();
        sources.entry(source_name.to_string()).or_default().resources = replacement;
        Ok(())
    }

    /// Tools for one source, sorted by name for stable reads.
    pub fn tools_for_source(&self, source_name: &str) -> Vec<Tool> {
        let sources = self.sources.read();
        let mut tools: Vec<Tool> = sources
            .get(source_name)
            .map(|s| s.tools.values().cloned().collect())
            .unwrap_or_default();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn prompts_for_source(&self, source_name: &str) -> Vec<Prompt> {
        let sources = self.sources.read();
        let mut prompts: Vec<Prompt> = sources
            .get(source_name)
            .map(|s| s.prompts.values().cloned().collect())
            .unwrap_or_default();
        prompts.sort_by(|a, b| a.name.cmp(&b.name));
        prompts
    }

    pub fn resources_for_source(&self, source_name: &str) -> Vec<Resource> {
        let sources = self.sources.read();
        let mut resources: Vec<Resource> = sources
            .get(source_name)
            .map(|s| s.resources.values().cloned().collect())
            .unwrap_or_default();
        resources.sort_by(|a, b| a.uri.cmp(&b.uri));
        resources
    }

    /// Drop every capability attributed to a source.
    pub fn remove_source(&self, source_name: &str) {
        self.sources.write().remove(source_name);
    }

    pub fn all_tools(&self) -> Vec<Tool> {
        let sources = self.sources.read();
        let mut tools: Vec<Tool> = sources
            .values()
            .flat_map(|s| s.tools.values().cloned())
            .collect();
        tools.sort_by(|a, b| (&a.source, &a.name).cmp(&(&b.source, &b.name)));
        tools
    }

    pub fn all_prompts(&self) -> Vec<Prompt> {
        let sources = self.sources.read();
        let mut prompts: Vec<Prompt> = sources
            .values()
            .flat_map(|s| s.prompts.values().cloned())
            .collect();
        prompts.sort_by(|a, b| (&a.source, &a.name).cmp(&(&b.source, &b.name)));
        prompts
    }

    pub fn all_resources(&self) -> Vec<Resource> {
        let sources = self.sources.read();
        let mut resources: Vec<Resource> = sources
            .values()
            .flat_map(|s| s.resources.values().cloned())
            .collect();
        resources.sort_by(|a, b| (&a.source, &a.uri).cmp(&(&b.source, &b.uri)));
        resources
    }

    pub fn sources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.read().keys().cloned().collect();
        names.sort();
        names
    }
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

    #[test]
    fn test_register_then_get_roundtrip() {
        let catalog = CapabilityCatalog::new();
        catalog.register_tool(tool("u1", "echo")).unwrap();

        let tools = catalog.tools_for_source("u1");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
        assert_eq!(tools[0].source, "u1");
    }

    #[test]
    fn test_duplicate_within_source_rejected() {
        let catalog = CapabilityCatalog::new();
        catalog.register_tool(tool("u1", "echo")).unwrap();

        let result = catalog.register_tool(tool("u1", "echo"));
        assert!(matches!(result, Err(Error::DuplicateTool { .. })));
    }

    #[test]
    fn test_same_identifier_across_sources_allowed() {
        let catalog = CapabilityCatalog::new();
        catalog.register_tool(tool("u1", "echo")).unwrap();
        catalog.register_tool(tool("u2", "echo")).unwrap();

        assert_eq!(catalog.tools_for_source("u1").len(), 1);
        assert_eq!(catalog.tools_for_source("u2").len(), 1);
        assert_eq!(catalog.all_tools().len(), 2);
    }

    #[test]
    fn test_invalid_records_rejected() {
        let catalog = CapabilityCatalog::new();

        let mut bad_tool = tool("u1", "x");
        bad_tool.name = String::new();
        assert!(matches!(
            catalog.register_tool(bad_tool),
            Err(Error::InvalidTool(_))
        ));

        let mut bad_schema = tool("u1", "y");
        bad_schema.input_schema = json!("not an object");
        assert!(matches!(
            catalog.register_tool(bad_schema),
            Err(Error::InvalidTool(_))
        ));

        assert!(matches!(
            catalog.register_resource(resource("u1", "")),
            Err(Error::InvalidResource(_))
        ));
    }

    #[test]
    fn test_replace_swaps_not_merges() {
        let catalog = CapabilityCatalog::new();
        catalog
            .replace_tools("u1", vec![tool("u1", "a"), tool("u1", "b")])
            .unwrap();
        catalog.replace_tools("u1", vec![tool("u1", "c")]).unwrap();

        let names: Vec<String> = catalog
            .tools_for_source("u1")
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["c"]);
    }

    #[test]
    fn test_replace_validates_before_swapping() {
        let catalog = CapabilityCatalog::new();
        catalog.replace_tools("u1", vec![tool("u1", "a")]).unwrap();

        let mut bad = tool("u1", "b");
        bad.name = String::new();
        let result = catalog.replace_tools("u1", vec![tool("u1", "c"), bad]);
        assert!(result.is_err());

        // previous registration untouched
        let names: Vec<String> = catalog
            .tools_for_source("u1")
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["a"]);
    }

    #[test]
    fn test_replace_rejects_duplicates_in_batch() {
        let catalog = CapabilityCatalog::new();
        let result = catalog.replace_prompts("u1", vec![prompt("u1", "p"), prompt("u1", "p")]);
        assert!(matches!(result, Err(Error::DuplicatePrompt { .. })));
    }

    #[test]
    fn test_remove_source_drops_all_kinds() {
        let catalog = CapabilityCatalog::new();
        catalog.register_tool(tool("u1", "echo")).unwrap();
        catalog.register_prompt(prompt("u1", "greet")).unwrap();
        catalog
            .register_resource(resource("u1", "mcp://u1/readme"))
            .unwrap();
        catalog.register_tool(tool("u2", "other")).unwrap();

        catalog.remove_source("u1");

        assert!(catalog.tools_for_source("u1").is_empty());
        assert!(catalog.prompts_for_source("u1").is_empty());
        assert!(catalog.resources_for_source("u1").is_empty());
        assert_eq!(catalog.tools_for_source("u2").len(), 1);
        assert_eq!(catalog.sources(), vec!["u2"]);
    }

    #[test]
    fn test_reads_sorted_by_identifier() {
        let catalog = CapabilityCatalog::new();
        catalog
            .replace_tools("u1", vec![tool("u1", "c"), tool("u1", "a"), tool("u1", "b")])
            .unwrap();

        let names: Vec<String> = catalog
            .tools_for_source("u1")
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
