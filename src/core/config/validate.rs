//! Configuration validation.
//!
//! Every published name must be unique across agents, flows, and MCP
//! servers; every reference must resolve; `extends` cannot be absolute;
//! non-local configs may only pull server sources from real repo URLs.

use super::data::{Config, Step, StringList, ToolRef};
use crate::error::{Error, Result};
use crate::mcp::types::McpServer;
use std::collections::{HashMap, HashSet};

impl Config {
    /// Validates the whole tree. `allow_local` is set when the config
    /// came from a local path and may reference local server sources.
    pub fn validate(&self, allow_local: bool) -> Result<()> {
        let mut errs: Vec<String> = Vec::new();
        let mut seen: HashMap<String, &'static str> = HashMap::new();

        if self.extends.trim().starts_with('/') {
            errs.push(format!(
                "extends cannot be an absolute path: {}",
                self.extends
            ));
        }

        for (name, agent) in &self.agents {
            check_dup(&mut seen, &mut errs, "agents", name);
            self.validate_agent(name, agent, &mut errs);
        }

        for (name, server) in &self.mcp_servers {
            check_dup(&mut seen, &mut errs, "mcpServers", name);
            validate_server(name, server, allow_local, &mut errs);
        }

        for (name, flow) in &self.flows {
            check_dup(&mut seen, &mut errs, "flows", name);
            for (index, step) in flow.steps.iter().enumerate() {
                self.validate_step(step, &mut errs, &format!("flow {name:?} step {index}"));
            }
            check_step_ids(&flow.steps, &mut errs, &format!("flow {name:?}"));
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(Error::Semantic(errs.join("; ")))
        }
    }

    fn validate_agent(&self, name: &str, agent: &super::data::Agent, errs: &mut Vec<String>) {
        let resolved = self.validate_references(
            &agent.tools,
            &agent.agents,
            &agent.flows,
            errs,
            &format!("agent {name:?}"),
        );

        if agent.instructions.is_prompt()
            && !self.mcp_servers.contains_key(&agent.instructions.mcp_server)
        {
            errs.push(format!(
                "agent {name:?} has instructions with MCP server {:?} that is not defined in config",
                agent.instructions.mcp_server
            ));
        }

        if let Some(resolved) = resolved {
            if !agent.tool_choice.is_empty()
                && agent.tool_choice != "none"
                && agent.tool_choice != "auto"
                && !resolved.contains(&agent.tool_choice)
            {
                errs.push(format!(
                    "agent {name:?} has tool choice {:?} that is not defined in tools",
                    agent.tool_choice
                ));
            }
        }
    }

    fn validate_step(&self, step: &Step, errs: &mut Vec<String>, context: &str) {
        if let Some(call) = step.call() {
            if !step.steps.is_empty() {
                errs.push(format!(
                    "{context}: cannot have both a call target ({call}) and nested steps"
                ));
            }
        }

        self.validate_references(
            &as_list(&step.tool),
            &as_list(&step.agent.name),
            &as_list(&step.flow),
            errs,
            context,
        );

        for (index, nested) in step.steps.iter().enumerate() {
            self.validate_step(nested, errs, &format!("{context} nested step {index}"));
        }
        check_step_ids(&step.steps, errs, context);
    }

    /// Returns the resolved published names when every reference was
    /// known, mirroring how tool-choice validation is skipped once an
    /// unknown name has already been reported.
    fn validate_references(
        &self,
        tools: &StringList,
        agents: &StringList,
        flows: &StringList,
        errs: &mut Vec<String>,
        context: &str,
    ) -> Option<HashSet<String>> {
        let mut resolved = HashSet::new();
        let mut unknown = false;

        for reference in tools.iter() {
            let tool_ref = ToolRef::parse(reference);
            if !self.mcp_servers.contains_key(&tool_ref.server) {
                errs.push(format!(
                    "{context}: can not find MCP server {reference:?}, missing in config"
                ));
                unknown = true;
            } else {
                resolved.insert(tool_ref.published_name(""));
            }
        }

        for reference in agents.iter() {
            validate_flat_ref(reference, "agent", &self.agents, errs, context, &mut resolved);
        }
        for reference in flows.iter() {
            validate_flat_ref(reference, "flow", &self.flows, errs, context, &mut resolved);
        }

        if unknown {
            None
        } else {
            Some(resolved)
        }
    }
}

fn as_list(value: &str) -> StringList {
    if value.is_empty() {
        StringList::default()
    } else {
        StringList(vec![value.to_string()])
    }
}

fn validate_flat_ref<T>(
    reference: &str,
    kind: &str,
    targets: &HashMap<String, T>,
    errs: &mut Vec<String>,
    context: &str,
    resolved: &mut HashSet<String>,
) {
    if reference.contains('/') {
        errs.push(format!(
            "{context}: invalid {kind} reference {reference:?}: slashes are not allowed"
        ));
        return;
    }
    let tool_ref = ToolRef::parse(reference);
    if !targets.contains_key(&tool_ref.server) {
        errs.push(format!(
            "{context}: can not find {kind} {reference:?}, missing in config"
        ));
        return;
    }
    resolved.insert(tool_ref.published_name(&tool_ref.server.clone()));
}

fn check_dup(
    seen: &mut HashMap<String, &'static str>,
    errs: &mut Vec<String>,
    category: &'static str,
    name: &str,
) {
    if let Some(existing) = seen.insert(name.to_string(), category) {
        errs.push(format!(
            "duplicate name {name:?} in {category}, already used in {existing}"
        ));
    }
}

/// Step ids must be unique within their containing step list.
fn check_step_ids(steps: &[Step], errs: &mut Vec<String>, context: &str) {
    let mut ids = HashSet::new();
    for step in steps {
        if step.id.is_empty() {
            continue;
        }
        if !ids.insert(step.id.as_str()) {
            errs.push(format!("{context}: duplicate step id {:?}", step.id));
        }
    }
}

fn validate_server(name: &str, server: &McpServer, allow_local: bool, errs: &mut Vec<String>) {
    if allow_local {
        return;
    }
    let repo = &server.source.repo;
    if repo.is_empty() {
        return;
    }
    let ok = repo.starts_with("https://")
        || repo.starts_with("http://")
        || repo.starts_with("git@")
        || repo.starts_with("ssh://");
    if !ok {
        errs.push(format!(
            "mcpServer {name:?} has invalid repo URL {repo:?}, must start with http://, https://, git@, or ssh://"
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: serde_json::Value) -> Config {
        serde_json::from_value(value).expect("config")
    }

    #[test]
    fn accepts_a_complete_config() {
        let cfg = config(json!({
            "publish": {"entrypoint": "main", "tools": ["main"]},
            "agents": {
                "main": {
                    "model": "gpt-5",
                    "tools": ["calc/add"],
                    "agents": ["helper"],
                    "flows": ["pipeline"],
                    "toolChoice": "add",
                },
                "helper": {"model": "small"},
            },
            "mcpServers": {"calc": {"command": "calc-server"}},
            "flows": {"pipeline": {"steps": [{"id": "one", "tool": "calc/add"}]}},
        }));
        cfg.validate(true).expect("valid");
    }

    #[test]
    fn rejects_duplicate_names_across_categories() {
        let cfg = config(json!({
            "agents": {"echo": {"model": "m"}},
            "flows": {"echo": {"steps": []}},
        }));
        let err = cfg.validate(true).expect_err("duplicate");
        assert!(err.to_string().contains("duplicate name"));
    }

    #[test]
    fn rejects_unknown_references() {
        let cfg = config(json!({
            "agents": {"main": {"tools": ["nope/add"], "agents": ["ghost"]}},
        }));
        let err = cfg.validate(true).expect_err("unknown refs").to_string();
        assert!(err.contains("nope/add"));
        assert!(err.contains("ghost"));
    }

    #[test]
    fn rejects_slashed_agent_refs_and_absolute_extends() {
        let cfg = config(json!({
            "extends": "/etc/base.yaml",
            "agents": {"main": {"agents": ["a/b"]}},
        }));
        let err = cfg.validate(true).expect_err("invalid").to_string();
        assert!(err.contains("absolute path"));
        assert!(err.contains("slashes are not allowed"));
    }

    #[test]
    fn rejects_duplicate_step_ids_in_one_list() {
        let cfg = config(json!({
            "mcpServers": {"calc": {"command": "c"}},
            "flows": {"f": {"steps": [
                {"id": "s", "tool": "calc/add"},
                {"id": "s", "tool": "calc/add"},
            ]}},
        }));
        let err = cfg.validate(true).expect_err("dup step id").to_string();
        assert!(err.contains("duplicate step id"));
    }

    #[test]
    fn rejects_call_target_combined_with_nested_steps() {
        let cfg = config(json!({
            "mcpServers": {"calc": {"command": "c"}},
            "flows": {"f": {"steps": [
                {"tool": "calc/add", "steps": [{"tool": "calc/add"}]},
            ]}},
        }));
        let err = cfg.validate(true).expect_err("conflict").to_string();
        assert!(err.contains("call target"));
    }

    #[test]
    fn non_local_configs_need_url_repos() {
        let cfg = config(json!({
            "mcpServers": {"tool": {"command": "c", "source": {"repo": "../local"}}},
        }));
        assert!(cfg.validate(false).is_err());
        cfg.validate(true).expect("local allowed");
    }

    #[test]
    fn tool_choice_must_resolve() {
        let cfg = config(json!({
            "mcpServers": {"calc": {"command": "c"}},
            "agents": {"main": {"tools": ["calc/add"], "toolChoice": "subtract"}},
        }));
        let err = cfg.validate(true).expect_err("bad choice").to_string();
        assert!(err.contains("tool choice"));
    }
}
