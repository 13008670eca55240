//! Workflow YAML validation
//!
//! A workflow is pippy-ready when it accepts a `pippy_run_id` dispatch
//! input and interpolates it into `run-name` — that interpolation is the
//! contract that lets the observer match dispatched runs by title.

use std::collections::HashMap;

use serde_yaml::{Mapping, Value};

use crate::Result;

const RUN_ID_INPUT: &str = "pippy_run_id";
const RUN_NAME_EXPR: &str = "inputs.pippy_run_id";

fn key(name: &str) -> Value {
    Value::String(name.to_string())
}

/// `{type: string}` input declaration
fn run_id_decl() -> Value {
    let mut decl = Mapping::new();
    decl.insert(key("type"), key("string"));
    Value::Mapping(decl)
}

/// `{inputs: {pippy_run_id: {type: string}}}`
fn dispatch_with_run_id() -> Value {
    let mut inputs = Mapping::new();
    inputs.insert(key(RUN_ID_INPUT), run_id_decl());
    let mut dispatch = Mapping::new();
    dispatch.insert(key("inputs"), Value::Mapping(inputs));
    Value::Mapping(dispatch)
}

fn to_fragment(value: &Value) -> Result<String> {
    Ok(serde_yaml::to_string(value)?)
}

fn string_at(doc: &Mapping, name: &str) -> String {
    doc.get(&key(name))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Normalize declared inputs to `key -> {type}` and record their types.
/// Adds `pippy_run_id` when missing; returns `None` when nothing was added.
fn normalized_inputs(inputs: &Mapping, declared: &mut HashMap<String, String>) -> Option<Mapping> {
    let mut normalized = Mapping::new();
    for (input_key, decl) in inputs {
        let input_type = decl
            .get(&key("type"))
            .and_then(Value::as_str)
            .unwrap_or("string")
            .to_string();
        let mut new_decl = Mapping::new();
        new_decl.insert(key("type"), key(input_type.as_str()));
        normalized.insert(input_key.clone(), Value::Mapping(new_decl));
        if let Some(name) = input_key.as_str() {
            declared.insert(name.to_string(), input_type);
        }
    }

    if normalized.contains_key(&key(RUN_ID_INPUT)) {
        return None;
    }
    normalized.insert(key(RUN_ID_INPUT), run_id_decl());
    Some(normalized)
}

/// YAML fragments that must be added to make the workflow pippy-ready,
/// plus the dispatch inputs the workflow already declares.
pub fn required_changes(content: &str) -> Result<(Vec<String>, HashMap<String, String>)> {
    let doc: Mapping = serde_yaml::from_str(content)?;

    let workflow_name = string_at(&doc, "name");
    let run_name = string_at(&doc, "run-name");

    let mut changes = Vec::new();
    let mut declared = HashMap::new();

    match doc.get(&key("on")) {
        Some(Value::Mapping(triggers)) => match triggers.get(&key("workflow_dispatch")) {
            Some(Value::Mapping(dispatch)) => {
                if let Some(Value::Mapping(inputs)) = dispatch.get(&key("inputs")) {
                    if let Some(normalized) = normalized_inputs(inputs, &mut declared) {
                        let mut new_dispatch = Mapping::new();
                        new_dispatch.insert(key("inputs"), Value::Mapping(normalized));
                        let mut fragment = Mapping::new();
                        fragment.insert(key("workflow_dispatch"), Value::Mapping(new_dispatch));
                        changes.push(to_fragment(&Value::Mapping(fragment))?);
                    }
                }
            }
            Some(_) => {
                let mut fragment = Mapping::new();
                fragment.insert(key("workflow_dispatch"), dispatch_with_run_id());
                changes.push(to_fragment(&Value::Mapping(fragment))?);
            }
            None => {
                let mut triggers_fragment = Mapping::new();
                triggers_fragment.insert(key("workflow_dispatch"), dispatch_with_run_id());
                let mut fragment = Mapping::new();
                fragment.insert(key("on"), Value::Mapping(triggers_fragment));
                changes.push(to_fragment(&Value::Mapping(fragment))?);
            }
        },
        Some(Value::Sequence(events)) => {
            let mut triggers = Mapping::new();
            for event in events {
                triggers.insert(event.clone(), Value::Mapping(Mapping::new()));
            }
            triggers.insert(key("workflow_dispatch"), dispatch_with_run_id());
            let mut fragment = Mapping::new();
            fragment.insert(key("on"), Value::Mapping(triggers));
            changes.push(to_fragment(&Value::Mapping(fragment))?);
        }
        _ => {
            let mut triggers = Mapping::new();
            triggers.insert(key("workflow_dispatch"), dispatch_with_run_id());
            let mut fragment = Mapping::new();
            fragment.insert(key("on"), Value::Mapping(triggers));
            changes.push(to_fragment(&Value::Mapping(fragment))?);
        }
    }

    if !run_name.contains(RUN_NAME_EXPR) {
        let base = if run_name.is_empty() {
            workflow_name
        } else {
            run_name
        };
        let mut fragment = Mapping::new();
        fragment.insert(
            key("run-name"),
            key(&format!("{base} - ${{{{{RUN_NAME_EXPR}}}}}")),
        );
        changes.push(to_fragment(&Value::Mapping(fragment))?);
    }

    Ok((changes, declared))
}

/// Rewrite the workflow file in place, merging in the `pippy_run_id` input
/// and the `run-name` interpolation.
pub fn rewrite(content: &str) -> Result<String> {
    let mut doc: Mapping = serde_yaml::from_str(content)?;

    let workflow_name = string_at(&doc, "name");
    let run_name = string_at(&doc, "run-name");

    let mut declared = HashMap::new();

    // event lists and missing triggers are rebuilt wholesale
    let rebuilt_triggers = match doc.get(&key("on")) {
        Some(Value::Mapping(_)) => None,
        Some(Value::Sequence(events)) => {
            let mut triggers = Mapping::new();
            for event in events {
                triggers.insert(event.clone(), Value::Mapping(Mapping::new()));
            }
            triggers.insert(key("workflow_dispatch"), dispatch_with_run_id());
            Some(Value::Mapping(triggers))
        }
        _ => {
            let mut triggers = Mapping::new();
            triggers.insert(key("workflow_dispatch"), dispatch_with_run_id());
            Some(Value::Mapping(triggers))
        }
    };

    if let Some(triggers) = rebuilt_triggers {
        doc.insert(key("on"), triggers);
    } else if let Some(Value::Mapping(triggers)) = doc.get_mut(&key("on")) {
        let has_dispatch_mapping = matches!(
            triggers.get(&key("workflow_dispatch")),
            Some(Value::Mapping(_))
        );
        if !has_dispatch_mapping {
            triggers.insert(key("workflow_dispatch"), dispatch_with_run_id());
        } else if let Some(Value::Mapping(dispatch)) = triggers.get_mut(&key("workflow_dispatch"))
        {
            let normalized = match dispatch.get(&key("inputs")) {
                Some(Value::Mapping(inputs)) => normalized_inputs(inputs, &mut declared),
                _ => {
                    let mut inputs = Mapping::new();
                    inputs.insert(key(RUN_ID_INPUT), run_id_decl());
                    Some(inputs)
                }
            };
            if let Some(normalized) = normalized {
                dispatch.insert(key("inputs"), Value::Mapping(normalized));
            }
        }
    }

    if !run_name.contains(RUN_NAME_EXPR) {
        let base = if run_name.is_empty() {
            workflow_name
        } else {
            run_name
        };
        doc.insert(
            key("run-name"),
            key(&format!("{base} - ${{{{{RUN_NAME_EXPR}}}}}")),
        );
    }

    Ok(serde_yaml::to_string(&Value::Mapping(doc))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const READY: &str = r#"
name: Deploy
run-name: Deploy - ${{inputs.pippy_run_id}}
on:
  workflow_dispatch:
    inputs:
      version:
        type: string
      pippy_run_id:
        type: string
jobs: {}
"#;

    const NO_DISPATCH: &str = r#"
name: Deploy
on:
  push:
    branches: [main]
jobs: {}
"#;

    const MISSING_RUN_ID: &str = r#"
name: Deploy
run-name: Deploy
on:
  workflow_dispatch:
    inputs:
      version:
        type: string
jobs: {}
"#;

    #[test]
    fn test_ready_workflow_needs_no_changes() {
        let (changes, inputs) = required_changes(READY).unwrap();
        assert!(changes.is_empty());
        assert_eq!(inputs.get("version"), Some(&"string".to_string()));
        assert_eq!(inputs.get(RUN_ID_INPUT), Some(&"string".to_string()));
    }

    #[test]
    fn test_missing_dispatch_adds_on_fragment_and_run_name() {
        let (changes, _) = required_changes(NO_DISPATCH).unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes[0].contains("workflow_dispatch"));
        assert!(changes[0].contains(RUN_ID_INPUT));
        assert!(changes[1].contains("run-name"));
        assert!(changes[1].contains("Deploy - ${{inputs.pippy_run_id}}"));
    }

    #[test]
    fn test_missing_run_id_input_adds_input_fragment() {
        let (changes, inputs) = required_changes(MISSING_RUN_ID).unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes[0].contains(RUN_ID_INPUT));
        assert!(changes[0].contains("version"));
        assert_eq!(inputs.get("version"), Some(&"string".to_string()));
    }

    #[test]
    fn test_event_list_trigger() {
        let content = "name: CI\non: [push, pull_request]\njobs: {}\n";
        let (changes, _) = required_changes(content).unwrap();
        assert!(changes[0].contains("push"));
        assert!(changes[0].contains("pull_request"));
        assert!(changes[0].contains(RUN_ID_INPUT));
    }

    #[test]
    fn test_rewrite_produces_ready_workflow() {
        let rewritten = rewrite(MISSING_RUN_ID).unwrap();
        let (changes, inputs) = required_changes(&rewritten).unwrap();
        assert!(changes.is_empty(), "rewritten workflow still needs {changes:?}");
        assert!(inputs.contains_key(RUN_ID_INPUT));
        assert!(inputs.contains_key("version"));
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let once = rewrite(NO_DISPATCH).unwrap();
        let twice = rewrite(&once).unwrap();
        assert_eq!(once, twice);
    }
}
