//! `pgrant classify`: print the classifier's view of some SQL as JSON.

use anyhow::{Context, Result};
use pgrant_core::Control;
use pgrant_policy::{classify_statement, split_statements, PolicyEngine};
use serde_json::{json, Value as JsonValue};

pub fn run(sql: &str, controls: &[String]) -> Result<()> {
    let controls = parse_controls(controls)?;
    println!("{}", serde_json::to_string_pretty(&report(sql, &controls))?);
    Ok(())
}

fn parse_controls(names: &[String]) -> Result<Vec<Control>> {
    names
        .iter()
        .map(|name| {
            serde_json::from_value(JsonValue::String(name.trim().to_string()))
                .with_context(|| format!("unknown control '{}'", name))
        })
        .collect()
}

fn report(sql: &str, controls: &[Control]) -> JsonValue {
    let statements: Vec<JsonValue> = split_statements(sql)
        .into_iter()
        .map(|statement| {
            json!({
                "statement": statement,
                "classification": classify_statement(statement),
            })
        })
        .collect();

    let decision = match PolicyEngine::new(controls.iter().copied()).check(sql) {
        Ok(_) => json!({ "allowed": true }),
        Err(violation) => json!({
            "allowed": false,
            "reason": violation.reason(),
            "sqlstate": violation.sqlstate(),
            "message": violation.to_string(),
        }),
    };

    json!({
        "controls": controls,
        "statements": statements,
        "decision": decision,
    })
}
