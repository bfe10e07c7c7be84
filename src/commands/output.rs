//! `output` - show declared outputs

use anyhow::{Result, bail};
use colored::Colorize;
use declarative::{Literal, MASK, OutputEntry, OutputValue, collect_outputs, output_value};
use std::fmt::Write as _;

use super::Workspace;
use crate::Context;

fn raw(value: &Literal) -> String {
    value.as_str().map_or_else(|| value.to_string(), str::to_string)
}

fn shown(value: &OutputValue, reveal: bool) -> String {
    if reveal {
        raw(value.reveal())
    } else {
        value.to_string()
    }
}

fn to_json(entries: &[OutputEntry], reveal: bool) -> Result<String> {
    let mut map = serde_json::Map::new();
    for entry in entries {
        let value = match &entry.value {
            None => serde_json::Value::Null,
            Some(value) if value.is_sensitive() && !reveal => serde_json::Value::from(MASK),
            Some(value) => serde_json::to_value(value.reveal())?,
        };
        map.insert(entry.name.clone(), value);
    }
    Ok(serde_json::to_string_pretty(&serde_json::Value::Object(map))?)
}

fn to_text(entries: &[OutputEntry], reveal: bool) -> String {
    let width = entries.iter().map(|e| e.name.len()).max().unwrap_or(0);
    let mut out = String::new();
    for entry in entries {
        let value = entry.value.as_ref().map_or_else(
            || "(not yet applied)".dimmed().to_string(),
            |v| shown(v, reveal),
        );
        let _ = writeln!(out, "  {:<width$} = {value}", entry.name.bold());
    }
    out
}

pub fn run(ctx: &Context, name: Option<&str>, reveal: bool, json: bool) -> Result<()> {
    let ws = Workspace::load(ctx)?;
    let configuration = &ws.config.configuration;

    if let Some(name) = name {
        let Some(value) = output_value(configuration, &ws.state, name)? else {
            bail!("Output `{name}` has no value yet; run `stratum apply` first");
        };
        if json {
            let entry = OutputEntry {
                name: name.to_string(),
                value: Some(value),
            };
            println!("{}", to_json(std::slice::from_ref(&entry), reveal)?);
        } else {
            println!("{}", shown(&value, reveal));
        }
        return Ok(());
    }

    let entries = collect_outputs(configuration, &ws.state)?;
    if json {
        println!("{}", to_json(&entries, reveal)?);
    } else if entries.is_empty() {
        crate::ui::dim("No outputs declared");
    } else {
        print!("{}", to_text(&entries, reveal));
    }
    Ok(())
}
