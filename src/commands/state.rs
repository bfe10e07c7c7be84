//! `state list|show|rm`

use anyhow::{Result, bail};
use colored::Colorize;
use declarative::output::masked;
use declarative::{Literal, RemoteResourceState, ResourceId, StateStore};
use std::fmt::Write as _;

use super::Workspace;
use crate::Context;
use crate::ui;

pub fn list(ctx: &Context) -> Result<()> {
    let ws = Workspace::load(ctx)?;
    let entries = ws.state.list()?;

    if entries.is_empty() {
        ui::dim("No resources recorded");
        return Ok(());
    }

    ui::header(&format!("State ({})", ws.state.path().display()));
    for entry in &entries {
        println!(
            "  {:<40} {}",
            entry.id.to_string().bold(),
            entry.display_remote_id().dimmed()
        );
    }
    ui::dim(&format!(
        "{} (serial {})",
        ui::plural(entries.len(), "resource"),
        ws.state.serial()
    ));
    Ok(())
}

/// Every sensitive value recorded anywhere, so inputs copied from a secret
/// output are masked too
fn secrets(entries: &[RemoteResourceState]) -> Vec<&Literal> {
    entries
        .iter()
        .flat_map(|e| {
            e.outputs
                .iter()
                .filter(|(k, _)| e.is_sensitive(k))
                .map(|(_, v)| v)
        })
        .collect()
}

fn describe(entry: &RemoteResourceState, secrets: &[&Literal]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "  {}: {}", "remote id".dimmed(), entry.display_remote_id());
    for (label, at) in [("created", entry.created_at), ("updated", entry.updated_at)] {
        let _ = writeln!(out, "  {}: {}", label.dimmed(), at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if !entry.dependencies.is_empty() {
        let names: Vec<String> = entry.dependencies.iter().map(ToString::to_string).collect();
        let _ = writeln!(out, "  {}: {}", "depends on".dimmed(), names.join(", "));
    }

    for (title, attributes) in [("inputs", &entry.inputs), ("outputs", &entry.outputs)] {
        if attributes.is_empty() {
            continue;
        }
        let _ = writeln!(out, "  {}:", title.dimmed());
        for (key, value) in attributes {
            let sensitive = entry.is_sensitive(key) || secrets.contains(&value);
            let _ = writeln!(out, "    {key} = {}", masked(value, sensitive));
        }
    }
    out
}

pub fn show(ctx: &Context, id: &str) -> Result<()> {
    let ws = Workspace::load(ctx)?;
    let id: ResourceId = id.parse()?;
    let entries = ws.state.list()?;

    let Some(entry) = entries.iter().find(|e| e.id == id) else {
        bail!("{id} is not recorded in state");
    };

    ui::header(&id.to_string());
    print!("{}", describe(entry, &secrets(&entries)));
    Ok(())
}

pub fn rm(ctx: &Context, id: &str) -> Result<()> {
    let ws = Workspace::load(ctx)?;
    let id: ResourceId = id.parse()?;

    if ws.state.delete(&id)?.is_none() {
        bail!("{id} is not recorded in state");
    }
    ui::success(&format!("Forgot {id}; the remote object was left in place"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use declarative::{Attributes, ResourceKind};

    fn entries() -> Vec<RemoteResourceState> {
        let mut key_outputs = Attributes::new();
        key_outputs.insert("id".into(), Literal::from("AKIAEXAMPLE"));
        key_outputs.insert("secret".into(), Literal::from("wJalrXUtnFEMI"));
        let mut key_inputs = Attributes::new();
        key_inputs.insert("user".into(), Literal::from("lb"));
        let key = RemoteResourceState::new(
            ResourceId::new(ResourceKind::AccessKey, "lb"),
            "AKIAEXAMPLE",
            key_inputs,
            key_outputs,
        );

        // A user whose path was copied from the key id
        let mut user_inputs = Attributes::new();
        user_inputs.insert("name".into(), Literal::from("lb"));
        user_inputs.insert("path".into(), Literal::from("AKIAEXAMPLE"));
        let user = RemoteResourceState::new(
            ResourceId::new(ResourceKind::User, "lb"),
            "AIDAEXAMPLE",
            user_inputs,
            Attributes::new(),
        );
        vec![key, user]
    }

    #[test]
    fn test_describe_masks_secrets_everywhere() {
        colored::control::set_override(false);
        let entries = entries();
        let secrets = secrets(&entries);

        let key = describe(&entries[0], &secrets);
        assert!(!key.contains("AKIAEXAMPLE"));
        assert!(!key.contains("wJalrXUtnFEMI"));
        assert!(key.contains("user = \"lb\""));

        let user = describe(&entries[1], &secrets);
        assert!(user.contains("AIDAEXAMPLE"));
        assert!(!user.contains("AKIAEXAMPLE"));
    }

    #[test]
    fn test_rm_forgets_entry() {
        let (_dir, ctx) = workspace_dir(CONFIG);
        let ws = Workspace::load(&ctx).unwrap();
        for entry in entries() {
            ws.state.put(entry).unwrap();
        }

        rm(&ctx, "access_key.lb").unwrap();
        let ws = Workspace::load(&ctx).unwrap();
        assert_eq!(ws.state.list().unwrap().len(), 1);
        assert!(rm(&ctx, "access_key.lb").is_err());
        assert!(show(&ctx, "user.lb").is_ok());
    }
}
