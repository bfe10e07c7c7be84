//! Plan rendering

use colored::{ColoredString, Colorize};
use declarative::{AttributeChange, DiffSummary, ExecutionPlan, PlannedAction, ResourceKind, group_by_kind};
use similar::{ChangeTag, TextDiff};
use std::fmt::Write as _;

fn kind_title(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::User => "Users",
        ResourceKind::Policy => "Policies",
        ResourceKind::Role => "Roles",
        ResourceKind::UserPolicyAttachment => "User policy attachments",
        ResourceKind::RolePolicyAttachment => "Role policy attachments",
        ResourceKind::AccessKey => "Access keys",
        ResourceKind::LoginProfile => "Login profiles",
    }
}

fn symbol(action: &PlannedAction) -> ColoredString {
    match action {
        PlannedAction::Create => "+".green(),
        PlannedAction::Update => "~".yellow(),
        PlannedAction::Replace { .. } => "-/+".magenta(),
        PlannedAction::Delete => "-".red(),
        PlannedAction::NoOp => " ".normal(),
    }
}

/// JSON documents are compared pretty-printed so one-line policies diff by line
fn normalize(text: &str) -> String {
    serde_json::from_str::<serde_json::Value>(text)
        .and_then(|value| serde_json::to_string_pretty(&value))
        .unwrap_or_else(|_| text.to_string())
}

fn render_change(out: &mut String, change: &AttributeChange) {
    if let Some((old, new)) = change.text_pair() {
        let (old, new) = (normalize(old), normalize(new));
        if old.contains('\n') || new.contains('\n') {
            let _ = writeln!(out, "│       {}:", change.attribute);
            let diff = TextDiff::from_lines(&old, &new);
            for line in diff.iter_all_changes() {
                let text = line.value().trim_end_matches('\n');
                let rendered = match line.tag() {
                    ChangeTag::Delete => format!("- {text}").red(),
                    ChangeTag::Insert => format!("+ {text}").green(),
                    ChangeTag::Equal => format!("  {text}").dimmed(),
                };
                let _ = writeln!(out, "│         {rendered}");
            }
            return;
        }
    }

    let line = change.to_string();
    let line = if change.forces_replace {
        line.magenta()
    } else {
        line.dimmed()
    };
    let _ = writeln!(out, "│       {line}");
}

/// Render a plan as a boxed listing grouped by kind
pub fn render_plan(plan: &ExecutionPlan, title: &str) -> String {
    let mut out = String::new();
    let summary = DiffSummary::from_plan(plan);

    if !summary.has_changes() {
        let _ = writeln!(out);
        let _ = writeln!(out, "  {} No changes needed", "✓".green());
        return out;
    }

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "┌─ {} ─────────────────────────────────────────┐",
        title.bold()
    );
    let _ = writeln!(out, "│");

    for (kind, nodes) in group_by_kind(plan) {
        let _ = writeln!(out, "│ {}", kind_title(kind).bold());
        for node in nodes {
            let _ = writeln!(
                out,
                "│   {:>3} {:<36} {}",
                symbol(&node.action),
                node.id.to_string(),
                format!("({})", node.action).dimmed()
            );
            for change in &node.changes {
                render_change(&mut out, change);
            }
        }
        let _ = writeln!(out, "│");
    }

    let _ = writeln!(out, "├─────────────────────────────────────────────────────┤");
    let _ = writeln!(out, "│ Plan: {}", summary.to_string().bold());
    let _ = writeln!(out, "└─────────────────────────────────────────────────────┘");
    out
}

/// Print a plan to stdout
pub fn display_plan(plan: &ExecutionPlan, title: &str) {
    print!("{}", render_plan(plan, title));
}

#[cfg(test)]
mod tests {
    use super::*;
    use declarative::{DesiredValue, Literal, MASK, PlannedNode, ResourceId};

    fn node(id: ResourceId, action: PlannedAction, changes: Vec<AttributeChange>) -> PlannedNode {
        PlannedNode { id, action, changes }
    }

    fn change(attribute: &str, old: Option<&str>, new: Option<&str>, sensitive: bool) -> AttributeChange {
        AttributeChange {
            attribute: attribute.to_string(),
            old: old.map(Literal::from),
            new: new.map(|v| DesiredValue::Known {
                value: Literal::from(v),
                sensitive,
            }),
            sensitive,
            forces_replace: false,
        }
    }

    #[test]
    fn test_empty_plan_reports_no_changes() {
        colored::control::set_override(false);
        let rendered = render_plan(&ExecutionPlan::default(), "Plan");
        assert!(rendered.contains("No changes needed"));
    }

    #[test]
    fn test_groups_by_kind_and_summarizes() {
        colored::control::set_override(false);
        let plan = ExecutionPlan {
            orphans: vec![node(
                ResourceId::new(ResourceKind::Role, "old"),
                PlannedAction::Delete,
                Vec::new(),
            )],
            nodes: vec![
                node(
                    ResourceId::new(ResourceKind::User, "lb"),
                    PlannedAction::Create,
                    vec![change("name", None, Some("loadbalancer"), false)],
                ),
                node(
                    ResourceId::new(ResourceKind::Policy, "ro"),
                    PlannedAction::NoOp,
                    Vec::new(),
                ),
            ],
        };

        let rendered = render_plan(&plan, "Plan");
        assert!(rendered.contains("Users"));
        assert!(rendered.contains("Roles"));
        assert!(!rendered.contains("Policies"));
        assert!(rendered.contains("user.lb"));
        assert!(rendered.contains("loadbalancer"));
        assert!(rendered.contains("1 to add, 0 to change, 0 to replace, 1 to destroy"));
    }

    #[test]
    fn test_policy_documents_diff_by_line() {
        colored::control::set_override(false);
        let plan = ExecutionPlan {
            orphans: Vec::new(),
            nodes: vec![node(
                ResourceId::new(ResourceKind::Policy, "ro"),
                PlannedAction::Update,
                vec![change(
                    "policy",
                    Some(r#"{"Statement":[],"Version":"2012-10-17"}"#),
                    Some(r#"{"Statement":[{"Effect":"Allow"}],"Version":"2012-10-17"}"#),
                    false,
                )],
            )],
        };

        let rendered = render_plan(&plan, "Plan");
        assert!(rendered.contains("+       \"Effect\": \"Allow\""));
        assert!(rendered.contains("  \"Version\": \"2012-10-17\""));
    }

    #[test]
    fn test_sensitive_values_are_masked() {
        colored::control::set_override(false);
        let plan = ExecutionPlan {
            orphans: Vec::new(),
            nodes: vec![node(
                ResourceId::new(ResourceKind::UserPolicyAttachment, "lb"),
                PlannedAction::Update,
                vec![change("user", Some("AKIAOLD"), Some("AKIANEW"), true)],
            )],
        };

        let rendered = render_plan(&plan, "Plan");
        assert!(rendered.contains(MASK));
        assert!(!rendered.contains("AKIAOLD"));
        assert!(!rendered.contains("AKIANEW"));
    }
}
