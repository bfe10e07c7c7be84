//! `validate`, `graph` and `plan`

use anyhow::Result;
use colored::Colorize;
use declarative::{DependencyGraph, Direction, ExecutionPlan, check_outputs};

use super::Workspace;
use crate::Context;
use crate::cli::GraphFormat;
use crate::engine::display_plan;
use crate::ui;

// ============================================================================
// Validate
// ============================================================================

pub fn validate(ctx: &Context) -> Result<()> {
    let ws = Workspace::load(ctx)?;
    let graph = ws.graph(None, Direction::Dependencies)?;
    check_outputs(&ws.config.configuration)?;

    ui::success(&format!(
        "{} is valid: {}, {}, {}",
        ctx.config.display(),
        ui::plural(graph.len(), "resource"),
        ui::plural(graph.edge_count(), "reference"),
        ui::plural(ws.config.configuration.outputs().len(), "output")
    ));
    Ok(())
}

// ============================================================================
// Graph
// ============================================================================

pub fn graph(ctx: &Context, format: GraphFormat) -> Result<()> {
    let ws = Workspace::load(ctx)?;
    let graph = ws.graph(None, Direction::Dependencies)?;

    match format {
        GraphFormat::Dot => print!("{}", graph.to_dot()),
        GraphFormat::Text => {
            ui::header("Dependency Graph");
            for (position, id) in graph.topological_order().into_iter().enumerate() {
                println!("  {:>3}. {}", position + 1, id.to_string().bold());
                let dependencies = graph.dependencies_of(id);
                if !dependencies.is_empty() {
                    let names: Vec<String> = dependencies.iter().map(ToString::to_string).collect();
                    ui::dim(&format!("       after {}", names.join(", ")));
                }
            }
        }
    }
    Ok(())
}

// ============================================================================
// Plan
// ============================================================================

/// Plan an apply (or destroy) of the configuration, optionally targeted
pub fn compute(
    ws: &Workspace,
    target: Option<&str>,
    destroy: bool,
) -> Result<(DependencyGraph, ExecutionPlan)> {
    // Orphans are only considered for whole-configuration runs
    let include_orphans = target.is_none();

    if destroy {
        let graph = ws.graph(target, Direction::Dependents)?;
        let plan = declarative::plan_destroy(&graph, &ws.state, include_orphans)?;
        Ok((graph, plan))
    } else {
        let graph = ws.graph(target, Direction::Dependencies)?;
        let plan = declarative::plan(&graph, &ws.state, include_orphans)?;
        Ok((graph, plan))
    }
}

pub fn plan(ctx: &Context, target: Option<&str>, destroy: bool) -> Result<()> {
    let ws = Workspace::load(ctx)?;
    let (_, plan) = compute(&ws, target, destroy)?;

    display_plan(&plan, if destroy { "Destroy Plan" } else { "Execution Plan" });
    for reason in plan.nodes.iter().filter_map(|n| n.replace_reason()) {
        ui::dim(&reason.to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use declarative::PlannedAction;

    #[test]
    fn test_fresh_plan_creates_everything_in_order() {
        let (_dir, ctx) = workspace_dir(CONFIG);
        let ws = Workspace::load(&ctx).unwrap();
        let (_, plan) = compute(&ws, None, false).unwrap();

        let ids: Vec<String> = plan.nodes.iter().map(|n| n.id.to_string()).collect();
        assert_eq!(
            ids,
            [
                "user.lb",
                "policy.lb_ro",
                "user_policy_attachment.lb_ro",
                "access_key.lb"
            ]
        );
        assert!(plan.nodes.iter().all(|n| n.action == PlannedAction::Create));
    }

    #[test]
    fn test_destroy_plan_of_empty_state_is_a_no_op() {
        let (_dir, ctx) = workspace_dir(CONFIG);
        let ws = Workspace::load(&ctx).unwrap();
        let (_, plan) = compute(&ws, None, true).unwrap();
        assert!(!plan.has_changes());
    }

    #[test]
    fn test_validate_rejects_cycles() {
        let (_dir, ctx) = workspace_dir(
            r#"
[user.a]
name = "${user.b.name}"

[user.b]
name = "${user.a.name}"
"#,
        );
        let err = validate(&ctx).unwrap_err();
        assert!(format!("{err:#}").contains("dependency cycle"));
    }

    #[test]
    fn test_validate_rejects_reference_to_unset_input() {
        let (_dir, ctx) = workspace_dir(
            r#"
[user.a]
name = "a"

[user.b]
name = "b"
path = "${user.a.path}"
"#,
        );
        let err = validate(&ctx).unwrap_err();
        assert!(format!("{err:#}").contains("input is not set"));
    }
}
