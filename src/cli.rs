use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "stratum")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Declarative IAM resources: plan, apply and destroy a dependency graph", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "STRATUM_CONFIG",
        default_value = "stratum.toml"
    )]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Check the configuration: schema, references and cycles
    Validate,

    /// Print the dependency graph
    Graph(GraphArgs),

    /// Show what apply (or destroy) would change
    Plan(PlanArgs),

    /// Create, update or replace resources to match the configuration
    Apply(ApplyArgs),

    /// Delete resources recorded in state, dependents first
    Destroy(DestroyArgs),

    /// Drop state entries whose remote object no longer exists
    Refresh(RefreshArgs),

    /// Show declared outputs
    Output(OutputArgs),

    /// Inspect recorded state
    #[command(subcommand)]
    State(StateCommand),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Graph / Plan
// ============================================================================

#[derive(Clone, Copy, Default, ValueEnum)]
pub enum GraphFormat {
    /// Resources in apply order with their dependencies
    #[default]
    Text,
    /// Graphviz dot
    Dot,
}

#[derive(Parser)]
pub struct GraphArgs {
    /// Output format
    #[arg(short, long, value_enum, default_value_t)]
    pub format: GraphFormat,
}

#[derive(Parser)]
pub struct PlanArgs {
    /// Only plan `kind` or `kind.name` (with its dependencies)
    #[arg(short, long)]
    pub target: Option<String>,

    /// Plan a destroy instead of an apply
    #[arg(long)]
    pub destroy: bool,
}

// ============================================================================
// Apply / Destroy / Refresh
// ============================================================================

#[derive(Parser)]
pub struct ApplyArgs {
    /// Only apply `kind` or `kind.name` (with its dependencies)
    #[arg(short, long)]
    pub target: Option<String>,

    /// Show the plan without making changes
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Maximum provider calls in flight (defaults to settings.jobs)
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Keep applying branches that do not depend on a failed resource
    #[arg(long)]
    pub continue_on_error: bool,
}

#[derive(Parser)]
pub struct DestroyArgs {
    /// Only destroy `kind` or `kind.name` (with everything depending on it)
    #[arg(short, long)]
    pub target: Option<String>,

    /// Show the plan without making changes
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Maximum provider calls in flight (defaults to settings.jobs)
    #[arg(short, long)]
    pub jobs: Option<usize>,
}

#[derive(Parser)]
pub struct RefreshArgs {
    /// Maximum provider calls in flight (defaults to settings.jobs)
    #[arg(short, long)]
    pub jobs: Option<usize>,
}

// ============================================================================
// Outputs / State
// ============================================================================

#[derive(Parser)]
pub struct OutputArgs {
    /// Only this output
    pub name: Option<String>,

    /// Print sensitive values in clear
    #[arg(long)]
    pub reveal: bool,

    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum StateCommand {
    /// List recorded resources
    List,

    /// Show one recorded resource
    Show {
        /// Resource identity, `kind.name`
        id: String,
    },

    /// Forget a resource without deleting it remotely
    Rm {
        /// Resource identity, `kind.name`
        id: String,
    },
}
