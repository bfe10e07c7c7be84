//! Configuration file loading
//!
//! `stratum.toml` declares resources as `[<kind>.<name>]` tables, named
//! outputs as `[output.<name>]` and engine settings under `[settings]`.
//! Tables are read in file order, which is the declaration order used to
//! break ties between independent resources.

use anyhow::{Context, Result, bail};
use declarative::{
    Configuration, FileLoader, Literal, OutputDeclaration, ResourceDeclaration, ResourceKind,
    Value,
};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Default state file, next to the configuration
pub const DEFAULT_STATE_FILE: &str = "stratum.state.toml";

// ============================================================================
// Settings
// ============================================================================

/// The `[settings]` table
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Maximum provider calls in flight
    #[serde(default = "default_jobs")]
    pub jobs: usize,

    /// State file, relative to the configuration file
    #[serde(default = "default_state")]
    pub state: String,

    /// Simulated account file; defaults to the user's data directory
    #[serde(default)]
    pub account: Option<String>,

    /// Account number used in generated ARNs
    #[serde(default = "default_account_id")]
    pub account_id: String,
}

fn default_jobs() -> usize {
    4
}

fn default_state() -> String {
    DEFAULT_STATE_FILE.to_string()
}

fn default_account_id() -> String {
    "123456789012".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            state: default_state(),
            account: None,
            account_id: default_account_id(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OutputTable {
    value: toml::Value,
    #[serde(default)]
    sensitive: bool,
}

// ============================================================================
// Loading
// ============================================================================

/// A parsed configuration file
#[derive(Debug)]
pub struct StratumConfig {
    /// Directory relative paths are resolved against
    pub base_dir: PathBuf,
    pub settings: Settings,
    pub configuration: Configuration,
}

impl StratumConfig {
    /// Read and parse a configuration file
    pub fn load(path: &Path, loader: &dyn FileLoader) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read config file: {}", path.display()))?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

        let config = Self::parse(&content, base_dir, loader)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        log::debug!(
            "Loaded {} resource(s) and {} output(s) from {}",
            config.configuration.len(),
            config.configuration.outputs().len(),
            path.display()
        );
        Ok(config)
    }

    /// Parse configuration text; `base_dir` anchors relative file paths
    pub fn parse(content: &str, base_dir: PathBuf, loader: &dyn FileLoader) -> Result<Self> {
        let table: toml::Table = toml::from_str(content).context("Invalid TOML format")?;

        let mut settings = Settings::default();
        let mut declarations = Vec::new();
        let mut outputs = Vec::new();

        for (key, value) in table {
            match key.as_str() {
                "settings" => {
                    settings = value.try_into().context("Invalid [settings] table")?;
                }
                "output" => {
                    let declared = value.as_table().context("[output] must hold named outputs")?;
                    for (name, raw) in declared {
                        outputs.push(
                            parse_output(name, raw, &base_dir, loader)
                                .with_context(|| format!("Invalid output '{name}'"))?,
                        );
                    }
                }
                kind => {
                    let kind: ResourceKind = kind.parse()?;
                    let resources = value
                        .as_table()
                        .with_context(|| format!("[{kind}] must hold named resources"))?;
                    for (name, attributes) in resources {
                        declarations.push(
                            parse_resource(kind, name, attributes, &base_dir, loader)
                                .with_context(|| format!("Invalid resource {kind}.{name}"))?,
                        );
                    }
                }
            }
        }

        if settings.jobs == 0 {
            bail!("settings.jobs must be at least 1");
        }

        let configuration = Configuration::new(declarations)?.with_outputs(outputs);
        Ok(Self {
            base_dir,
            settings,
            configuration,
        })
    }

    /// Where state is recorded
    pub fn state_path(&self) -> PathBuf {
        resolve_path(&self.base_dir, &self.settings.state)
    }

    /// Where the simulated account lives
    pub fn account_path(&self) -> Result<PathBuf> {
        if let Some(account) = &self.settings.account {
            return Ok(resolve_path(&self.base_dir, account));
        }
        let data = dirs::data_local_dir().context("Could not determine local data directory")?;
        Ok(data.join("stratum").join("account.toml"))
    }
}

/// Expand `~` and anchor relative paths at `base`
pub fn resolve_path(base: &Path, raw: &str) -> PathBuf {
    let expanded = PathBuf::from(shellexpand::tilde(raw).as_ref());
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

fn parse_resource(
    kind: ResourceKind,
    name: &str,
    attributes: &toml::Value,
    base: &Path,
    loader: &dyn FileLoader,
) -> Result<ResourceDeclaration> {
    let attributes = attributes
        .as_table()
        .context("a resource must be a table of attributes")?;

    let mut declaration = ResourceDeclaration::new(kind, name);
    for (attribute, value) in attributes {
        let value = parse_value(value, base, loader)
            .with_context(|| format!("Invalid value for '{attribute}'"))?;
        declaration = declaration.with(attribute.as_str(), value);
    }
    Ok(declaration)
}

fn parse_output(
    name: &str,
    raw: &toml::Value,
    base: &Path,
    loader: &dyn FileLoader,
) -> Result<OutputDeclaration> {
    let table: OutputTable = raw.clone().try_into()?;
    let output = OutputDeclaration::new(name, parse_value(&table.value, base, loader)?);
    Ok(if table.sensitive { output.sensitive() } else { output })
}

/// One attribute value: a literal, a `${..}` reference, or `{ file = ".." }`
fn parse_value(value: &toml::Value, base: &Path, loader: &dyn FileLoader) -> Result<Value> {
    match value {
        toml::Value::String(s) => Ok(Value::parse_str(s)?),
        toml::Value::Integer(i) => Ok(Literal::Int(*i).into()),
        toml::Value::Boolean(b) => Ok(Literal::Bool(*b).into()),
        toml::Value::Table(table) => {
            let Some(toml::Value::String(file)) = table.get("file") else {
                bail!("expected {{ file = \"path\" }}");
            };
            if table.len() != 1 {
                bail!("a file value takes only the `file` key");
            }
            let content = loader.load(&resolve_path(base, file))?;
            Ok(Value::File(content))
        }
        other => bail!("unsupported value type: {}", other.type_str()),
    }
}

// ============================================================================
// Tests
// ============================================================================
