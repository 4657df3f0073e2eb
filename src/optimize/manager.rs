//! # Stage: Optimize Manager
//!
//! ## Responsibility
//! Facade over the tuning engine.  Knows which components (and versions) are
//! deployed, finds the right definition files on disk for each of them,
//! resolves the parser for the document schema, and exposes the resulting
//! [`OptimizeConfig`].
//!
//! On-disk layout under `<home>/optimize/`:
//!
//! ```text
//! optimize_parser/<version>/              # one directory per schema version
//! <component>/<version>/optimizer.yaml    # {optimizer: {<type>: {<name>: {query, modify}}}}
//! <component>/<version>/<scenario>.yaml   # {optimize_config: {<stage>: {<type>: [...]}}}
//! ```
//!
//! ## Guarantees
//! - Resolve once: the first parser resolved is used for the rest of the
//!   manager's life.  Later requests for another schema version are logged
//!   and served by the cached parser.
//! - A missing definition file is never an error; it is logged at debug level
//!   and skipped.
//!
//! ## NOT Responsible For
//! - Applying anything: callers take entrances from the config and drive them.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_yaml::Value as Yaml;
use tracing::{debug, error, warn};

use super::config::OptimizeConfig;
use super::parser::{OptimizeParser, ParserRegistry, OPTIMIZER_KEY, OPTIMIZE_CONFIG_KEY, SCHEMA_VERSION_KEY};
use super::version::{search_versioned_file, version_dirs, ComponentVersion, SENTINEL_VERSION};
use crate::error::{OptimizeError, Result};

/// Environment variable naming the home directory.
pub const HOME_ENV: &str = "DEPLOY_TUNE_HOME";

/// File name stem of per-component optimizer bindings.
pub const OPTIMIZER_FILE_STEM: &str = "optimizer";

const OPTIMIZE_DIR: &str = "optimize";
const PARSER_DIR: &str = "optimize_parser";

// ---------------------------------------------------------------------------
// ManagerConfig
// ---------------------------------------------------------------------------

/// Where definitions live and how they are looked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Directory containing `optimize/`.
    pub home: PathBuf,
    /// Version directory used when no real version matches.
    pub sentinel_version: String,
    /// Document extensions tried, in order.
    pub extensions: Vec<String>,
}

impl ManagerConfig {
    /// Defaults: sentinel `0.1`, extensions `yaml`, `yml`, `toml`.
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            sentinel_version: SENTINEL_VERSION.to_string(),
            extensions: vec!["yaml".to_string(), "yml".to_string(), "toml".to_string()],
        }
    }

    /// Read the home directory from `DEPLOY_TUNE_HOME`.
    pub fn from_env() -> Result<Self> {
        let home = std::env::var(HOME_ENV)
            .map_err(|_| OptimizeError::Parse(format!("{} is not set", HOME_ENV)))?;
        Ok(Self::new(home))
    }

    pub fn optimize_root(&self) -> PathBuf {
        self.home.join(OPTIMIZE_DIR)
    }

    pub fn parser_root(&self) -> PathBuf {
        self.optimize_root().join(PARSER_DIR)
    }
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// Read a YAML or TOML document, chosen by extension (YAML otherwise).
pub fn read_document(path: &Path) -> Result<Yaml> {
    let content = fs::read_to_string(path).map_err(|e| OptimizeError::io(path, e))?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Ok(toml::from_str::<Yaml>(&content)?),
        _ => Ok(serde_yaml::from_str::<Yaml>(&content)?),
    }
}

/// The document's declared `schema_version`, if any.
pub fn schema_version(document: &Yaml) -> Option<String> {
    match document.get(SCHEMA_VERSION_KEY)? {
        Yaml::String(s) => Some(s.clone()),
        Yaml::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// OptimizeManager
// ---------------------------------------------------------------------------

/// Loads versioned tuning definitions for the registered components.
pub struct OptimizeManager {
    config: ManagerConfig,
    components: BTreeMap<String, ComponentVersion>,
    registry: ParserRegistry,
    parser: Option<Arc<dyn OptimizeParser>>,
    optimize_config: OptimizeConfig,
}

impl OptimizeManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_registry(config, ParserRegistry::default())
    }

    pub fn with_registry(config: ManagerConfig, registry: ParserRegistry) -> Self {
        Self {
            config,
            components: BTreeMap::new(),
            registry,
            parser: None,
            optimize_config: OptimizeConfig::new(),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Declare a deployed component; required before any load.
    pub fn register_component(&mut self, name: impl Into<String>, version: &str) -> Result<()> {
        let version = version.parse()?;
        self.components.insert(name.into(), version);
        Ok(())
    }

    pub fn components(&self) -> &BTreeMap<String, ComponentVersion> {
        &self.components
    }

    pub fn optimize_config(&self) -> &OptimizeConfig {
        &self.optimize_config
    }

    pub fn optimize_config_mut(&mut self) -> &mut OptimizeConfig {
        &mut self.optimize_config
    }

    /// The parser resolved so far, if any.
    pub fn parser(&self) -> Option<&Arc<dyn OptimizeParser>> {
        self.parser.as_ref()
    }

    /// Resolve the parser for `version`, or for the newest schema present
    /// under `optimize_parser/` when `None`.
    pub fn resolve_parser(&mut self, version: Option<&str>) -> Result<Arc<dyn OptimizeParser>> {
        if let Some(parser) = &self.parser {
            if let Some(requested) = version {
                if requested != parser.schema_version() {
                    warn!(
                        requested,
                        cached = parser.schema_version(),
                        "parser already resolved for this manager; ignoring requested version"
                    );
                }
            }
            return Ok(Arc::clone(parser));
        }

        let target = match version {
            Some(v) => v.parse()?,
            None => match version_dirs(&self.config.parser_root()).into_iter().next() {
                Some(v) => v,
                None => self
                    .registry
                    .latest()
                    .cloned()
                    .ok_or_else(|| OptimizeError::NoParser("<none registered>".to_string()))?,
            },
        };
        let parser = self.registry.resolve(&target)?;
        debug!(requested = %target, resolved = parser.schema_version(), "resolved optimize parser");
        self.parser = Some(Arc::clone(&parser));
        Ok(parser)
    }

    /// Version-aware lookup of `filename` for a registered component.
    pub fn search_file(&self, component: &str, filename: &str) -> Result<Option<PathBuf>> {
        let version = self
            .components
            .get(component)
            .ok_or_else(|| OptimizeError::ComponentNotRegistered(component.to_string()))?;
        Ok(search_versioned_file(
            &self.config.optimize_root(),
            component,
            version,
            filename,
            &self.config.sentinel_version,
        ))
    }

    /// Like [`Self::search_file`], trying each configured extension for `stem`.
    pub fn search_document(&self, component: &str, stem: &str) -> Result<Option<PathBuf>> {
        for ext in &self.config.extensions {
            if let Some(path) = self.search_file(component, &format!("{}.{}", stem, ext))? {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    fn load_default_optimizers(&mut self, parser: &dyn OptimizeParser) -> Result<()> {
        let names: Vec<String> = self.components.keys().cloned().collect();
        for component in names {
            let Some(path) = self.search_document(&component, OPTIMIZER_FILE_STEM)? else {
                debug!(component = %component, "no default optimizer file");
                continue;
            };
            let document = read_document(&path)?;
            let section = document.get(OPTIMIZER_KEY).unwrap_or(&document);
            parser.load_optimizer_by_component(&mut self.optimize_config, &component, section)?;
            debug!(component = %component, path = %path.display(), "loaded default optimizers");
        }
        Ok(())
    }

    fn try_load_config(&mut self, path: &Path) -> Result<()> {
        let document = read_document(path)?;
        let parser = self.resolve_parser(schema_version(&document).as_deref())?;
        self.load_default_optimizers(parser.as_ref())?;

        if let Some(section) = document.get(OPTIMIZER_KEY).and_then(Yaml::as_mapping) {
            for (component, optimizers) in section {
                let component = component_name(component)?;
                parser.load_optimizer_by_component(&mut self.optimize_config, &component, optimizers)?;
            }
        }
        if let Some(section) = document.get(OPTIMIZE_CONFIG_KEY).and_then(Yaml::as_mapping) {
            for (component, stages) in section {
                let component = component_name(component)?;
                parser.load_config_by_component(&mut self.optimize_config, &component, stages)?;
            }
        }
        Ok(())
    }

    /// Load default optimizers for every registered component, then layer
    /// the document at `path` on top.  Errors are logged.
    pub fn load_config(&mut self, path: &Path) -> bool {
        match self.try_load_config(path) {
            Ok(()) => true,
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to load optimize config");
                false
            }
        }
    }

    fn try_load_default_config(&mut self, scenario: &str) -> Result<()> {
        let parser = self.resolve_parser(None)?;
        self.load_default_optimizers(parser.as_ref())?;

        let names: Vec<String> = self.components.keys().cloned().collect();
        for component in names {
            let Some(path) = self.search_document(&component, scenario)? else {
                debug!(component = %component, scenario, "no scenario file");
                continue;
            };
            let document = read_document(&path)?;
            if let Some(optimizers) = document.get(OPTIMIZER_KEY) {
                parser.load_optimizer_by_component(&mut self.optimize_config, &component, optimizers)?;
            }
            let stages = document.get(OPTIMIZE_CONFIG_KEY).unwrap_or(&document);
            parser.load_config_by_component(&mut self.optimize_config, &component, stages)?;
            debug!(component = %component, path = %path.display(), "loaded scenario");
        }
        Ok(())
    }

    /// Load default optimizers and the `scenario` definitions of every
    /// registered component.  Errors are logged.
    pub fn load_default_config(&mut self, scenario: &str) -> bool {
        match self.try_load_default_config(scenario) {
            Ok(()) => true,
            Err(e) => {
                error!(scenario, error = %e, "failed to load default optimize config");
                false
            }
        }
    }
}

fn component_name(key: &Yaml) -> Result<String> {
    key.as_str()
        .map(str::to_string)
        .ok_or_else(|| OptimizeError::Parse("component keys must be strings".to_string()))
}
