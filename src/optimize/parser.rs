//! # Stage: Optimize Parser
//!
//! ## Responsibility
//! Turn a decoded optimize document into [`OptimizeConfig`] content, either
//! wholesale or one component at a time.
//!
//! Parsers are selected by the document's `schema_version` through a
//! [`ParserRegistry`] that maps versions to factories and resolves the highest
//! registered version not newer than the one requested.
//!
//! ## Guarantees
//! - A component's section is fully validated before anything of it is
//!   written into the config.
//! - No rollback across components: a wholesale load that fails on one
//!   component keeps the components loaded before it.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_yaml::Value as Yaml;
use tracing::error;

use super::config::{OptimizeConfig, StageMap};
use super::entrance::EntranceDecl;
use super::item::{ItemDecl, OptimizeType};
use super::optimizer::{Optimizer, OptimizerDecl};
use super::version::ComponentVersion;
use crate::error::{OptimizeError, Result};

/// Top-level key holding the document's schema version.
pub const SCHEMA_VERSION_KEY: &str = "schema_version";
/// Top-level key holding optimizer bindings per component.
pub const OPTIMIZER_KEY: &str = "optimizer";
/// Top-level key holding stage declarations per component.
pub const OPTIMIZE_CONFIG_KEY: &str = "optimize_config";

/// Turns documents of one schema version into config content.
pub trait OptimizeParser: Send + Sync {
    /// Schema version this parser understands.
    fn schema_version(&self) -> &str;

    /// Replace everything in `config` with the document's content.
    ///
    /// Errors are logged; returns `false` if any component failed.
    fn load(&self, config: &mut OptimizeConfig, document: &Yaml) -> bool;

    /// Replace `component`'s entire stage map with `stages`.
    fn load_config_by_component(&self, config: &mut OptimizeConfig, component: &str, stages: &Yaml) -> Result<()>;

    /// Merge `optimizers` (`{<type>: {<name>: {query, modify}}}`) into
    /// `component`'s existing bindings.
    fn load_optimizer_by_component(&self, config: &mut OptimizeConfig, component: &str, optimizers: &Yaml) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Schema 0.1
// ---------------------------------------------------------------------------

/// Parser for schema version `0.1`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParserV01;

impl ParserV01 {
    pub const VERSION: &'static str = "0.1";

    pub fn boxed() -> Box<dyn OptimizeParser> {
        Box::new(ParserV01)
    }
}

fn mapping<'a>(value: &'a Yaml, what: &str) -> Result<&'a serde_yaml::Mapping> {
    value
        .as_mapping()
        .ok_or_else(|| OptimizeError::Parse(format!("{} must be a mapping", what)))
}

fn key_text(key: &Yaml, what: &str) -> Result<String> {
    match key {
        Yaml::String(s) => Ok(s.clone()),
        Yaml::Number(n) => Ok(n.to_string()),
        _ => Err(OptimizeError::Parse(format!("{} keys must be strings", what))),
    }
}

fn parse_stages(component: &str, stages: &Yaml) -> Result<StageMap> {
    let mut out = StageMap::new();
    if stages.is_null() {
        return Ok(out);
    }
    for (stage, kinds) in mapping(stages, &format!("optimize_config.{}", component))? {
        let stage = key_text(stage, "stage")?;
        let mut entrances = Vec::new();
        if !kinds.is_null() {
            for (kind, items) in mapping(kinds, &format!("optimize_config.{}.{}", component, stage))? {
                let kind: OptimizeType = key_text(kind, "optimize type")?.parse()?;
                let items = match items {
                    Yaml::Null => Vec::new(),
                    Yaml::Sequence(seq) => seq
                        .iter()
                        .map(|raw| ItemDecl::parse(kind, raw))
                        .collect::<Result<Vec<_>>>()?,
                    _ => {
                        return Err(OptimizeError::Parse(format!(
                            "{}.{}.{} must be a list",
                            component, stage, kind
                        )))
                    }
                };
                entrances.push(EntranceDecl { kind, items });
            }
        }
        out.insert(stage, entrances);
    }
    Ok(out)
}

fn parse_optimizers(component: &str, optimizers: &Yaml) -> Result<Vec<(OptimizeType, Vec<Optimizer>)>> {
    let mut out = Vec::new();
    if optimizers.is_null() {
        return Ok(out);
    }
    for (kind, named) in mapping(optimizers, &format!("optimizer.{}", component))? {
        let kind: OptimizeType = key_text(kind, "optimize type")?.parse()?;
        let mut set = Vec::new();
        if !named.is_null() {
            for (name, decl) in mapping(named, &format!("optimizer.{}.{}", component, kind))? {
                let decl: OptimizerDecl = serde_yaml::from_value(decl.clone())?;
                set.push(Optimizer::from_decl(key_text(name, "optimizer")?, decl));
            }
        }
        out.push((kind, set));
    }
    Ok(out)
}

impl OptimizeParser for ParserV01 {
    fn schema_version(&self) -> &str {
        Self::VERSION
    }

    fn load(&self, config: &mut OptimizeConfig, document: &Yaml) -> bool {
        config.clear();

        let sections = [
            (OPTIMIZER_KEY, true),
            (OPTIMIZE_CONFIG_KEY, false),
        ];
        for (key, is_optimizer) in sections {
            let Some(section) = document.get(key) else {
                continue;
            };
            let components = match mapping(section, key) {
                Ok(m) => m,
                Err(e) => {
                    error!(section = key, error = %e, "failed to load optimize document");
                    return false;
                }
            };
            for (component, body) in components {
                let loaded = key_text(component, "component").and_then(|component| {
                    if is_optimizer {
                        self.load_optimizer_by_component(config, &component, body)
                    } else {
                        self.load_config_by_component(config, &component, body)
                    }
                });
                if let Err(e) = loaded {
                    error!(section = key, error = %e, "failed to load optimize document");
                    return false;
                }
            }
        }
        true
    }

    fn load_config_by_component(&self, config: &mut OptimizeConfig, component: &str, stages: &Yaml) -> Result<()> {
        let stages = parse_stages(component, stages)?;
        config.set_stages(component, stages);
        Ok(())
    }

    fn load_optimizer_by_component(&self, config: &mut OptimizeConfig, component: &str, optimizers: &Yaml) -> Result<()> {
        for (kind, set) in parse_optimizers(component, optimizers)? {
            config.merge_optimizers(component, kind, set);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ParserRegistry
// ---------------------------------------------------------------------------

/// Builds a parser instance.
pub type ParserFactory = fn() -> Box<dyn OptimizeParser>;

/// Schema versions mapped to parser factories.
///
/// Resolution picks the highest registered version not newer than the one
/// requested.  Each version is instantiated once and shared afterwards.
pub struct ParserRegistry {
    factories: BTreeMap<ComponentVersion, ParserFactory>,
    instances: BTreeMap<ComponentVersion, Arc<dyn OptimizeParser>>,
}

impl ParserRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self { factories: BTreeMap::new(), instances: BTreeMap::new() }
    }

    /// Register `factory` for `version`, replacing any previous one.
    pub fn register(&mut self, version: &str, factory: ParserFactory) -> Result<()> {
        let version: ComponentVersion = version.parse()?;
        self.instances.remove(&version);
        self.factories.insert(version, factory);
        Ok(())
    }

    /// Registered versions, lowest first.
    pub fn versions(&self) -> Vec<&ComponentVersion> {
        self.factories.keys().collect()
    }

    /// Highest registered version.
    pub fn latest(&self) -> Option<&ComponentVersion> {
        self.factories.keys().next_back()
    }

    /// Parser for the highest registered version `<= version`.
    pub fn resolve(&mut self, version: &ComponentVersion) -> Result<Arc<dyn OptimizeParser>> {
        let (found, factory) = self
            .factories
            .range(..=version.clone())
            .next_back()
            .map(|(v, f)| (v.clone(), *f))
            .ok_or_else(|| OptimizeError::NoParser(version.to_string()))?;
        let parser = self.instances.entry(found).or_insert_with(|| Arc::from(factory()));
        Ok(Arc::clone(parser))
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        if let Ok(version) = ParserV01::VERSION.parse() {
            registry.factories.insert(version, ParserV01::boxed);
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Params;

    const DOC: &str = r#"
schema_version: "0.1"
optimizer:
  oceanbase:
    variables:
      default:
        query: "show variables like '{name}'"
        modify: "set global {name} = {value}"
    system_config:
      default:
        query: "show parameters like '{name}'"
        modify: "alter system set {name} = {value}"
optimize_config:
  oceanbase:
    bench:
      variables:
        - {name: ob_query_timeout, value: 36000000000, value_type: int}
        - {name: autocommit, value: 1}
      system_config:
        - {name: enable_sql_audit, value: false, value_type: bool, need_restart: true}
      exec_sql:
        - {name: freeze, value: "alter system major freeze"}
    post_bench:
      exec_sql_file:
        - {path: /tmp/post.sql, sys: true}
  obproxy:
    bench:
      variables:
        - {name: proxy_mem_limited, value: 4G, value_type: capacity}
"#;

    fn doc(src: &str) -> Yaml {
        serde_yaml::from_str(src).unwrap()
    }

    #[test]
    fn test_load_full_document() {
        let mut cfg = OptimizeConfig::new();
        assert!(ParserV01.load(&mut cfg, &doc(DOC)));
        assert_eq!(cfg.components(), vec!["obproxy", "oceanbase"]);
        assert_eq!(cfg.stages("oceanbase"), vec!["bench", "post_bench"]);

        let kinds: Vec<_> = cfg.declarations("oceanbase", "bench").iter().map(|d| d.kind).collect();
        assert_eq!(kinds, vec![OptimizeType::Variables, OptimizeType::SystemConfig, OptimizeType::ExecSql]);
        assert!(cfg.optimizer("oceanbase", OptimizeType::SystemConfig, "default").is_some());

        cfg.set_environment(Params::new());
        let entrances = cfg.get_optimize_entrances("oceanbase", "bench").unwrap();
        assert_eq!(entrances[0].items().len(), 2);
    }

    #[test]
    fn test_load_replaces_previous_content() {
        let mut cfg = OptimizeConfig::new();
        assert!(ParserV01.load(&mut cfg, &doc(DOC)));
        assert!(ParserV01.load(&mut cfg, &doc("optimize_config: {obagent: {bench: {}}}")));
        assert_eq!(cfg.components(), vec!["obagent"]);
        assert!(cfg.optimizer("oceanbase", OptimizeType::Variables, "default").is_none());
    }

    #[test]
    fn test_load_unknown_type_fails_but_keeps_earlier_components() {
        let src = r#"
optimize_config:
  a:
    s: {variables: [{name: x, value: 1}]}
  b:
    s: {indexes: [{name: y}]}
  c:
    s: {variables: [{name: z, value: 1}]}
"#;
        let mut cfg = OptimizeConfig::new();
        assert!(!ParserV01.load(&mut cfg, &doc(src)));
        assert_eq!(cfg.components(), vec!["a"]);
    }

    #[test]
    fn test_load_malformed_items_fails() {
        let mut cfg = OptimizeConfig::new();
        let src = "optimize_config: {a: {s: {variables: {name: x}}}}";
        assert!(!ParserV01.load(&mut cfg, &doc(src)));
        assert!(cfg.components().is_empty());
    }

    #[test]
    fn test_load_out_of_range_duration_fails() {
        let mut cfg = OptimizeConfig::new();
        let src = "optimize_config: {a: {s: {variables: [{name: x, value: 99999999999999999999999d, value_type: duration}]}}}";
        assert!(!ParserV01.load(&mut cfg, &doc(src)));
        assert!(cfg.components().is_empty());
    }

    #[test]
    fn test_config_by_component_replaces_stage_map() {
        let mut cfg = OptimizeConfig::new();
        assert!(ParserV01.load(&mut cfg, &doc(DOC)));
        let scenario = doc("tpcc: {variables: [{name: a, value: 1}]}");
        ParserV01.load_config_by_component(&mut cfg, "oceanbase", &scenario).unwrap();
        assert_eq!(cfg.stages("oceanbase"), vec!["tpcc"]);
        assert_eq!(cfg.stages("obproxy"), vec!["bench"]);
    }

    #[test]
    fn test_optimizer_by_component_merges() {
        let mut cfg = OptimizeConfig::new();
        assert!(ParserV01.load(&mut cfg, &doc(DOC)));
        let overlay = doc("variables: {default: {query: 'select 1'}, extra: {modify: 'set x'}}");
        ParserV01.load_optimizer_by_component(&mut cfg, "oceanbase", &overlay).unwrap();

        let default = cfg.optimizer("oceanbase", OptimizeType::Variables, "default").unwrap();
        assert_eq!(default.query_template(), Some("select 1"));
        assert!(default.modify_template().is_none());
        assert!(cfg.optimizer("oceanbase", OptimizeType::Variables, "extra").is_some());
        // Untouched type keeps its bindings.
        assert!(cfg.optimizer("oceanbase", OptimizeType::SystemConfig, "default").is_some());
    }

    #[test]
    fn test_registry_resolves_highest_not_newer() {
        let mut registry = ParserRegistry::default();
        let parser = registry.resolve(&"0.3".parse().unwrap()).unwrap();
        assert_eq!(parser.schema_version(), "0.1");
        assert!(registry.resolve(&"0.0.9".parse().unwrap()).is_err());
    }

    #[test]
    fn test_registry_shares_instances() {
        let mut registry = ParserRegistry::default();
        let a = registry.resolve(&"0.1".parse().unwrap()).unwrap();
        let b = registry.resolve(&"0.2".parse().unwrap()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_registry_register_newer_version() {
        let mut registry = ParserRegistry::default();
        registry.register("0.2", ParserV01::boxed).unwrap();
        assert_eq!(registry.latest().unwrap().as_str(), "0.2");
        assert_eq!(registry.versions().len(), 2);
    }
}
