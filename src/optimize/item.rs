//! # Stage: Tunable Items
//!
//! ## Responsibility
//! One desired change each: decide whether it is needed, apply it through the
//! bound optimizer or client tool, and remember enough to undo it.
//!
//! Declarations are validated into [`ItemDecl`] once at load time.  A fresh
//! [`Item`] is built from its declaration every time an entrance is requested,
//! so captured origin values never leak between runs.
//!
//! ## Guarantees
//! - An item's origin value is captured only by a successful query during
//!   apply; recover without a captured value is a no-op.
//! - `ExecSql` and `SqlFile` are irreversible: recover never touches the
//!   cluster.
//!
//! ## NOT Responsible For
//! - Ordering, bookkeeping of applied items, or error containment
//!   (see [`super::entrance`]).

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::optimizer::{Optimizer, OptimizerSet, DEFAULT_OPTIMIZER};
use crate::error::{OptimizeError, Result};
use crate::expr::{Condition, Expr};
use crate::session::{row_value, ClientCommand, CommandRunner, Session};
use crate::value::{scalar_text, Params, TypedValue, ValueType};

/// Item name that turns a variable declaration into a pause.
pub const DELAY_ITEM_NAME: &str = "sleep";

/// Client tool used for SQL scripts when the environment names none.
pub const DEFAULT_CLIENT_BIN: &str = "obclient";

// ---------------------------------------------------------------------------
// OptimizeType
// ---------------------------------------------------------------------------

/// The four kinds of tuning declarations, keyed by their document section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OptimizeType {
    Variables,
    SystemConfig,
    ExecSql,
    ExecSqlFile,
}

impl OptimizeType {
    pub const ALL: [OptimizeType; 4] = [
        OptimizeType::Variables,
        OptimizeType::SystemConfig,
        OptimizeType::ExecSql,
        OptimizeType::ExecSqlFile,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            OptimizeType::Variables => "variables",
            OptimizeType::SystemConfig => "system_config",
            OptimizeType::ExecSql => "exec_sql",
            OptimizeType::ExecSqlFile => "exec_sql_file",
        }
    }
}

impl fmt::Display for OptimizeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

impl FromStr for OptimizeType {
    type Err = OptimizeError;

    fn from_str(s: &str) -> Result<Self> {
        OptimizeType::ALL
            .into_iter()
            .find(|t| t.key() == s)
            .ok_or_else(|| OptimizeError::UnknownType(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Raw declarations (document shape)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawVariable {
    name: String,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    value_type: Option<String>,
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    expression: bool,
    #[serde(default)]
    need_restart: bool,
    #[serde(default)]
    tenant: Option<String>,
    #[serde(flatten)]
    extras: Params,
}

#[derive(Debug, Deserialize)]
struct RawExecSql {
    #[serde(default)]
    name: Option<String>,
    value: String,
    #[serde(default)]
    need_restart: bool,
    #[serde(flatten)]
    extras: Params,
}

#[derive(Debug, Deserialize)]
struct RawSqlFile {
    path: PathBuf,
    #[serde(default)]
    sys: bool,
}

// ---------------------------------------------------------------------------
// Validated declarations
// ---------------------------------------------------------------------------

/// Desired value of a variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Desired {
    Literal(Value),
    /// Computed from the shared environment at apply time.
    Expression { expr: Expr, source: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableSpec {
    pub name: String,
    pub desired: Desired,
    pub value_type: ValueType,
    pub condition: Condition,
    pub need_restart: bool,
    /// Only meaningful for system config items.
    pub tenant: Option<String>,
    pub extras: Params,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecSqlSpec {
    pub name: String,
    pub statement: String,
    pub need_restart: bool,
    pub extras: Params,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlFileSpec {
    pub path: PathBuf,
    /// Run as the sys tenant's administrator instead of the business user.
    pub sys: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DelaySpec {
    /// Non-negative and representable; checked at load time.
    pub pause: Duration,
}

/// A validated item declaration.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemDecl {
    Variable(VariableSpec),
    SystemConfig(VariableSpec),
    ExecSql(ExecSqlSpec),
    SqlFile(SqlFileSpec),
    Delay(DelaySpec),
}

impl ItemDecl {
    /// Validate one declaration from the `kind` section of a document.
    pub fn parse(kind: OptimizeType, raw: &serde_yaml::Value) -> Result<Self> {
        match kind {
            OptimizeType::Variables | OptimizeType::SystemConfig => {
                let raw: RawVariable = serde_yaml::from_value(raw.clone())?;
                if raw.name == DELAY_ITEM_NAME {
                    let pause = match ValueType::Double.coerce(&raw.value)? {
                        TypedValue::Double(s) => Duration::try_from_secs_f64(s).ok(),
                        _ => None,
                    };
                    let pause = pause.ok_or_else(|| OptimizeError::Value {
                        value: scalar_text(&raw.value),
                        value_type: "delay seconds".to_string(),
                    })?;
                    return Ok(ItemDecl::Delay(DelaySpec { pause }));
                }
                let spec = variable_spec(raw)?;
                Ok(if kind == OptimizeType::Variables {
                    ItemDecl::Variable(spec)
                } else {
                    ItemDecl::SystemConfig(spec)
                })
            }
            OptimizeType::ExecSql => {
                let raw: RawExecSql = serde_yaml::from_value(raw.clone())?;
                Ok(ItemDecl::ExecSql(ExecSqlSpec {
                    name: raw.name.unwrap_or_else(|| raw.value.clone()),
                    statement: raw.value,
                    need_restart: raw.need_restart,
                    extras: raw.extras,
                }))
            }
            OptimizeType::ExecSqlFile => {
                let raw: RawSqlFile = serde_yaml::from_value(raw.clone())?;
                Ok(ItemDecl::SqlFile(SqlFileSpec { path: raw.path, sys: raw.sys }))
            }
        }
    }
}

fn variable_spec(raw: RawVariable) -> Result<VariableSpec> {
    let value_type = match &raw.value_type {
        Some(t) => t.parse()?,
        None => ValueType::default(),
    };
    let condition = match &raw.condition {
        Some(c) => c.parse()?,
        None => Condition::default(),
    };
    let desired = if raw.expression {
        let source = scalar_text(&raw.value);
        Desired::Expression { expr: Expr::parse(&source)?, source }
    } else {
        value_type.coerce(&raw.value)?;
        Desired::Literal(raw.value)
    };
    Ok(VariableSpec {
        name: raw.name,
        desired,
        value_type,
        condition,
        need_restart: raw.need_restart,
        tenant: raw.tenant,
        extras: raw.extras,
    })
}

// ---------------------------------------------------------------------------
// Execution context
// ---------------------------------------------------------------------------

/// What an item may read from its owning entrance.
#[derive(Debug, Clone, Copy)]
pub struct ItemContext<'a> {
    pub environment: &'a Params,
    pub optimizers: &'a OptimizerSet,
}

impl<'a> ItemContext<'a> {
    /// The optimizer dedicated to `name`, else the type's default one.
    pub fn optimizer_for(&self, name: &str) -> Option<&'a Arc<Optimizer>> {
        self.optimizers
            .get(name)
            .or_else(|| self.optimizers.get(DEFAULT_OPTIMIZER))
    }
}

/// Handles to the live cluster used while applying or recovering.
pub struct ExecContext<'a> {
    pub session: &'a mut dyn Session,
    pub runner: &'a dyn CommandRunner,
}

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

/// A variable change gated by a condition; restored to its captured origin.
#[derive(Debug, Clone)]
pub struct VariableItem {
    spec: VariableSpec,
    origin: Option<TypedValue>,
}

impl VariableItem {
    pub fn new(spec: VariableSpec) -> Self {
        Self { spec, origin: None }
    }

    pub fn spec(&self) -> &VariableSpec {
        &self.spec
    }

    /// Value captured before the change, if apply got that far.
    pub fn origin(&self) -> Option<&TypedValue> {
        self.origin.as_ref()
    }

    fn desired(&self, env: &Params) -> Result<TypedValue> {
        let raw = match &self.spec.desired {
            Desired::Literal(v) => v.clone(),
            Desired::Expression { expr, .. } => expr.eval_in(env)?.to_json(),
        };
        self.spec.value_type.coerce(&raw)
    }

    fn call_params(&self, env: &Params, value: &TypedValue, scope: &Params, params: &Params) -> Params {
        let mut call = env.clone();
        call.insert("name".to_string(), Value::String(self.spec.name.clone()));
        call.insert("value".to_string(), value.to_json());
        call.extend(self.spec.extras.iter().map(|(k, v)| (k.clone(), v.clone())));
        call.extend(scope.iter().map(|(k, v)| (k.clone(), v.clone())));
        call.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
        call
    }

    fn apply_scoped(
        &mut self,
        ctx: &ItemContext<'_>,
        exec: &mut ExecContext<'_>,
        scope: &Params,
        params: &Params,
    ) -> Result<bool> {
        let name = self.spec.name.clone();
        let desired = self.desired(ctx.environment)?;
        let call = self.call_params(ctx.environment, &desired, scope, params);

        let Some(optimizer) = ctx.optimizer_for(&name) else {
            warn!(item = %name, "no optimizer bound, current value unknown; skipping");
            return Ok(false);
        };
        let row = optimizer.query(exec.session, &call)?;
        let Some(current_raw) = row.as_ref().and_then(row_value) else {
            warn!(item = %name, "current value unknown; skipping");
            return Ok(false);
        };
        let current = self.spec.value_type.coerce(current_raw)?;
        self.origin = Some(current.clone());

        if !self.spec.condition.holds(&desired, &current, ctx.environment)? {
            debug!(item = %name, current = %current, desired = %desired, "condition not met; unchanged");
            return Ok(false);
        }

        let modified = optimizer.modify(exec.session, &desired.to_json(), &call)?;
        if modified {
            debug!(item = %name, from = %current, to = %desired, "applied");
        }
        Ok(modified)
    }

    fn recover_scoped(
        &mut self,
        ctx: &ItemContext<'_>,
        exec: &mut ExecContext<'_>,
        scope: &Params,
        params: &Params,
    ) -> Result<bool> {
        let Some(origin) = self.origin.clone() else {
            return Ok(false);
        };
        let Some(optimizer) = ctx.optimizer_for(&self.spec.name) else {
            warn!(item = %self.spec.name, "no optimizer bound; cannot recover");
            return Ok(false);
        };
        let call = self.call_params(ctx.environment, &origin, scope, params);
        let restored = optimizer.modify(exec.session, &origin.to_json(), &call)?;
        if restored {
            debug!(item = %self.spec.name, to = %origin, "recovered");
        }
        Ok(restored)
    }
}

/// A cluster-level parameter; like a variable but tenant-scoped and
/// possibly requiring a restart.
#[derive(Debug, Clone)]
pub struct SystemConfigItem {
    inner: VariableItem,
}

impl SystemConfigItem {
    pub fn new(spec: VariableSpec) -> Self {
        Self { inner: VariableItem::new(spec) }
    }

    pub fn origin(&self) -> Option<&TypedValue> {
        self.inner.origin()
    }

    fn scope(&self, env: &Params) -> Params {
        let tenant = self
            .inner
            .spec
            .tenant
            .clone()
            .map(Value::String)
            .or_else(|| env.get("tenant").cloned())
            .unwrap_or_else(|| Value::String("sys".to_string()));
        Params::from([("tenant".to_string(), tenant)])
    }
}

/// One unconditional statement.
#[derive(Debug)]
pub struct ExecSqlItem {
    spec: ExecSqlSpec,
    optimizer: Optimizer,
}

impl ExecSqlItem {
    pub fn new(spec: ExecSqlSpec) -> Self {
        let optimizer = Optimizer::new(spec.name.clone(), None, Some(spec.statement.clone()));
        Self { spec, optimizer }
    }

    fn apply(&self, ctx: &ItemContext<'_>, exec: &mut ExecContext<'_>, params: &Params) -> Result<bool> {
        let mut call = ctx.environment.clone();
        call.insert("name".to_string(), Value::String(self.spec.name.clone()));
        call.extend(self.spec.extras.iter().map(|(k, v)| (k.clone(), v.clone())));
        call.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.optimizer.modify(exec.session, &Value::Null, &call)
    }
}

/// An external SQL script fed to the client tool.
#[derive(Debug, Clone)]
pub struct SqlFileItem {
    spec: SqlFileSpec,
}

impl SqlFileItem {
    pub fn new(spec: SqlFileSpec) -> Self {
        Self { spec }
    }

    /// Build the client invocation from the shared environment.
    pub fn command(&self, env: &Params) -> Result<ClientCommand> {
        let text = |key: &str| env.get(key).map(scalar_text).filter(|s| !s.is_empty());
        let required = |key: &str| {
            text(key).ok_or_else(|| OptimizeError::Command {
                command: format!("sql file {}", self.spec.path.display()),
                stderr: format!("environment has no '{}'", key),
            })
        };

        let (user, tenant, password) = if self.spec.sys {
            (
                text("sys_user").unwrap_or_else(|| "root".to_string()),
                Some("sys".to_string()),
                text("sys_password"),
            )
        } else {
            (required("user")?, text("tenant"), text("password"))
        };

        let mut args = vec![
            format!("-h{}", required("host")?),
            format!("-P{}", required("port")?),
            match tenant {
                Some(t) => format!("-u{}@{}", user, t),
                None => format!("-u{}", user),
            },
        ];
        if let Some(pw) = password {
            args.push(format!("-p{}", pw));
        }
        if let Some(db) = text("database") {
            args.push(format!("-D{}", db));
        }

        Ok(ClientCommand {
            program: text("client_bin").unwrap_or_else(|| DEFAULT_CLIENT_BIN.to_string()),
            args,
            script: self.spec.path.clone(),
        })
    }

    fn apply(&self, ctx: &ItemContext<'_>, exec: &mut ExecContext<'_>) -> Result<bool> {
        let command = self.command(ctx.environment)?;
        debug!(command = %command.display(), "running sql file");
        let output = exec.runner.run(&command)?;
        if !output.success {
            return Err(OptimizeError::Command { command: command.display(), stderr: output.stderr });
        }
        Ok(true)
    }
}

/// A pause between neighbouring items.
#[derive(Debug, Clone)]
pub struct DelayItem {
    spec: DelaySpec,
}

impl DelayItem {
    fn pause(&self) -> Result<bool> {
        debug!(seconds = self.spec.pause.as_secs_f64(), "sleeping");
        std::thread::sleep(self.spec.pause);
        Ok(true)
    }
}

/// One tunable item of any kind.
#[derive(Debug)]
pub enum Item {
    Variable(VariableItem),
    SystemConfig(SystemConfigItem),
    ExecSql(ExecSqlItem),
    SqlFile(SqlFileItem),
    Delay(DelayItem),
}

impl Item {
    pub fn from_decl(decl: &ItemDecl) -> Self {
        match decl.clone() {
            ItemDecl::Variable(spec) => Item::Variable(VariableItem::new(spec)),
            ItemDecl::SystemConfig(spec) => Item::SystemConfig(SystemConfigItem::new(spec)),
            ItemDecl::ExecSql(spec) => Item::ExecSql(ExecSqlItem::new(spec)),
            ItemDecl::SqlFile(spec) => Item::SqlFile(SqlFileItem::new(spec)),
            ItemDecl::Delay(spec) => Item::Delay(DelayItem { spec }),
        }
    }

    pub fn name(&self) -> String {
        match self {
            Item::Variable(v) => v.spec.name.clone(),
            Item::SystemConfig(s) => s.inner.spec.name.clone(),
            Item::ExecSql(e) => e.spec.name.clone(),
            Item::SqlFile(f) => f.spec.path.display().to_string(),
            Item::Delay(_) => DELAY_ITEM_NAME.to_string(),
        }
    }

    pub fn need_restart(&self) -> bool {
        match self {
            Item::Variable(v) => v.spec.need_restart,
            Item::SystemConfig(s) => s.inner.spec.need_restart,
            Item::ExecSql(e) => e.spec.need_restart,
            Item::SqlFile(_) | Item::Delay(_) => false,
        }
    }

    /// Apply the change; `Ok(true)` only when something was actually applied.
    pub fn apply(&mut self, ctx: &ItemContext<'_>, exec: &mut ExecContext<'_>, params: &Params) -> Result<bool> {
        match self {
            Item::Variable(v) => v.apply_scoped(ctx, exec, &Params::new(), params),
            Item::SystemConfig(s) => {
                let scope = s.scope(ctx.environment);
                s.inner.apply_scoped(ctx, exec, &scope, params)
            }
            Item::ExecSql(e) => {
                if e.apply(ctx, exec, params)? {
                    Ok(true)
                } else {
                    Err(OptimizeError::Modify {
                        name: e.spec.name.clone(),
                        reason: "no statement to execute".to_string(),
                    })
                }
            }
            Item::SqlFile(f) => f.apply(ctx, exec),
            Item::Delay(d) => d.pause(),
        }
    }

    /// Undo a previous apply; `Ok(false)` when there was nothing to undo.
    pub fn recover(&mut self, ctx: &ItemContext<'_>, exec: &mut ExecContext<'_>, params: &Params) -> Result<bool> {
        match self {
            Item::Variable(v) => v.recover_scoped(ctx, exec, &Params::new(), params),
            Item::SystemConfig(s) => {
                let scope = s.scope(ctx.environment);
                s.inner.recover_scoped(ctx, exec, &scope, params)
            }
            Item::ExecSql(_) | Item::SqlFile(_) => Ok(false),
            Item::Delay(d) => d.pause(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MemorySession, RecordingRunner};
    use serde_json::json;

    fn yaml(src: &str) -> serde_yaml::Value {
        serde_yaml::from_str(src).unwrap()
    }

    fn optimizers() -> OptimizerSet {
        OptimizerSet::from([(
            DEFAULT_OPTIMIZER.to_string(),
            Arc::new(Optimizer::new(
                DEFAULT_OPTIMIZER,
                Some("show variables like '{name}'".into()),
                Some("set global {name} = {value}".into()),
            )),
        )])
    }

    fn env() -> Params {
        Params::from([
            ("host".to_string(), json!("10.0.0.1")),
            ("port".to_string(), json!(2881)),
            ("user".to_string(), json!("app")),
            ("tenant".to_string(), json!("test")),
            ("password".to_string(), json!("pw")),
            ("cpu_count".to_string(), json!(8)),
        ])
    }

    fn item(kind: OptimizeType, src: &str) -> Item {
        Item::from_decl(&ItemDecl::parse(kind, &yaml(src)).unwrap())
    }

    // -----------------------------------------------------------------------
    // Declarations
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_variable_defaults() {
        let decl = ItemDecl::parse(OptimizeType::Variables, &yaml("{name: autocommit, value: 1}")).unwrap();
        let ItemDecl::Variable(spec) = decl else { panic!("expected variable") };
        assert_eq!(spec.condition, Condition::NotEqual);
        assert_eq!(spec.value_type, ValueType::String);
        assert!(!spec.need_restart);
    }

    #[test]
    fn test_parse_sleep_becomes_delay() {
        let decl = ItemDecl::parse(OptimizeType::Variables, &yaml("{name: sleep, value: 2}")).unwrap();
        assert_eq!(decl, ItemDecl::Delay(DelaySpec { pause: Duration::from_secs(2) }));
    }

    #[test]
    fn test_parse_unrepresentable_sleep_rejected() {
        let err = ItemDecl::parse(OptimizeType::Variables, &yaml("{name: sleep, value: 1e300}")).unwrap_err();
        assert!(matches!(err, OptimizeError::Value { .. }));
        assert!(ItemDecl::parse(OptimizeType::Variables, &yaml("{name: sleep, value: .inf}")).is_err());
    }

    #[test]
    fn test_parse_negative_sleep_rejected() {
        assert!(ItemDecl::parse(OptimizeType::SystemConfig, &yaml("{name: sleep, value: -1}")).is_err());
    }

    #[test]
    fn test_parse_keeps_extras() {
        let decl = ItemDecl::parse(OptimizeType::Variables, &yaml("{name: a, value: 1, scope: global}")).unwrap();
        let ItemDecl::Variable(spec) = decl else { panic!("expected variable") };
        assert_eq!(spec.extras.get("scope"), Some(&json!("global")));
    }

    #[test]
    fn test_parse_bad_literal_for_type_rejected() {
        let src = "{name: a, value: lots, value_type: int}";
        assert!(ItemDecl::parse(OptimizeType::Variables, &yaml(src)).is_err());
    }

    #[test]
    fn test_parse_exec_sql_without_name_uses_statement() {
        let decl = ItemDecl::parse(OptimizeType::ExecSql, &yaml("{value: 'alter system major freeze'}")).unwrap();
        let ItemDecl::ExecSql(spec) = decl else { panic!("expected exec sql") };
        assert_eq!(spec.name, "alter system major freeze");
    }

    #[test]
    fn test_parse_sql_file() {
        let decl = ItemDecl::parse(OptimizeType::ExecSqlFile, &yaml("{path: /tmp/a.sql, sys: true}")).unwrap();
        assert_eq!(decl, ItemDecl::SqlFile(SqlFileSpec { path: PathBuf::from("/tmp/a.sql"), sys: true }));
    }

    #[test]
    fn test_optimize_type_keys_round_trip() {
        for t in OptimizeType::ALL {
            assert_eq!(t.key().parse::<OptimizeType>().unwrap(), t);
        }
        assert!("indexes".parse::<OptimizeType>().is_err());
    }

    // -----------------------------------------------------------------------
    // Variable
    // -----------------------------------------------------------------------

    #[test]
    fn test_variable_apply_and_recover() {
        let env = env();
        let opts = optimizers();
        let ctx = ItemContext { environment: &env, optimizers: &opts };
        let mut session = MemorySession::new()
            .with_value("show variables like 'ob_query_timeout'", json!("10000000"));
        let runner = RecordingRunner::new();
        let mut it = item(OptimizeType::Variables, "{name: ob_query_timeout, value: 100000000, value_type: int}");

        let mut exec = ExecContext { session: &mut session, runner: &runner };
        assert!(it.apply(&ctx, &mut exec, &Params::new()).unwrap());
        assert!(it.recover(&ctx, &mut exec, &Params::new()).unwrap());

        assert_eq!(
            session.executed,
            vec![
                ("set global ob_query_timeout = ?".to_string(), vec![json!(100000000)]),
                ("set global ob_query_timeout = ?".to_string(), vec![json!(10000000)]),
            ]
        );
    }

    #[test]
    fn test_variable_condition_false_not_applied() {
        let env = env();
        let opts = optimizers();
        let ctx = ItemContext { environment: &env, optimizers: &opts };
        let mut session = MemorySession::new().with_value("show variables like 'a'", json!("1"));
        let runner = RecordingRunner::new();
        let mut it = item(OptimizeType::Variables, "{name: a, value: 1, value_type: int}");

        let mut exec = ExecContext { session: &mut session, runner: &runner };
        assert!(!it.apply(&ctx, &mut exec, &Params::new()).unwrap());
        assert!(session.executed.is_empty());
    }

    #[test]
    fn test_variable_unknown_current_value_skips() {
        let env = env();
        let opts = optimizers();
        let ctx = ItemContext { environment: &env, optimizers: &opts };
        let mut session = MemorySession::new();
        let runner = RecordingRunner::new();
        let mut it = item(OptimizeType::Variables, "{name: a, value: 1}");

        let mut exec = ExecContext { session: &mut session, runner: &runner };
        assert!(!it.apply(&ctx, &mut exec, &Params::new()).unwrap());
        // Nothing captured, so recover is a no-op.
        assert!(!it.recover(&ctx, &mut exec, &Params::new()).unwrap());
        assert!(session.executed.is_empty());
    }

    #[test]
    fn test_variable_query_failure_is_error() {
        let env = env();
        let opts = optimizers();
        let ctx = ItemContext { environment: &env, optimizers: &opts };
        let mut session = MemorySession::new().fail_fetch_on("show");
        let runner = RecordingRunner::new();
        let mut it = item(OptimizeType::Variables, "{name: a, value: 1}");

        let mut exec = ExecContext { session: &mut session, runner: &runner };
        assert!(it.apply(&ctx, &mut exec, &Params::new()).is_err());
    }

    #[test]
    fn test_variable_modify_failure_is_error() {
        let env = env();
        let opts = optimizers();
        let ctx = ItemContext { environment: &env, optimizers: &opts };
        let mut session = MemorySession::new()
            .with_value("show variables like 'a'", json!("0"))
            .fail_execute_on("set global");
        let runner = RecordingRunner::new();
        let mut it = item(OptimizeType::Variables, "{name: a, value: 1}");

        let mut exec = ExecContext { session: &mut session, runner: &runner };
        let err = it.apply(&ctx, &mut exec, &Params::new()).unwrap_err();
        assert!(matches!(err, OptimizeError::Modify { .. }));
    }

    #[test]
    fn test_variable_expression_value_uses_environment() {
        let env = env();
        let opts = optimizers();
        let ctx = ItemContext { environment: &env, optimizers: &opts };
        let mut session = MemorySession::new().with_value("show variables like 'parallel'", json!("4"));
        let runner = RecordingRunner::new();
        let mut it = item(
            OptimizeType::Variables,
            "{name: parallel, value: 'cpu_count * 2', expression: true, value_type: int}",
        );

        let mut exec = ExecContext { session: &mut session, runner: &runner };
        assert!(it.apply(&ctx, &mut exec, &Params::new()).unwrap());
        assert_eq!(session.executed[0].1, vec![json!(16)]);
    }

    #[test]
    fn test_dedicated_optimizer_wins_over_default() {
        let env = env();
        let mut opts = optimizers();
        opts.insert(
            "autocommit".to_string(),
            Arc::new(Optimizer::new("autocommit", Some("select @@autocommit".into()), Some("set autocommit = {value}".into()))),
        );
        let ctx = ItemContext { environment: &env, optimizers: &opts };
        let mut session = MemorySession::new().with_value("select @@autocommit", json!(1));
        let runner = RecordingRunner::new();
        let mut it = item(OptimizeType::Variables, "{name: autocommit, value: 0, value_type: int}");

        let mut exec = ExecContext { session: &mut session, runner: &runner };
        assert!(it.apply(&ctx, &mut exec, &Params::new()).unwrap());
        assert_eq!(session.executed[0].0, "set autocommit = ?");
    }

    #[test]
    fn test_variable_without_optimizer_skips() {
        let env = env();
        let opts = OptimizerSet::new();
        let ctx = ItemContext { environment: &env, optimizers: &opts };
        let mut session = MemorySession::new();
        let runner = RecordingRunner::new();
        let mut it = item(OptimizeType::Variables, "{name: a, value: 1}");

        let mut exec = ExecContext { session: &mut session, runner: &runner };
        assert!(!it.apply(&ctx, &mut exec, &Params::new()).unwrap());
    }

    // -----------------------------------------------------------------------
    // SystemConfig
    // -----------------------------------------------------------------------

    #[test]
    fn test_system_config_injects_tenant() {
        let env = env();
        let opts = OptimizerSet::from([(
            DEFAULT_OPTIMIZER.to_string(),
            Arc::new(Optimizer::new(
                DEFAULT_OPTIMIZER,
                Some("show parameters like '{name}' tenant = '{tenant}'".into()),
                Some("alter system set {name} = {value} tenant = '{tenant}'".into()),
            )),
        )]);
        let ctx = ItemContext { environment: &env, optimizers: &opts };
        let mut session = MemorySession::new()
            .with_value("show parameters like 'cpu_quota' tenant = 'bench'", json!("1"));
        let runner = RecordingRunner::new();
        let mut it = item(
            OptimizeType::SystemConfig,
            "{name: cpu_quota, value: 4, value_type: int, tenant: bench, need_restart: true}",
        );

        assert!(it.need_restart());
        let mut exec = ExecContext { session: &mut session, runner: &runner };
        assert!(it.apply(&ctx, &mut exec, &Params::new()).unwrap());
        assert_eq!(session.executed[0].0, "alter system set cpu_quota = ? tenant = 'bench'");
    }

    #[test]
    fn test_system_config_recover_restores_origin_in_tenant_scope() {
        let env = env();
        let opts = OptimizerSet::from([(
            DEFAULT_OPTIMIZER.to_string(),
            Arc::new(Optimizer::new(
                DEFAULT_OPTIMIZER,
                Some("show parameters like '{name}' tenant = '{tenant}'".into()),
                Some("alter system set {name} = {value} tenant = '{tenant}'".into()),
            )),
        )]);
        let ctx = ItemContext { environment: &env, optimizers: &opts };
        let mut session = MemorySession::new()
            .with_value("show parameters like 'cpu_quota' tenant = 'test'", json!("2"))
            .with_value("show parameters like 'memory_limit' tenant = 'bench'", json!("4G"));
        let runner = RecordingRunner::new();
        let mut inherited = item(OptimizeType::SystemConfig, "{name: cpu_quota, value: 4, value_type: int}");
        let mut declared = item(
            OptimizeType::SystemConfig,
            "{name: memory_limit, value: 8G, value_type: capacity, tenant: bench}",
        );

        let mut exec = ExecContext { session: &mut session, runner: &runner };
        assert!(inherited.apply(&ctx, &mut exec, &Params::new()).unwrap());
        assert!(declared.apply(&ctx, &mut exec, &Params::new()).unwrap());
        assert!(declared.recover(&ctx, &mut exec, &Params::new()).unwrap());
        assert!(inherited.recover(&ctx, &mut exec, &Params::new()).unwrap());

        assert_eq!(
            session.executed[2..],
            [
                ("alter system set memory_limit = ? tenant = 'bench'".to_string(), vec![json!("4G")]),
                ("alter system set cpu_quota = ? tenant = 'test'".to_string(), vec![json!(2)]),
            ]
        );
    }

    // -----------------------------------------------------------------------
    // ExecSql / SqlFile / Delay
    // -----------------------------------------------------------------------

    #[test]
    fn test_exec_sql_runs_statement_and_never_recovers() {
        let env = env();
        let opts = OptimizerSet::new();
        let ctx = ItemContext { environment: &env, optimizers: &opts };
        let mut session = MemorySession::new();
        let runner = RecordingRunner::new();
        let mut it = item(OptimizeType::ExecSql, "{name: freeze, value: 'alter system major freeze tenant = {tenant}'}");

        let mut exec = ExecContext { session: &mut session, runner: &runner };
        assert!(it.apply(&ctx, &mut exec, &Params::new()).unwrap());
        assert!(!it.recover(&ctx, &mut exec, &Params::new()).unwrap());
        assert_eq!(session.executed.len(), 1);
        assert_eq!(session.executed[0].0, "alter system major freeze tenant = test");
    }

    #[test]
    fn test_sql_file_command_uses_environment() {
        let it = SqlFileItem::new(SqlFileSpec { path: PathBuf::from("/tmp/init.sql"), sys: false });
        let mut env = env();
        env.insert("database".to_string(), json!("tpcc"));
        let cmd = it.command(&env).unwrap();
        assert_eq!(cmd.program, DEFAULT_CLIENT_BIN);
        assert_eq!(cmd.args, vec!["-h10.0.0.1", "-P2881", "-uapp@test", "-ppw", "-Dtpcc"]);
        assert_eq!(cmd.script, PathBuf::from("/tmp/init.sql"));
    }

    #[test]
    fn test_sql_file_sys_command() {
        let it = SqlFileItem::new(SqlFileSpec { path: PathBuf::from("a.sql"), sys: true });
        let cmd = it.command(&env()).unwrap();
        assert_eq!(cmd.args, vec!["-h10.0.0.1", "-P2881", "-uroot@sys"]);
    }

    #[test]
    fn test_sql_file_missing_host_is_error() {
        let it = SqlFileItem::new(SqlFileSpec { path: PathBuf::from("a.sql"), sys: false });
        let mut env = env();
        env.remove("host");
        assert!(it.command(&env).is_err());
    }

    #[test]
    fn test_sql_file_failure_carries_stderr() {
        let env = env();
        let opts = OptimizerSet::new();
        let ctx = ItemContext { environment: &env, optimizers: &opts };
        let mut session = MemorySession::new();
        let runner = RecordingRunner::failing("ERROR 1146: table missing");
        let mut it = item(OptimizeType::ExecSqlFile, "{path: a.sql}");

        let mut exec = ExecContext { session: &mut session, runner: &runner };
        let err = it.apply(&ctx, &mut exec, &Params::new()).unwrap_err();
        assert!(err.to_string().contains("table missing"));
        assert!(!it.recover(&ctx, &mut exec, &Params::new()).unwrap());
        assert_eq!(runner.commands().len(), 1);
    }

    #[test]
    fn test_delay_reports_success_both_ways() {
        let env = env();
        let opts = OptimizerSet::new();
        let ctx = ItemContext { environment: &env, optimizers: &opts };
        let mut session = MemorySession::new();
        let runner = RecordingRunner::new();
        let mut it = item(OptimizeType::Variables, "{name: sleep, value: 0}");

        let mut exec = ExecContext { session: &mut session, runner: &runner };
        assert!(it.apply(&ctx, &mut exec, &Params::new()).unwrap());
        assert!(it.recover(&ctx, &mut exec, &Params::new()).unwrap());
        assert!(session.fetched.is_empty());
    }
}
