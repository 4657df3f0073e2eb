//! # Stage: Optimize Entrance
//!
//! ## Responsibility
//! Own the ordered items of one kind for one (component, stage), apply them in
//! declaration order, and recover the ones that actually applied in reverse.
//!
//! ## Guarantees
//! - `items_done` is always an order-preserving subsequence of `items`, holding
//!   exactly the items whose apply reported a change.
//! - Recovery walks `items_done` back to front.
//! - An item still in `items_done` is not applied again, so a repeated
//!   `apply` never overwrites the value captured before the first change.
//! - Errors never escape `apply`/`recover`: they are logged and reported as
//!   `false`.  Only misuse (an unbound entrance) is an `Err`.
//! - No all-or-nothing guarantee: a failing item stops the apply loop and the
//!   items before it stay applied.
//!
//! ## Recovery policy
//! Best effort.  A failing recover is logged and the walk continues with the
//! earlier items.  Items that recovered are dropped from `items_done`; the
//! ones that failed stay, in order, so a later `recover` can retry them.

use std::sync::Arc;

use tracing::{debug, error};

use super::item::{ExecContext, Item, ItemContext, ItemDecl, OptimizeType};
use super::optimizer::OptimizerSet;
use crate::error::{OptimizeError, Result};
use crate::value::Params;

/// Declared items of one kind, as stored in the optimize config.
#[derive(Debug, Clone, PartialEq)]
pub struct EntranceDecl {
    pub kind: OptimizeType,
    pub items: Vec<ItemDecl>,
}

#[derive(Debug)]
struct Binding {
    optimizers: OptimizerSet,
    environment: Arc<Params>,
}

/// Ordered items of one kind for one (component, stage).
#[derive(Debug)]
pub struct OptimizeEntrance {
    component: String,
    stage: String,
    kind: OptimizeType,
    items: Vec<Item>,
    items_done: Vec<usize>,
    binding: Option<Binding>,
    need_restart: bool,
}

impl OptimizeEntrance {
    /// Build fresh items from `decl`.
    pub fn new(component: impl Into<String>, stage: impl Into<String>, decl: &EntranceDecl) -> Self {
        Self {
            component: component.into(),
            stage: stage.into(),
            kind: decl.kind,
            items: decl.items.iter().map(Item::from_decl).collect(),
            items_done: Vec::new(),
            binding: None,
            need_restart: false,
        }
    }

    /// Give the entrance its optimizers and the shared environment.
    ///
    /// # Errors
    /// `AlreadyBound` on a second call.
    pub fn bind(&mut self, optimizers: OptimizerSet, environment: Arc<Params>) -> Result<()> {
        if self.binding.is_some() {
            return Err(OptimizeError::AlreadyBound);
        }
        self.binding = Some(Binding { optimizers, environment });
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn kind(&self) -> OptimizeType {
        self.kind
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// Items whose apply reported a change, in apply order.
    pub fn items_done(&self) -> impl Iterator<Item = &Item> + '_ {
        self.items_done.iter().map(move |&i| &self.items[i])
    }

    /// Indices into [`Self::items`] of the applied items.
    pub fn done_indices(&self) -> &[usize] {
        &self.items_done
    }

    /// True once any applied or recovered item required a restart.
    pub fn need_restart(&self) -> bool {
        self.need_restart
    }

    /// Apply every item in order, skipping items already applied.
    ///
    /// With `disable_restart`, items that require a restart are skipped
    /// entirely.  Returns `Ok(false)` when an item failed; the items applied
    /// before it are kept in `items_done`.
    ///
    /// # Errors
    /// `Unbound` if [`Self::bind`] was never called.
    pub fn apply(&mut self, exec: &mut ExecContext<'_>, disable_restart: bool, params: &Params) -> Result<bool> {
        let binding = self.binding.as_ref().ok_or(OptimizeError::Unbound)?;
        let ctx = ItemContext { environment: &binding.environment, optimizers: &binding.optimizers };

        for (index, item) in self.items.iter_mut().enumerate() {
            if self.items_done.contains(&index) {
                debug!(component = %self.component, stage = %self.stage, item = %item.name(), "already applied; skipped");
                continue;
            }
            if disable_restart && item.need_restart() {
                debug!(component = %self.component, stage = %self.stage, item = %item.name(), "restart required; skipped");
                continue;
            }
            match item.apply(&ctx, exec, params) {
                Ok(true) => {
                    self.items_done.push(index);
                    self.need_restart |= item.need_restart();
                }
                Ok(false) => {}
                Err(e) => {
                    error!(
                        component = %self.component,
                        stage = %self.stage,
                        kind = %self.kind,
                        item = %item.name(),
                        error = %e,
                        "optimize apply failed"
                    );
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Undo applied items, last applied first.
    ///
    /// # Errors
    /// `Unbound` if [`Self::bind`] was never called.
    pub fn recover(&mut self, exec: &mut ExecContext<'_>, params: &Params) -> Result<bool> {
        let binding = self.binding.as_ref().ok_or(OptimizeError::Unbound)?;
        let ctx = ItemContext { environment: &binding.environment, optimizers: &binding.optimizers };

        let mut ok = true;
        let mut still_done = Vec::new();
        for &index in self.items_done.iter().rev() {
            let item = &mut self.items[index];
            match item.recover(&ctx, exec, params) {
                Ok(_) => self.need_restart |= item.need_restart(),
                Err(e) => {
                    error!(
                        component = %self.component,
                        stage = %self.stage,
                        kind = %self.kind,
                        item = %item.name(),
                        error = %e,
                        "optimize recover failed"
                    );
                    ok = false;
                    still_done.push(index);
                }
            }
        }
        still_done.reverse();
        self.items_done = still_done;
        Ok(ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimize::optimizer::{Optimizer, DEFAULT_OPTIMIZER};
    use crate::session::{MemorySession, RecordingRunner};
    use serde_json::json;

    fn decl(kind: OptimizeType, src: &str) -> EntranceDecl {
        let raw: Vec<serde_yaml::Value> = serde_yaml::from_str(src).unwrap();
        EntranceDecl {
            kind,
            items: raw.iter().map(|r| ItemDecl::parse(kind, r).unwrap()).collect(),
        }
    }

    fn optimizers() -> OptimizerSet {
        OptimizerSet::from([(
            DEFAULT_OPTIMIZER.to_string(),
            Arc::new(Optimizer::new(
                DEFAULT_OPTIMIZER,
                Some("show {name}".into()),
                Some("set {name} = {value}".into()),
            )),
        )])
    }

    fn bound(kind: OptimizeType, src: &str) -> OptimizeEntrance {
        let mut e = OptimizeEntrance::new("oceanbase", "bench", &decl(kind, src));
        e.bind(optimizers(), Arc::new(Params::new())).unwrap();
        e
    }

    fn done_names(e: &OptimizeEntrance) -> Vec<String> {
        e.items_done().map(Item::name).collect()
    }

    #[test]
    fn test_unbound_entrance_is_error() {
        let mut e = OptimizeEntrance::new("c", "s", &decl(OptimizeType::Variables, "[{name: a, value: 1}]"));
        let mut session = MemorySession::new();
        let runner = RecordingRunner::new();
        let mut exec = ExecContext { session: &mut session, runner: &runner };
        assert!(matches!(e.apply(&mut exec, false, &Params::new()), Err(OptimizeError::Unbound)));
        assert!(matches!(e.recover(&mut exec, &Params::new()), Err(OptimizeError::Unbound)));
    }

    #[test]
    fn test_bind_twice_is_error() {
        let mut e = bound(OptimizeType::Variables, "[]");
        assert!(matches!(
            e.bind(optimizers(), Arc::new(Params::new())),
            Err(OptimizeError::AlreadyBound)
        ));
    }

    #[test]
    fn test_apply_records_only_changed_items() {
        let mut e = bound(
            OptimizeType::Variables,
            "[{name: a, value: 1, condition: always}, {name: b, value: 2, condition: never}, {name: c, value: 3}]",
        );
        let mut session = MemorySession::new()
            .with_value("show a", json!("0"))
            .with_value("show b", json!("0"))
            .with_value("show c", json!("0"));
        let runner = RecordingRunner::new();
        let mut exec = ExecContext { session: &mut session, runner: &runner };

        assert!(e.apply(&mut exec, false, &Params::new()).unwrap());
        assert_eq!(done_names(&e), vec!["a", "c"]);
        assert_eq!(e.done_indices(), &[0, 2]);
    }

    #[test]
    fn test_recover_runs_in_reverse_and_clears_done() {
        let mut e = bound(OptimizeType::Variables, "[{name: a, value: 1}, {name: b, value: 2}]");
        let mut session = MemorySession::new()
            .with_value("show a", json!("10"))
            .with_value("show b", json!("20"));
        let runner = RecordingRunner::new();
        let mut exec = ExecContext { session: &mut session, runner: &runner };

        assert!(e.apply(&mut exec, false, &Params::new()).unwrap());
        assert!(e.recover(&mut exec, &Params::new()).unwrap());
        assert_eq!(e.items_done().count(), 0);

        let statements: Vec<_> = session.executed.iter().map(|(s, a)| (s.as_str(), a[0].clone())).collect();
        assert_eq!(
            statements,
            vec![
                ("set a = ?", json!("1")),
                ("set b = ?", json!("2")),
                ("set b = ?", json!("20")),
                ("set a = ?", json!("10")),
            ]
        );
    }

    #[test]
    fn test_disable_restart_skips_restart_items() {
        let mut e = bound(
            OptimizeType::SystemConfig,
            "[{name: a, value: 1, need_restart: true}, {name: b, value: 2}]",
        );
        let mut session = MemorySession::new()
            .with_value("show a", json!("0"))
            .with_value("show b", json!("0"));
        let runner = RecordingRunner::new();
        let mut exec = ExecContext { session: &mut session, runner: &runner };

        assert!(e.apply(&mut exec, true, &Params::new()).unwrap());
        assert_eq!(done_names(&e), vec!["b"]);
        assert!(!e.need_restart());
        assert!(!session.fetched.contains(&"show a".to_string()));
    }

    #[test]
    fn test_restart_flag_propagates() {
        let mut e = bound(OptimizeType::SystemConfig, "[{name: a, value: 1, need_restart: true}]");
        let mut session = MemorySession::new().with_value("show a", json!("0"));
        let runner = RecordingRunner::new();
        let mut exec = ExecContext { session: &mut session, runner: &runner };

        assert!(e.apply(&mut exec, false, &Params::new()).unwrap());
        assert!(e.need_restart());
    }

    #[test]
    fn test_failure_stops_loop_and_keeps_progress() {
        let mut e = bound(
            OptimizeType::ExecSql,
            "[{name: one, value: 'select 1'}, {name: two, value: 'broken'}, {name: three, value: 'select 3'}]",
        );
        let mut session = MemorySession::new().fail_execute_on("broken");
        let runner = RecordingRunner::new();
        let mut exec = ExecContext { session: &mut session, runner: &runner };

        assert!(!e.apply(&mut exec, false, &Params::new()).unwrap());
        assert_eq!(done_names(&e), vec!["one"]);
        let ran: Vec<_> = session.executed.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(ran, vec!["select 1"]);
    }

    #[test]
    fn test_repeated_apply_keeps_first_origin() {
        let mut e = bound(OptimizeType::Variables, "[{name: a, value: 1}]");
        let runner = RecordingRunner::new();

        let mut before = MemorySession::new().with_value("show a", json!("0"));
        {
            let mut exec = ExecContext { session: &mut before, runner: &runner };
            assert!(e.apply(&mut exec, false, &Params::new()).unwrap());
        }

        let mut after = MemorySession::new().with_value("show a", json!("1"));
        {
            let mut exec = ExecContext { session: &mut after, runner: &runner };
            assert!(e.apply(&mut exec, false, &Params::new()).unwrap());
        }
        assert!(after.fetched.is_empty());
        assert_eq!(e.done_indices(), &[0]);

        let mut restore = MemorySession::new();
        let mut exec = ExecContext { session: &mut restore, runner: &runner };
        assert!(e.recover(&mut exec, &Params::new()).unwrap());
        assert_eq!(restore.executed, vec![("set a = ?".to_string(), vec![json!("0")])]);
    }

    #[test]
    fn test_recover_is_best_effort() {
        let mut e = bound(
            OptimizeType::Variables,
            "[{name: a, value: 1}, {name: b, value: 2}, {name: c, value: 3}]",
        );
        let mut session = MemorySession::new()
            .with_value("show a", json!("0"))
            .with_value("show b", json!("0"))
            .with_value("show c", json!("0"));
        let runner = RecordingRunner::new();
        {
            let mut exec = ExecContext { session: &mut session, runner: &runner };
            assert!(e.apply(&mut exec, false, &Params::new()).unwrap());
        }

        // Recovery of `b` fails; `a` is still attempted.
        let mut failing = MemorySession::new().fail_execute_on("set b");
        let mut exec = ExecContext { session: &mut failing, runner: &runner };
        assert!(!e.recover(&mut exec, &Params::new()).unwrap());
        assert_eq!(done_names(&e), vec!["b"]);

        let ran: Vec<_> = failing.executed.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(ran, vec!["set c = ?", "set a = ?"]);
    }
}
