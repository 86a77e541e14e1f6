//! Promise evaluator
//!
//! Walks a bundle promise by promise: check the class guard, expand the
//! promiser through the iteration engine, and for each concrete expansion
//! take the per-promise advisory lock, dispatch the actuator, define the
//! outcome classes and account the result. Vars and classes promises
//! mutate the evaluation context directly; everything else goes through
//! the actuator dispatch.

use pledge_context::{verify_class_promise, ClassContext, VariableTable};
use pledge_core::{
    BundleRef, DefineClasses, Promise, PromiseAttrs, PromiseResult, RVal, RunContext, VarRef,
};
use tracing::{debug, error, info, warn};

use crate::{LockOutcome, LockStore, PromiseIterator};

/// Per-bundle and per-run outcome accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub kept: u64,
    pub repaired: u64,
    pub warned: u64,
    pub failed: u64,
    pub denied: u64,
    pub interrupted: u64,
    pub skipped: u64,
}

impl Totals {
    pub fn add(&mut self, result: PromiseResult) {
        match result {
            PromiseResult::Noop => self.kept += 1,
            PromiseResult::Change => self.repaired += 1,
            PromiseResult::Warn => self.warned += 1,
            PromiseResult::Fail => self.failed += 1,
            PromiseResult::Denied => self.denied += 1,
            PromiseResult::Interrupted => self.interrupted += 1,
            PromiseResult::Skipped => self.skipped += 1,
        }
    }

    pub fn merge(&mut self, other: &Totals) {
        self.kept += other.kept;
        self.repaired += other.repaired;
        self.warned += other.warned;
        self.failed += other.failed;
        self.denied += other.denied;
        self.interrupted += other.interrupted;
        self.skipped += other.skipped;
    }

    pub fn total(&self) -> u64 {
        self.kept
            + self.repaired
            + self.warned
            + self.failed
            + self.denied
            + self.interrupted
            + self.skipped
    }
}

/// One concrete expansion of a promise.
#[derive(Debug, Clone)]
struct Expansion {
    promiser: String,
    /// Expanded value for vars promises.
    value: Option<RVal>,
}

/// Dispatch point for the state-touching actuators (files, processes,
/// storage, acl). The evaluator hands over the concrete promiser; the
/// implementation wires in the OS collaborators.
pub trait ActuatorDispatch {
    fn actuate(
        &mut self,
        run: &RunContext,
        classes: &mut ClassContext,
        promise: &Promise,
        promiser: &str,
    ) -> PromiseResult;
}

/// A bundle as handed over by the parser.
#[derive(Debug, Clone)]
pub struct BundleDecl {
    pub bundle: BundleRef,
    pub promises: Vec<Promise>,
}

/// The single-threaded promise evaluator of one policy run.
pub struct Evaluator<'a> {
    pub run: &'a RunContext,
    pub table: VariableTable,
    pub classes: ClassContext,
    /// Advisory lock store; absent in unit-test configurations.
    pub locks: Option<LockStore>,
    /// Persistent classes store; absent when the run tolerates losing
    /// time-scoped classes.
    pub persistent: Option<Box<dyn pledge_store::Kv>>,
}

impl<'a> Evaluator<'a> {
    pub fn new(run: &'a RunContext) -> Self {
        Evaluator {
            run,
            table: VariableTable::new(),
            classes: ClassContext::new(),
            locks: None,
            persistent: None,
        }
    }

    pub fn with_locks(mut self, locks: LockStore) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Attach the persistent classes store and load whatever is still
    /// live in it.
    pub fn with_persistent_classes(mut self, db: Box<dyn pledge_store::Kv>) -> Self {
        if let Err(e) = pledge_context::load_persistent_classes(
            db.as_ref(),
            &mut self.classes,
            self.run.start_time(),
        ) {
            warn!(error = %e, "could not load persistent classes, starting without them");
        }
        self.persistent = Some(db);
        self
    }

    /// Evaluate every promise of a bundle in declaration order. The
    /// bundle gets a class frame of its own; its bundle-scoped classes
    /// vanish when it exits.
    pub fn evaluate_bundle(
        &mut self,
        decl: &BundleDecl,
        dispatch: &mut dyn ActuatorDispatch,
    ) -> Totals {
        let mut totals = Totals::default();
        self.classes.push_frame();

        for promise in &decl.promises {
            if self.run.is_interrupted() {
                warn!(bundle = %decl.bundle.name, "run interrupted, stopping evaluation");
                totals.add(PromiseResult::Interrupted);
                break;
            }
            let result = self.evaluate_promise(promise, dispatch);
            totals.add(result);
        }

        self.classes.pop_frame();
        info!(
            bundle = %decl.bundle.name,
            kept = totals.kept,
            repaired = totals.repaired,
            failed = totals.failed,
            "bundle evaluated"
        );
        totals
    }

    /// Evaluate one promise: guard, expand, lock, actuate, account.
    pub fn evaluate_promise(
        &mut self,
        promise: &Promise,
        dispatch: &mut dyn ActuatorDispatch,
    ) -> PromiseResult {
        match self.classes.evaluate(&promise.class_guard) {
            Ok(true) => {}
            Ok(false) => {
                debug!(promiser = %promise.promiser, guard = %promise.class_guard, "guard false");
                return PromiseResult::Noop;
            }
            Err(e) => {
                error!(promiser = %promise.promiser, error = %e, "malformed class guard");
                return PromiseResult::Interrupted;
            }
        }

        let expansions = self.collect_expansions(promise);
        let mut promise_result = PromiseResult::Skipped;

        for expansion in &expansions {
            if self.run.is_interrupted() {
                promise_result.update(PromiseResult::Interrupted);
                break;
            }
            let result = self.evaluate_expansion(promise, expansion, dispatch);
            self.define_outcome_classes(promise, result);
            log_outcome(promise, &expansion.promiser, result);
            promise_result.update(result);
        }

        if expansions.is_empty() {
            debug!(promiser = %promise.promiser, "iteration produced no expansions");
            promise_result = PromiseResult::Noop;
        }
        promise_result
    }

    /// Expand the promiser (and for vars promises the value) through the
    /// iteration engine against the current table snapshot.
    fn collect_expansions(&self, promise: &Promise) -> Vec<Expansion> {
        let mut iter = PromiseIterator::new(&self.table, &promise.bundle, &promise.promiser);
        let mut out = Vec::new();
        while let Some(promiser) = iter.next_expansion() {
            let value = match &promise.attrs {
                PromiseAttrs::Vars(attrs) => Some(expand_rval(&iter, &attrs.value)),
                _ => None,
            };
            out.push(Expansion { promiser, value });
        }
        out
    }

    fn evaluate_expansion(
        &mut self,
        promise: &Promise,
        expansion: &Expansion,
        dispatch: &mut dyn ActuatorDispatch,
    ) -> PromiseResult {
        // Context mutations take no advisory lock.
        match &promise.attrs {
            PromiseAttrs::Vars(attrs) => {
                return self.install_variable(promise, expansion, attrs.dtype);
            }
            PromiseAttrs::Classes(attrs) => {
                let mut concrete = promise.clone();
                concrete.promiser = expansion.promiser.clone();
                let result = verify_class_promise(&mut self.classes, &concrete);

                // Time-scoped classes also land in the persistent store.
                if attrs.persistence_min > 0
                    && result == PromiseResult::Noop
                    && self.classes.is_defined(&pledge_core::canonify(&concrete.promiser))
                {
                    if let Some(db) = &self.persistent {
                        let tags: Vec<&str> = attrs.tags.iter().map(String::as_str).collect();
                        if let Err(e) = pledge_context::persist_class(
                            db.as_ref(),
                            &pledge_core::canonify(&concrete.promiser),
                            attrs.persistence_min,
                            pledge_context::PersistentPolicy::Reset,
                            &tags,
                            self.run.start_time(),
                        ) {
                            warn!(class = %concrete.promiser, error = %e, "could not persist class");
                        }
                    }
                }
                return result;
            }
            _ => {}
        }

        let transaction = promise.attrs.transaction();
        let lock_name = lock_name_for(promise, &expansion.promiser);

        let lock = match &self.locks {
            Some(store) => {
                match store.acquire(
                    &lock_name,
                    transaction.ifelapsed_min,
                    transaction.expireafter_min,
                    self.run.start_time(),
                ) {
                    Ok(LockOutcome::Acquired(lock)) => Some(lock),
                    Ok(LockOutcome::Skipped) => {
                        debug!(lock = %lock_name, "promise is locked, skipping");
                        return PromiseResult::Skipped;
                    }
                    Err(e) => {
                        // Degraded mode: carry on without the lock.
                        warn!(lock = %lock_name, error = %e, "lock store unavailable");
                        None
                    }
                }
            }
            None => None,
        };

        let result = dispatch.actuate(self.run, &mut self.classes, promise, &expansion.promiser);

        if let (Some(store), Some(lock)) = (&self.locks, lock) {
            if let Err(e) = store.release(lock, self.run.start_time()) {
                warn!(lock = %lock_name, error = %e, "could not release lock");
            }
        }
        result
    }

    fn install_variable(
        &mut self,
        promise: &Promise,
        expansion: &Expansion,
        dtype: pledge_core::DataType,
    ) -> PromiseResult {
        let key = match VarRef::parse_from_bundle(&expansion.promiser, &promise.bundle) {
            Ok(key) => key,
            Err(e) => {
                error!(promiser = %expansion.promiser, error = %e, "malformed variable promiser");
                return PromiseResult::Interrupted;
            }
        };
        self.table.put(
            key,
            expansion.value.clone(),
            dtype,
            &["source=promise"],
            promise.handle.as_deref(),
        );
        PromiseResult::Noop
    }

    fn define_outcome_classes(&mut self, promise: &Promise, result: PromiseResult) {
        let Some(classes) = promise.attrs.classes() else {
            return;
        };
        if classes.is_empty() {
            return;
        }
        let names = outcome_class_names(classes, result);
        for name in names {
            self.classes.define(
                Some(&promise.bundle.ns),
                name,
                classes.scope,
                &["source=promise"],
            );
        }
    }
}

/// Which outcome classes a result triggers.
fn outcome_class_names(classes: &DefineClasses, result: PromiseResult) -> &[String] {
    match result {
        PromiseResult::Noop => &classes.promise_kept,
        PromiseResult::Change => &classes.promise_repaired,
        PromiseResult::Fail | PromiseResult::Denied | PromiseResult::Interrupted => {
            &classes.repair_failed
        }
        PromiseResult::Warn | PromiseResult::Skipped => &[],
    }
}

/// The lock name unique to (promise type, concrete promiser, key
/// attribute): processes append their restart class, files and storage
/// lock on the path.
pub fn lock_name_for(promise: &Promise, promiser: &str) -> String {
    match &promise.attrs {
        PromiseAttrs::Processes(attrs) => {
            let suffix = attrs.restart_class.as_deref().unwrap_or("norestart");
            format!("proc-{promiser}-{suffix}")
        }
        _ => format!("{}-{}", promise.kind().as_str(), promiser),
    }
}

/// Expand every scalar inside an rval under the iterator's current
/// configuration.
fn expand_rval(iter: &PromiseIterator<'_>, value: &RVal) -> RVal {
    match value {
        RVal::Scalar(s) => RVal::Scalar(iter.expand(s)),
        RVal::List(items) => RVal::List(items.iter().map(|i| expand_rval(iter, i)).collect()),
        RVal::FnCall { name, args } => RVal::FnCall {
            name: name.clone(),
            args: args.iter().map(|a| expand_rval(iter, a)).collect(),
        },
        RVal::Container(v) => RVal::Container(v.clone()),
    }
}

/// One structured log line per promise, severity matching the result.
fn log_outcome(promise: &Promise, promiser: &str, result: PromiseResult) {
    let kind = promise.kind().as_str();
    match result {
        PromiseResult::Fail | PromiseResult::Denied => {
            error!(kind, promiser, result = %result, "promise outcome");
        }
        PromiseResult::Warn | PromiseResult::Interrupted => {
            warn!(kind, promiser, result = %result, "promise outcome");
        }
        _ => {
            info!(kind, promiser, result = %result, "promise outcome");
        }
    }
}

// ============================================================================
// DEFAULT DISPATCH
// ============================================================================

use pledge_actuators::{
    verify_acl_promise, verify_file_promise, verify_process_promise, verify_storage_promise,
    AclBackend, CommandRunner, MountExec, ProcessSource, Signaler,
};

/// Dispatch wired to the real actuators, with the OS collaborators
/// injected.
pub struct DefaultDispatch {
    pub processes: Box<dyn ProcessSource>,
    pub signaler: Box<dyn Signaler>,
    pub runner: Box<dyn CommandRunner>,
    pub mounts: Box<dyn MountExec>,
    pub acl_backend: Box<dyn AclBackend>,
}

impl ActuatorDispatch for DefaultDispatch {
    fn actuate(
        &mut self,
        run: &RunContext,
        classes: &mut ClassContext,
        promise: &Promise,
        promiser: &str,
    ) -> PromiseResult {
        match &promise.attrs {
            PromiseAttrs::Files(attrs) => {
                verify_file_promise(run, std::path::Path::new(promiser), attrs)
            }
            PromiseAttrs::Processes(_) => verify_process_promise(
                classes,
                promise,
                promiser,
                self.processes.as_ref(),
                self.signaler.as_ref(),
                self.runner.as_ref(),
            ),
            PromiseAttrs::Storage(attrs) => verify_storage_promise(
                run,
                std::path::Path::new(promiser),
                attrs,
                self.mounts.as_ref(),
            ),
            PromiseAttrs::Acl(attrs) => verify_acl_promise(
                std::path::Path::new(promiser),
                attrs,
                self.acl_backend.as_ref(),
            ),
            PromiseAttrs::Vars(_) | PromiseAttrs::Classes(_) => {
                // Handled inside the evaluator; reaching here is a
                // dispatch wiring error.
                PromiseResult::Fail
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pledge_core::{
        ClassAttrs, DataType, FileAttrs, StorageAttrs, Transaction, VarAttrs,
    };

    struct FixedDispatch(PromiseResult);
    impl ActuatorDispatch for FixedDispatch {
        fn actuate(
            &mut self,
            _run: &RunContext,
            _classes: &mut ClassContext,
            _promise: &Promise,
            _promiser: &str,
        ) -> PromiseResult {
            self.0
        }
    }

    struct RecordingDispatch {
        seen: Vec<String>,
        result: PromiseResult,
    }
    impl ActuatorDispatch for RecordingDispatch {
        fn actuate(
            &mut self,
            _run: &RunContext,
            _classes: &mut ClassContext,
            _promise: &Promise,
            promiser: &str,
        ) -> PromiseResult {
            self.seen.push(promiser.to_string());
            self.result
        }
    }

    fn agent_bundle() -> BundleRef {
        BundleRef::new("default", "main", "agent")
    }

    fn run_ctx() -> RunContext {
        RunContext::with_start_time("/tmp/pledge-eval-test", false, 1_700_000_000)
    }

    fn vars_promise(name: &str, value: RVal, dtype: DataType) -> Promise {
        Promise::new(
            name,
            agent_bundle(),
            PromiseAttrs::Vars(VarAttrs {
                dtype,
                value,
                tags: vec![],
            }),
        )
    }

    fn files_promise(path: &str) -> Promise {
        Promise::new(path, agent_bundle(), PromiseAttrs::Files(FileAttrs::default()))
    }

    #[test]
    fn test_vars_promise_installs_binding() {
        let run = run_ctx();
        let mut ev = Evaluator::new(&run);
        let mut dispatch = FixedDispatch(PromiseResult::Noop);

        let p = vars_promise("greeting", RVal::Scalar("hello".into()), DataType::String);
        assert_eq!(ev.evaluate_promise(&p, &mut dispatch), PromiseResult::Noop);

        let key = VarRef::parse("default:main.greeting").expect("reference should parse");
        assert_eq!(
            ev.table.get(&key).expect("binding should exist").value,
            Some(RVal::Scalar("hello".into()))
        );
    }

    #[test]
    fn test_iterated_promise_fans_out() {
        let run = run_ctx();
        let mut ev = Evaluator::new(&run);
        let mut dispatch = RecordingDispatch {
            seen: vec![],
            result: PromiseResult::Noop,
        };

        // Install the lists, then a files promise over both.
        let mut noop = FixedDispatch(PromiseResult::Noop);
        let p = vars_promise("i", RVal::scalar_list(["1", "2"]), DataType::StringList);
        ev.evaluate_promise(&p, &mut noop);
        let p = vars_promise("j", RVal::scalar_list(["a", "b"]), DataType::StringList);
        ev.evaluate_promise(&p, &mut noop);

        let p = files_promise("/tmp/x_$(i)_$(j)");
        ev.evaluate_promise(&p, &mut dispatch);
        assert_eq!(
            dispatch.seen,
            vec!["/tmp/x_1_a", "/tmp/x_1_b", "/tmp/x_2_a", "/tmp/x_2_b"]
        );
    }

    #[test]
    fn test_vars_value_expands_per_iteration() {
        let run = run_ctx();
        let mut ev = Evaluator::new(&run);
        let mut noop = FixedDispatch(PromiseResult::Noop);

        let p = vars_promise("i", RVal::scalar_list(["1", "2"]), DataType::StringList);
        ev.evaluate_promise(&p, &mut noop);
        let p = vars_promise("copy_$(i)", RVal::Scalar("value $(i)".into()), DataType::String);
        ev.evaluate_promise(&p, &mut noop);

        let key = VarRef::parse("default:main.copy_2").expect("reference should parse");
        assert_eq!(
            ev.table.get(&key).expect("binding should exist").value,
            Some(RVal::Scalar("value 2".into()))
        );
    }

    #[test]
    fn test_guard_false_is_noop() {
        let run = run_ctx();
        let mut ev = Evaluator::new(&run);
        let mut dispatch = RecordingDispatch {
            seen: vec![],
            result: PromiseResult::Change,
        };

        let p = files_promise("/tmp/guarded").with_guard("undefined_class");
        assert_eq!(ev.evaluate_promise(&p, &mut dispatch), PromiseResult::Noop);
        assert!(dispatch.seen.is_empty(), "guarded promise must not actuate");
    }

    #[test]
    fn test_malformed_guard_is_interrupted() {
        let run = run_ctx();
        let mut ev = Evaluator::new(&run);
        let mut dispatch = FixedDispatch(PromiseResult::Noop);
        let p = files_promise("/tmp/x").with_guard("(broken");
        assert_eq!(
            ev.evaluate_promise(&p, &mut dispatch),
            PromiseResult::Interrupted
        );
    }

    #[test]
    fn test_outcome_classes_defined() {
        let run = run_ctx();
        let mut ev = Evaluator::new(&run);
        let mut dispatch = FixedDispatch(PromiseResult::Change);

        let mut attrs = FileAttrs::default();
        attrs.classes.promise_repaired = vec!["motd_fixed".to_string()];
        attrs.classes.repair_failed = vec!["motd_broken".to_string()];
        let p = Promise::new("/etc/motd", agent_bundle(), PromiseAttrs::Files(attrs));

        ev.evaluate_promise(&p, &mut dispatch);
        assert!(ev.classes.is_defined("motd_fixed"));
        assert!(!ev.classes.is_defined("motd_broken"));

        let mut dispatch = FixedDispatch(PromiseResult::Fail);
        ev.evaluate_promise(&p, &mut dispatch);
        assert!(ev.classes.is_defined("motd_broken"));
    }

    #[test]
    fn test_bundle_totals() {
        let run = run_ctx();
        let mut ev = Evaluator::new(&run);
        let mut dispatch = FixedDispatch(PromiseResult::Change);

        let decl = BundleDecl {
            bundle: agent_bundle(),
            promises: vec![
                files_promise("/tmp/a"),
                files_promise("/tmp/b"),
                files_promise("/tmp/c").with_guard("no_such_class"),
            ],
        };
        let totals = ev.evaluate_bundle(&decl, &mut dispatch);
        assert_eq!(totals.repaired, 2);
        assert_eq!(totals.kept, 1);
        assert_eq!(totals.total(), 3);
    }

    #[test]
    fn test_result_merge_across_expansions() {
        let run = run_ctx();
        let mut ev = Evaluator::new(&run);
        let mut noop = FixedDispatch(PromiseResult::Noop);
        let p = vars_promise("i", RVal::scalar_list(["1", "2"]), DataType::StringList);
        ev.evaluate_promise(&p, &mut noop);

        struct AlternatingDispatch(u32);
        impl ActuatorDispatch for AlternatingDispatch {
            fn actuate(
                &mut self,
                _run: &RunContext,
                _classes: &mut ClassContext,
                _promise: &Promise,
                _promiser: &str,
            ) -> PromiseResult {
                self.0 += 1;
                if self.0 == 1 {
                    PromiseResult::Noop
                } else {
                    PromiseResult::Fail
                }
            }
        }

        let p = files_promise("/tmp/$(i)");
        let mut dispatch = AlternatingDispatch(0);
        // Fail dominates Noop.
        assert_eq!(ev.evaluate_promise(&p, &mut dispatch), PromiseResult::Fail);
    }

    #[test]
    fn test_interrupt_stops_bundle() {
        let run = run_ctx();
        run.interrupt();
        let mut ev = Evaluator::new(&run);
        let mut dispatch = RecordingDispatch {
            seen: vec![],
            result: PromiseResult::Noop,
        };
        let decl = BundleDecl {
            bundle: agent_bundle(),
            promises: vec![files_promise("/tmp/a"), files_promise("/tmp/b")],
        };
        let totals = ev.evaluate_bundle(&decl, &mut dispatch);
        assert_eq!(totals.interrupted, 1);
        assert!(dispatch.seen.is_empty());
    }

    #[test]
    fn test_lock_names() {
        let p = files_promise("/etc/motd");
        assert_eq!(lock_name_for(&p, "/etc/motd"), "files-/etc/motd");

        let p = Promise::new(
            "sshd",
            agent_bundle(),
            PromiseAttrs::Processes(pledge_core::ProcessAttrs {
                restart_class: Some("restart_sshd".to_string()),
                ..Default::default()
            }),
        );
        assert_eq!(lock_name_for(&p, "sshd"), "proc-sshd-restart_sshd");

        let p = Promise::new(
            "sshd",
            agent_bundle(),
            PromiseAttrs::Processes(Default::default()),
        );
        assert_eq!(lock_name_for(&p, "sshd"), "proc-sshd-norestart");

        let p = Promise::new(
            "/mnt/data",
            agent_bundle(),
            PromiseAttrs::Storage(StorageAttrs::default()),
        );
        assert_eq!(lock_name_for(&p, "/mnt/data"), "storage-/mnt/data");
    }

    #[test]
    fn test_classes_promise_through_evaluator() {
        let run = run_ctx();
        let mut ev = Evaluator::new(&run);
        let mut dispatch = FixedDispatch(PromiseResult::Noop);

        let p = Promise::new(
            "configured",
            BundleRef::new("default", "setup", "common"),
            PromiseAttrs::Classes(ClassAttrs::default()),
        );
        assert_eq!(ev.evaluate_promise(&p, &mut dispatch), PromiseResult::Noop);
        assert!(ev.classes.is_defined("configured"));
    }

    #[test]
    fn test_persistent_class_promise_saved() {
        use pledge_store::{DbId, LmdbKv, OpenOutcome};
        let dir = tempfile::TempDir::new().expect("TempDir creation should succeed");
        let open = || match LmdbKv::open(dir.path(), DbId::ClassesPersistent)
            .expect("open should succeed")
        {
            OpenOutcome::Open(db) => db,
            OpenOutcome::Broken => panic!("fresh database cannot be broken"),
        };

        let run = run_ctx();
        {
            let mut ev = Evaluator::new(&run).with_persistent_classes(Box::new(open()));
            let mut dispatch = FixedDispatch(PromiseResult::Noop);
            let p = Promise::new(
                "maintenance_window",
                BundleRef::new("default", "setup", "common"),
                PromiseAttrs::Classes(ClassAttrs {
                    persistence_min: 60,
                    ..Default::default()
                }),
            );
            assert_eq!(ev.evaluate_promise(&p, &mut dispatch), PromiseResult::Noop);
            assert!(ev.classes.is_defined("maintenance_window"));
        }

        // A later run loads the class back from the store.
        let ev = Evaluator::new(&run).with_persistent_classes(Box::new(open()));
        assert!(ev.classes.is_defined("maintenance_window"));
    }

    #[test]
    fn test_skipped_lock_counts_skipped() {
        use pledge_store::{DbId, LmdbKv, OpenOutcome};
        let dir = tempfile::TempDir::new().expect("TempDir creation should succeed");
        let db = match LmdbKv::open(dir.path(), DbId::Locks).expect("open should succeed") {
            OpenOutcome::Open(db) => db,
            OpenOutcome::Broken => panic!("fresh database cannot be broken"),
        };
        let locks = LockStore::new(Box::new(db));

        let run = run_ctx();
        let mut ev = Evaluator::new(&run).with_locks(locks);
        let mut dispatch = RecordingDispatch {
            seen: vec![],
            result: PromiseResult::Change,
        };

        // First evaluation runs; the second is inside the ifelapsed
        // window of the same lock and is skipped.
        let p = Promise::new(
            "/tmp/locked",
            agent_bundle(),
            PromiseAttrs::Files(FileAttrs {
                transaction: Transaction {
                    ifelapsed_min: 5,
                    ..Default::default()
                },
                ..Default::default()
            }),
        );
        assert_eq!(ev.evaluate_promise(&p, &mut dispatch), PromiseResult::Change);
        assert_eq!(ev.evaluate_promise(&p, &mut dispatch), PromiseResult::Skipped);
        assert_eq!(dispatch.seen.len(), 1);
    }
}
