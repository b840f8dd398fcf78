//! Integration tests for lifecycle hooks and participants.

use std::sync::Arc;

use nestedtx::resource::{MemoryConnection, MemoryStore, ResourceCall};
use nestedtx::transaction::{
    Hook, HookPhase, HookResult, Participant, PropagationBehavior, TransactionError,
    TransactionManager, TransactionOptions, TransactionState,
};
use parking_lot::Mutex;
use serde_json::json;

type Log = Arc<Mutex<Vec<String>>>;

fn setup() -> (MemoryStore, TransactionManager<MemoryStore>) {
    let store = MemoryStore::new();
    (store.clone(), TransactionManager::new(store))
}

fn logging(log: &Log, phase: HookPhase, label: &str, priority: i32) -> Hook<MemoryConnection> {
    let log = Arc::clone(log);
    let label = label.to_string();
    Hook::new(phase, label.clone(), move |_| {
        log.lock().push(label.clone());
        Ok(())
    })
    .with_priority(priority)
}

#[test]
fn hooks_run_in_priority_order() {
    let (_store, manager) = setup();
    let log: Log = Arc::default();
    manager.register_global_hook(logging(&log, HookPhase::BeforeCommit, "30", 30));
    manager.register_global_hook(logging(&log, HookPhase::BeforeCommit, "10", 10));
    manager.register_global_hook(logging(&log, HookPhase::BeforeCommit, "20", 20));
    manager.register_global_hook(logging(&log, HookPhase::BeforeCommit, "10-again", 10));

    manager
        .with_transaction(|_| Ok::<_, TransactionError>(()))
        .unwrap();

    assert_eq!(*log.lock(), vec!["10", "10-again", "20", "30"]);
}

#[test]
fn global_and_local_hooks_are_merged() {
    let (_store, manager) = setup();
    let log: Log = Arc::default();
    manager.register_global_hook(logging(&log, HookPhase::AfterCommit, "global", 5));

    let local_log = Arc::clone(&log);
    manager
        .with_transaction(move |ctx| -> Result<(), TransactionError> {
            ctx.unwrap()
                .register_hook(logging(&local_log, HookPhase::AfterCommit, "local", 1));
            Ok(())
        })
        .unwrap();

    assert_eq!(*log.lock(), vec!["local", "global"]);
}

#[test]
fn lifecycle_phases_in_order() {
    let (_store, manager) = setup();
    let log: Log = Arc::default();
    for phase in [
        HookPhase::BeforeBegin,
        HookPhase::AfterBegin,
        HookPhase::BeforeCommit,
        HookPhase::AfterCommit,
        HookPhase::BeforeRollback,
        HookPhase::AfterRollback,
    ] {
        manager.register_global_hook(logging(&log, phase, &phase.to_string(), 0));
    }

    manager
        .with_transaction(|_| Ok::<_, TransactionError>(()))
        .unwrap();
    assert_eq!(
        *log.lock(),
        vec!["before_begin", "after_begin", "before_commit", "after_commit"]
    );

    log.lock().clear();
    let _ = manager.with_transaction(|_| {
        Err::<(), _>(TransactionError::InvalidOperation("abort".into()))
    });
    assert_eq!(
        *log.lock(),
        vec!["before_begin", "after_begin", "before_rollback", "after_rollback"]
    );
}

#[test]
fn failing_before_commit_prevents_commit() {
    let (store, manager) = setup();
    manager.register_global_hook(Hook::new(HookPhase::BeforeCommit, "validate", |_| {
        Err("balance would go negative".into())
    }));

    let result = manager.with_transaction(|ctx| -> Result<(), TransactionError> {
        ctx.unwrap()
            .with_resource(|conn| conn.put("accounts", "1", -5))?;
        Ok(())
    });

    let err = result.unwrap_err();
    assert!(matches!(
        err,
        TransactionError::HookFailed { ref hook, phase: HookPhase::BeforeCommit, .. } if hook == "validate"
    ));
    assert!(err.to_string().contains("balance would go negative"));
    assert!(store.is_empty());
    assert_eq!(store.call_count(ResourceCall::Commit), 0);
    assert_eq!(store.call_count(ResourceCall::Rollback), 1);
}

#[test]
fn failing_after_commit_keeps_commit() {
    let (store, manager) = setup();
    manager.register_global_hook(Hook::new(HookPhase::AfterCommit, "notify", |_| {
        Err("smtp unavailable".into())
    }));

    let ctx = manager
        .with_transaction(|ctx| -> Result<_, TransactionError> {
            let ctx = ctx.unwrap();
            ctx.with_resource(|conn| conn.put("accounts", "1", 100))?;
            Ok(manager.current().unwrap())
        })
        .unwrap();

    assert_eq!(ctx.state(), TransactionState::Committed);
    assert_eq!(store.get("accounts", "1"), Some(json!(100)));
    let failures = ctx.hook_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].hook, "notify");
    assert_eq!(failures[0].phase, HookPhase::AfterCommit);
}

#[test]
fn before_begin_failure_opens_nothing() {
    let (store, manager) = setup();
    manager.register_global_hook(Hook::new(HookPhase::BeforeBegin, "maintenance", |_| {
        Err("read-only window".into())
    }));

    let mut ran = false;
    let result = manager.with_transaction(|_| {
        ran = true;
        Ok::<_, TransactionError>(())
    });

    assert!(matches!(
        result,
        Err(TransactionError::HookFailed { phase: HookPhase::BeforeBegin, .. })
    ));
    assert!(!ran);
    assert_eq!(store.call_count(ResourceCall::Begin), 0);
    assert_eq!(manager.active_count(), 0);
}

#[test]
fn on_error_hooks_see_the_error() {
    let (_store, manager) = setup();
    let seen: Log = Arc::default();
    let sink = Arc::clone(&seen);
    manager.register_global_hook(Hook::on_error("capture", move |ctx, err| {
        sink.lock().push(format!("{}: {}", ctx.state(), err));
        Ok(())
    }));

    let _ = manager.with_transaction(|_| {
        Err::<(), _>(TransactionError::InvalidOperation("payment declined".into()))
    });

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].starts_with("active: "));
    assert!(seen[0].contains("payment declined"));
}

fn counting_on_error(manager: &TransactionManager<MemoryStore>) -> Arc<Mutex<usize>> {
    let count = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&count);
    manager.register_global_hook(Hook::on_error("count", move |_, _| {
        *sink.lock() += 1;
        Ok(())
    }));
    count
}

#[test]
fn on_error_runs_once_per_error_across_scopes() {
    let (_store, manager) = setup();
    let count = counting_on_error(&manager);
    let required = TransactionOptions::new(PropagationBehavior::Required);

    let result = manager.transaction(&required, |_| {
        manager.transaction(&required, |_| {
            manager.transaction(&required, |_| {
                Err::<(), _>(TransactionError::InvalidOperation("card expired".into()))
            })
        })
    });

    assert!(result.is_err());
    assert_eq!(*count.lock(), 1);
}

#[test]
fn each_failed_step_is_reported() {
    let (_store, manager) = setup();
    let count = counting_on_error(&manager);
    let nested = TransactionOptions::new(PropagationBehavior::Nested);

    manager
        .with_transaction(|_| -> Result<(), TransactionError> {
            for _ in 0..2 {
                let step = manager.transaction(&nested, |_| {
                    Err::<(), _>(TransactionError::InvalidOperation("sku-1 out of stock".into()))
                });
                assert!(step.is_err());
            }
            Ok(())
        })
        .unwrap();

    assert_eq!(*count.lock(), 2);
}

#[test]
fn unregistered_global_hook_stops_running() {
    let (_store, manager) = setup();
    let log: Log = Arc::default();
    let id = manager.register_global_hook(logging(&log, HookPhase::AfterBegin, "audit", 0));

    manager
        .with_transaction(|_| Ok::<_, TransactionError>(()))
        .unwrap();
    assert!(manager.unregister_global_hook(id));
    manager
        .with_transaction(|_| Ok::<_, TransactionError>(()))
        .unwrap();

    assert_eq!(log.lock().len(), 1);
}

#[test]
fn joined_scopes_do_not_rerun_lifecycle_hooks() {
    let (_store, manager) = setup();
    let log: Log = Arc::default();
    manager.register_global_hook(logging(&log, HookPhase::AfterBegin, "begin", 0));
    manager.register_global_hook(logging(&log, HookPhase::AfterCommit, "commit", 0));

    manager
        .with_transaction(|_| {
            manager.transaction(&TransactionOptions::new(PropagationBehavior::Required), |_| {
                manager.with_transaction(|_| Ok::<_, TransactionError>(()))
            })
        })
        .unwrap();

    assert_eq!(*log.lock(), vec!["begin", "commit"]);
}

struct Outbox {
    log: Log,
    ready: bool,
}

impl Participant for Outbox {
    fn name(&self) -> &str {
        "outbox"
    }

    fn prepare(&self) -> HookResult {
        self.log.lock().push("prepare".into());
        if self.ready {
            Ok(())
        } else {
            Err("broker unreachable".into())
        }
    }

    fn commit(&self) -> HookResult {
        self.log.lock().push("commit".into());
        Ok(())
    }

    fn rollback(&self) -> HookResult {
        self.log.lock().push("rollback".into());
        Ok(())
    }
}

#[test]
fn participants_follow_transaction_outcome() {
    let (store, manager) = setup();
    let log: Log = Arc::default();

    let participant = Arc::new(Outbox {
        log: Arc::clone(&log),
        ready: true,
    });
    manager
        .with_transaction(|ctx| -> Result<(), TransactionError> {
            ctx.unwrap().enlist(participant);
            Ok(())
        })
        .unwrap();
    assert_eq!(*log.lock(), vec!["prepare", "commit"]);

    log.lock().clear();
    let unready = Arc::new(Outbox {
        log: Arc::clone(&log),
        ready: false,
    });
    let result = manager.with_transaction(|ctx| -> Result<(), TransactionError> {
        let ctx = ctx.unwrap();
        ctx.enlist(unready);
        ctx.with_resource(|conn| conn.put("t", "x", 1))?;
        Ok(())
    });

    assert!(matches!(
        result,
        Err(TransactionError::HookFailed { ref hook, .. }) if hook == "outbox"
    ));
    assert_eq!(*log.lock(), vec!["prepare", "rollback"]);
    assert!(store.is_empty());
}

#[test]
fn hooks_can_use_the_data_bag() {
    let (_store, manager) = setup();
    manager.register_global_hook(Hook::new(HookPhase::AfterBegin, "tenant", |ctx| {
        ctx.set("tenant", "acme")?;
        Ok(())
    }));

    let tenant = manager
        .with_transaction(|ctx| ctx.unwrap().get::<String>("tenant"))
        .unwrap();

    assert_eq!(tenant.as_deref(), Some("acme"));
}
