//! Integration tests for propagation behaviors and the current-transaction pointer.

use std::sync::Arc;
use std::thread;

use nestedtx::resource::{MemoryStore, ResourceCall};
use nestedtx::transaction::{
    PropagationBehavior, RetryPolicy, TransactionError, TransactionManager, TransactionOptions,
};
use serde_json::json;

fn setup() -> (MemoryStore, TransactionManager<MemoryStore>) {
    let store = MemoryStore::new();
    (store.clone(), TransactionManager::new(store))
}

fn options(propagation: PropagationBehavior) -> TransactionOptions {
    TransactionOptions::new(propagation)
}

#[test]
fn never_inside_transaction_is_rejected_without_side_effects() {
    let (store, manager) = setup();

    manager
        .with_transaction(|ctx| -> Result<(), TransactionError> {
            let ctx = ctx.unwrap();
            let calls_before = store.calls().len();
            let level_before = ctx.nesting_level();

            let result = manager.transaction(&options(PropagationBehavior::Never), |_| {
                Ok::<_, TransactionError>(())
            });

            assert!(matches!(
                result,
                Err(TransactionError::Propagation {
                    propagation: PropagationBehavior::Never,
                    ..
                })
            ));
            assert_eq!(store.calls().len(), calls_before);
            assert_eq!(ctx.nesting_level(), level_before);
            assert!(ctx.is_active());
            Ok(())
        })
        .unwrap();
}

#[test]
fn never_and_supports_run_without_transaction() {
    let (store, manager) = setup();

    for propagation in [
        PropagationBehavior::Never,
        PropagationBehavior::Supports,
        PropagationBehavior::NotSupported,
    ] {
        let saw = manager
            .transaction(&options(propagation), |ctx| {
                Ok::<_, TransactionError>(ctx.is_some())
            })
            .unwrap();
        assert!(!saw, "{} should run without a transaction", propagation);
    }
    assert!(store.calls().is_empty());
}

#[test]
fn supports_and_mandatory_join_ambient() {
    let (store, manager) = setup();

    manager
        .with_transaction(|outer| -> Result<(), TransactionError> {
            let outer_id = outer.unwrap().id().to_string();
            for propagation in [PropagationBehavior::Supports, PropagationBehavior::Mandatory] {
                manager.transaction(&options(propagation), |ctx| {
                    let ctx = ctx.unwrap();
                    assert_eq!(ctx.id(), outer_id);
                    assert_eq!(ctx.nesting_level(), 2);
                    Ok::<_, TransactionError>(())
                })?;
            }
            Ok(())
        })
        .unwrap();

    assert_eq!(store.call_count(ResourceCall::Open), 1);
    assert_eq!(store.call_count(ResourceCall::Commit), 1);
}

#[test]
fn not_supported_hides_ambient_transaction() {
    let (store, manager) = setup();

    manager
        .with_transaction(|outer| -> Result<(), TransactionError> {
            outer
                .unwrap()
                .with_resource(|conn| conn.put("t", "x", 1))?;

            manager.transaction(&options(PropagationBehavior::NotSupported), |ctx| {
                assert!(ctx.is_none());
                assert!(manager.current().is_none());
                assert!(!manager.in_transaction());

                // a Required scope in here starts its own transaction
                manager.transaction(&options(PropagationBehavior::Required), |inner| {
                    inner
                        .unwrap()
                        .with_resource(|conn| conn.put("t", "independent", 2))?;
                    Ok::<_, TransactionError>(())
                })
            })?;

            assert!(manager.in_transaction());
            Err(TransactionError::InvalidOperation("outer fails".into()))
        })
        .unwrap_err();

    assert_eq!(store.get("t", "x"), None);
    assert_eq!(store.get("t", "independent"), Some(json!(2)));
    assert_eq!(store.call_count(ResourceCall::Open), 2);
}

#[test]
fn current_is_restored_after_scopes() {
    let (_store, manager) = setup();
    assert!(manager.current().is_none());

    manager
        .with_transaction(|outer| -> Result<(), TransactionError> {
            let outer_id = outer.unwrap().id().to_string();
            let _ = manager.transaction(&options(PropagationBehavior::Nested), |_| {
                Err::<(), _>(TransactionError::InvalidOperation("step failed".into()))
            });
            assert_eq!(manager.current().unwrap().id(), outer_id);
            Ok(())
        })
        .unwrap();

    assert!(manager.current().is_none());
}

#[test]
fn managers_do_not_share_current_transaction() {
    let (_store, first) = setup();
    let (_other_store, second) = setup();

    first
        .with_transaction(|_| -> Result<(), TransactionError> {
            assert!(first.in_transaction());
            assert!(!second.in_transaction());
            Ok(())
        })
        .unwrap();
}

#[test]
fn threads_get_independent_transactions() {
    let (store, manager) = setup();
    let manager = Arc::new(manager);

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                manager.with_transaction(|ctx| -> Result<String, TransactionError> {
                    let ctx = ctx.unwrap();
                    assert_eq!(ctx.nesting_level(), 1);
                    ctx.with_resource(|conn| conn.put("t", &format!("k{}", i), i))?;
                    Ok(ctx.id().to_string())
                })
            })
        })
        .collect();

    let mut ids: Vec<String> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();
    ids.sort();
    ids.dedup();

    assert_eq!(ids.len(), 4);
    assert_eq!(store.len(), 4);
    assert_eq!(store.call_count(ResourceCall::Commit), 4);
}

#[test]
fn retry_reruns_transient_failures() {
    let (store, manager) = setup();
    store.fail_next_commits(2);
    let policy = RetryPolicy::new(3).initial_backoff(std::time::Duration::from_millis(1));
    let mut attempts = 0;

    manager
        .transaction_with_retry(&TransactionOptions::default(), &policy, |ctx| {
            attempts += 1;
            ctx.unwrap()
                .with_resource(|conn| conn.put("t", "x", attempts))?;
            Ok::<_, TransactionError>(())
        })
        .unwrap();

    assert_eq!(attempts, 3);
    assert_eq!(store.get("t", "x"), Some(json!(3)));
    assert_eq!(store.call_count(ResourceCall::Rollback), 2);
}

#[test]
fn retry_gives_up_after_max_attempts() {
    let (store, manager) = setup();
    store.fail_next_commits(5);
    let policy = RetryPolicy::new(2).initial_backoff(std::time::Duration::from_millis(1));
    let mut attempts = 0;

    let result = manager.transaction_with_retry(&TransactionOptions::default(), &policy, |_| {
        attempts += 1;
        Ok::<_, TransactionError>(())
    });

    assert!(result.unwrap_err().is_retryable());
    assert_eq!(attempts, 2);
}

#[test]
fn retry_skips_permanent_failures() {
    let (_store, manager) = setup();
    let mut attempts = 0;

    let result = manager.transaction_with_retry(
        &TransactionOptions::default(),
        &RetryPolicy::new(5),
        |_| {
            attempts += 1;
            Err::<(), _>(TransactionError::InvalidOperation("bad input".into()))
        },
    );

    assert!(result.is_err());
    assert_eq!(attempts, 1);
}

#[test]
fn retry_runs_once_inside_ambient_transaction() {
    let (store, manager) = setup();
    let mut attempts = 0;

    let err = manager
        .with_transaction(|_| -> Result<(), TransactionError> {
            let inner = manager.with_retry(&TransactionOptions::default(), |_| {
                attempts += 1;
                Err::<(), _>(TransactionError::Resource(
                    nestedtx::resource::ResourceError::Conflict {
                        reason: "lock timeout".into(),
                    },
                ))
            });
            assert!(inner.is_err());
            // the failed joined scope took the shared transaction down with it
            assert!(!manager.in_transaction());
            Ok(())
        })
        .unwrap_err();

    assert!(matches!(err, TransactionError::RolledBackByInnerScope { .. }));
    assert_eq!(attempts, 1);
    assert_eq!(store.call_count(ResourceCall::Rollback), 1);
    assert_eq!(store.call_count(ResourceCall::Commit), 0);
}
