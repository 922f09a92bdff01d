//! Attribution context store.
//!
//! Answers "who is making this change right now" without threading the
//! actor through every call. Values are installed as deferred accessors and
//! resolved only when read, so an actor installed before authentication
//! finishes is picked up once it is known.
//!
//! Every execution context owns its own store:
//!
//! - each native thread has a private store ([`with_attribution`],
//!   [`current_attribution`]);
//! - async work wrapped in [`scope`] gets a task-local store forked from the
//!   enclosing values, and every `with_attribution` / `current_attribution`
//!   call made while that future runs uses it.
//!
//! Nothing is shared between contexts, so the store itself takes no locks.
//!
//! ## Example
//!
//! ```rust
//! use revtrail_audit::attribution::{self, Attribution};
//! use revtrail_core::Party;
//!
//! attribution::with_attribution(Attribution::new().actor(Party::label("importer")), || {
//!     let current = attribution::current_attribution();
//!     assert_eq!(current.actor, Some(Party::label("importer")));
//! });
//! assert_eq!(attribution::current_attribution().actor, None);
//! ```

use revtrail_core::Party;
use serde::Serialize;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::error::AuditError;

/// Zero-argument accessor evaluated when the attribution is read.
pub type Deferred<T> = Arc<dyn Fn() -> Option<T> + Send + Sync>;

/// A partial set of attribution values.
///
/// Used both as the overrides handed to a scope and as the store's current
/// values. Keys left unset are inherited from the enclosing scope.
#[derive(Clone, Default)]
pub struct Attribution {
    actor: Option<Deferred<Party>>,
    tenant: Option<Deferred<Party>>,
    remote_address: Option<Deferred<String>>,
    request_id: Option<Deferred<String>>,
}

impl Attribution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actor(self, actor: impl Into<Party>) -> Self {
        let actor = actor.into();
        self.actor_with(move || Some(actor.clone()))
    }

    /// Install a lazily resolved actor.
    pub fn actor_with<F>(mut self, resolve: F) -> Self
    where
        F: Fn() -> Option<Party> + Send + Sync + 'static,
    {
        self.actor = Some(Arc::new(resolve));
        self
    }

    pub fn tenant(self, tenant: impl Into<Party>) -> Self {
        let tenant = tenant.into();
        self.tenant_with(move || Some(tenant.clone()))
    }

    /// Install a lazily resolved tenant.
    pub fn tenant_with<F>(mut self, resolve: F) -> Self
    where
        F: Fn() -> Option<Party> + Send + Sync + 'static,
    {
        self.tenant = Some(Arc::new(resolve));
        self
    }

    pub fn remote_address(self, address: impl Into<String>) -> Self {
        let address = address.into();
        self.remote_address_with(move || Some(address.clone()))
    }

    pub fn remote_address_with<F>(mut self, resolve: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        self.remote_address = Some(Arc::new(resolve));
        self
    }

    pub fn request_id(self, id: impl Into<String>) -> Self {
        let id = id.into();
        self.request_id_with(move || Some(id.clone()))
    }

    pub fn request_id_with<F>(mut self, resolve: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        self.request_id = Some(Arc::new(resolve));
        self
    }

    /// Whether no key is set.
    pub fn is_empty(&self) -> bool {
        self.actor.is_none()
            && self.tenant.is_none()
            && self.remote_address.is_none()
            && self.request_id.is_none()
    }

    /// Layer `overrides` on top of these values.
    fn overlay(self, overrides: Attribution) -> Self {
        Self {
            actor: overrides.actor.or(self.actor),
            tenant: overrides.tenant.or(self.tenant),
            remote_address: overrides.remote_address.or(self.remote_address),
            request_id: overrides.request_id.or(self.request_id),
        }
    }

    /// Evaluate every accessor now.
    pub fn resolve(&self) -> AttributionSnapshot {
        AttributionSnapshot {
            actor: self.actor.as_ref().and_then(|resolve| resolve()),
            tenant: self.tenant.as_ref().and_then(|resolve| resolve()),
            remote_address: self.remote_address.as_ref().and_then(|resolve| resolve()),
            request_id: self.request_id.as_ref().and_then(|resolve| resolve()),
        }
    }
}

impl fmt::Debug for Attribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attribution")
            .field("actor", &self.actor.is_some())
            .field("tenant", &self.tenant.is_some())
            .field("remote_address", &self.remote_address.is_some())
            .field("request_id", &self.request_id.is_some())
            .finish()
    }
}

/// Attribution values resolved at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AttributionSnapshot {
    pub actor: Option<Party>,
    pub tenant: Option<Party>,
    pub remote_address: Option<String>,
    pub request_id: Option<String>,
}

/// Previous values of the keys one scope overrode.
///
/// The outer `Option` says whether the key was overridden at all, the inner
/// one is the value it had before.
struct Frame {
    actor: Option<Option<Deferred<Party>>>,
    tenant: Option<Option<Deferred<Party>>>,
    remote_address: Option<Option<Deferred<String>>>,
    request_id: Option<Option<Deferred<String>>>,
}

fn install<T>(slot: &mut Option<T>, value: Option<T>) -> Option<Option<T>> {
    value.map(|value| slot.replace(value))
}

fn restore<T>(slot: &mut Option<T>, saved: Option<Option<T>>) {
    if let Some(previous) = saved {
        *slot = previous;
    }
}

/// A nestable attribution store for one execution context.
///
/// Scopes form an explicit stack of saved frames. Entering a scope saves
/// the current values of the keys it overrides; leaving restores exactly
/// those, so a nested scope always falls back to its enclosing scope's
/// values rather than to the defaults.
#[derive(Default)]
pub struct AttributionStore {
    values: RefCell<Attribution>,
    frames: RefCell<Vec<Frame>>,
}

impl AttributionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_values(values: Attribution) -> Self {
        Self {
            values: RefCell::new(values),
            frames: RefCell::new(Vec::new()),
        }
    }

    /// Install `overrides` until the returned scope is exited or dropped.
    pub fn enter(&self, overrides: Attribution) -> AttributionScope<'_> {
        let frame = {
            let mut values = self.values.borrow_mut();
            Frame {
                actor: install(&mut values.actor, overrides.actor),
                tenant: install(&mut values.tenant, overrides.tenant),
                remote_address: install(&mut values.remote_address, overrides.remote_address),
                request_id: install(&mut values.request_id, overrides.request_id),
            }
        };

        let mut frames = self.frames.borrow_mut();
        frames.push(frame);
        AttributionScope {
            store: self,
            depth: frames.len(),
            active: true,
        }
    }

    fn exit(&self, depth: usize) -> Result<(), AuditError> {
        let frame = {
            let mut frames = self.frames.try_borrow_mut().map_err(|_| {
                AuditError::AttributionRestoreFailure("frame stack is borrowed".to_string())
            })?;
            if frames.len() != depth {
                return Err(AuditError::AttributionRestoreFailure(format!(
                    "scope at depth {} exited while {} scopes are open",
                    depth,
                    frames.len()
                )));
            }
            frames.pop().ok_or_else(|| {
                AuditError::AttributionRestoreFailure("frame stack is empty".to_string())
            })?
        };

        let mut values = self.values.try_borrow_mut().map_err(|_| {
            AuditError::AttributionRestoreFailure("values are borrowed".to_string())
        })?;
        restore(&mut values.actor, frame.actor);
        restore(&mut values.tenant, frame.tenant);
        restore(&mut values.remote_address, frame.remote_address);
        restore(&mut values.request_id, frame.request_id);
        Ok(())
    }

    /// Run `body` with `overrides` installed.
    ///
    /// The previous values are restored on every exit path, including
    /// panics. The body's result, error or not, is returned as is.
    pub fn with_attribution<R>(&self, overrides: Attribution, body: impl FnOnce() -> R) -> R {
        let _scope = self.enter(overrides);
        body()
    }

    /// Resolve the nearest enclosing values now.
    pub fn current(&self) -> AttributionSnapshot {
        // Accessors may read the store themselves; release the borrow first.
        let values = self.values.borrow().clone();
        values.resolve()
    }

    /// Number of open scopes.
    pub fn depth(&self) -> usize {
        self.frames.borrow().len()
    }
}

/// Guard for an open attribution scope.
#[must_use = "dropping the scope immediately restores the previous attribution"]
pub struct AttributionScope<'a> {
    store: &'a AttributionStore,
    depth: usize,
    active: bool,
}

impl AttributionScope<'_> {
    /// Leave the scope, reporting a corrupted stack instead of panicking.
    pub fn exit(mut self) -> Result<(), AuditError> {
        self.active = false;
        self.store.exit(self.depth)
    }
}

impl Drop for AttributionScope<'_> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;

        if let Err(err) = self.store.exit(self.depth) {
            tracing::error!(error = %err, depth = self.depth, "Attribution scope restore failed");
            if !std::thread::panicking() {
                panic!("{}", err);
            }
        }
    }
}

thread_local! {
    static THREAD_STORE: AttributionStore = AttributionStore::new();
}

tokio::task_local! {
    static TASK_STORE: AttributionStore;
}

fn with_store<R>(f: impl FnOnce(&AttributionStore) -> R) -> R {
    if TASK_STORE.try_with(|_| ()).is_ok() {
        TASK_STORE.with(f)
    } else {
        THREAD_STORE.with(f)
    }
}

/// Run `body` with `overrides` installed in the current execution context.
pub fn with_attribution<R>(overrides: Attribution, body: impl FnOnce() -> R) -> R {
    with_store(|store| store.with_attribution(overrides, body))
}

/// Resolve the current execution context's attribution.
pub fn current_attribution() -> AttributionSnapshot {
    with_store(|store| store.current())
}

/// Run `future` with its own attribution store.
///
/// The store starts from the enclosing context's values with `overrides`
/// layered on top and is discarded when the future completes. Use one per
/// inbound request.
pub async fn scope<F: Future>(overrides: Attribution, future: F) -> F::Output {
    let inherited = with_store(|store| store.values.borrow().clone());
    let store = AttributionStore::with_values(inherited.overlay(overrides));
    TASK_STORE.scope(store, future).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::{Barrier, Mutex};
    use std::thread;
    use std::time::Duration;

    fn actor(store: &AttributionStore) -> Option<Party> {
        store.current().actor
    }

    #[test]
    fn test_nested_scopes_restore_enclosing_values() {
        let store = AttributionStore::new();
        assert_eq!(actor(&store), None);

        store.with_attribution(Attribution::new().actor("X"), || {
            assert_eq!(actor(&store), Some(Party::label("X")));

            store.with_attribution(Attribution::new().actor("Y"), || {
                assert_eq!(actor(&store), Some(Party::label("Y")));
            });

            assert_eq!(actor(&store), Some(Party::label("X")));
        });

        assert_eq!(actor(&store), None);
        assert_eq!(store.depth(), 0);
    }

    #[test]
    fn test_error_in_nested_scope_restores_and_propagates() {
        let store = AttributionStore::new();

        store.with_attribution(Attribution::new().actor("X"), || {
            let result: Result<(), &str> =
                store.with_attribution(Attribution::new().actor("Y"), || Err("boom"));

            assert_eq!(result, Err("boom"));
            assert_eq!(actor(&store), Some(Party::label("X")));
        });
    }

    #[test]
    fn test_panic_in_nested_scope_restores() {
        let store = AttributionStore::new();

        store.with_attribution(Attribution::new().actor("X"), || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                store.with_attribution::<()>(Attribution::new().actor("Y"), || panic!("boom"))
            }));

            assert!(outcome.is_err());
            assert_eq!(actor(&store), Some(Party::label("X")));
            assert_eq!(store.depth(), 1);
        });
    }

    #[test]
    fn test_only_overridden_keys_are_replaced() {
        let store = AttributionStore::new();
        let outer = Attribution::new()
            .actor(Party::reference("User", 1))
            .tenant("acme")
            .request_id("req-1");

        store.with_attribution(outer, || {
            store.with_attribution(Attribution::new().actor("cron"), || {
                let current = store.current();
                assert_eq!(current.actor, Some(Party::label("cron")));
                assert_eq!(current.tenant, Some(Party::label("acme")));
                assert_eq!(current.request_id.as_deref(), Some("req-1"));
            });

            assert_eq!(actor(&store), Some(Party::reference("User", 1)));
        });
    }

    #[test]
    fn test_values_resolve_at_read_time() {
        let store = AttributionStore::new();
        let signed_in: Arc<Mutex<Option<i64>>> = Arc::new(Mutex::new(None));
        let session = Arc::clone(&signed_in);

        let overrides = Attribution::new().actor_with(move || {
            session
                .lock()
                .ok()
                .and_then(|id| *id)
                .map(|id| Party::reference("User", id))
        });

        store.with_attribution(overrides, || {
            assert_eq!(actor(&store), None);

            *signed_in.lock().unwrap() = Some(42);
            assert_eq!(actor(&store), Some(Party::reference("User", 42)));
        });
    }

    #[test]
    fn test_out_of_order_exit_is_reported() {
        let store = AttributionStore::new();
        let outer = store.enter(Attribution::new().actor("X"));
        let inner = store.enter(Attribution::new().actor("Y"));

        let err = outer.exit().unwrap_err();
        assert!(matches!(err, AuditError::AttributionRestoreFailure(_)));

        inner.exit().unwrap();
        assert_eq!(actor(&store), Some(Party::label("X")));
    }

    #[test]
    fn test_threads_never_see_each_other() {
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = ["alice", "bob"]
            .into_iter()
            .map(|name| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    with_attribution(Attribution::new().actor(name), || {
                        barrier.wait();
                        let seen = current_attribution().actor;
                        barrier.wait();
                        seen
                    })
                })
            })
            .collect();

        let seen: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(seen, vec![Some(Party::label("alice")), Some(Party::label("bob"))]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scoped_tasks_never_see_each_other() {
        let tasks: Vec<_> = ["alice", "bob"]
            .into_iter()
            .map(|name| {
                tokio::spawn(scope(Attribution::new().actor(name), async move {
                    let mut seen = Vec::new();
                    for _ in 0..5 {
                        seen.push(current_attribution().actor);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                    }
                    (name, seen)
                }))
            })
            .collect();

        for task in tasks {
            let (name, seen) = task.await.unwrap();
            assert!(seen.iter().all(|actor| actor == &Some(Party::label(name))));
        }
    }

    #[tokio::test]
    async fn test_scope_inherits_and_overrides() {
        let outer = Attribution::new().tenant("acme").actor("X");

        scope(outer, async {
            scope(Attribution::new().actor("Y"), async {
                let current = current_attribution();
                assert_eq!(current.actor, Some(Party::label("Y")));
                assert_eq!(current.tenant, Some(Party::label("acme")));
            })
            .await;

            assert_eq!(current_attribution().actor, Some(Party::label("X")));

            with_attribution(Attribution::new().actor("Z"), || {
                assert_eq!(current_attribution().actor, Some(Party::label("Z")));
            });
            assert_eq!(current_attribution().actor, Some(Party::label("X")));
        })
        .await;

        assert_eq!(current_attribution().actor, None);
    }
}
