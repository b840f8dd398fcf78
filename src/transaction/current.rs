//! Thread-scoped pointer to the current transaction.
//!
//! Each thread keeps a stack of frames per manager. A scope pushes a frame
//! on entry and the returned [`CurrentFrame`] pops it on drop, so the
//! previous value is restored however the scope ends (return, error or
//! panic). A suspended frame hides whatever is below it.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use ulid::Ulid;

use crate::resource::ResourceHandle;
use crate::transaction::context::TransactionContext;

type Frame = Option<Arc<dyn Any + Send + Sync>>;

thread_local! {
    static CURRENT: RefCell<HashMap<Ulid, Vec<Frame>>> = RefCell::new(HashMap::new());
}

/// The context on top of this thread's stack for `manager`, if any.
pub(crate) fn current<R: ResourceHandle>(manager: Ulid) -> Option<Arc<TransactionContext<R>>> {
    let top = CURRENT.with(|stacks| {
        stacks
            .borrow()
            .get(&manager)
            .and_then(|frames| frames.last().cloned())
            .flatten()
    })?;
    top.downcast::<TransactionContext<R>>().ok()
}

/// A pushed frame. Dropping it pops the frame.
#[must_use = "the frame is popped as soon as the guard is dropped"]
pub(crate) struct CurrentFrame {
    manager: Ulid,
    // Frames are per thread; the guard must be dropped where it was created.
    _not_send: PhantomData<*const ()>,
}

impl CurrentFrame {
    /// Make `ctx` the current transaction.
    pub(crate) fn push<R: ResourceHandle>(manager: Ulid, ctx: Arc<TransactionContext<R>>) -> Self {
        let frame: Arc<dyn Any + Send + Sync> = ctx;
        Self::push_frame(manager, Some(frame))
    }

    /// Hide the current transaction.
    pub(crate) fn suspend(manager: Ulid) -> Self {
        Self::push_frame(manager, None)
    }

    fn push_frame(manager: Ulid, frame: Frame) -> Self {
        CURRENT.with(|stacks| {
            stacks
                .borrow_mut()
                .entry(manager)
                .or_default()
                .push(frame)
        });
        Self {
            manager,
            _not_send: PhantomData,
        }
    }
}

impl Drop for CurrentFrame {
    fn drop(&mut self) {
        // `try_with` so a frame dropped during thread teardown does not panic.
        let _ = CURRENT.try_with(|stacks| {
            let mut stacks = stacks.borrow_mut();
            if let Some(frames) = stacks.get_mut(&self.manager) {
                frames.pop();
                if frames.is_empty() {
                    stacks.remove(&self.manager);
                }
            }
        });
    }
}
