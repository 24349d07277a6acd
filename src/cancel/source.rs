//! Cancellation source, token, and scoped subscription.

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crate::intrusive::{IntrusiveList, ListNode};
use crate::util::SpinWait;

/// Lock bit of the source state word. Guards `Inner`.
const LOCKED: u8 = 0b01;
/// Stop-requested bit. Set exactly once, before delivery begins; the
/// `fetch_or` that sets it elects the single delivering thread.
const STOP_REQUESTED: u8 = 0b10;

type Callback = Box<dyn FnOnce() + Send>;

/// Per-subscription record, linked into the source's list.
struct SubEntry {
    /// Taken out by the deliverer (under the lock) before invocation, so a
    /// callback that destroys its own subscription never frees memory the
    /// deliverer still touches.
    callback: Option<Callback>,
    /// Whether the node is currently linked. Guarded by the lock bit.
    linked: bool,
}

/// State shared by the source, its tokens, and its subscriptions.
struct Shared {
    state: AtomicU8,
    /// Guarded by the `LOCKED` bit in `state`.
    inner: UnsafeCell<Inner>,
    /// Number of live `CancelSource` handles (0 or 1).
    sources: AtomicUsize,
}

struct Inner {
    /// Subscriptions, newest first. Delivery pops from the front, which is
    /// what makes callbacks fire in reverse registration order.
    subscriptions: IntrusiveList<SubEntry>,
    /// The node whose callback is currently being invoked, if any.
    delivering: *mut ListNode<SubEntry>,
    /// Identity of the thread performing that invocation. Compared against
    /// the removing thread so self-removal from inside a callback does not
    /// deadlock on its own completion.
    delivering_thread: Option<ThreadId>,
}

// Safety: Inner is only touched while holding the lock bit; the raw node
// pointers reference nodes owned by subscriptions, which deregister before
// they are freed.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(0),
            inner: UnsafeCell::new(Inner {
                subscriptions: IntrusiveList::new(),
                delivering: ptr::null_mut(),
                delivering_thread: None,
            }),
            sources: AtomicUsize::new(1),
        })
    }

    /// Acquires the spinlock bit, returning the state bits observed at the
    /// moment of acquisition (so callers can read `STOP_REQUESTED` without a
    /// second load). Held durations are O(1) pointer operations, which is why
    /// this is a bounded busy-wait and not a blocking mutex.
    fn lock(&self) -> u8 {
        let mut spin = SpinWait::new();
        loop {
            let prev = self.state.fetch_or(LOCKED, Ordering::Acquire);
            if prev & LOCKED == 0 {
                return prev;
            }
            spin.spin();
        }
    }

    fn unlock(&self) {
        self.state.fetch_and(!LOCKED, Ordering::Release);
    }

    /// # Safety
    ///
    /// Caller must hold the lock bit.
    #[allow(clippy::mut_from_ref)]
    unsafe fn inner(&self) -> &mut Inner {
        &mut *self.inner.get()
    }

    fn stop_requested(&self) -> bool {
        self.state.load(Ordering::Acquire) & STOP_REQUESTED != 0
    }
}

/// Owner of one cancellation domain.
///
/// Creating a source creates the domain; [`request_stop`](Self::request_stop)
/// broadcasts to every registered [`CancelSubscription`] exactly once.
/// Dropping a source with live subscriptions is a usage error and trips a
/// debug assertion: subscriptions borrow the domain's state and must be
/// removed first.
pub struct CancelSource {
    shared: Arc<Shared>,
}

impl CancelSource {
    /// Creates a new cancellation domain with stop not yet requested.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Shared::new(),
        }
    }

    /// Returns a token referencing this source.
    #[must_use]
    pub fn token(&self) -> CancelToken {
        CancelToken {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Returns whether stop has been requested on this source.
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.shared.stop_requested()
    }

    /// Requests stop. Idempotent.
    ///
    /// Returns `true` if stop had already been requested by an earlier call
    /// (in which case this call delivers nothing). On the call that performs
    /// the transition, the calling thread becomes the sole deliverer: it
    /// unlinks one subscription at a time, invoking each callback with no
    /// lock held, so callbacks are free to add or remove subscriptions,
    /// including removing themselves. Subscriptions fire in reverse order of
    /// registration.
    pub fn request_stop(&self) -> bool {
        let prev = self.shared.state.fetch_or(STOP_REQUESTED, Ordering::AcqRel);
        if prev & STOP_REQUESTED != 0 {
            return true;
        }

        // Sole deliverer from here on.
        loop {
            self.shared.lock();
            // Safety: lock bit held.
            let inner = unsafe { self.shared.inner() };
            inner.delivering = ptr::null_mut();
            inner.delivering_thread = None;
            match inner.subscriptions.pop_front() {
                None => {
                    self.shared.unlock();
                    break;
                }
                Some(mut node) => {
                    // Safety: the node is owned by a live subscription; it
                    // cannot be freed while `delivering` points at it.
                    let entry = unsafe { node.as_mut() };
                    entry.linked = false;
                    let callback = entry.callback.take();
                    inner.delivering = node.as_ptr();
                    inner.delivering_thread = Some(thread::current().id());
                    self.shared.unlock();
                    if let Some(callback) = callback {
                        callback();
                    }
                }
            }
        }
        false
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CancelSource {
    fn drop(&mut self) {
        self.shared.lock();
        // Safety: lock bit held.
        let _live = unsafe { self.shared.inner() }.subscriptions.len();
        self.shared.unlock();
        debug_assert!(
            _live == 0,
            "cancel source dropped with {_live} live subscription(s)"
        );
        self.shared.sources.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for CancelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSource")
            .field("stop_requested", &self.stop_requested())
            .finish()
    }
}

/// A cheap, clonable handle referencing a [`CancelSource`].
///
/// Tokens only observe the domain: they can query its state and anchor
/// subscriptions, but cannot request stop.
#[derive(Clone)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

impl CancelToken {
    /// Returns a token that can never signal stop, for callers that have no
    /// cancellation domain to offer.
    #[must_use]
    pub fn never() -> Self {
        let shared = Shared::new();
        shared.sources.store(0, Ordering::Release);
        Self { shared }
    }

    /// Returns whether stop has been requested. O(1).
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.shared.stop_requested()
    }

    /// Returns whether a stop request can still arrive: either one already
    /// has, or the source is still alive. A token whose source was dropped
    /// without requesting stop can never fire, and waiters may skip
    /// registering subscriptions entirely.
    #[must_use]
    pub fn stop_possible(&self) -> bool {
        self.shared.stop_requested() || self.shared.sources.load(Ordering::Acquire) > 0
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("stop_requested", &self.stop_requested())
            .field("stop_possible", &self.stop_possible())
            .finish()
    }
}

/// A scoped registration of a callback with a [`CancelToken`].
///
/// On construction the callback is linked at the head of the source's
/// subscription list, or, if stop was already requested, invoked inline on
/// the constructing thread. On destruction the subscription deregisters; if
/// its callback is being invoked on another thread at that moment, the
/// destructor spin-waits until the invocation completes, guaranteeing the
/// callback's captures are never freed while it runs. Destroying the
/// subscription from inside its own callback is safe and does not block.
pub struct CancelSubscription {
    shared: Arc<Shared>,
    node: Box<ListNode<SubEntry>>,
    registered: bool,
}

// Safety: the node's raw links and entry are only touched under the source's
// lock bit, and the boxed callback is required to be Send. The destructor may
// therefore run on any thread.
unsafe impl Send for CancelSubscription {}

impl CancelSubscription {
    /// Registers `callback` to run when stop is requested on the token's
    /// source. If stop was already requested, the callback runs inline
    /// before this returns.
    pub fn new(token: &CancelToken, callback: impl FnOnce() + Send + 'static) -> Self {
        let shared = Arc::clone(&token.shared);
        let mut node = Box::new(ListNode::new(SubEntry {
            callback: Some(Box::new(callback)),
            linked: false,
        }));

        let observed = shared.lock();
        if observed & STOP_REQUESTED != 0 {
            shared.unlock();
            let callback = node.callback.take();
            if let Some(callback) = callback {
                callback();
            }
            return Self {
                shared,
                node,
                registered: false,
            };
        }
        node.linked = true;
        // Safety: lock bit held; the node is heap-pinned by the Box and is
        // unlinked in Drop before it can be freed.
        unsafe {
            shared
                .inner()
                .subscriptions
                .push_front(NonNull::from(&mut *node));
        }
        shared.unlock();
        Self {
            shared,
            node,
            registered: true,
        }
    }

    /// Returns whether the callback was linked for later delivery, rather
    /// than invoked inline at construction.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registered
    }
}

impl Drop for CancelSubscription {
    fn drop(&mut self) {
        if !self.registered {
            return;
        }
        let node_ptr: *mut ListNode<SubEntry> = &mut *self.node;

        self.shared.lock();
        // Safety: lock bit held.
        let inner = unsafe { self.shared.inner() };
        if self.node.linked {
            // Not yet unlinked for delivery; plain removal, no blocking.
            unsafe {
                inner
                    .subscriptions
                    .remove(NonNull::new_unchecked(node_ptr));
            }
            self.node.linked = false;
            self.shared.unlock();
            return;
        }
        if inner.delivering == node_ptr {
            if inner.delivering_thread == Some(thread::current().id()) {
                // Removal from inside our own callback. The deliverer only
                // compares this pointer after the callback returns; it never
                // dereferences it again, so dropping the node now is fine.
                self.shared.unlock();
                return;
            }
            // Another thread is mid-invocation; wait for it to finish so the
            // callback's captures are not freed out from under it.
            self.shared.unlock();
            let mut spin = SpinWait::new();
            loop {
                self.shared.lock();
                // Safety: lock bit held.
                let still = unsafe { self.shared.inner() }.delivering == node_ptr;
                self.shared.unlock();
                if !still {
                    return;
                }
                spin.spin();
            }
        }
        // Already delivered (or never linked to begin with).
        self.shared.unlock();
    }
}

impl std::fmt::Debug for CancelSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSubscription")
            .field("registered", &self.registered)
            .finish()
    }
}
