//! Dependency Detection
//!
//! The detection context records which subscribables a computation reads
//! while it runs. This is what lets a computed discover its inputs without
//! declaring them.
//!
//! # Implementation
//!
//! Two thread-local stacks are kept:
//!
//! - the *frame* stack. The top frame receives every dependency read. A
//!   `None` frame suppresses detection (used by [`DependencyDetection::ignore`]
//!   so that listener execution is never mistaken for a read).
//! - the *repeater handler* stack. The top handler is told about every
//!   disposable resource created while it is active, so an enclosing
//!   evaluation or subscription can claim and later dispose it.
//!
//! Both stacks are only touched through RAII guards, so a panic inside an
//! evaluation unwinds them to the state they had before it began.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::subscription::{Repeater, SubscriptionHandle};
use crate::error::{ReactiveError, Result};

/// Stable identity of a subscribable, assigned the first time it is seen by
/// a detection frame. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DependencyId(u64);

impl DependencyId {
    /// Generate a new unique dependency ID.
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// The capability every dependency must provide.
///
/// Implemented by [`Subscribable`](super::Subscribable) and therefore by
/// everything that embeds one.
pub trait Dependency {
    /// Identity used to collapse repeated reads within one frame.
    fn dependency_id(&self) -> DependencyId;

    /// Subscribe `on_outdated` to this dependency's `"outdated"` channel.
    fn subscribe_outdated(&self, on_outdated: Rc<dyn Fn()>, eager: bool)
        -> Rc<dyn SubscriptionHandle>;
}

/// Type-erased dependency, for callers that only hold `dyn Any` values.
#[derive(Clone)]
pub struct DependencyHandle(pub(crate) Rc<dyn Dependency>);

impl fmt::Debug for DependencyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DependencyHandle")
            .field(&self.0.dependency_id())
            .finish()
    }
}

/// Callback invoked with each distinct dependency read inside a frame.
pub type FrameCallback = Rc<dyn Fn(&dyn Dependency)>;

/// Handler told about each repeater created while it is on top of the stack.
pub type RepeaterHandler = Rc<dyn Fn(Repeater)>;

/// One entry of the detection stack.
pub struct Frame {
    callback: FrameCallback,
    seen: HashSet<DependencyId>,
}

impl Frame {
    pub fn new(callback: impl Fn(&dyn Dependency) + 'static) -> Self {
        Self {
            callback: Rc::new(callback),
            seen: HashSet::new(),
        }
    }
}

thread_local! {
    static FRAMES: RefCell<Vec<Option<Frame>>> = const { RefCell::new(Vec::new()) };
    static REPEATER_HANDLERS: RefCell<Vec<Option<RepeaterHandler>>> = const { RefCell::new(Vec::new()) };
}

/// Value returned by [`DependencyDetection::collect_repeaters`]: the
/// closure's result plus every repeater created while it ran. The caller
/// decides who owns the repeaters.
pub struct Harvest<R> {
    pub value: R,
    pub repeaters: Vec<Repeater>,
}

/// Guard that pops a frame and its repeater handler when dropped.
pub struct DetectionScope {
    depth: usize,
}

impl DetectionScope {
    /// Close the scope explicitly. Equivalent to dropping it.
    pub fn end(self) {}
}

impl Drop for DetectionScope {
    fn drop(&mut self) {
        let popped = FRAMES.with(|frames| {
            let mut frames = frames.borrow_mut();
            let len = frames.len();
            frames.pop();
            len
        });
        debug_assert_eq!(
            popped, self.depth,
            "DetectionScope mismatch: expected depth {}, got {}",
            self.depth, popped
        );
        REPEATER_HANDLERS.with(|handlers| {
            handlers.borrow_mut().pop();
        });
    }
}

/// Guard that pops a frame pushed by [`DependencyDetection::ignore`].
struct FrameOnly;

impl Drop for FrameOnly {
    fn drop(&mut self) {
        FRAMES.with(|frames| {
            frames.borrow_mut().pop();
        });
    }
}

/// Guard that pops one repeater handler when dropped.
pub struct RepeaterScope {
    _private: (),
}

impl Drop for RepeaterScope {
    fn drop(&mut self) {
        REPEATER_HANDLERS.with(|handlers| {
            handlers.borrow_mut().pop();
        });
    }
}

/// Entry points for the ambient detection context.
pub struct DependencyDetection;

impl DependencyDetection {
    /// Push a frame and a repeater handler. Either may be `None` to suppress
    /// that kind of tracking. Both are popped when the scope drops.
    pub fn begin(frame: Option<Frame>, repeaters: Option<RepeaterHandler>) -> DetectionScope {
        let depth = FRAMES.with(|frames| {
            let mut frames = frames.borrow_mut();
            frames.push(frame);
            frames.len()
        });
        REPEATER_HANDLERS.with(|handlers| handlers.borrow_mut().push(repeaters));
        DetectionScope { depth }
    }

    /// True if reads are currently being recorded.
    pub fn is_active() -> bool {
        FRAMES.with(|frames| matches!(frames.borrow().last(), Some(Some(_))))
    }

    /// Number of frames on the stack, suppressed ones included.
    pub fn depth() -> usize {
        FRAMES.with(|frames| frames.borrow().len())
    }

    /// Record a read of `dependency` in the active frame.
    ///
    /// Does nothing without an active frame. Repeated reads of the same
    /// dependency within one frame reach the frame callback only once.
    pub fn register_dependency(dependency: &dyn Dependency) {
        let id = dependency.dependency_id();
        let callback = FRAMES.with(|frames| {
            let mut frames = frames.borrow_mut();
            match frames.last_mut() {
                Some(Some(frame)) => frame.seen.insert(id).then(|| Rc::clone(&frame.callback)),
                _ => None,
            }
        });
        if let Some(callback) = callback {
            tracing::trace!(dependency = id.raw(), "dependency registered");
            callback(dependency);
        }
    }

    /// Register a value whose type is only known at runtime.
    ///
    /// Succeeds (and records the read) only for a [`DependencyHandle`];
    /// anything else is rejected with [`ReactiveError::InvalidDependency`].
    pub fn register_any<V: Any>(value: &V) -> Result<()> {
        match (value as &dyn Any).downcast_ref::<DependencyHandle>() {
            Some(handle) => {
                Self::register_dependency(handle.0.as_ref());
                Ok(())
            }
            None => Err(ReactiveError::InvalidDependency {
                type_name: std::any::type_name::<V>().to_string(),
            }),
        }
    }

    /// Run `f` with detection suppressed.
    pub fn ignore<R>(f: impl FnOnce() -> R) -> R {
        FRAMES.with(|frames| frames.borrow_mut().push(None));
        let _guard = FrameOnly;
        f()
    }

    /// Push a repeater handler (or `None` to suppress registration).
    pub fn push_repeater(handler: Option<RepeaterHandler>) -> RepeaterScope {
        REPEATER_HANDLERS.with(|handlers| handlers.borrow_mut().push(handler));
        RepeaterScope { _private: () }
    }

    /// Tell the top repeater handler, if any, that `repeater` was created.
    pub fn register_repeater(repeater: Repeater) {
        let handler = REPEATER_HANDLERS.with(|handlers| handlers.borrow().last().cloned().flatten());
        if let Some(handler) = handler {
            handler(repeater);
        }
    }

    /// Run `f` without letting the resources it creates be claimed by the
    /// enclosing evaluation. Dependency detection is left untouched.
    pub fn preserve_repeaters<R>(f: impl FnOnce() -> R) -> R {
        let _scope = Self::push_repeater(None);
        f()
    }

    /// Run `f` and hand back every repeater it created.
    pub fn collect_repeaters<R>(f: impl FnOnce() -> R) -> Harvest<R> {
        let sink: Rc<RefCell<Vec<Repeater>>> = Rc::new(RefCell::new(Vec::new()));
        let value = {
            let sink = Rc::clone(&sink);
            let _scope = Self::push_repeater(Some(Rc::new(move |repeater: Repeater| {
                sink.borrow_mut().push(repeater);
            })));
            f()
        };
        let repeaters = std::mem::take(&mut *sink.borrow_mut());
        Harvest { value, repeaters }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::subscription::Disposable;
    use std::cell::Cell;

    struct FakeDependency {
        id: DependencyId,
    }

    impl Dependency for FakeDependency {
        fn dependency_id(&self) -> DependencyId {
            self.id
        }

        fn subscribe_outdated(
            &self,
            _on_outdated: Rc<dyn Fn()>,
            _eager: bool,
        ) -> Rc<dyn SubscriptionHandle> {
            unreachable!("not used by these tests")
        }
    }

    struct Counted(Rc<Cell<usize>>);

    impl Disposable for Counted {
        fn dispose(&self) {
            self.0.set(self.0.get() + 1);
        }

        fn is_disposed(&self) -> bool {
            self.0.get() > 0
        }
    }

    fn recording_frame(log: &Rc<RefCell<Vec<DependencyId>>>) -> Frame {
        let log = Rc::clone(log);
        Frame::new(move |dep| log.borrow_mut().push(dep.dependency_id()))
    }

    #[test]
    fn frame_collapses_duplicate_reads() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = FakeDependency { id: DependencyId::next() };
        let b = FakeDependency { id: DependencyId::next() };

        {
            let _scope = DependencyDetection::begin(Some(recording_frame(&log)), None);
            assert!(DependencyDetection::is_active());
            DependencyDetection::register_dependency(&a);
            DependencyDetection::register_dependency(&b);
            DependencyDetection::register_dependency(&a);
        }

        assert_eq!(*log.borrow(), vec![a.id, b.id]);
        assert!(!DependencyDetection::is_active());
    }

    #[test]
    fn register_without_frame_is_noop() {
        let a = FakeDependency { id: DependencyId::next() };
        DependencyDetection::register_dependency(&a);
        assert_eq!(DependencyDetection::depth(), 0);
    }

    #[test]
    fn nested_frames_restore_outer() {
        let outer = Rc::new(RefCell::new(Vec::new()));
        let inner = Rc::new(RefCell::new(Vec::new()));
        let a = FakeDependency { id: DependencyId::next() };
        let b = FakeDependency { id: DependencyId::next() };

        let _outer_scope = DependencyDetection::begin(Some(recording_frame(&outer)), None);
        {
            let _inner_scope = DependencyDetection::begin(Some(recording_frame(&inner)), None);
            DependencyDetection::register_dependency(&a);
        }
        DependencyDetection::register_dependency(&b);

        assert_eq!(*inner.borrow(), vec![a.id]);
        assert_eq!(*outer.borrow(), vec![b.id]);
    }

    #[test]
    fn ignore_suppresses_detection() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = FakeDependency { id: DependencyId::next() };

        let _scope = DependencyDetection::begin(Some(recording_frame(&log)), None);
        DependencyDetection::ignore(|| {
            assert!(!DependencyDetection::is_active());
            DependencyDetection::register_dependency(&a);
        });
        assert!(DependencyDetection::is_active());
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn stacks_unwind_on_panic() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let before = DependencyDetection::depth();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _scope = DependencyDetection::begin(Some(recording_frame(&log)), None);
            DependencyDetection::ignore(|| panic!("read failed"));
        }));

        assert!(result.is_err());
        assert_eq!(DependencyDetection::depth(), before);
    }

    #[test]
    fn collect_and_preserve_repeaters() {
        let count = Rc::new(Cell::new(0));

        let harvest = DependencyDetection::collect_repeaters(|| {
            DependencyDetection::register_repeater(Rc::new(Counted(Rc::clone(&count))));
            DependencyDetection::preserve_repeaters(|| {
                DependencyDetection::register_repeater(Rc::new(Counted(Rc::clone(&count))));
            });
            42
        });

        assert_eq!(harvest.value, 42);
        assert_eq!(harvest.repeaters.len(), 1);
        // Registration without any handler is silently dropped.
        DependencyDetection::register_repeater(Rc::new(Counted(Rc::clone(&count))));
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn register_any_rejects_non_dependencies() {
        let err = DependencyDetection::register_any(&5_u32).unwrap_err();
        assert!(matches!(err, ReactiveError::InvalidDependency { ref type_name } if type_name == "u32"));
    }
}
