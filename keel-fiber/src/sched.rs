//! The cooperative scheduler.
//!
//! Every OS thread gets its own scheduler: a FIFO ring of ready fibers, the
//! currently running context, and a single slot for the most recently
//! terminated fiber. Exactly one fiber runs per OS thread at any instant;
//! control moves only at explicit switch points ([`yield_now`], fiber
//! termination), never by preemption. The thread's original context takes
//! part in the rotation like any other fiber, it just runs on the stack the
//! OS gave it.
//!
//! A fiber cannot free its own stack while standing on it, so a
//! terminating fiber parks itself in the terminated slot and the next
//! context to run reaps it ([`after_switch`]).

use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use keel_common::{fatal, InlineFifo, InlineNode, InlineSet, ListLink, SetLink, SetNode};

use crate::detail;
use crate::stack::{FiberConfig, FiberError, FiberStack, SwitchState};

/// Identifies a fiber on its OS thread. The thread's original context is
/// fiber 0; spawned fibers get process-unique non-zero ids.
pub type FiberId = u64;

/// The id of every thread's original context.
pub const ROOT_FIBER: FiberId = 0;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

struct Fiber {
    id: FiberId,
    /// `None` for the root context, which runs on the OS-provided stack.
    stack: Option<FiberStack>,
    /// The stack pointer saved by the last switch away from this fiber.
    sp: Cell<*mut usize>,
    task: RefCell<Option<Box<dyn FnOnce()>>>,
    /// Membership in the ready ring.
    link: ListLink<Fiber>,
    /// Membership in the per-thread set of live fiber stacks, kept so a
    /// collector can scan suspended stacks for roots.
    stack_link: SetLink<Fiber>,
}

impl InlineNode for Fiber {
    fn link(&self) -> &ListLink<Fiber> {
        &self.link
    }
}

impl SetNode for Fiber {
    fn set_link(&self) -> &SetLink<Fiber> {
        &self.stack_link
    }
}

struct Scheduler {
    ready: InlineFifo<Fiber>,
    alive: InlineSet<Fiber>,
    current: NonNull<Fiber>,
    /// A fiber that exited and waits for the next context to free it.
    terminated: Option<NonNull<Fiber>>,
    /// Number of switches into task fibers, for scheduler diagnostics.
    activations: u64,
}

impl Scheduler {
    fn new() -> Scheduler {
        let root = Box::new(Fiber {
            id: ROOT_FIBER,
            stack: None,
            sp: Cell::new(std::ptr::null_mut()),
            task: RefCell::new(None),
            link: ListLink::new(),
            stack_link: SetLink::new(),
        });
        Scheduler {
            ready: InlineFifo::new(),
            alive: InlineSet::new(),
            current: NonNull::from(Box::leak(root)),
            terminated: None,
            activations: 0,
        }
    }
}

thread_local! {
    static SCHED: RefCell<Scheduler> = RefCell::new(Scheduler::new());
}

/// Spawns a fiber with the default stack configuration.
///
/// The fiber is appended to the back of the ready ring; the caller keeps
/// running. Stack exhaustion is fatal here; use [`try_spawn`] to handle it.
pub fn spawn(task: impl FnOnce() + 'static) -> FiberId {
    match try_spawn(&FiberConfig::default(), task) {
        Ok(id) => id,
        Err(err) => fatal!("{err}"),
    }
}

/// Spawns a fiber with an explicit stack configuration.
pub fn try_spawn(
    config: &FiberConfig,
    task: impl FnOnce() + 'static,
) -> Result<FiberId, FiberError> {
    let stack = FiberStack::new(config)?;
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);

    let fiber = Box::new(Fiber {
        id,
        stack: Some(stack),
        sp: Cell::new(std::ptr::null_mut()),
        task: RefCell::new(Some(Box::new(task))),
        link: ListLink::new(),
        stack_link: SetLink::new(),
    });
    let fiber = NonNull::from(Box::leak(fiber));

    unsafe {
        let top = fiber.as_ref().stack.as_ref().unwrap().top();
        let sp = detail::init_frame(top, fiber.as_ptr() as *mut u8);
        fiber.as_ref().sp.set(sp);
    }

    SCHED.with(|sched| {
        let mut sched = sched.borrow_mut();
        unsafe {
            sched.alive.insert(fiber);
            sched.ready.push(fiber);
        }
    });

    tracing::trace!(id, "spawned a fiber");
    Ok(id)
}

/// Whether any fiber is waiting in the ready ring.
pub fn any_ready() -> bool {
    SCHED.with(|sched| sched.borrow().ready.any())
}

/// The id of the currently running context.
pub fn current_id() -> FiberId {
    SCHED.with(|sched| unsafe { sched.borrow().current.as_ref().id })
}

/// The usable bounds `(limit, top)` of the running fiber's stack, or
/// `None` on the root context.
pub fn current_stack_bounds() -> Option<(usize, usize)> {
    SCHED.with(|sched| {
        let sched = sched.borrow();
        let current = unsafe { sched.current.as_ref() };
        current
            .stack
            .as_ref()
            .map(|stack| (stack.limit() as usize, stack.top() as usize))
    })
}

/// The number of live task fibers on this thread, running or suspended.
pub fn alive_count() -> usize {
    SCHED.with(|sched| sched.borrow().alive.count())
}

/// The number of switches into task fibers so far on this thread.
pub fn switch_count() -> u64 {
    SCHED.with(|sched| sched.borrow().activations)
}

/// Visits every *suspended* fiber stack on this thread as
/// `(id, saved stack pointer, limit, top)`.
///
/// This is the collector's window into fiber stacks: everything between
/// the saved stack pointer and the top is live data to scan. The running
/// context is excluded; its registers are only accurate in an OS context.
pub fn for_each_suspended_stack(mut visit: impl FnMut(FiberId, *mut usize, usize, usize)) {
    SCHED.with(|sched| {
        let sched = sched.borrow();
        unsafe {
            for fiber in sched.alive.iter() {
                if fiber == sched.current {
                    continue;
                }
                let fiber = fiber.as_ref();
                if let Some(stack) = fiber.stack.as_ref() {
                    visit(
                        fiber.id,
                        fiber.sp.get(),
                        stack.limit() as usize,
                        stack.top() as usize,
                    );
                }
            }
        }
    });
}

/// Yields to the next ready fiber, if any.
///
/// The current context goes to the back of the ring and regains control
/// after every other ready fiber had its turn.
pub fn yield_now() {
    let target = SCHED.with(|sched| {
        let mut sched = sched.borrow_mut();
        let next = unsafe { sched.ready.pop() }?;
        let prev = sched.current;
        unsafe { sched.ready.push(prev) };
        sched.current = next;
        if unsafe { next.as_ref() }.stack.is_some() {
            sched.activations += 1;
        }
        Some((unsafe { next.as_ref() }.sp.get(), prev))
    });

    // The scheduler borrow is released; nothing may hold it across the
    // switch, the next context needs it.
    if let Some((next_sp, prev)) = target {
        let state = SwitchState::save();
        unsafe { detail::keel_fiber_switch(next_sp, prev.as_ref().sp.as_ptr()) };
        state.restore();
        after_switch();
    }
}

/// Housekeeping on the arriving side of every switch: frees the stack of a
/// fiber that exited while we were away.
fn after_switch() {
    let dead = SCHED.with(|sched| sched.borrow_mut().terminated.take());
    if let Some(dead) = dead {
        drop(unsafe { Box::from_raw(dead.as_ptr()) });
    }
}

/// The trampoline every fiber starts in; the entry shim of the
/// context-switch module tail-calls it with the fiber as argument.
#[no_mangle]
unsafe extern "C" fn keel_fiber_main(fiber: *mut Fiber) -> ! {
    // The other possible exit of a switch.
    after_switch();

    let task = (*fiber)
        .task
        .borrow_mut()
        .take()
        .unwrap_or_else(|| fatal!("fiber entered twice"));

    // A panic cannot be allowed past this frame; there is nothing on the
    // fabricated stack to unwind into.
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        fatal!("a fiber task terminated with an unhandled panic");
    }

    let me = NonNull::new_unchecked(fiber);
    let (next_sp, my_sp) = SCHED.with(|sched| {
        let mut sched = sched.borrow_mut();
        sched.alive.remove(me);
        sched.terminated = Some(me);

        let next = sched
            .ready
            .pop()
            .unwrap_or_else(|| fatal!("the last fiber exited with no context to return to"));
        sched.current = next;
        if next.as_ref().stack.is_some() {
            sched.activations += 1;
        }
        (next.as_ref().sp.get(), me.as_ref().sp.as_ptr())
    });

    // The save into `my_sp` is throwaway; this fiber is never resumed, the
    // next `after_switch` frees it.
    detail::keel_fiber_switch(next_sp, my_sp);
    unreachable!("switched back into a terminated fiber");
}
