//! Rust closures as native `wl_listener`s.
//!
//! Native code only holds a raw pointer to the `wl_listener` embedded in a
//! [`ListenerCell`]. The cell, and the closure it carries, are retained by a
//! thread-local registry from the moment the listener is created until it is
//! removed, so they can never be freed while native code may still call them.
//!
//! An emission in progress holds a pointer to the listener it will call next,
//! read before the current one runs. So while any listener is dispatching on
//! this thread, removal only retires a cell: it stays linked, its callback is
//! no longer called, and it is unlinked and freed once the outermost dispatch
//! returns. The one cell the emission is about to visit is kept until then.

use std::{
    cell::{Cell, RefCell},
    fmt,
    hash::{Hash, Hasher},
    mem::ManuallyDrop,
    panic::{self, AssertUnwindSafe},
    ptr::{self, NonNull},
};

use libc::c_void;
use slotmap::new_key_type;
use thin_trait_object::*;
use wayland_sys::{
    common::wl_list,
    server::{wl_listener, wl_signal},
};

use crate::{invariant_violation, link, macros::container_of, slab::IndexList, WlError};

new_key_type! {
    pub(crate) struct ListenerKey;
}

/// What the trampoline does when a listener callback panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PanicPolicy {
    /// Log the panic and go on with the next listener.
    #[default]
    LogAndContinue,
    /// Log the panic and abort the process.
    Abort,
}

thread_local! {
    static REGISTRY: RefCell<IndexList<ListenerKey, NonNull<ListenerCell>>> =
        RefCell::new(IndexList::new());
    static PANIC_POLICY: Cell<PanicPolicy> = Cell::new(PanicPolicy::default());
    /// Nesting depth of listener dispatch on this thread.
    static DISPATCH_DEPTH: Cell<u32> = Cell::new(0);
    /// Removed during dispatch, still linked.
    static RETIRED: RefCell<Vec<NonNull<ListenerCell>>> = RefCell::new(Vec::new());
}

/// Sets the panic policy for listeners dispatched on this thread.
pub fn set_panic_policy(policy: PanicPolicy) {
    PANIC_POLICY.with(|p| p.set(policy));
}

pub fn panic_policy() -> PanicPolicy {
    PANIC_POLICY.with(|p| p.get())
}

/// Number of listeners currently retained on this thread.
pub fn registered_count() -> usize {
    REGISTRY.with(|r| r.borrow().len())
}

#[thin_trait_object]
trait Callback {
    fn call(&self, args: (Listener, *mut c_void)) -> Result<(), WlError>;
}

impl<F> Callback for F
where
    F: Fn(Listener, *mut c_void) -> Result<(), WlError> + 'static,
{
    fn call(&self, (listener, data): (Listener, *mut c_void)) -> Result<(), WlError> {
        self(listener, data)
    }
}

#[repr(C)]
pub(crate) struct ListenerCell {
    raw: wl_listener,
    callback: *mut (),
    key: Cell<ListenerKey>,
    signal: Cell<*mut wl_signal>,
    retired: Cell<bool>,
}

/// A registered observer. Copies refer to the same native `wl_listener`, and
/// compare equal iff they do.
#[derive(Clone, Copy)]
pub struct Listener {
    ptr: NonNull<wl_listener>,
    key: ListenerKey,
}

impl Listener {
    /// Creates an unlinked listener calling `callback` with its own handle and
    /// the raw event data.
    pub fn new(callback: impl Fn(Listener, *mut c_void) + 'static) -> Listener {
        Self::with_callback(move |listener, data| {
            callback(listener, data);
            Ok(())
        })
    }

    pub(crate) fn with_callback(
        callback: impl Fn(Listener, *mut c_void) -> Result<(), WlError> + 'static,
    ) -> Listener {
        let callback = BoxedCallback::new(callback);
        let cell = Box::into_raw(Box::new(ListenerCell {
            raw: wl_listener {
                link: wl_list {
                    prev: ptr::null_mut(),
                    next: ptr::null_mut(),
                },
                notify,
            },
            callback: callback.into_raw() as *mut (),
            key: Cell::new(ListenerKey::default()),
            signal: Cell::new(ptr::null_mut()),
            retired: Cell::new(false),
        }));

        // SAFETY: just allocated.
        let cell = unsafe { NonNull::new_unchecked(cell) };
        let key = REGISTRY.with(|r| r.borrow_mut().push_back(cell));
        unsafe { cell.as_ref().key.set(key) };

        let listener = Listener {
            ptr: unsafe { NonNull::new_unchecked(ptr::addr_of_mut!((*cell.as_ptr()).raw)) },
            key,
        };
        log::trace!("created listener {:p}", listener.as_ptr());
        listener
    }

    pub fn as_ptr(&self) -> *mut wl_listener {
        self.ptr.as_ptr()
    }

    /// Whether the listener has not been removed yet.
    pub fn is_registered(&self) -> bool {
        self.cell().is_some()
    }

    /// Whether the listener is currently linked into a list.
    pub fn is_linked(&self) -> bool {
        match self.cell() {
            Some(cell) => unsafe { link::is_linked(ptr::addr_of!((*cell.as_ptr()).raw.link)) },
            None => false,
        }
    }

    /// Links the listener through a native registration function such as
    /// `wl_display_add_destroy_listener`, for objects that do not expose their
    /// `wl_signal`.
    ///
    /// # Safety
    ///
    /// `add` must link the listener it is given into a list of listeners that
    /// native code emits from. The listener must not be linked yet.
    pub unsafe fn attach_with(self, add: impl FnOnce(*mut wl_listener)) -> Result<(), WlError> {
        if !self.is_registered() {
            return Err(WlError::UnknownListener);
        }
        add(self.as_ptr());
        Ok(())
    }

    /// Unlinks the listener and releases its closure. Removed from inside a
    /// callback, the listener is never called again but stays linked until
    /// the outermost dispatch on this thread returns.
    pub fn remove(self) -> Result<(), WlError> {
        let cell = REGISTRY
            .with(|r| {
                let mut registry = r.borrow_mut();
                let owned = registry.get(self.key).map_or(false, |cell| self.owns(*cell));
                if owned {
                    registry.remove(self.key)
                } else {
                    None
                }
            })
            .ok_or(WlError::UnknownListener)?;

        log::trace!("removing listener {:p}", self.as_ptr());
        unsafe {
            let c = cell.as_ref();
            c.signal.set(ptr::null_mut());
            if dispatch_depth() > 0 {
                c.retired.set(true);
                RETIRED.with(|r| r.borrow_mut().push(cell));
            } else {
                unlink(cell);
                release(cell);
            }
        }
        Ok(())
    }

    /// The signal this listener was linked to by [`Signal::add`](crate::Signal::add).
    pub(crate) fn signal(&self) -> Option<*mut wl_signal> {
        self.cell().map(|cell| unsafe { cell.as_ref().signal.get() })
    }

    /// Links the listener at the tail of `signal`'s listener list.
    ///
    /// # Safety
    ///
    /// `signal` must be initialized and outlive the link.
    pub(crate) unsafe fn link_to(&self, signal: *mut wl_signal) {
        let cell = match self.cell() {
            Some(cell) => cell,
            None => invariant_violation(format_args!("linking released listener {:p}", self.ptr)),
        };
        let list = ptr::addr_of_mut!((*signal).listener_list);
        link::insert((*list).prev, ptr::addr_of_mut!((*cell.as_ptr()).raw.link));
        cell.as_ref().signal.set(signal);
    }

    /// Listeners linked to `signal` through [`link_to`](Self::link_to), in
    /// registration order.
    pub(crate) fn linked_to(signal: *mut wl_signal) -> Vec<Listener> {
        REGISTRY.with(|r| {
            r.borrow()
                .iter()
                .map(|(key, cell)| (key, *cell))
                .filter(|&(_, cell)| unsafe { cell.as_ref().signal.get() } == signal)
                .map(|(key, cell)| Listener {
                    ptr: unsafe { NonNull::new_unchecked(ptr::addr_of_mut!((*cell.as_ptr()).raw)) },
                    key,
                })
                .collect()
        })
    }

    fn cell(&self) -> Option<NonNull<ListenerCell>> {
        REGISTRY.with(|r| r.borrow().get(self.key).copied().filter(|cell| self.owns(*cell)))
    }

    fn owns(&self, cell: NonNull<ListenerCell>) -> bool {
        unsafe { ptr::addr_of_mut!((*cell.as_ptr()).raw) == self.ptr.as_ptr() }
    }
}

impl PartialEq for Listener {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl Eq for Listener {}

impl Hash for Listener {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ptr.hash(state)
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Listener").field(&self.ptr).finish()
    }
}

fn dispatch_depth() -> u32 {
    DISPATCH_DEPTH.with(|d| d.get())
}

unsafe fn unlink(cell: NonNull<ListenerCell>) {
    let link = ptr::addr_of_mut!((*cell.as_ptr()).raw.link);
    if link::is_linked(link) {
        link::remove(link);
    }
}

/// Frees the cell and drops its closure.
///
/// # Safety
///
/// The cell must be out of the registry, unlinked, and not dispatching.
unsafe fn release(cell: NonNull<ListenerCell>) {
    let cell = Box::from_raw(cell.as_ptr());
    drop(BoxedCallback::from_raw(cell.callback));
}

/// Unlinks and frees every retired cell except the one linked at `keep`,
/// which the emission in progress is about to visit.
///
/// Dropping a closure can remove more listeners; those are retired as well
/// and picked up by the next round.
unsafe fn release_retired(keep: *mut wl_list) {
    loop {
        let cells: Vec<_> = RETIRED.with(|r| {
            let mut retired = r.borrow_mut();
            let (kept, cells): (Vec<_>, Vec<_>) = retired
                .drain(..)
                .partition(|cell| ptr::addr_of_mut!((*cell.as_ptr()).raw.link) == keep);
            *retired = kept;
            cells
        });
        if cells.is_empty() {
            return;
        }

        DISPATCH_DEPTH.with(|d| d.set(d.get() + 1));
        for cell in cells {
            unlink(cell);
            release(cell);
        }
        DISPATCH_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

unsafe extern "C" fn notify(raw: *mut wl_listener, data: *mut c_void) {
    let cell = container_of!(raw, ListenerCell, raw);
    let listener = Listener {
        ptr: NonNull::new_unchecked(raw),
        key: (*cell).key.get(),
    };

    // What the emission will visit after this listener.
    let next = (*raw).link.next;

    DISPATCH_DEPTH.with(|d| d.set(d.get() + 1));
    if !(*cell).retired.get() {
        // The closure stays owned by the cell.
        let callback = ManuallyDrop::new(BoxedCallback::from_raw((*cell).callback));
        let ret = panic::catch_unwind(AssertUnwindSafe(|| callback.call((listener, data))));

        match ret {
            Ok(Ok(())) => {}
            Ok(Err(err)) => invariant_violation(format_args!("listener {:p}: {}", raw, err)),
            Err(_) => match panic_policy() {
                PanicPolicy::LogAndContinue => {
                    log::warn!("listener {:p} panicked, continuing with the next one", raw);
                }
                PanicPolicy::Abort => {
                    log::error!("listener {:p} panicked, aborting", raw);
                    std::process::abort();
                }
            },
        }
    }
    let depth = DISPATCH_DEPTH.with(|d| {
        d.set(d.get() - 1);
        d.get()
    });

    // May free this very cell; nothing below may touch it.
    if depth == 0 {
        release_retired(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macros::container_of;
    use std::rc::Rc;

    fn head() -> Box<wl_list> {
        let mut head = Box::new(wl_list {
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
        });
        unsafe { link::init(&mut *head) };
        head
    }

    /// Calls `listener` the way libwayland does.
    unsafe fn fire(listener: Listener, data: *mut c_void) {
        let raw = listener.as_ptr();
        ((*raw).notify)(raw, data);
    }

    #[test]
    fn equality_is_by_address() {
        let a = Listener::new(|_, _| {});
        let b = Listener::new(|_, _| {});
        let copy = a;
        assert_eq!(a, copy);
        assert_ne!(a, b);
        a.remove().unwrap();
        b.remove().unwrap();
    }

    #[test]
    fn callback_receives_own_handle_and_data() {
        let seen = Rc::new(Cell::new(None));
        let s = seen.clone();
        let listener = Listener::new(move |me, data| s.set(Some((me, data as usize))));
        unsafe { fire(listener, 0x1234 as *mut c_void) };
        assert_eq!(seen.get(), Some((listener, 0x1234)));
        listener.remove().unwrap();
    }

    #[test]
    fn registry_retains_until_removed() {
        assert_eq!(registered_count(), 0);
        let listener = Listener::new(|_, _| {});
        assert_eq!(registered_count(), 1);
        assert!(listener.is_registered());
        assert!(!listener.is_linked());

        listener.remove().unwrap();
        assert_eq!(registered_count(), 0);
        assert!(!listener.is_registered());
    }

    #[test]
    fn double_remove_is_reported() {
        let listener = Listener::new(|_, _| {});
        listener.remove().unwrap();
        assert!(matches!(listener.remove(), Err(WlError::UnknownListener)));
    }

    #[test]
    fn stale_handle_does_not_alias_new_listener() {
        let old = Listener::new(|_, _| {});
        old.remove().unwrap();
        let new = Listener::new(|_, _| {});
        assert!(old.remove().is_err());
        assert!(new.is_registered());
        new.remove().unwrap();
    }

    #[test]
    fn closure_dropped_on_remove() {
        let token = Rc::new(());
        let held = token.clone();
        let listener = Listener::new(move |_, _| {
            let _ = &held;
        });
        assert_eq!(Rc::strong_count(&token), 2);
        listener.remove().unwrap();
        assert_eq!(Rc::strong_count(&token), 1);
    }

    #[test]
    fn self_removal_is_deferred() {
        let token = Rc::new(());
        let held = token.clone();
        let calls = Rc::new(Cell::new(0));
        let c = calls.clone();
        let mut list = head();
        let listener = Listener::new(move |me, _| {
            let _ = &held;
            c.set(c.get() + 1);
            me.remove().unwrap();
            // still alive while running
            c.set(c.get() + 1);
        });
        unsafe {
            listener.attach_with(|raw| link::insert(&mut *list, &mut (*raw).link)).unwrap();
            fire(listener, ptr::null_mut());
            assert!(link::is_empty(&mut *list));
        }
        assert_eq!(calls.get(), 2);
        assert_eq!(Rc::strong_count(&token), 1);
        assert_eq!(registered_count(), 0);
    }

    /// Walks `head` like `wl_signal_emit`.
    unsafe fn emit_list(head: *mut wl_list) {
        let mut pos = (*head).next;
        while pos != head {
            let next = (*pos).next;
            let raw = container_of!(pos, wl_listener, link);
            ((*raw).notify)(raw, ptr::null_mut());
            pos = next;
        }
    }

    #[test]
    fn removing_next_listener_during_dispatch() {
        let mut list = head();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let token = Rc::new(());
        let victim = Rc::new(Cell::new(None::<Listener>));

        let (c, v) = (calls.clone(), victim.clone());
        let first = Listener::new(move |_, _| {
            c.borrow_mut().push(1);
            v.get().unwrap().remove().unwrap();
            assert_eq!(registered_count(), 2);
        });
        let (c, held) = (calls.clone(), token.clone());
        let second = Listener::new(move |_, _| {
            let _ = &held;
            c.borrow_mut().push(2);
        });
        let c = calls.clone();
        let third = Listener::new(move |_, _| c.borrow_mut().push(3));
        victim.set(Some(second));

        unsafe {
            for listener in [first, second, third] {
                listener
                    .attach_with(|raw| link::insert((*list).prev, &mut (*raw).link))
                    .unwrap();
            }
            emit_list(&mut *list);
            assert_eq!(link::length(&mut *list), 2);
        }
        assert_eq!(*calls.borrow(), [1, 3]);
        assert!(!second.is_linked());
        assert_eq!(Rc::strong_count(&token), 1);

        first.remove().unwrap();
        third.remove().unwrap();
        assert_eq!(registered_count(), 0);
    }

    #[test]
    fn removing_earlier_listener_during_dispatch() {
        let mut list = head();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let victim = Rc::new(Cell::new(None::<Listener>));

        let c = calls.clone();
        let first = Listener::new(move |_, _| c.borrow_mut().push(1));
        let (c, v) = (calls.clone(), victim.clone());
        let second = Listener::new(move |_, _| {
            c.borrow_mut().push(2);
            if let Some(first) = v.take() {
                first.remove().unwrap();
            }
        });
        victim.set(Some(first));

        unsafe {
            for listener in [first, second] {
                listener
                    .attach_with(|raw| link::insert((*list).prev, &mut (*raw).link))
                    .unwrap();
            }
            emit_list(&mut *list);
            assert_eq!(link::length(&mut *list), 1);
            emit_list(&mut *list);
        }
        assert_eq!(*calls.borrow(), [1, 2, 2]);
        second.remove().unwrap();
    }

    #[test]
    fn panics_do_not_escape() {
        set_panic_policy(PanicPolicy::LogAndContinue);
        let listener = Listener::new(|_, _| panic!("boom"));
        unsafe { fire(listener, ptr::null_mut()) };
        assert!(listener.is_registered());
        listener.remove().unwrap();
    }

    #[test]
    fn panic_policy_is_per_thread() {
        set_panic_policy(PanicPolicy::Abort);
        assert_eq!(panic_policy(), PanicPolicy::Abort);
        let other = std::thread::spawn(panic_policy).join().unwrap();
        assert_eq!(other, PanicPolicy::LogAndContinue);
        set_panic_policy(PanicPolicy::LogAndContinue);
    }

    #[test]
    fn attach_after_remove_fails() {
        let listener = Listener::new(|_, _| {});
        listener.remove().unwrap();
        let attached = unsafe { listener.attach_with(|_| unreachable!()) };
        assert!(attached.is_err());
    }
}
