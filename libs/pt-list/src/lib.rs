// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An intrusive, doubly-linked FIFO list.
//!
//! This gives the scheduler's ready list and wait buckets O(1)
//! append-newest / remove-oldest / remove-by-identity without allocating a
//! separate node for every queued item: the link pointers live inside the
//! queued type itself, via the [`Linked`] trait.
//!
//! The list is head-is-oldest, tail-is-newest, so `push_back` +
//! `pop_front` is a FIFO. This is an ordinary doubly-linked list rather
//! than a singly-linked ring, which is why [`List::remove`] is O(1)
//! instead of O(n): removing a node by identity only needs that node's
//! own `prev`/`next` links, not a walk from the head.

use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomPinned;
use core::ptr::NonNull;

/// Types that can be members of an intrusive [`List`].
///
/// # Safety
///
/// Implementations must ensure that the [`Links`] returned by
/// [`links`](Linked::links) are valid for as long as the pointer handed to
/// [`from_ptr`](Linked::from_ptr) would be, and that a given node is never
/// simultaneously linked into two lists.
pub unsafe trait Linked {
    /// The owning handle for a node (typically `Box<Self>`).
    type Handle;

    /// Converts a handle into a raw pointer, giving up ownership.
    fn into_ptr(handle: Self::Handle) -> NonNull<Self>;

    /// Converts a raw pointer back into an owning handle.
    ///
    /// # Safety
    ///
    /// `ptr` must have been produced by [`into_ptr`](Linked::into_ptr) and
    /// must not already have been converted back.
    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle;

    /// Returns the link field embedded in the node pointed to by `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must point at a live, correctly initialized `Self`.
    unsafe fn links(ptr: NonNull<Self>) -> NonNull<Links<Self>>;
}

type Link<T> = Option<NonNull<T>>;

/// The link pointers embedded in a node. Every type implementing [`Linked`]
/// must store one of these.
pub struct Links<T: ?Sized> {
    inner: UnsafeCell<LinksInner<T>>,
}

struct LinksInner<T: ?Sized> {
    next: Link<T>,
    prev: Link<T>,
    // `Links` must stay `!Unpin`: the list mutates these fields through a
    // raw pointer even while a `&Links` may exist elsewhere.
    _pin: PhantomPinned,
}

impl<T: ?Sized> Default for Links<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> fmt::Debug for Links<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Links")
            .field("next", &self.next())
            .field("prev", &self.prev())
            .finish()
    }
}

// Safety: the pointers inside `Links` are only ever dereferenced by the
// `List` that owns the node, under that list's own aliasing discipline.
unsafe impl<T: ?Sized + Send> Send for Links<T> {}
// Safety: see above.
unsafe impl<T: ?Sized + Sync> Sync for Links<T> {}

impl<T: ?Sized> Links<T> {
    /// Creates fresh, unlinked link pointers.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: UnsafeCell::new(LinksInner {
                next: None,
                prev: None,
                _pin: PhantomPinned,
            }),
        }
    }

    /// Returns `true` if this node is currently the member of some list.
    pub fn is_linked(&self) -> bool {
        self.next().is_some() || self.prev().is_some()
    }

    #[inline]
    fn next(&self) -> Link<T> {
        // Safety: reading through a raw pointer is fine, the list
        // serializes all mutation.
        unsafe { (*self.inner.get()).next }
    }

    #[inline]
    fn prev(&self) -> Link<T> {
        // Safety: see `next`.
        unsafe { (*self.inner.get()).prev }
    }

    #[inline]
    fn set_next(&self, next: Link<T>) {
        // Safety: see `next`.
        unsafe { (*self.inner.get()).next = next }
    }

    #[inline]
    fn set_prev(&self, prev: Link<T>) {
        // Safety: see `next`.
        unsafe { (*self.inner.get()).prev = prev }
    }

    fn unlink(&self) {
        self.set_next(None);
        self.set_prev(None);
    }
}

/// An intrusive FIFO list of `T`s.
///
/// `push_back` appends the newest item; `pop_front` removes the oldest.
/// This is the list used for both the scheduler's ready queue and each
/// wait bucket.
pub struct List<T>
where
    T: Linked + ?Sized,
{
    head: Link<T>,
    tail: Link<T>,
    len: usize,
}

// Safety: a `List<T>` owns its nodes exactly like a `Vec<T::Handle>` would;
// it's `Send`/`Sync` whenever `T` is.
unsafe impl<T: Linked + ?Sized + Send> Send for List<T> {}
// Safety: see above.
unsafe impl<T: Linked + ?Sized + Sync> Sync for List<T> {}

impl<T> Default for List<T>
where
    T: Linked + ?Sized,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for List<T>
where
    T: Linked + ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("List").field("len", &self.len).finish()
    }
}

impl<T> Drop for List<T>
where
    T: Linked + ?Sized,
{
    fn drop(&mut self) {
        while self.pop_front().is_some() {}
    }
}

impl<T> List<T>
where
    T: Linked + ?Sized,
{
    /// Creates a new, empty list.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Returns the number of linked nodes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the list holds no nodes.
    pub fn is_empty(&self) -> bool {
        debug_assert_eq!(self.head.is_none(), self.tail.is_none());
        debug_assert_eq!(self.head.is_none(), self.len == 0);
        self.head.is_none()
    }

    /// Appends `handle` as the newest element (`append-newest` in the
    /// scheduler's terms).
    pub fn push_back(&mut self, handle: T::Handle) {
        let ptr = T::into_ptr(handle);
        // Safety: `ptr` was just produced by `into_ptr`, so it's live and
        // not linked anywhere else.
        let links = unsafe { T::links(ptr) };
        let links = unsafe { links.as_ref() };
        links.set_next(None);
        links.set_prev(self.tail);

        if let Some(tail) = self.tail {
            // Safety: `tail` is a live node owned by this list.
            unsafe { T::links(tail).as_ref().set_next(Some(ptr)) };
        } else {
            self.head = Some(ptr);
        }
        self.tail = Some(ptr);
        self.len += 1;
    }

    /// Removes and returns the oldest element (`remove-oldest`).
    pub fn pop_front(&mut self) -> Option<T::Handle> {
        let head = self.head?;
        // Safety: `head` is a live node owned by this list.
        let links = unsafe { T::links(head) };
        let links = unsafe { links.as_ref() };
        self.head = links.next();
        if let Some(new_head) = self.head {
            // Safety: `new_head` is a live node owned by this list.
            unsafe { T::links(new_head).as_ref().set_prev(None) };
        } else {
            self.tail = None;
        }
        links.unlink();
        self.len -= 1;
        // Safety: `head` was linked into this list and is being removed
        // from it now, so ownership transfers to the returned handle.
        Some(unsafe { T::from_ptr(head) })
    }

    /// Removes a specific node by identity (`find-and-remove`), given a
    /// pointer previously obtained via [`Linked::into_ptr`] for a node
    /// still linked into *this* list.
    ///
    /// Returns `None` if `ptr` is not currently linked into this list (the
    /// caller is expected to already know whether it might be, e.g. by
    /// checking the node's own "which list am I on" state).
    ///
    /// # Safety
    ///
    /// `ptr` must point at a node that, if linked at all, is linked into
    /// this list and no other.
    pub unsafe fn remove(&mut self, ptr: NonNull<T>) -> Option<T::Handle> {
        // Safety: caller's obligation.
        let links = unsafe { T::links(ptr) };
        let links = unsafe { links.as_ref() };
        if !links.is_linked() && self.head != Some(ptr) {
            return None;
        }

        let prev = links.prev();
        let next = links.next();

        match prev {
            // Safety: `prev` is a live node owned by this list.
            Some(prev) => unsafe { T::links(prev).as_ref().set_next(next) },
            None => self.head = next,
        }
        match next {
            // Safety: `next` is a live node owned by this list.
            Some(next) => unsafe { T::links(next).as_ref().set_prev(prev) },
            None => self.tail = prev,
        }

        links.unlink();
        self.len -= 1;
        // Safety: `ptr` was linked into this list and is being removed
        // from it now.
        Some(unsafe { T::from_ptr(ptr) })
    }

    /// Iterates from oldest to newest without removing anything.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            curr: self.head,
            _list: self,
        }
    }
}

/// Borrowing, oldest-to-newest iterator over a [`List`].
pub struct Iter<'a, T: Linked + ?Sized> {
    curr: Link<T>,
    _list: &'a List<T>,
}

impl<'a, T: Linked + ?Sized> Iterator for Iter<'a, T> {
    type Item = NonNull<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let curr = self.curr?;
        // Safety: `curr` is a live node owned by the list we borrow from.
        let links = unsafe { T::links(curr) };
        let links = unsafe { links.as_ref() };
        self.curr = links.next();
        Some(curr)
    }
}
