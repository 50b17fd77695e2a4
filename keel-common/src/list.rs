//! Intrusive list primitives.
//!
//! The schedulers and tables in the runtime core keep elements in lists
//! without allocating per-node memory: the link fields live inside the
//! elements themselves. An element can be a member of at most one list per
//! link field; the lists reject double membership.
//!
//! All element handles are [`NonNull`] pointers. The lists never allocate or
//! free elements; the caller owns them and must keep a member alive until it
//! has been popped or removed again. Operations that follow element pointers
//! are `unsafe` for that reason.

use std::cell::Cell;
use std::ptr::NonNull;

/// The link field of an intrusive singly-linked list.
///
/// Embed one of these in an element type and hand it out through
/// [`InlineNode::link`]. The link must be clear (not a member of any list)
/// when the element is dropped.
pub struct ListLink<T: ?Sized> {
    next: Cell<Option<NonNull<T>>>,
}

impl<T: ?Sized> ListLink<T> {
    /// Creates a clear link.
    pub const fn new() -> Self {
        ListLink {
            next: Cell::new(None),
        }
    }

    /// Whether the element is currently linked to a successor.
    ///
    /// Note that the tail of a list has no successor, so this alone cannot
    /// decide membership; the lists check against their tail as well.
    pub fn is_linked(&self) -> bool {
        self.next.get().is_some()
    }
}

impl<T: ?Sized> Default for ListLink<T> {
    fn default() -> Self {
        ListLink::new()
    }
}

/// An element that can be a member of an [`InlineFifo`] or an
/// [`InlinePriorityList`].
pub trait InlineNode {
    /// The singly-linked list link of this element.
    fn link(&self) -> &ListLink<Self>;
}

/// An intrusive singly-linked FIFO queue.
///
/// `push` appends at the tail and `pop` removes from the head, both in O(1).
pub struct InlineFifo<T: InlineNode> {
    head: Option<NonNull<T>>,
    tail: Option<NonNull<T>>,
}

impl<T: InlineNode> InlineFifo<T> {
    /// Creates an empty queue.
    pub const fn new() -> Self {
        InlineFifo {
            head: None,
            tail: None,
        }
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Whether the queue holds at least one element.
    pub fn any(&self) -> bool {
        self.head.is_some()
    }

    /// Appends `elem` at the tail of the queue.
    ///
    /// Panics if `elem` is already a member of a list.
    ///
    /// # Safety
    ///
    /// `elem` must stay valid until it is popped again.
    pub unsafe fn push(&mut self, elem: NonNull<T>) {
        let link = elem.as_ref().link();
        assert!(
            !link.is_linked() && self.tail != Some(elem),
            "element is already a member of a list"
        );

        match self.tail {
            Some(tail) => tail.as_ref().link().next.set(Some(elem)),
            None => self.head = Some(elem),
        }
        self.tail = Some(elem);
    }

    /// Removes and returns the head of the queue, or `None` if it is empty.
    ///
    /// # Safety
    ///
    /// All members must still be valid.
    pub unsafe fn pop(&mut self) -> Option<NonNull<T>> {
        let head = self.head?;
        let link = head.as_ref().link();
        self.head = link.next.take();
        if self.head.is_none() {
            self.tail = None;
        }
        Some(head)
    }
}

impl<T: InlineNode> Default for InlineFifo<T> {
    fn default() -> Self {
        InlineFifo::new()
    }
}

impl<T: InlineNode> Drop for InlineFifo<T> {
    fn drop(&mut self) {
        // Clear the links so the elements can be pushed elsewhere later.
        let mut at = self.head.take();
        self.tail = None;
        while let Some(cur) = at {
            at = unsafe { cur.as_ref().link().next.take() };
        }
    }
}

/// An intrusive singly-linked list kept sorted by `Ord`.
///
/// `push` walks from the head and inserts the new element before the first
/// member that orders strictly after it, which keeps equal keys in arrival
/// order. `pop` removes the least element.
pub struct InlinePriorityList<T: InlineNode + Ord> {
    head: Option<NonNull<T>>,
}

impl<T: InlineNode + Ord> InlinePriorityList<T> {
    /// Creates an empty list.
    pub const fn new() -> Self {
        InlinePriorityList { head: None }
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Whether the list holds at least one element.
    pub fn any(&self) -> bool {
        self.head.is_some()
    }

    /// Inserts `elem` at its position in the list.
    ///
    /// Panics if `elem` is already a member of a list.
    ///
    /// # Safety
    ///
    /// `elem` must stay valid until it is popped again.
    pub unsafe fn push(&mut self, elem: NonNull<T>) {
        let link = elem.as_ref().link();
        assert!(
            !link.is_linked() && self.last() != Some(elem),
            "element is already a member of a list"
        );

        let mut at: *mut Option<NonNull<T>> = &mut self.head;
        while let Some(cur) = *at {
            if elem.as_ref() < cur.as_ref() {
                break;
            }
            at = cur.as_ref().link().next.as_ptr();
        }

        link.next.set(*at);
        *at = Some(elem);
    }

    /// Removes and returns the least element, or `None` if the list is empty.
    ///
    /// # Safety
    ///
    /// All members must still be valid.
    pub unsafe fn pop(&mut self) -> Option<NonNull<T>> {
        let head = self.head?;
        self.head = head.as_ref().link().next.take();
        Some(head)
    }

    /// Returns the least element without removing it.
    pub fn peek(&self) -> Option<NonNull<T>> {
        self.head
    }

    unsafe fn last(&self) -> Option<NonNull<T>> {
        let mut at = self.head?;
        while let Some(next) = at.as_ref().link().next.get() {
            at = next;
        }
        Some(at)
    }
}

impl<T: InlineNode + Ord> Default for InlinePriorityList<T> {
    fn default() -> Self {
        InlinePriorityList::new()
    }
}

impl<T: InlineNode + Ord> Drop for InlinePriorityList<T> {
    fn drop(&mut self) {
        let mut at = self.head.take();
        while let Some(cur) = at {
            at = unsafe { cur.as_ref().link().next.take() };
        }
    }
}

/// The link field of an [`InlineSet`] member.
pub struct SetLink<T: ?Sized> {
    prev: Cell<Option<NonNull<T>>>,
    next: Cell<Option<NonNull<T>>>,
    member: Cell<bool>,
}

impl<T: ?Sized> SetLink<T> {
    /// Creates a clear link.
    pub const fn new() -> Self {
        SetLink {
            prev: Cell::new(None),
            next: Cell::new(None),
            member: Cell::new(false),
        }
    }

    /// Whether the element is currently a member of a set.
    pub fn is_member(&self) -> bool {
        self.member.get()
    }
}

impl<T: ?Sized> Default for SetLink<T> {
    fn default() -> Self {
        SetLink::new()
    }
}

/// An element that can be a member of an [`InlineSet`].
pub trait SetNode {
    /// The doubly-linked set link of this element.
    fn set_link(&self) -> &SetLink<Self>;
}

/// An intrusive doubly-linked list with a set-flavored interface.
///
/// Insertion and removal are O(1); iteration visits elements in insertion
/// order. The iterator caches its successor, so removing the element the
/// iterator just yielded is safe.
pub struct InlineSet<T: SetNode> {
    head: Option<NonNull<T>>,
    tail: Option<NonNull<T>>,
    count: usize,
}

impl<T: SetNode> InlineSet<T> {
    /// Creates an empty set.
    pub const fn new() -> Self {
        InlineSet {
            head: None,
            tail: None,
            count: 0,
        }
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Whether the set holds at least one element.
    pub fn any(&self) -> bool {
        self.head.is_some()
    }

    /// The number of members.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Whether `elem` is a member of a set (this one, if the caller keeps
    /// each element in at most one set, as required).
    pub fn contains(&self, elem: NonNull<T>) -> bool {
        unsafe { elem.as_ref().set_link().is_member() }
    }

    /// Inserts `elem` at the end of the iteration order.
    ///
    /// Panics if `elem` is already a member of a set.
    ///
    /// # Safety
    ///
    /// `elem` must stay valid until it is removed again.
    pub unsafe fn insert(&mut self, elem: NonNull<T>) {
        let link = elem.as_ref().set_link();
        assert!(!link.is_member(), "element is already a member of a set");

        link.member.set(true);
        link.prev.set(self.tail);
        link.next.set(None);
        match self.tail {
            Some(tail) => tail.as_ref().set_link().next.set(Some(elem)),
            None => self.head = Some(elem),
        }
        self.tail = Some(elem);
        self.count += 1;
    }

    /// Removes `elem` from the set. Returns whether it was a member.
    ///
    /// # Safety
    ///
    /// `elem` must be valid, and if it is a member it must be a member of
    /// this set.
    pub unsafe fn remove(&mut self, elem: NonNull<T>) -> bool {
        let link = elem.as_ref().set_link();
        if !link.is_member() {
            return false;
        }

        let prev = link.prev.take();
        let next = link.next.take();
        link.member.set(false);

        match prev {
            Some(prev) => prev.as_ref().set_link().next.set(next),
            None => self.head = next,
        }
        match next {
            Some(next) => next.as_ref().set_link().prev.set(prev),
            None => self.tail = prev,
        }
        self.count -= 1;
        true
    }

    /// Iterates over the members in insertion order.
    ///
    /// The iterator caches the successor of the element it yields, so the
    /// yielded element may be removed from the set during iteration.
    ///
    /// # Safety
    ///
    /// All members must stay valid for the lifetime of the iterator, and the
    /// set must not be mutated during iteration except by removing the
    /// element most recently yielded.
    pub unsafe fn iter(&self) -> SetIter<T> {
        SetIter { at: self.head }
    }
}

impl<T: SetNode> Default for InlineSet<T> {
    fn default() -> Self {
        InlineSet::new()
    }
}

impl<T: SetNode> Drop for InlineSet<T> {
    fn drop(&mut self) {
        let mut at = self.head.take();
        self.tail = None;
        while let Some(cur) = at {
            let link = unsafe { cur.as_ref().set_link() };
            link.prev.set(None);
            link.member.set(false);
            at = link.next.take();
        }
    }
}

/// Iterator over an [`InlineSet`], see [`InlineSet::iter`].
pub struct SetIter<T: SetNode> {
    at: Option<NonNull<T>>,
}

impl<T: SetNode> Iterator for SetIter<T> {
    type Item = NonNull<T>;

    fn next(&mut self) -> Option<NonNull<T>> {
        let cur = self.at?;
        // Cache the successor before handing out `cur`; the caller may
        // remove `cur` from the set before asking for the next element.
        self.at = unsafe { cur.as_ref().set_link().next.get() };
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Task {
        key: u32,
        seq: u32,
        link: ListLink<Task>,
        set_link: SetLink<Task>,
    }

    impl Task {
        fn new(key: u32, seq: u32) -> Box<Task> {
            Box::new(Task {
                key,
                seq,
                link: ListLink::new(),
                set_link: SetLink::new(),
            })
        }
    }

    impl InlineNode for Task {
        fn link(&self) -> &ListLink<Task> {
            &self.link
        }
    }

    impl SetNode for Task {
        fn set_link(&self) -> &SetLink<Task> {
            &self.set_link
        }
    }

    impl PartialEq for Task {
        fn eq(&self, other: &Task) -> bool {
            self.key == other.key
        }
    }

    impl Eq for Task {}

    impl PartialOrd for Task {
        fn partial_cmp(&self, other: &Task) -> Option<std::cmp::Ordering> {
            Some(self.cmp(other))
        }
    }

    impl Ord for Task {
        fn cmp(&self, other: &Task) -> std::cmp::Ordering {
            self.key.cmp(&other.key)
        }
    }

    fn handle(task: &Task) -> NonNull<Task> {
        NonNull::from(task)
    }

    #[test]
    fn fifo_order() {
        let a = Task::new(1, 0);
        let b = Task::new(2, 0);
        let c = Task::new(3, 0);

        let mut fifo = InlineFifo::new();
        assert!(fifo.is_empty());
        unsafe {
            fifo.push(handle(&a));
            fifo.push(handle(&b));
            fifo.push(handle(&c));
            assert!(fifo.any());

            assert_eq!(fifo.pop(), Some(handle(&a)));
            // Popped elements can be re-queued.
            fifo.push(handle(&a));
            assert_eq!(fifo.pop(), Some(handle(&b)));
            assert_eq!(fifo.pop(), Some(handle(&c)));
            assert_eq!(fifo.pop(), Some(handle(&a)));
            assert_eq!(fifo.pop(), None);
        }
        assert!(fifo.is_empty());
    }

    #[test]
    #[should_panic(expected = "already a member")]
    fn fifo_rejects_double_membership() {
        let a = Task::new(1, 0);
        let mut fifo = InlineFifo::new();
        unsafe {
            fifo.push(handle(&a));
            fifo.push(handle(&a));
        }
    }

    #[test]
    fn priority_order_is_stable() {
        let tasks = [
            Task::new(3, 0),
            Task::new(1, 1),
            Task::new(2, 2),
            Task::new(1, 3),
            Task::new(2, 4),
        ];

        let mut list = InlinePriorityList::new();
        unsafe {
            for task in &tasks {
                list.push(handle(task));
            }

            let mut order = Vec::new();
            while let Some(task) = list.pop() {
                order.push((task.as_ref().key, task.as_ref().seq));
            }
            // Sorted by key; equal keys stay in arrival order.
            assert_eq!(order, vec![(1, 1), (1, 3), (2, 2), (2, 4), (3, 0)]);
        }
    }

    #[test]
    fn priority_peek() {
        let a = Task::new(5, 0);
        let b = Task::new(2, 1);
        let mut list = InlinePriorityList::new();
        unsafe {
            list.push(handle(&a));
            assert_eq!(list.peek(), Some(handle(&a)));
            list.push(handle(&b));
            assert_eq!(list.peek(), Some(handle(&b)));
        }
    }

    #[test]
    fn set_iteration_in_insertion_order() {
        let a = Task::new(1, 0);
        let b = Task::new(2, 0);
        let c = Task::new(3, 0);

        let mut set = InlineSet::new();
        unsafe {
            set.insert(handle(&a));
            set.insert(handle(&b));
            set.insert(handle(&c));
            assert_eq!(set.count(), 3);
            assert!(set.contains(handle(&b)));

            let keys: Vec<u32> = set.iter().map(|t| t.as_ref().key).collect();
            assert_eq!(keys, vec![1, 2, 3]);

            assert!(set.remove(handle(&b)));
            assert!(!set.remove(handle(&b)));
            let keys: Vec<u32> = set.iter().map(|t| t.as_ref().key).collect();
            assert_eq!(keys, vec![1, 3]);
        }
    }

    #[test]
    fn set_remove_during_iteration() {
        let tasks = [Task::new(1, 0), Task::new(2, 0), Task::new(3, 0)];

        let mut set = InlineSet::new();
        unsafe {
            for task in &tasks {
                set.insert(handle(task));
            }

            let mut seen = Vec::new();
            let iter = set.iter();
            for task in iter {
                seen.push(task.as_ref().key);
                set.remove(task);
            }
            assert_eq!(seen, vec![1, 2, 3]);
        }
        assert!(set.is_empty());
        assert_eq!(set.count(), 0);
    }
}
