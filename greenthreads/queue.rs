// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the FIFO queue used to hold threads.
//!
//! A [`Queue`] supports adding to the rear, removing from the
//! front, deleting an arbitrary element by value, and iterating
//! from front to rear with an early-stop predicate. It does no
//! locking of its own; the scheduler only touches its queues
//! with preemption disabled.

use std::collections::VecDeque;

/// An ordered first-in, first-out queue.
///
#[derive(Debug)]
pub struct Queue<T> {
    items: VecDeque<T>,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Queue::new()
    }
}

impl<T> Queue<T> {
    /// Returns an empty queue.
    ///
    pub const fn new() -> Self {
        Queue {
            items: VecDeque::new(),
        }
    }

    /// Adds `item` to the rear of the queue.
    ///
    pub fn enqueue(&mut self, item: T) {
        self.items.push_back(item);
    }

    /// Removes and returns the item at the front of
    /// the queue, or `None` if the queue is empty.
    ///
    pub fn dequeue(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Returns the item at the front of the queue
    /// without removing it.
    ///
    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    /// Calls `f` on each item from front to rear,
    /// stopping at and returning the first item for
    /// which `f` returns `true`.
    ///
    pub fn iterate_until<F>(&self, mut f: F) -> Option<&T>
    where
        F: FnMut(&T) -> bool,
    {
        self.items.iter().find(|item| f(item))
    }

    /// Returns an iterator over the queue, from front
    /// to rear.
    ///
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.items.iter()
    }

    /// Returns the number of items in the queue.
    ///
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns whether the queue is empty.
    ///
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: PartialEq> Queue<T> {
    /// Removes the first item equal to `item`, keeping
    /// the order of the remaining items.
    ///
    /// Returns whether an item was removed.
    ///
    pub fn delete(&mut self, item: &T) -> bool {
        match self.items.iter().position(|x| x == item) {
            Some(index) => {
                self.items.remove(index);
                true
            }
            None => false,
        }
    }

    /// Returns whether the queue holds an item equal
    /// to `item`.
    ///
    pub fn contains(&self, item: &T) -> bool {
        self.items.contains(item)
    }
}
