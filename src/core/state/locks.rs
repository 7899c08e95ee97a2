// src/core/state/locks.rs

//! The multi-lock over the cluster tables, split into five independent rails.
//!
//! Callers acquire only the rails they need, always in the fixed order
//! conf -> job -> node -> part -> fed. Acquiring a rail while already holding
//! a higher-ordered one is an invariant violation and aborts the daemon; a
//! silent deadlock would be strictly worse.
//!
//! Guards must never be held across an await point. Every rail is a
//! `parking_lot::RwLock`, which makes that a compile-visible property of the
//! call sites (the guards are !Send).

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::cell::RefCell;
use std::ops::{Deref, DerefMut};

thread_local! {
    // Ranks of rails held by this thread, in acquisition order.
    static HELD_RANKS: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

fn push_rank(rank: u8, name: &'static str) {
    HELD_RANKS.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(&top) = held.last() {
            if top >= rank {
                // Fatal by design: an out-of-order acquisition is a programming
                // error that would eventually deadlock two daemons.
                panic!("lock rail '{name}' (rank {rank}) acquired while holding rank {top}");
            }
        }
        held.push(rank);
    });
}

fn pop_rank(rank: u8) {
    HELD_RANKS.with(|held| {
        let mut held = held.borrow_mut();
        debug_assert_eq!(held.last().copied(), Some(rank));
        held.pop();
    });
}

/// An `RwLock` that participates in the rail ordering.
#[derive(Debug)]
pub struct OrderedRwLock<T> {
    rank: u8,
    name: &'static str,
    inner: RwLock<T>,
}

impl<T> OrderedRwLock<T> {
    pub fn new(rank: u8, name: &'static str, value: T) -> Self {
        Self {
            rank,
            name,
            inner: RwLock::new(value),
        }
    }

    pub fn read(&self) -> RailReadGuard<'_, T> {
        push_rank(self.rank, self.name);
        RailReadGuard {
            rank: self.rank,
            guard: self.inner.read(),
        }
    }

    pub fn write(&self) -> RailWriteGuard<'_, T> {
        push_rank(self.rank, self.name);
        RailWriteGuard {
            rank: self.rank,
            guard: self.inner.write(),
        }
    }
}

pub struct RailReadGuard<'a, T> {
    rank: u8,
    guard: RwLockReadGuard<'a, T>,
}

impl<T> Deref for RailReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> Drop for RailReadGuard<'_, T> {
    fn drop(&mut self) {
        pop_rank(self.rank);
    }
}

pub struct RailWriteGuard<'a, T> {
    rank: u8,
    guard: RwLockWriteGuard<'a, T>,
}

impl<T> Deref for RailWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for RailWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for RailWriteGuard<'_, T> {
    fn drop(&mut self) {
        pop_rank(self.rank);
    }
}

pub const RAIL_CONF: u8 = 0;
pub const RAIL_JOB: u8 = 1;
pub const RAIL_NODE: u8 = 2;
pub const RAIL_PART: u8 = 3;
pub const RAIL_RESV: u8 = 4;
pub const RAIL_FED: u8 = 5;
