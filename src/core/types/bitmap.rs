// src/core/types/bitmap.rs

//! A fixed-size bitset keyed by node index.
//!
//! All cluster-wide node membership (available, idle, powering down, ...) is
//! tracked as one of these. The length is fixed at table build time; every
//! bitmap over the same node table has the same length, so the binary
//! operators assume equal lengths.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeBitmap {
    bits: Vec<u64>,
    len: usize,
}

impl NodeBitmap {
    /// Creates an empty bitmap sized for `len` nodes.
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(64)],
            len,
        }
    }

    /// Creates a bitmap with every bit set.
    pub fn new_full(len: usize) -> Self {
        let mut bm = Self::new(len);
        bm.set_all();
        bm
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|w| *w == 0)
    }

    pub fn set(&mut self, idx: usize) {
        debug_assert!(idx < self.len);
        self.bits[idx / 64] |= 1 << (idx % 64);
    }

    pub fn clear(&mut self, idx: usize) {
        debug_assert!(idx < self.len);
        self.bits[idx / 64] &= !(1 << (idx % 64));
    }

    pub fn test(&self, idx: usize) -> bool {
        debug_assert!(idx < self.len);
        self.bits[idx / 64] & (1 << (idx % 64)) != 0
    }

    pub fn set_all(&mut self) {
        for w in &mut self.bits {
            *w = u64::MAX;
        }
        self.mask_tail();
    }

    pub fn clear_all(&mut self) {
        for w in &mut self.bits {
            *w = 0;
        }
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn union_with(&mut self, other: &NodeBitmap) {
        for (a, b) in self.bits.iter_mut().zip(&other.bits) {
            *a |= b;
        }
    }

    pub fn intersect_with(&mut self, other: &NodeBitmap) {
        for (a, b) in self.bits.iter_mut().zip(&other.bits) {
            *a &= b;
        }
    }

    /// Removes every bit set in `other` (self &= !other).
    pub fn difference_with(&mut self, other: &NodeBitmap) {
        for (a, b) in self.bits.iter_mut().zip(&other.bits) {
            *a &= !b;
        }
    }

    pub fn union(&self, other: &NodeBitmap) -> NodeBitmap {
        let mut out = self.clone();
        out.union_with(other);
        out
    }

    pub fn intersection(&self, other: &NodeBitmap) -> NodeBitmap {
        let mut out = self.clone();
        out.intersect_with(other);
        out
    }

    pub fn difference(&self, other: &NodeBitmap) -> NodeBitmap {
        let mut out = self.clone();
        out.difference_with(other);
        out
    }

    /// True when every bit of `self` is also set in `other`.
    pub fn is_subset_of(&self, other: &NodeBitmap) -> bool {
        self.bits.iter().zip(&other.bits).all(|(a, b)| a & !b == 0)
    }

    /// True when the two bitmaps share at least one bit.
    pub fn overlaps(&self, other: &NodeBitmap) -> bool {
        self.bits.iter().zip(&other.bits).any(|(a, b)| a & b != 0)
    }

    pub fn first_set(&self) -> Option<usize> {
        self.iter_ones().next()
    }

    /// Iterates over the indices of set bits in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter().enumerate().flat_map(|(wi, w)| {
            let mut w = *w;
            std::iter::from_fn(move || {
                if w == 0 {
                    return None;
                }
                let bit = w.trailing_zeros() as usize;
                w &= w - 1;
                Some(wi * 64 + bit)
            })
        })
    }

    /// Keeps only the first `n` set bits, clearing the rest.
    pub fn truncate_ones(&mut self, n: usize) {
        let extra: Vec<usize> = self.iter_ones().skip(n).collect();
        for idx in extra {
            self.clear(idx);
        }
    }

    // Bits beyond `len` must stay clear so count() stays honest.
    fn mask_tail(&mut self) {
        let tail = self.len % 64;
        if tail != 0 {
            if let Some(last) = self.bits.last_mut() {
                *last &= (1 << tail) - 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_clear_count() {
        let mut bm = NodeBitmap::new(100);
        bm.set(0);
        bm.set(63);
        bm.set(64);
        bm.set(99);
        assert_eq!(bm.count(), 4);
        assert!(bm.test(63));
        bm.clear(63);
        assert_eq!(bm.count(), 3);
        assert!(!bm.test(63));
    }

    #[test]
    fn full_respects_length() {
        let bm = NodeBitmap::new_full(70);
        assert_eq!(bm.count(), 70);
    }

    #[test]
    fn subset_and_difference() {
        let mut a = NodeBitmap::new(10);
        let mut b = NodeBitmap::new(10);
        a.set(1);
        a.set(2);
        b.set(1);
        b.set(2);
        b.set(3);
        assert!(a.is_subset_of(&b));
        assert!(!b.is_subset_of(&a));
        b.difference_with(&a);
        assert_eq!(b.iter_ones().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn iter_ones_ascending() {
        let mut bm = NodeBitmap::new(200);
        for idx in [5, 64, 65, 190] {
            bm.set(idx);
        }
        assert_eq!(bm.iter_ones().collect::<Vec<_>>(), vec![5, 64, 65, 190]);
    }

    #[test]
    fn truncate_keeps_first_n() {
        let mut bm = NodeBitmap::new(32);
        for idx in [2, 4, 8, 16] {
            bm.set(idx);
        }
        bm.truncate_ones(2);
        assert_eq!(bm.iter_ones().collect::<Vec<_>>(), vec![2, 4]);
    }
}
