// src/core/license/backfill.rs

//! The per-pass backfill license ledger.
//!
//! Each backfill pass works against its own lightweight copy of the main
//! ledger so it can simulate starts and completions without touching the
//! authoritative counts. Entries are keyed by (name, reservation); the
//! entry with no reservation is the global pool.

use super::LicenseLedger;
use crate::core::types::job::Job;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BfLicense {
    pub name: String,
    pub remaining: u32,
    /// Owning reservation; `None` is the global pool.
    pub reservation: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BfLedger {
    entries: Vec<BfLicense>,
}

impl BfLedger {
    /// Seeds the pass ledger from the main one. With `from_total` the pass
    /// starts at the configured totals (running jobs' licenses will be
    /// re-examined as the pass simulates them); otherwise it starts from
    /// current occupancy.
    pub fn from_ledger(ledger: &LicenseLedger, from_total: bool) -> Self {
        let entries = ledger
            .iter()
            .map(|e| BfLicense {
                name: e.name.clone(),
                remaining: if from_total {
                    e.total
                } else {
                    e.total.saturating_sub(e.used)
                },
                reservation: None,
            })
            .collect();
        Self { entries }
    }

    fn find(&self, name: &str, reservation: Option<&str>) -> Option<&BfLicense> {
        self.entries
            .iter()
            .find(|e| e.name == name && e.reservation.as_deref() == reservation)
    }

    fn find_mut(&mut self, name: &str, reservation: Option<&str>) -> Option<&mut BfLicense> {
        self.entries
            .iter_mut()
            .find(|e| e.name == name && e.reservation.as_deref() == reservation)
    }

    /// Whether the job's license needs fit in this pass's ledger, drawing
    /// from its reservation bucket first.
    pub fn available(&self, job: &Job) -> bool {
        let resv = job.details.reservation.as_deref();
        for req in &job.license_list {
            let from_resv = resv
                .and_then(|r| self.find(&req.name, Some(r)))
                .map_or(0, |e| e.remaining);
            let from_global = self.find(&req.name, None).map_or(0, |e| e.remaining);
            if from_resv.saturating_add(from_global) < req.count {
                return false;
            }
        }
        true
    }

    /// Deducts a simulated start, draining the reservation bucket before the
    /// global pool. Short pools clamp at zero rather than going negative;
    /// callers check `available` first.
    pub fn deduct(&mut self, job: &Job) {
        let resv = job.details.reservation.clone();
        for req in &job.license_list {
            let mut needed = req.count;
            if let Some(r) = resv.as_deref() {
                if let Some(entry) = self.find_mut(&req.name, Some(r)) {
                    let take = entry.remaining.min(needed);
                    entry.remaining -= take;
                    needed -= take;
                }
            }
            if needed > 0 {
                if let Some(entry) = self.find_mut(&req.name, None) {
                    entry.remaining = entry.remaining.saturating_sub(needed);
                }
            }
        }
    }

    /// A simulated completion of a reservation job: its licenses return to
    /// the reservation's bucket, not the global pool. Creates the bucket on
    /// first use.
    pub fn transfer_to_reservation(&mut self, job: &Job) {
        let Some(resv) = job.details.reservation.clone() else {
            return;
        };
        for req in &job.license_list {
            match self.find_mut(&req.name, Some(&resv)) {
                Some(entry) => entry.remaining += req.count,
                None => self.entries.push(BfLicense {
                    name: req.name.clone(),
                    remaining: req.count,
                    reservation: Some(resv.clone()),
                }),
            }
        }
    }

    /// Structural equality of two pass ledgers, used to detect that a
    /// re-evaluation changed nothing and the pass can stop early.
    pub fn equal(a: &BfLedger, b: &BfLedger) -> bool {
        a == b
    }
}
