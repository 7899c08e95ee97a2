// src/core/types/reservation.rs

//! Advance reservations: named node/time blocks with membership rules.

use crate::core::types::bitmap::NodeBitmap;
use crate::core::types::job::Job;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
    pub struct ResvFlags: u32 {
        /// Maintenance window; member nodes reject normal work.
        const MAINT = 1 << 0;
        /// Flexible: outside jobs may use member nodes at a weight penalty.
        const FLEX  = 1 << 1;
        /// Reservation counts licenses rather than nodes.
        const LICENSE_ONLY = 1 << 2;
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Reservation {
    pub name: String,
    pub node_bitmap: NodeBitmap,
    pub flags: ResvFlags,
    /// Unix seconds.
    pub start_time: i64,
    pub end_time: i64,
    pub users: Vec<u32>,
    pub accounts: Vec<String>,
    /// Licenses held by the reservation, by (name, count).
    pub licenses: Vec<(String, u32)>,
}

impl Reservation {
    pub fn is_active_at(&self, when: i64) -> bool {
        when >= self.start_time && when < self.end_time
    }

    /// Whether the job may run on this reservation's nodes.
    pub fn includes_job(&self, job: &Job) -> bool {
        self.includes(
            job.user_id,
            job.account.as_deref(),
            job.details.reservation.as_deref(),
        )
    }

    /// Membership by primitive identity, for callers that cannot hand over
    /// the whole job record.
    pub fn includes(&self, user_id: u32, account: Option<&str>, resv_name: Option<&str>) -> bool {
        if resv_name == Some(self.name.as_str()) {
            return true;
        }
        if self.users.contains(&user_id) {
            return true;
        }
        if let Some(account) = account {
            if self.accounts.iter().any(|a| a == account) {
                return true;
            }
        }
        false
    }

    /// License share this reservation holds on `name` at `when`. Jobs that
    /// must reboot nodes first are assumed to overlap the reservation window.
    pub fn license_share(&self, name: &str, when: i64, reboot_needed: bool) -> u32 {
        if !(self.is_active_at(when) || reboot_needed) {
            return 0;
        }
        self.licenses
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, c)| *c)
            .sum()
    }
}
