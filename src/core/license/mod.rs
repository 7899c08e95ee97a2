// src/core/license/mod.rs

//! The license ledger: cluster-wide counted resources.
//!
//! Entries come from two places: *local* licenses declared in configuration,
//! and *remote* licenses mirrored from a federation database. Remote entries
//! carry a deficit that models consumption observed elsewhere exceeding the
//! share assigned to peers, so local scheduling stays conservative.
//!
//! All ledger operations run under one mutex owned by the caller
//! (`SharedState::licenses`); packing a snapshot happens under that same
//! mutex so RPC readers see a consistent ledger.

pub mod backfill;

use crate::core::errors::LodestarError;
use crate::core::types::job::{Job, LicenseRequest};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

/// Storage role of a ledger entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RemoteStatus {
    #[default]
    Local,
    /// Remote entry not seen in the most recent federation sync.
    RemoteStale,
    /// Remote entry refreshed by the most recent federation sync.
    RemoteFresh,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LicenseEntry {
    pub name: String,
    /// Units this cluster may allocate.
    pub total: u32,
    pub used: u32,
    /// Units held back for advance reservations.
    pub reserved: u32,
    pub remote: RemoteStatus,
    /// Consumption last reported by the federation, across all clusters.
    pub last_consumed: u32,
    /// max(0, last_consumed - external_share - used).
    pub last_deficit: u32,
    /// Unix seconds of the last remote refresh.
    pub last_update: i64,
}

/// Result of testing a job's license needs at a point in time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LicenseTest {
    /// Licenses are available now.
    Ok,
    /// Not available now, but the request is satisfiable later.
    Again,
    /// The request exceeds the configured total and can never run.
    Never,
}

/// A federation-delivered update for one remote license.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RemoteLicenseUpdate {
    pub name: String,
    /// Total pool size across the federation.
    pub count: u32,
    /// Share assigned to this cluster, absolute or percent.
    pub allowed: u32,
    pub percentage: bool,
    pub last_consumed: u32,
}

/// Parses `name[:count][,name[:count]]*`. The default count is 1 and
/// duplicate names accumulate. Whitespace or a malformed count rejects the
/// whole string.
pub fn parse_license_spec(spec: &str) -> Result<Vec<LicenseRequest>, LodestarError> {
    let mut out: Vec<LicenseRequest> = Vec::new();
    if spec.is_empty() {
        return Ok(out);
    }
    for item in spec.split(',') {
        let (name, count) = match item.split_once(':') {
            Some((name, count)) => {
                let count: u32 = count
                    .parse()
                    .map_err(|_| LodestarError::LicenseSpecInvalid(spec.to_string()))?;
                (name, count)
            }
            None => (item, 1),
        };
        if name.is_empty() || name.contains(char::is_whitespace) || name.contains(':') {
            return Err(LodestarError::LicenseSpecInvalid(spec.to_string()));
        }
        match out.iter_mut().find(|r| r.name == name) {
            Some(existing) => existing.count += count,
            None => out.push(LicenseRequest {
                name: name.to_string(),
                count,
            }),
        }
    }
    Ok(out)
}

/// Formats a request list back into the `name:count` form.
pub fn license_list_to_string(list: &[LicenseRequest]) -> String {
    list.iter()
        .map(|r| format!("{}:{}", r.name, r.count))
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Default)]
pub struct LicenseLedger {
    entries: Vec<LicenseEntry>,
}

impl LicenseLedger {
    /// Builds the ledger from the configured license string.
    pub fn from_config(spec: &str) -> Result<Self, LodestarError> {
        let mut ledger = Self::default();
        for req in parse_license_spec(spec)? {
            ledger.entries.push(LicenseEntry {
                name: req.name,
                total: req.count,
                used: 0,
                reserved: 0,
                remote: RemoteStatus::Local,
                last_consumed: 0,
                last_deficit: 0,
                last_update: 0,
            });
        }
        Ok(ledger)
    }

    pub fn find(&self, name: &str) -> Option<&LicenseEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut LicenseEntry> {
        self.entries.iter_mut().find(|e| e.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LicenseEntry> {
        self.entries.iter()
    }

    /// Parses and resolves a job's license request against the ledger.
    /// With `must_exist` false, unknown names are silently dropped (used for
    /// requests carried over from a cluster whose licenses changed).
    pub fn validate(
        &self,
        req: &str,
        must_exist: bool,
    ) -> Result<Vec<LicenseRequest>, LodestarError> {
        let parsed = parse_license_spec(req)?;
        let mut out = Vec::with_capacity(parsed.len());
        for r in parsed {
            match self.find(&r.name) {
                Some(_) => out.push(r),
                None if must_exist => return Err(LodestarError::LicenseUnknown(r.name)),
                None => debug!("Dropping unknown license '{}' from request", r.name),
            }
        }
        Ok(out)
    }

    /// Claims a job's licenses, incrementing `used`. A missing backing entry
    /// is logged and reported but earlier increments are kept; the caller is
    /// mid-allocation and the return path will saturate on the way back.
    ///
    /// When restoring a job from saved state, a remote entry's deficit is
    /// reduced by the restored amount: the federation counter already
    /// includes this job's consumption.
    pub fn job_get(&mut self, job: &Job, restoring: bool) -> Result<(), LodestarError> {
        let mut missing: Option<String> = None;
        for req in &job.license_list {
            match self.find_mut(&req.name) {
                Some(entry) => {
                    entry.used += req.count;
                    if restoring && entry.remote != RemoteStatus::Local {
                        entry.last_deficit = entry.last_deficit.saturating_sub(req.count);
                    }
                }
                None => {
                    error!(
                        "job {}: license '{}' disappeared from the ledger",
                        job.id, req.name
                    );
                    missing.get_or_insert(req.name.clone());
                }
            }
        }
        match missing {
            Some(name) => Err(LodestarError::LicenseUnknown(name)),
            None => Ok(()),
        }
    }

    /// Returns a job's licenses. Underflow saturates at zero and is logged;
    /// it indicates a double return or a restore mismatch, not a reason to
    /// corrupt the ledger further.
    pub fn job_return(&mut self, job: &Job) {
        for req in &job.license_list {
            match self.find_mut(&req.name) {
                Some(entry) => {
                    if entry.used < req.count {
                        warn!(
                            "job {}: returning {} of license '{}' but only {} in use",
                            job.id, req.count, req.name, entry.used
                        );
                    }
                    entry.used = entry.used.saturating_sub(req.count);
                }
                None => warn!(
                    "job {}: returned license '{}' is not in the ledger",
                    job.id, req.name
                ),
            }
        }
    }

    /// Tests whether a job's licenses are available at `when`.
    ///
    /// `resv_share` reports units held by advance reservations the job is not
    /// part of. When `collect_preemptees` is set, a shortfall collects the
    /// running holders reported by `holders_of` into `licenses_to_preempt`
    /// instead of failing outright.
    pub fn job_test(
        &self,
        job: &mut Job,
        when: i64,
        reboot_needed: bool,
        resv_share: &dyn Fn(&str, i64, bool) -> u32,
        collect_preemptees: bool,
        holders_of: &dyn Fn(&str) -> Vec<u32>,
    ) -> LicenseTest {
        let mut result = LicenseTest::Ok;
        for req in &job.license_list {
            let Some(entry) = self.find(&req.name) else {
                return LicenseTest::Never;
            };
            if entry.total < req.count {
                return LicenseTest::Never;
            }
            // Conservative view: local use plus the remote deficit plus units
            // promised to reservations the job cannot draw from.
            let effective_used = entry
                .used
                .saturating_add(entry.last_deficit)
                .saturating_add(resv_share(&req.name, when, reboot_needed));
            if entry.total < req.count.saturating_add(effective_used) {
                if collect_preemptees {
                    for holder in holders_of(&req.name) {
                        if holder != job.id && !job.licenses_to_preempt.contains(&holder) {
                            job.licenses_to_preempt.push(holder);
                        }
                    }
                    continue;
                }
                result = LicenseTest::Again;
            }
        }
        result
    }

    /// Applies one remote update, creating the entry on first sight.
    pub fn update_remote(&mut self, upd: &RemoteLicenseUpdate) {
        let local_total = if upd.percentage {
            upd.count * upd.allowed / 100
        } else {
            upd.allowed
        };
        let external_share = upd.count.saturating_sub(local_total);
        let now = chrono::Utc::now().timestamp();

        if self.find(&upd.name).is_none() {
            self.entries.push(LicenseEntry {
                name: upd.name.clone(),
                total: 0,
                used: 0,
                reserved: 0,
                remote: RemoteStatus::RemoteFresh,
                last_consumed: 0,
                last_deficit: 0,
                last_update: 0,
            });
        }
        let entry = self.find_mut(&upd.name).unwrap();
        entry.total = local_total;
        entry.last_consumed = upd.last_consumed;
        entry.last_deficit = upd
            .last_consumed
            .saturating_sub(external_share)
            .saturating_sub(entry.used);
        entry.last_update = now;
        entry.remote = RemoteStatus::RemoteFresh;
    }

    /// Reconciles the ledger with a full remote snapshot: every remote entry
    /// is marked stale, entries present in `updates` are refreshed, and any
    /// entry still stale afterwards is dropped (federation revoked it).
    pub fn sync_remote(&mut self, updates: &[RemoteLicenseUpdate]) {
        for entry in &mut self.entries {
            if entry.remote != RemoteStatus::Local {
                entry.remote = RemoteStatus::RemoteStale;
            }
        }
        for upd in updates {
            self.update_remote(upd);
        }
        self.entries.retain(|e| {
            if e.remote == RemoteStatus::RemoteStale {
                warn!("Removing revoked remote license '{}'", e.name);
                false
            } else {
                true
            }
        });
    }

    /// Packs a consistent snapshot for RPC readers. Callers hold the ledger
    /// mutex for the duration.
    pub fn pack(&self) -> serde_json::Value {
        let packed: Vec<serde_json::Value> = self
            .entries
            .iter()
            .map(|e| {
                serde_json::json!({
                    "name": e.name,
                    "total": e.total,
                    "used": e.used,
                    "reserved": e.reserved,
                    "remote": e.remote != RemoteStatus::Local,
                    "last_consumed": e.last_consumed,
                    "last_deficit": e.last_deficit,
                })
            })
            .collect();
        serde_json::Value::Array(packed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with(id: u32, spec: &str) -> Job {
        Job {
            id,
            license_list: parse_license_spec(spec).unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn parse_accumulates_duplicates() {
        let reqs = parse_license_spec("a:2,b,a:3").unwrap();
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].name, "a");
        assert_eq!(reqs[0].count, 5);
        assert_eq!(reqs[1].count, 1);
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(parse_license_spec("a :1").is_err());
        assert!(parse_license_spec("a:b").is_err());
        assert!(parse_license_spec(":3").is_err());
    }

    #[test]
    fn validate_resolves_against_ledger() {
        let ledger = LicenseLedger::from_config("known:4").unwrap();

        let reqs = ledger.validate("known:2", true).unwrap();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].count, 2);

        let err = ledger.validate("known:1,ghost:2", true).unwrap_err();
        assert_eq!(err, LodestarError::LicenseUnknown("ghost".into()));

        // Restore mode drops unknown names instead of failing.
        let reqs = ledger.validate("known:1,ghost:2", false).unwrap();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].name, "known");
    }

    #[test]
    fn get_and_return_saturate() {
        let mut ledger = LicenseLedger::from_config("lic:10").unwrap();
        let job = job_with(1, "lic:4");
        ledger.job_get(&job, false).unwrap();
        assert_eq!(ledger.find("lic").unwrap().used, 4);
        ledger.job_return(&job);
        ledger.job_return(&job);
        assert_eq!(ledger.find("lic").unwrap().used, 0);
    }

    #[test]
    fn remote_deficit_formula() {
        let mut ledger = LicenseLedger::from_config("lic:10").unwrap();
        let job = job_with(1, "lic:2");
        ledger.job_get(&job, false).unwrap();
        // Whole pool assigned to us: external share is 0.
        ledger.update_remote(&RemoteLicenseUpdate {
            name: "lic".into(),
            count: 10,
            allowed: 100,
            percentage: true,
            last_consumed: 11,
        });
        assert_eq!(ledger.find("lic").unwrap().last_deficit, 9);

        let mut probe = job_with(2, "lic:1");
        let test = ledger.job_test(&mut probe, 0, false, &|_, _, _| 0, false, &|_| vec![]);
        assert_eq!(test, LicenseTest::Again);
    }

    #[test]
    fn sync_drops_stale_remote_entries() {
        let mut ledger = LicenseLedger::from_config("local:1").unwrap();
        ledger.update_remote(&RemoteLicenseUpdate {
            name: "gone".into(),
            count: 4,
            allowed: 4,
            percentage: false,
            last_consumed: 0,
        });
        assert!(ledger.find("gone").is_some());
        ledger.sync_remote(&[]);
        assert!(ledger.find("gone").is_none());
        assert!(ledger.find("local").is_some());
    }

    #[test]
    fn test_collects_preemptees() {
        let mut ledger = LicenseLedger::from_config("lic:2").unwrap();
        // The holder and the probing job must be distinct jobs: a job never
        // collects itself as a preemption target.
        let holder = job_with(100, "lic:2");
        ledger.job_get(&holder, false).unwrap();

        let mut probe = job_with(200, "lic:1");
        let test = ledger.job_test(&mut probe, 0, false, &|_, _, _| 0, true, &|name| {
            assert_eq!(name, "lic");
            vec![100]
        });
        assert_eq!(test, LicenseTest::Ok);
        assert_eq!(probe.licenses_to_preempt, vec![100]);

        // Self-holding is filtered out.
        let mut self_probe = job_with(100, "lic:1");
        let test = ledger.job_test(&mut self_probe, 0, false, &|_, _, _| 0, true, &|_| vec![100]);
        assert_eq!(test, LicenseTest::Ok);
        assert!(self_probe.licenses_to_preempt.is_empty());
    }
}
