// src/core/sched/share.rs

//! The oversubscription resolver: may this job share nodes with others?

use crate::config::SelectBackend;
use crate::core::types::job::{Job, WholeNode};
use crate::core::types::partition::SharePolicy;

/// The resolved sharing decision for one (job, partition) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShareDecision {
    pub can_share: bool,
    /// Jobs allowed per resource when sharing.
    pub max_share: u16,
    /// The job must take whole nodes regardless of its CPU request.
    pub whole_node: bool,
}

/// Resolves the sharing matrix:
/// an EXCLUSIVE partition never shares; FORCE with a count above one always
/// shares; the consumable-TRES backend follows the job's request; the linear
/// backend takes whole nodes unless the partition allows sharing and the job
/// asked for it.
pub fn resolve_share(job: &Job, policy: SharePolicy, backend: SelectBackend) -> ShareDecision {
    // A job-level exclusive request wins over everything but FORCE.
    let job_exclusive = !matches!(job.details.whole_node, WholeNode::NotSet);

    match policy {
        SharePolicy::Exclusive => ShareDecision {
            can_share: false,
            max_share: 0,
            whole_node: true,
        },
        SharePolicy::Force(n) => ShareDecision {
            can_share: true,
            max_share: n.max(1),
            whole_node: false,
        },
        SharePolicy::Yes(n) if job_exclusive => ShareDecision {
            can_share: false,
            max_share: n,
            whole_node: true,
        },
        SharePolicy::No if job_exclusive => ShareDecision {
            can_share: false,
            max_share: 1,
            whole_node: true,
        },
        SharePolicy::Yes(n) => match backend {
            SelectBackend::ConsumableTres => ShareDecision {
                can_share: job.details.share_res.unwrap_or(false),
                max_share: n,
                whole_node: false,
            },
            SelectBackend::Linear => ShareDecision {
                can_share: job.details.share_res.unwrap_or(false),
                max_share: n,
                // Whole node unless the job explicitly asked to share.
                whole_node: !job.details.share_res.unwrap_or(false),
            },
        },
        SharePolicy::No => ShareDecision {
            can_share: false,
            max_share: 1,
            whole_node: backend == SelectBackend::Linear,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_sharing(share: Option<bool>, whole: WholeNode) -> Job {
        let mut job = Job::default();
        job.details.share_res = share;
        job.details.whole_node = whole;
        job
    }

    #[test]
    fn exclusive_partition_never_shares() {
        let job = job_sharing(Some(true), WholeNode::NotSet);
        let d = resolve_share(&job, SharePolicy::Exclusive, SelectBackend::ConsumableTres);
        assert!(!d.can_share);
        assert!(d.whole_node);
    }

    #[test]
    fn force_overrides_job_exclusive() {
        let job = job_sharing(None, WholeNode::Exclusive);
        let d = resolve_share(&job, SharePolicy::Force(4), SelectBackend::ConsumableTres);
        assert!(d.can_share);
        assert_eq!(d.max_share, 4);
    }

    #[test]
    fn consumable_tres_follows_request() {
        let asks = job_sharing(Some(true), WholeNode::NotSet);
        let silent = job_sharing(None, WholeNode::NotSet);
        assert!(
            resolve_share(&asks, SharePolicy::Yes(2), SelectBackend::ConsumableTres).can_share
        );
        assert!(
            !resolve_share(&silent, SharePolicy::Yes(2), SelectBackend::ConsumableTres).can_share
        );
    }

    #[test]
    fn linear_defaults_to_whole_node() {
        let silent = job_sharing(None, WholeNode::NotSet);
        let d = resolve_share(&silent, SharePolicy::Yes(2), SelectBackend::Linear);
        assert!(d.whole_node);
        let asks = job_sharing(Some(true), WholeNode::NotSet);
        let d = resolve_share(&asks, SharePolicy::Yes(2), SelectBackend::Linear);
        assert!(!d.whole_node);
        assert!(d.can_share);
    }
}
