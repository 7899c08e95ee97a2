// tests/property/consistency_test.rs

//! License-ledger conservation: guarded claims never exceed the total, and
//! any interleaving of claims and returns equals the running sum of held
//! amounts, saturating at zero on double returns.

use lodestar::core::license::{LicenseLedger, LicenseTest, parse_license_spec};
use lodestar::core::types::job::Job;
use proptest::prelude::*;

fn job(id: u32, count: u32) -> Job {
    Job {
        id,
        license_list: parse_license_spec(&format!("lic:{count}")).unwrap(),
        ..Default::default()
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        ..ProptestConfig::default()
    })]

    #[test]
    fn license_use_never_exceeds_total(
        total in 1u32..64,
        ops in prop::collection::vec((prop::bool::ANY, 1u32..16), 1..64)
    ) {
        let mut ledger = LicenseLedger::from_config(&format!("lic:{total}")).unwrap();
        let mut held: Vec<Job> = Vec::new();
        let mut next_id = 1u32;

        for (is_claim, count) in ops {
            if is_claim {
                let mut probe = job(next_id, count);
                let status = ledger.job_test(&mut probe, 0, false, &|_, _, _| 0, false, &|_| vec![]);
                if status == LicenseTest::Ok {
                    ledger.job_get(&probe, false).unwrap();
                    held.push(probe);
                    next_id += 1;
                }
            } else if let Some(done) = held.pop() {
                ledger.job_return(&done);
            }

            let entry = ledger.find("lic").unwrap();
            let expected: u32 = held.iter().map(|j| j.license_list[0].count).sum();
            prop_assert!(entry.used <= entry.total);
            prop_assert_eq!(entry.used, expected);
        }
    }

    #[test]
    fn double_return_saturates_at_zero(
        total in 1u32..32,
        count in 1u32..8,
        extra_returns in 1usize..4
    ) {
        prop_assume!(count <= total);
        let mut ledger = LicenseLedger::from_config(&format!("lic:{total}")).unwrap();
        let j = job(1, count);
        ledger.job_get(&j, false).unwrap();
        ledger.job_return(&j);
        for _ in 0..extra_returns {
            ledger.job_return(&j);
        }
        prop_assert_eq!(ledger.find("lic").unwrap().used, 0);
    }
}
