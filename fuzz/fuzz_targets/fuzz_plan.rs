#![no_main]
use libfuzzer_sys::fuzz_target;

use schemashift_core::domains::DomainCatalog;
use schemashift_core::rollback::RollbackPlan;

fuzz_target!(|data: &[u8]| {
    if let Ok(plan) = serde_json::from_slice::<RollbackPlan>(data) {
        assert!(plan.verify().is_ok());
        let _ = plan.summary();
        let order = DomainCatalog::canonical().rollback_order(plan.domains());
        assert!(order.len() <= plan.target_versions.len());
    }
});
