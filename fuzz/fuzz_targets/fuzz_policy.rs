#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) {
        let _ = schemashift_core::schema::policy_issues(&value);
        if let Ok(policy) = serde_json::from_value::<schemashift_core::policy::Policy>(value) {
            if policy.validate().is_ok() {
                let provider = schemashift_engine::strategy::StrategyProvider::new(&policy);
                for env in schemashift_core::types::Environment::ALL {
                    let _ = provider.for_environment(env);
                }
            }
        }
    }
});
