#![forbid(unsafe_code)]

pub mod audit;
pub mod backup;
pub mod domains;
pub mod errors;
pub mod policy;
pub mod result;
pub mod rollback;
pub mod schema;
pub mod strategy;
pub mod traits;
pub mod types;
