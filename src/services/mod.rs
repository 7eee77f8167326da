pub mod delivery;
pub mod dispatcher;
pub mod notification;
pub mod queue;
pub mod rate_limit;
pub mod signer;
pub mod subscription;
pub mod usage;
pub mod worker;
