pub mod approvals;
pub mod connectivity;
pub mod credentials;
pub mod event_stream;
pub mod issues;
pub mod metrics;
pub mod pairing;
pub mod reconcile;
pub mod sequence;
pub mod wire;
