pub mod batch_aggregator;
pub mod job_store;
pub mod notification;
pub mod orchestrator;
pub mod provider;
pub mod queue;
pub mod storage;
pub mod worker;
