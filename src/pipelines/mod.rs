pub mod ingest;
pub mod orchestrator;
pub mod queue;
