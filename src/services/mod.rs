pub mod jobs;
pub mod queue;
pub mod reaper;
pub mod supervisor;
pub mod worker;
