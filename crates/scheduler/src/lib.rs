pub mod jobs;
pub mod scheduler;
pub mod sends;
