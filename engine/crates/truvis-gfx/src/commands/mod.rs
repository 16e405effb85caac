pub mod barrier;
pub mod queue;
pub mod recorder;
pub mod submit_info;
