pub mod bypass;
pub mod config;
pub mod console;
pub mod invocation;
pub mod log;
pub mod orchestrator;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod relay;
pub mod results;
pub mod summary;
pub mod supervisor;
pub mod tools;
