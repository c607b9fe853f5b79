pub mod command;
pub mod fastx;
pub mod locate;
pub mod paths;
pub mod postprocess;
pub mod runner;
pub mod status;
pub mod tree;
