pub mod archiver;
pub mod client;
pub mod compile;
pub mod config;
pub mod convert;
pub mod dump;
pub mod html;
pub mod jobs;
pub mod logging;
pub mod model;
pub mod page_file;
pub mod progress;
pub mod store;
pub mod vcs;

#[cfg(test)]
pub(crate) mod testing;
