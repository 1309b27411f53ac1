#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

pub mod classifier;
pub mod config;
pub mod data;
pub mod encode;
pub mod export;
pub mod metrics;
pub mod pairs;
pub mod partition;
pub mod pipeline;
pub mod reclassify;
pub mod transition_matrix;
pub mod types;
