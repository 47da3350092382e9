#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod aggregate;
pub mod chunk;
pub mod config;
pub mod hwe;
pub mod io;
pub mod pipeline;
pub mod prepare;
pub mod qc;
pub mod report;
pub mod source;
pub mod types;
