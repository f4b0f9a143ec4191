//! Transfer pipeline: chunking, reassembly, and off-executor chunk reads.

pub mod chunk;
pub mod worker;
