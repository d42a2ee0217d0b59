pub mod channel;
pub mod cli;
pub mod parser;
