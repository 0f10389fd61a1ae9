pub mod config;
pub mod diag;
pub mod pairing;
pub mod run;
pub mod status;
pub mod update;
