//! Library surface shared by the `tinit` PID-1 binary and the `tinitctl` CLI client.

pub mod bootstrap;
pub mod config;
pub mod control;
pub mod descriptor;
pub mod error;
pub mod eventloop;
pub mod glob;
pub mod log;
pub mod mount;
pub mod observer;
pub mod protocol;
pub mod repository;
pub mod service;
pub mod shutdown;
pub mod signal_channel;
pub mod spawn;
pub mod target;
