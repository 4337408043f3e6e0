//! Integration tests for the keel framework and the `keel` binary.

mod class_loading;
mod cli;
mod common;
mod concurrency;
mod fragments;
mod lifecycle;
mod refresh;
mod storage;
