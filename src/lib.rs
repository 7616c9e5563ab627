#![doc = include_str!("../README.md")]


pub mod types;
pub mod config;
pub mod error;
pub mod protocol;

pub mod node;
pub mod signals;

pub mod work;
pub mod cross_check;
pub mod bench;
pub mod listener;
pub mod metrics;

pub mod cli;
pub mod prelude;

#[cfg(any(test,doc))]
mod unit_test_utils;
