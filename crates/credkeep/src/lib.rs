// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

pub mod blacklist;
pub mod breaker;
pub mod channel;
pub mod clock;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod monitor;
pub mod principal;
pub mod record;
pub mod secure_store;
pub mod storage;
pub mod test_support;
pub mod tracker;
