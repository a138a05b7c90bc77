// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tails MongoDB change streams and forwards every inserted record to Grafana
//! Loki, persisting a resume position so restarts continue where they left off.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod error;
pub mod hostname;
pub mod http;
pub mod loki;
pub mod mapper;
pub mod pipeline;
pub mod position;
pub mod source;
