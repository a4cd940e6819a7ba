// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! amux-stream: the per-session streaming pipeline.
//!
//! Agent subprocesses speak length-prefixed JSON records on stdio. The
//! frame codec reads and writes those records, the parser turns them
//! into sequenced [`amux_core::Message`] values, and the hub fans the
//! result out to any number of subscribers with replay and backpressure.

pub mod frame;
pub mod hub;
pub mod parser;

pub use frame::{read_frame, write_frame, write_record, FrameError};
pub use hub::{CloseReason, Hub, StreamItem, Subscription};
pub use parser::{Parsed, RawRecord, StreamParser};
