/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Transports and drivers for running collective engines: a discrete-event
//! simulated network ([`simnet`]) and an in-process threaded network
//! ([`local`]).

pub mod local;
pub mod simnet;
pub mod workload;

pub use local::LocalNetwork;
pub use local::LocalTransport;
pub use local::run_threaded;
pub use simnet::NetworkConfig;
pub use simnet::SimNet;
pub use simnet::SimNetError;
pub use simnet::SimTransport;
pub use simnet::Simulation;
pub use workload::Workload;
