// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

use crate::chain::{ChainNotifier, ChainSource};
use crate::channel_registry::ChannelRegistry;
use crate::fee_estimator::FeeEstimator;
use crate::logger::Logger;
use crate::tx_broadcaster::Broadcaster;
use crate::wallet::{SweepScriptSource, WitnessSigner};

use lightning::util::persist::KVStore;

pub(crate) type DynStore = dyn KVStore + Send + Sync;

pub(crate) type DynLogger = dyn Logger + Send + Sync;

pub(crate) type DynChainSource = dyn ChainSource + Send + Sync;

pub(crate) type DynChainNotifier = dyn ChainNotifier + Send + Sync;

pub(crate) type DynFeeEstimator = dyn FeeEstimator + Send + Sync;

pub(crate) type DynWitnessSigner = dyn WitnessSigner + Send + Sync;

pub(crate) type DynSweepScriptSource = dyn SweepScriptSource + Send + Sync;

pub(crate) type DynBroadcaster = dyn Broadcaster + Send + Sync;

pub(crate) type DynChannelRegistry = dyn ChannelRegistry + Send + Sync;
