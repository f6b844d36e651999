// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

use std::fmt;

/// An error that possibly needs to be handled by the user.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
	/// Returned when trying to start the nursery while it is already running.
	AlreadyRunning,
	/// Returned when trying to stop the nursery while it is not running.
	NotRunning,
	/// The nursery state could not be persisted.
	PersistenceFailed,
	/// A persisted record could not be decoded.
	DecodeFailed,
	/// The queried channel is not tracked by the nursery.
	ChannelNotFound,
	/// The best block could not be retrieved from the chain source.
	BestBlockUnavailable,
	/// The chain notifier rejected a subscription.
	NotifierUnavailable,
	/// A transaction could not be broadcast to the network.
	TxBroadcastFailed,
	/// A fee rate estimate could not be retrieved.
	FeeEstimationFailed,
	/// A witness for a sweep input could not be generated.
	SigningFailed,
	/// A fresh sweep script could not be generated by the wallet.
	SweepScriptGenerationFailed,
	/// The sweep transaction could not be constructed.
	SweepTxCreationFailed,
	/// The external channel database could not be updated.
	ChannelUpdateFailed,
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
		match *self {
			Self::AlreadyRunning => write!(f, "The nursery is already running."),
			Self::NotRunning => write!(f, "The nursery is not running."),
			Self::PersistenceFailed => write!(f, "Failed to persist the nursery state."),
			Self::DecodeFailed => write!(f, "Failed to decode a persisted record."),
			Self::ChannelNotFound => write!(f, "The channel is not tracked by the nursery."),
			Self::BestBlockUnavailable => {
				write!(f, "Failed to retrieve the best block from the chain source.")
			},
			Self::NotifierUnavailable => write!(f, "Failed to subscribe to chain notifications."),
			Self::TxBroadcastFailed => write!(f, "Failed to broadcast a transaction."),
			Self::FeeEstimationFailed => write!(f, "Failed to retrieve a fee rate estimate."),
			Self::SigningFailed => write!(f, "Failed to generate a witness for a sweep input."),
			Self::SweepScriptGenerationFailed => {
				write!(f, "Failed to generate a fresh sweep script.")
			},
			Self::SweepTxCreationFailed => write!(f, "Failed to construct the sweep transaction."),
			Self::ChannelUpdateFailed => {
				write!(f, "Failed to update the external channel database.")
			},
		}
	}
}

impl std::error::Error for Error {}

impl From<lightning::ln::msgs::DecodeError> for Error {
	fn from(_: lightning::ln::msgs::DecodeError) -> Self {
		Self::DecodeFailed
	}
}
