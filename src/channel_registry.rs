// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

use crate::Error;

use bitcoin::OutPoint;

/// Provides access to the external channel database, in which channels are marked fully closed
/// once all of their outputs have been swept.
pub trait ChannelRegistry {
	/// Returns the channel points of all channels that are closed on-chain but not yet marked
	/// fully closed, i.e., the superset of all channels that may still be incubating.
	fn fetch_pending_closed_channels(&self) -> Result<Vec<OutPoint>, Error>;

	/// Marks the channel with the given funding outpoint as fully closed.
	fn mark_channel_fully_closed(&self, channel_point: &OutPoint) -> Result<(), Error>;
}
