// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

use crate::Error;

use bitcoin::FeeRate;

/// Provides fee rate estimates for sweep transactions.
pub trait FeeEstimator {
	/// Returns the estimated fee rate required for a transaction to confirm within
	/// `confirmation_target` blocks.
	fn estimate_fee_rate(&self, confirmation_target: u32) -> Result<FeeRate, Error>;
}
