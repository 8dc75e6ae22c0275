#[cfg(feature = "test_utils")]
mod dag_strategy;
/// Random value generator for sampling data.
#[cfg(feature = "test_utils")]
mod rvg;
#[cfg(feature = "test_utils")]
pub use dag_strategy::*;
#[cfg(feature = "test_utils")]
pub use rvg::*;

mod blockstore_utils;
mod mock_peer;
mod unixfs_utils;

pub use blockstore_utils::*;
pub use mock_peer::*;
pub use unixfs_utils::*;
