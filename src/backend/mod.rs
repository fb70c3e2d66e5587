#[cfg(feature = "sync")]
pub mod sync_client;
#[cfg(any(feature = "async", feature = "sync"))]
pub mod traits;
#[cfg(feature = "async")]
pub mod async_client;
#[cfg(any(feature = "async", feature = "sync"))]
pub(crate) mod tls;

#[cfg(any(feature = "async", feature = "sync"))]
pub use traits::*;
