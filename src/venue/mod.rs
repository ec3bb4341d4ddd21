//! Venue client contract and order types.
//!
//! The engine never talks to a venue transport directly; every venue is an
//! implementation of [`VenueClient`]. The mock venue ships here because the
//! execution tests and paper runs depend on its scripted failure modes.

pub mod mock;
mod traits;
mod types;

pub use mock::{FillScript, MockVenueClient};
pub use traits::VenueClient;
pub use types::{BestBidOffer, OrderId, OrderInfo, OrderSide, OrderStatus, SymbolMeta, VenueError};
