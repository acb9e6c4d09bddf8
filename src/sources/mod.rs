//! Upstream HTTP data sources
//!
//! Price and forecast fetching live here; the planner only ever sees
//! normalized `PricePoint` series and mean temperatures. Any transport or
//! shape problem surfaces as `FetchFailed`/`InsufficientData`, which the
//! control loop turns into a degraded plan rather than an abort.

pub mod forecast;
pub mod prices;

pub use forecast::ForecastClient;
pub use prices::{MIN_PRICE_ROWS, PriceClient};
