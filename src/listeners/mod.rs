mod store;
mod types;

pub use store::ListenerStore;
pub use types::{GeoInfo, Listener};
