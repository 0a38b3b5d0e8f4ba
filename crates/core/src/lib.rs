pub mod bus;
pub mod events;
pub mod models;
pub mod traits;

pub use bus::*;
pub use events::*;
pub use models::*;
pub use traits::*;
