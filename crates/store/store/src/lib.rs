pub mod error;
pub mod item;
pub mod store;
pub mod testing;

pub use error::StoreError;
pub use item::LockItem;
pub use store::{LockStore, WriteOutcome};
