//! Entity records owned by the world store.

mod actor;
mod item;
mod setting;

pub use actor::{Actor, InventoryEntry, ScheduleEntry, EQUIP_SLOTS, MAX_NOTES};
pub use item::Item;
pub use setting::{Connection, Setting};
