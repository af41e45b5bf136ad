//! Runtime collaborators of the compiler: linear memory, tables, and the
//! store that owns instances, links imports and routes calls.

mod memory;
mod store;
mod table;

pub use memory::{MAX_PAGES, Memory, PAGE_SIZE};
pub use store::{
    Engine, HostFunc, ImportTarget, Imports, Instance, InterruptHandle, Store, StoreLimits,
};
pub use table::{NULL_REF, Table};
