mod error;
mod schema;
pub mod utils;

pub mod btree;

pub use btree::{
    batch::BatchPage,
    buffer_pool::BufferPool,
    cursor::BTreeKeyIterator,
    latch::LockMode,
    table::{BTreeHandle, BTreeIndex},
};
pub use error::{ErrorKind, SmallError, SmallResult};
pub use schema::{BytesSchema, KeySchema};
