pub mod file_lock;
pub mod layout;
pub mod sequence;

pub use layout::StorageLayout;
pub use sequence::Sequence;
