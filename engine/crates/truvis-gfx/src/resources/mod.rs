pub mod format;
pub mod mapped_buffer;
