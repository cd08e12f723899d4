pub mod file_storage;
pub mod memory_storage;
pub mod storage;
