pub mod fs;
pub mod retention;
