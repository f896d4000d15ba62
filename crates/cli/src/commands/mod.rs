pub mod cores;
pub mod usage;
