pub mod hash_table;
pub mod interval;
pub mod message;
pub mod node;
pub mod ring;
pub mod routing;
pub mod utils;
