pub mod domain;
pub mod infrastructure;
pub mod resources;
pub mod worker;
