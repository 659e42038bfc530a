pub mod errors;
pub mod events;
pub mod lightbox;
pub mod models;
pub mod runs;
pub mod tools;
