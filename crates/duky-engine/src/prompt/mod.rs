//! Pure builders that turn tool options into the instruction text sent to
//! the image model.

pub mod aspect;
pub mod avatar;
pub mod free;
pub mod interpolation;
pub mod khmer;
pub mod poster;
pub mod studio;
pub mod template;
