pub mod budget;
pub mod limits;
pub mod shared;
pub mod topics;
pub mod window;
