pub mod geom;
pub mod model;
pub mod package;
pub mod shared;
