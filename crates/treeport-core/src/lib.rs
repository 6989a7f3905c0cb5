pub mod artifact;
pub mod backend;
pub mod data_transform;
pub mod error;
pub mod model;
pub mod shape;
pub mod spec;
pub mod tensor;
pub mod transform;

pub use artifact::*;
pub use backend::*;
pub use data_transform::*;
pub use error::*;
pub use model::*;
pub use shape::*;
pub use spec::*;
pub use tensor::*;
pub use transform::*;
