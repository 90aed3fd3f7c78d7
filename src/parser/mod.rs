pub mod modelfile;

pub use modelfile::{parse, Directive, Modelfile};
