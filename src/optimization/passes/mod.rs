pub mod canonicalize;
pub mod relative_ordering;
pub mod tensor_generators;
pub mod weight_updates;
