pub mod batch;
pub mod transform;
