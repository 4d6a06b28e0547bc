pub mod call;
pub mod stream;
