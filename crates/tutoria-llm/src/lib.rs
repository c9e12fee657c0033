pub mod codegen;
pub mod mock;
pub mod tutor;

pub use codegen::{HttpCodeGenerator, UnconfiguredCodeGenerator};
pub use mock::{MockAnswer, MockCodeGenerator, MockTutor};
pub use tutor::{HttpTutor, UnconfiguredTutor};
