pub mod oauth;
pub mod password;
pub mod signature;
pub mod validation;

pub use validation::ValidatedForm;
