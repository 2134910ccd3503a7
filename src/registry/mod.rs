pub mod flatten;
pub mod source;

pub use flatten::{flatten_batch, is_okved_code, CodeScope, OkvedFilter};
pub use source::RegistrySource;
