//! Alt-Svc advertisements: header decoding and the shared cache.

mod cache;
pub mod parser;

pub use cache::{AltSvcCache, AltSvcEntry};
pub use parser::{parse, AltSvcDirective, AltSvcDirectives};
