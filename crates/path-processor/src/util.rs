pub mod cancel;
pub(crate) mod shared;
