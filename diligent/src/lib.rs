pub use diligent_base as base;

pub use diligent_api as api;
