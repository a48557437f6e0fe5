pub mod hf_hub;
pub mod http;
pub mod options;
pub mod progress;
pub mod source;

pub use hf_hub::set_cache_dir;
pub use options::Options;
pub use source::ModelSource;
