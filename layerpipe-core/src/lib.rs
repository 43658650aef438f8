pub mod cancel;
pub mod compositor;
pub mod downscale;
pub mod img;
pub mod layers;
pub mod project;
pub mod result_cache;
pub mod scale_cache;
pub mod source;

pub use cancel::CancelToken;
pub use downscale::Quality;
pub use img::Image;
