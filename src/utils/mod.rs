pub mod image_ops;

pub use image_ops::{
    crop_and_encode_png_async, encode_preserving_format, load_image_from_memory_async,
};
