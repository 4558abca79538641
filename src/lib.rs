pub mod binarize;
pub mod boxes;
pub mod election;
pub mod geometry;
pub mod image_utils;
pub mod interpret;
pub mod layout;
pub mod metadata;
pub mod qr_code;
pub mod registration;
pub mod scoring;
pub mod segments;
pub mod shapes;
pub mod templates;
pub mod types;
pub mod votes;

#[cfg(test)]
mod test_utils;
