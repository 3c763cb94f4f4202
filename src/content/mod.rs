//! Content normalization: markdown to text, images, tags and profiles

pub mod command;
pub mod normalize;
pub mod profile;

pub use command::TagCommand;
pub use normalize::{
    is_patch, parse_metadata, plain_text, slugify, NormalizedPost, Normalizer, PostMetadata,
    Verdict,
};
pub use profile::parse_profile;
