//! Encoder selection and argument assembly

pub mod catalog;
pub mod command;
pub mod discovery;
pub mod strategy;

pub use catalog::{lookup, CatalogError, EncoderFamily, EncoderId, EncodingModeConfig};
pub use command::{build_all_passes, build_pass_args, EncodeInvocation};
pub use discovery::{
    EncoderDiscovery, EncoderProbe, FfmpegEncoderProbe, ProbeAttempt, ResolvedEncoder,
};
pub use strategy::{CodecProfile, CodecStrategy};
