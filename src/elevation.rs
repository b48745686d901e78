mod google_provider;
mod hgt;
mod hgt_provider;
mod sampler;
mod synthetic;

pub use google_provider::GoogleElevationProvider;
pub use hgt_provider::HgtElevationProvider;
pub use sampler::{ElevationProvider, ElevationSampler, SampleResult};
