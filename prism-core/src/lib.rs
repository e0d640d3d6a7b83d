pub mod device_map;
mod error;
mod handle;
pub mod loader;
mod sdxl;
mod util;

pub use device_map::*;
pub use error::Error;
pub use handle::{BoxedModel, LoadFn, LoadFuture, ModelHandle};
pub use loader::*;
pub use sdxl::SdxlLoader;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
pub(crate) use util::*;

use std::ops::RangeInclusive;

/// Seed sentinel meaning "pick a fresh random seed for this call".
pub const RANDOM_SEED: i64 = -1;

pub const GUIDANCE_SCALE_RANGE: RangeInclusive<f64> = 1.0..=20.0;
pub const STEPS_RANGE: RangeInclusive<usize> = 10..=50;
pub const DIMENSION_RANGE: RangeInclusive<usize> = 512..=1536;
pub const DIMENSION_STEP: usize = 64;
pub const NUM_OUTPUTS_RANGE: RangeInclusive<usize> = 1..=4;

// Define the request/response types. Field defaults mirror the demo UI
// widgets so partial request bodies behave like an untouched form.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default = "default_negative_prompt")]
    pub negative_prompt: String,
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default = "default_dimension")]
    pub width: usize,
    #[serde(default = "default_dimension")]
    pub height: usize,
    #[serde(default = "default_seed")]
    pub seed: i64,
    #[serde(default = "default_num_outputs")]
    pub num_outputs: usize,
}

fn default_negative_prompt() -> String {
    "low quality, blurry, distorted, bad anatomy, worst quality".to_string()
}

fn default_guidance_scale() -> f64 {
    7.5
}

fn default_steps() -> usize {
    28
}

fn default_dimension() -> usize {
    1024
}

fn default_seed() -> i64 {
    RANDOM_SEED
}

fn default_num_outputs() -> usize {
    4
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: default_negative_prompt(),
            guidance_scale: default_guidance_scale(),
            steps: default_steps(),
            width: default_dimension(),
            height: default_dimension(),
            seed: default_seed(),
            num_outputs: default_num_outputs(),
        }
    }
}

impl GenerationRequest {
    /// Enforces the parameter bounds of the demo UI widgets. Runs at the
    /// HTTP boundary so the adapter only ever sees in-range requests.
    pub fn validate(&self) -> Result<(), Error> {
        if !GUIDANCE_SCALE_RANGE.contains(&self.guidance_scale) {
            return Err(Error::InvalidParameter(format!(
                "guidance_scale must be between {} and {}, got {}",
                GUIDANCE_SCALE_RANGE.start(),
                GUIDANCE_SCALE_RANGE.end(),
                self.guidance_scale
            )));
        }
        if !STEPS_RANGE.contains(&self.steps) {
            return Err(Error::InvalidParameter(format!(
                "steps must be between {} and {}, got {}",
                STEPS_RANGE.start(),
                STEPS_RANGE.end(),
                self.steps
            )));
        }
        for (name, value) in [("width", self.width), ("height", self.height)] {
            if !DIMENSION_RANGE.contains(&value) || value % DIMENSION_STEP != 0 {
                return Err(Error::InvalidParameter(format!(
                    "{name} must be a multiple of {DIMENSION_STEP} between {} and {}, got {value}",
                    DIMENSION_RANGE.start(),
                    DIMENSION_RANGE.end(),
                )));
            }
        }
        if !NUM_OUTPUTS_RANGE.contains(&self.num_outputs) {
            return Err(Error::InvalidParameter(format!(
                "num_outputs must be between {} and {}, got {}",
                NUM_OUTPUTS_RANGE.start(),
                NUM_OUTPUTS_RANGE.end(),
                self.num_outputs
            )));
        }
        if self.seed != RANDOM_SEED && !(0..=u32::MAX as i64).contains(&self.seed) {
            return Err(Error::InvalidParameter(format!(
                "seed must be {RANDOM_SEED} or a 32-bit unsigned integer, got {}",
                self.seed
            )));
        }
        Ok(())
    }

    /// Resolves the seed for this call: the sentinel draws a fresh random
    /// 32-bit value, anything else is used as given.
    pub fn resolve_seed(&self) -> u32 {
        if self.seed == RANDOM_SEED {
            rand::random()
        } else {
            self.seed as u32
        }
    }
}

/// The images produced by one prediction call, in generation order, together
/// with the seed that was actually used.
#[derive(Debug)]
pub struct GenerationResult {
    pub images: Vec<DynamicImage>,
    pub seed: u32,
}

pub trait ModelLike: Send + Sync {
    fn run(&self, request: &GenerationRequest, seed: u32) -> anyhow::Result<Vec<DynamicImage>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_json_takes_widget_defaults() {
        let req: GenerationRequest = serde_json::from_str(r#"{"prompt":"a red cube"}"#).unwrap();
        assert_eq!(req.prompt, "a red cube");
        assert_eq!(
            req.negative_prompt,
            "low quality, blurry, distorted, bad anatomy, worst quality"
        );
        assert_eq!(req.guidance_scale, 7.5);
        assert_eq!(req.steps, 28);
        assert_eq!(req.width, 1024);
        assert_eq!(req.height, 1024);
        assert_eq!(req.seed, RANDOM_SEED);
        assert_eq!(req.num_outputs, 4);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn guidance_scale_bounds() {
        let with_guidance = |v| GenerationRequest {
            guidance_scale: v,
            ..Default::default()
        };
        assert!(with_guidance(0.5).validate().is_err());
        assert!(with_guidance(1.0).validate().is_ok());
        assert!(with_guidance(20.0).validate().is_ok());
        assert!(with_guidance(20.5).validate().is_err());
    }

    #[test]
    fn steps_bounds() {
        let with_steps = |v| GenerationRequest {
            steps: v,
            ..Default::default()
        };
        assert!(with_steps(9).validate().is_err());
        assert!(with_steps(10).validate().is_ok());
        assert!(with_steps(50).validate().is_ok());
        assert!(with_steps(51).validate().is_err());
    }

    #[test]
    fn dimension_bounds_and_grid() {
        let with_width = |v| GenerationRequest {
            width: v,
            ..Default::default()
        };
        assert!(with_width(448).validate().is_err());
        assert!(with_width(512).validate().is_ok());
        assert!(with_width(1536).validate().is_ok());
        assert!(with_width(1600).validate().is_err());
        // in range but off the 64-pixel grid
        assert!(with_width(1000).validate().is_err());

        let off_grid_height = GenerationRequest {
            height: 1000,
            ..Default::default()
        };
        assert!(off_grid_height.validate().is_err());
    }

    #[test]
    fn num_outputs_bounds() {
        let with_outputs = |v| GenerationRequest {
            num_outputs: v,
            ..Default::default()
        };
        assert!(with_outputs(0).validate().is_err());
        assert!(with_outputs(1).validate().is_ok());
        assert!(with_outputs(4).validate().is_ok());
        assert!(with_outputs(5).validate().is_err());
    }

    #[test]
    fn seed_bounds() {
        let with_seed = |v| GenerationRequest {
            seed: v,
            ..Default::default()
        };
        assert!(with_seed(-2).validate().is_err());
        assert!(with_seed(RANDOM_SEED).validate().is_ok());
        assert!(with_seed(0).validate().is_ok());
        assert!(with_seed(u32::MAX as i64).validate().is_ok());
        assert!(with_seed(u32::MAX as i64 + 1).validate().is_err());
    }

    #[test]
    fn fixed_seed_passes_through() {
        let req = GenerationRequest {
            seed: 42,
            ..Default::default()
        };
        assert_eq!(req.resolve_seed(), 42);
        assert_eq!(req.resolve_seed(), 42);
    }

    #[test]
    fn sentinel_seed_draws_fresh_values() {
        let req = GenerationRequest::default();
        let draws: Vec<u32> = (0..4).map(|_| req.resolve_seed()).collect();
        assert!(
            draws.windows(2).any(|w| w[0] != w[1]),
            "four random draws all identical: {draws:?}"
        );
    }
}
