//! Subnet configuration space: candidate lists, deterministic sampling and
//! cross-product enumeration.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;

use ofanas_core::SpaceConfig;

use crate::error::MlError;

/// A dimension value shared by every block, or one value per block/stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Choice<T> {
    Uniform(T),
    PerBlock(Vec<T>),
}

impl<T: Copy> Choice<T> {
    pub fn values(&self) -> Vec<T> {
        match self {
            Choice::Uniform(v) => vec![*v],
            Choice::PerBlock(vs) => vs.clone(),
        }
    }
}

impl<T: Copy + Into<f64>> Choice<T> {
    /// Mean over blocks, used for compact per-batch logging.
    pub fn mean(&self) -> f64 {
        match self {
            Choice::Uniform(v) => (*v).into(),
            Choice::PerBlock(vs) if vs.is_empty() => 0.0,
            Choice::PerBlock(vs) => {
                vs.iter().map(|v| (*v).into()).sum::<f64>() / vs.len() as f64
            }
        }
    }
}

impl<T: fmt::Display> fmt::Display for Choice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Choice::Uniform(v) => write!(f, "{v}"),
            Choice::PerBlock(vs) => {
                let parts: Vec<String> = vs.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", parts.join(","))
            }
        }
    }
}

/// One concrete subnet of the supernet.
///
/// Built once per sampling call or enumeration step and never mutated after
/// it has been handed to the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubnetSetting {
    pub image_size: u32,
    pub kernel_size: Choice<u32>,
    pub expand_ratio: Choice<f64>,
    pub depth: Choice<u32>,
    /// `None` for networks without an elastic number of scales.
    pub scale: Option<u32>,
    /// Index into the width multiplier list; 0 when width is not elastic.
    pub width_mult: usize,
}

impl SubnetSetting {
    /// Compact `key_mean` summary logged with every training batch.
    pub fn summary(&self) -> String {
        let mut parts = vec![
            format!("r_{}", self.image_size),
            format!("ks_{:.1}", self.kernel_size.mean()),
            format!("e_{:.1}", self.expand_ratio.mean()),
            format!("d_{:.1}", self.depth.mean()),
        ];
        if let Some(scale) = self.scale {
            parts.push(format!("s_{scale}"));
        }
        parts.push(format!("w_{}", self.width_mult));
        parts.join(",")
    }

    /// Validation name, e.g. `R576-D4-E8-K7-S4-W0`.
    pub fn name(&self) -> String {
        let mut name = format!(
            "R{}-D{}-E{}-K{}",
            self.image_size, self.depth, self.expand_ratio, self.kernel_size
        );
        if let Some(scale) = self.scale {
            name.push_str(&format!("-S{scale}"));
        }
        name.push_str(&format!("-W{}", self.width_mult));
        name
    }
}

/// A setting together with the label used in validation logs.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedSetting {
    pub setting: SubnetSetting,
    pub name: String,
}

impl NamedSetting {
    pub fn new(setting: SubnetSetting) -> Self {
        let name = setting.name();
        Self { setting, name }
    }
}

/// Per-dimension overrides for a validation sweep. `None` means "use every
/// candidate of the network".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepDims {
    pub image_sizes: Option<Vec<u32>>,
    pub kernel_sizes: Option<Vec<u32>>,
    pub expand_ratios: Option<Vec<f64>>,
    pub depths: Option<Vec<u32>>,
    pub scales: Option<Vec<u32>>,
    pub width_mults: Option<Vec<usize>>,
    /// Extra hand-picked settings evaluated after the cross product.
    pub additional: Vec<NamedSetting>,
}

/// Candidate values of every elastic dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSpace {
    pub image_sizes: Vec<u32>,
    pub kernel_sizes: Vec<u32>,
    pub expand_ratios: Vec<f64>,
    pub depths: Vec<u32>,
    pub scales: Vec<u32>,
    pub width_mults: Vec<f64>,
    pub num_blocks: usize,
    pub num_stages: usize,
    /// Restricts width to one index of `width_mults` while width is not
    /// yet elastic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_width: Option<usize>,
}

impl From<&SpaceConfig> for CandidateSpace {
    fn from(config: &SpaceConfig) -> Self {
        Self {
            image_sizes: config.image_sizes.clone(),
            kernel_sizes: config.kernel_sizes.clone(),
            expand_ratios: config.expand_ratios.clone(),
            depths: config.depths.clone(),
            scales: config.scales.clone(),
            width_mults: config.width_mults.clone(),
            num_blocks: config.num_blocks,
            num_stages: config.num_stages,
            pinned_width: None,
        }
    }
}

/// Seed for the `slot`-th subnet sampled at `batch` of `epoch`.
///
/// Decimal concatenation of the global step, the zero-padded slot and a
/// zero-padded `000`, so every replica draws the same subnet for the same
/// step and slot.
pub fn subnet_seed(epoch: usize, n_batches: usize, batch: usize, slot: usize) -> u64 {
    let step = (epoch as u64)
        .wrapping_mul(n_batches as u64)
        .wrapping_add(batch as u64);
    let slot_digits = format!("{slot:03}").len() as u32;
    step.wrapping_mul(10u64.pow(slot_digits + 3))
        .wrapping_add((slot as u64).wrapping_mul(1000))
}

fn pick<T: Copy>(rng: &mut StdRng, candidates: &[T]) -> T {
    if candidates.len() == 1 {
        return candidates[0];
    }
    candidates[rng.gen_range(0..candidates.len())]
}

fn pick_per_block<T: Copy>(rng: &mut StdRng, candidates: &[T], blocks: usize) -> Choice<T> {
    if candidates.len() == 1 {
        return Choice::Uniform(candidates[0]);
    }
    Choice::PerBlock((0..blocks).map(|_| pick(rng, candidates)).collect())
}

fn max_of<T: Copy + PartialOrd>(values: &[T]) -> Option<T> {
    values
        .iter()
        .copied()
        .fold(None, |acc, v| match acc {
            Some(m) if m >= v => Some(m),
            _ => Some(v),
        })
}

impl CandidateSpace {
    /// Width indices the space allows; `[0]` when width is not elastic.
    pub fn width_indices(&self) -> Vec<usize> {
        if let Some(index) = self.pinned_width {
            vec![index]
        } else if self.width_mults.is_empty() {
            vec![0]
        } else {
            (0..self.width_mults.len()).collect()
        }
    }

    /// Draw one subnet. Dimensions with a single candidate are pinned and
    /// consume no randomness.
    pub fn sample(&self, seed: u64) -> SubnetSetting {
        let mut rng = StdRng::seed_from_u64(seed);
        let image_size = pick(&mut rng, &self.image_sizes);
        let kernel_size = pick_per_block(&mut rng, &self.kernel_sizes, self.num_blocks);
        let expand_ratio = pick_per_block(&mut rng, &self.expand_ratios, self.num_blocks);
        let depth = pick_per_block(&mut rng, &self.depths, self.num_stages);
        let scale = if self.scales.is_empty() {
            None
        } else {
            Some(pick(&mut rng, &self.scales))
        };
        let width_mult = pick(&mut rng, &self.width_indices());
        SubnetSetting {
            image_size,
            kernel_size,
            expand_ratio,
            depth,
            scale,
            width_mult,
        }
    }

    /// The full-size network: largest candidate in every dimension.
    pub fn max_setting(&self) -> SubnetSetting {
        SubnetSetting {
            image_size: max_of(&self.image_sizes).unwrap_or_default(),
            kernel_size: Choice::Uniform(max_of(&self.kernel_sizes).unwrap_or_default()),
            expand_ratio: Choice::Uniform(max_of(&self.expand_ratios).unwrap_or_default()),
            depth: Choice::Uniform(max_of(&self.depths).unwrap_or_default()),
            scale: max_of(&self.scales),
            width_mult: self.width_indices().last().copied().unwrap_or_default(),
        }
    }

    /// Cross product of the sweep dimensions, depth outermost and image size
    /// innermost, followed by `dims.additional`.
    pub fn enumerate(&self, dims: &SweepDims) -> Vec<NamedSetting> {
        let image_sizes = dims.image_sizes.as_ref().unwrap_or(&self.image_sizes);
        let kernel_sizes = dims.kernel_sizes.as_ref().unwrap_or(&self.kernel_sizes);
        let expand_ratios = dims.expand_ratios.as_ref().unwrap_or(&self.expand_ratios);
        let depths = dims.depths.as_ref().unwrap_or(&self.depths);
        let scales: Vec<Option<u32>> = match &dims.scales {
            Some(scales) => scales.iter().copied().map(Some).collect(),
            None if self.scales.is_empty() => vec![None],
            None => self.scales.iter().copied().map(Some).collect(),
        };
        let width_mults = dims
            .width_mults
            .clone()
            .unwrap_or_else(|| self.width_indices());

        let mut settings = Vec::with_capacity(
            depths.len()
                * expand_ratios.len()
                * kernel_sizes.len()
                * scales.len()
                * width_mults.len()
                * image_sizes.len(),
        );
        for &d in depths {
            for &e in expand_ratios {
                for &k in kernel_sizes {
                    for &s in &scales {
                        for &w in &width_mults {
                            for &r in image_sizes {
                                settings.push(NamedSetting::new(SubnetSetting {
                                    image_size: r,
                                    kernel_size: Choice::Uniform(k),
                                    expand_ratio: Choice::Uniform(e),
                                    depth: Choice::Uniform(d),
                                    scale: s,
                                    width_mult: w,
                                }));
                            }
                        }
                    }
                }
            }
        }
        settings.extend(dims.additional.iter().cloned());
        settings
    }

    /// Check that every value of `setting` is a candidate of this space.
    pub fn validate(&self, setting: &SubnetSetting) -> Result<(), MlError> {
        if !self.image_sizes.contains(&setting.image_size) {
            return Err(MlError::invalid_setting(format!(
                "image size {} not in {:?}",
                setting.image_size, self.image_sizes
            )));
        }
        check_choice("kernel size", &setting.kernel_size, &self.kernel_sizes, self.num_blocks)?;
        check_choice(
            "expand ratio",
            &setting.expand_ratio,
            &self.expand_ratios,
            self.num_blocks,
        )?;
        check_choice("depth", &setting.depth, &self.depths, self.num_stages)?;
        match setting.scale {
            None if self.scales.is_empty() => {}
            Some(s) if self.scales.contains(&s) => {}
            other => {
                return Err(MlError::invalid_setting(format!(
                    "scale {other:?} not in {:?}",
                    self.scales
                )));
            }
        }
        if !self.width_indices().contains(&setting.width_mult) {
            return Err(MlError::invalid_setting(format!(
                "width index {} not in {:?}",
                setting.width_mult,
                self.width_indices()
            )));
        }
        Ok(())
    }
}

fn check_choice<T: PartialEq + fmt::Debug + Copy>(
    dim: &str,
    choice: &Choice<T>,
    candidates: &[T],
    blocks: usize,
) -> Result<(), MlError> {
    if let Choice::PerBlock(values) = choice
        && values.len() != blocks
    {
        return Err(MlError::invalid_setting(format!(
            "{dim} lists {} values for {blocks} blocks",
            values.len()
        )));
    }
    if let Some(bad) = choice.values().into_iter().find(|v| !candidates.contains(v)) {
        return Err(MlError::invalid_setting(format!(
            "{dim} {bad:?} not in {candidates:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn stereo_space() -> CandidateSpace {
        CandidateSpace {
            image_sizes: vec![576],
            kernel_sizes: vec![3, 5, 7],
            expand_ratios: vec![2.0, 4.0],
            depths: vec![2, 4],
            scales: vec![4],
            width_mults: Vec::new(),
            num_blocks: 6,
            num_stages: 3,
            pinned_width: None,
        }
    }

    #[test]
    fn test_enumerate_counts_cross_product() {
        let settings = stereo_space().enumerate(&SweepDims::default());
        assert_eq!(settings.len(), 3 * 2 * 2);

        let mut names: Vec<&str> = settings.iter().map(|s| s.name.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 12);
    }

    #[test]
    fn test_enumerate_order_and_names() {
        let settings = stereo_space().enumerate(&SweepDims::default());
        assert_eq!(settings[0].name, "R576-D2-E2-K3-S4-W0");
        assert_eq!(settings[1].name, "R576-D2-E2-K5-S4-W0");
        assert_eq!(settings[11].name, "R576-D4-E4-K7-S4-W0");
    }

    #[test]
    fn test_enumerate_with_overrides_and_additional() {
        let space = stereo_space();
        let extra = NamedSetting {
            setting: space.max_setting(),
            name: "max".into(),
        };
        let dims = SweepDims {
            depths: Some(vec![4]),
            kernel_sizes: Some(vec![7]),
            additional: vec![extra.clone()],
            ..SweepDims::default()
        };
        let settings = space.enumerate(&dims);
        assert_eq!(settings.len(), 2 + 1);
        assert_eq!(settings.last(), Some(&extra));
    }

    #[test]
    fn test_enumerate_without_scale_omits_segment() {
        let mut space = stereo_space();
        space.scales.clear();
        let settings = space.enumerate(&SweepDims::default());
        assert_eq!(settings.len(), 12);
        assert_eq!(settings[0].name, "R576-D2-E2-K3-W0");
        assert!(settings.iter().all(|s| s.setting.scale.is_none()));
    }

    #[test]
    fn test_sample_is_deterministic() {
        let space = stereo_space();
        let seed = subnet_seed(3, 100, 17, 1);
        assert_eq!(space.sample(seed), space.sample(seed));
    }

    #[test]
    fn test_sample_respects_space() {
        let space = stereo_space();
        for slot in 0..50 {
            let setting = space.sample(subnet_seed(0, 10, 4, slot));
            space.validate(&setting).unwrap();
        }
    }

    #[test]
    fn test_single_candidate_dimension_is_pinned() {
        let space = stereo_space();
        let setting = space.sample(42);
        assert_eq!(setting.scale, Some(4));
        assert_eq!(setting.image_size, 576);
        assert_eq!(setting.width_mult, 0);
        assert!(matches!(setting.kernel_size, Choice::PerBlock(ref v) if v.len() == 6));
        assert!(matches!(setting.depth, Choice::PerBlock(ref v) if v.len() == 3));
    }

    #[test]
    fn test_subnet_seed_concatenates_digits() {
        // step = 2 * 50 + 7 = 107, slot 3 -> "107" "003" "000"
        assert_eq!(subnet_seed(2, 50, 7, 3), 107_003_000);
        assert_eq!(subnet_seed(0, 50, 0, 0), 0);
        // slots past three digits widen the field instead of colliding
        assert_eq!(subnet_seed(0, 10, 1, 1234), 1_1234_000);
    }

    #[test]
    fn test_max_setting() {
        let setting = stereo_space().max_setting();
        assert_eq!(setting.kernel_size, Choice::Uniform(7));
        assert_eq!(setting.expand_ratio, Choice::Uniform(4.0));
        assert_eq!(setting.depth, Choice::Uniform(4));
        assert_eq!(setting.scale, Some(4));
    }

    #[test]
    fn test_pinned_width() {
        let mut space = stereo_space();
        space.width_mults = vec![0.8, 1.0, 1.2];
        assert_eq!(space.width_indices(), vec![0, 1, 2]);
        space.pinned_width = Some(2);
        assert_eq!(space.width_indices(), vec![2]);
        assert_eq!(space.sample(7).width_mult, 2);
        assert_eq!(space.max_setting().width_mult, 2);
        let mut setting = space.max_setting();
        setting.width_mult = 0;
        assert!(space.validate(&setting).is_err());
    }

    #[test]
    fn test_validate_rejects_foreign_values() {
        let space = stereo_space();
        let mut setting = space.max_setting();
        setting.kernel_size = Choice::Uniform(9);
        assert!(matches!(
            space.validate(&setting),
            Err(MlError::InvalidSetting(_))
        ));

        let mut setting = space.max_setting();
        setting.depth = Choice::PerBlock(vec![2, 4]);
        assert!(space.validate(&setting).is_err());

        let mut setting = space.max_setting();
        setting.width_mult = 1;
        assert!(space.validate(&setting).is_err());
    }

    #[test]
    fn test_summary_uses_block_means() {
        let setting = SubnetSetting {
            image_size: 576,
            kernel_size: Choice::PerBlock(vec![3, 7]),
            expand_ratio: Choice::Uniform(4.0),
            depth: Choice::PerBlock(vec![2, 3, 4]),
            scale: Some(3),
            width_mult: 0,
        };
        assert_eq!(setting.summary(), "r_576,ks_5.0,e_4.0,d_3.0,s_3,w_0");
    }

    #[test]
    fn test_from_space_config() {
        let space = CandidateSpace::from(&SpaceConfig::default());
        assert_eq!(space.depths, vec![2, 3, 4]);
        assert_eq!(space.enumerate(&SweepDims::default()).len(), 3 * 4 * 3 * 3);
    }
}
