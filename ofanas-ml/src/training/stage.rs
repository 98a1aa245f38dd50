//! The progressive-shrinking curriculum.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::space::CandidateSpace;

/// One stage of progressive shrinking, in training order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStage {
    /// The full-size network alone.
    Full,
    ElasticDepth,
    ElasticExpand,
    ElasticScale,
    ElasticWidth,
}

impl TrainingStage {
    pub const ALL: [TrainingStage; 5] = [
        TrainingStage::Full,
        TrainingStage::ElasticDepth,
        TrainingStage::ElasticExpand,
        TrainingStage::ElasticScale,
        TrainingStage::ElasticWidth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TrainingStage::Full => "full",
            TrainingStage::ElasticDepth => "depth",
            TrainingStage::ElasticExpand => "expand",
            TrainingStage::ElasticScale => "scale",
            TrainingStage::ElasticWidth => "width",
        }
    }

    pub fn next(&self) -> Option<TrainingStage> {
        let idx = Self::ALL.iter().position(|s| s == self)?;
        Self::ALL.get(idx + 1).copied()
    }

    /// Candidates the stage samples from. Dimensions not yet unlocked are
    /// pinned to their largest value; kernel size is elastic from the depth
    /// stage on. Image sizes are never restricted.
    pub fn training_space(&self, full: &CandidateSpace) -> CandidateSpace {
        let mut space = full.clone();
        if *self < TrainingStage::ElasticDepth {
            space.kernel_sizes = pin_max(&full.kernel_sizes);
            space.depths = pin_max(&full.depths);
        }
        if *self < TrainingStage::ElasticExpand {
            space.expand_ratios = pin_max(&full.expand_ratios);
        }
        if *self < TrainingStage::ElasticScale {
            space.scales = pin_max(&full.scales);
        }
        if *self < TrainingStage::ElasticWidth {
            space.pinned_width = widest(&full.width_mults);
        }
        space
    }
}

fn widest(width_mults: &[f64]) -> Option<usize> {
    width_mults
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(index, _)| index)
}

fn pin_max<T: Copy + PartialOrd>(values: &[T]) -> Vec<T> {
    values
        .iter()
        .copied()
        .reduce(|a, b| if b > a { b } else { a })
        .into_iter()
        .collect()
}

impl fmt::Display for TrainingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrainingStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "full" | "large" => Ok(TrainingStage::Full),
            "depth" | "elastic_depth" => Ok(TrainingStage::ElasticDepth),
            "expand" | "elastic_expand" => Ok(TrainingStage::ElasticExpand),
            "scale" | "elastic_scale" => Ok(TrainingStage::ElasticScale),
            "width" | "width_mult" | "elastic_width" => Ok(TrainingStage::ElasticWidth),
            other => Err(format!(
                "unknown training stage '{other}' (expected full, depth, expand, scale or width)"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn space() -> CandidateSpace {
        CandidateSpace {
            image_sizes: vec![512, 576],
            kernel_sizes: vec![3, 5, 7],
            expand_ratios: vec![2.0, 4.0, 6.0],
            depths: vec![2, 3, 4],
            scales: vec![2, 3, 4],
            width_mults: vec![1.0, 1.2],
            num_blocks: 6,
            num_stages: 3,
            pinned_width: None,
        }
    }

    #[test]
    fn test_parse_and_display() {
        for stage in TrainingStage::ALL {
            assert_eq!(stage.to_string().parse::<TrainingStage>(), Ok(stage));
        }
        assert_eq!("elastic-depth".parse(), Ok(TrainingStage::ElasticDepth));
        assert!("kernel".parse::<TrainingStage>().is_err());
    }

    #[test]
    fn test_order_and_next() {
        assert!(TrainingStage::Full < TrainingStage::ElasticWidth);
        assert_eq!(TrainingStage::Full.next(), Some(TrainingStage::ElasticDepth));
        assert_eq!(TrainingStage::ElasticWidth.next(), None);
    }

    #[test]
    fn test_full_stage_pins_everything() {
        let s = TrainingStage::Full.training_space(&space());
        assert_eq!(s.kernel_sizes, vec![7]);
        assert_eq!(s.depths, vec![4]);
        assert_eq!(s.expand_ratios, vec![6.0]);
        assert_eq!(s.scales, vec![4]);
        assert_eq!(s.width_mults, vec![1.0, 1.2]);
        assert_eq!(s.width_indices(), vec![1]);
        assert_eq!(s.image_sizes, vec![512, 576]);
    }

    #[test]
    fn test_stages_unlock_cumulatively() {
        let depth = TrainingStage::ElasticDepth.training_space(&space());
        assert_eq!(depth.depths, vec![2, 3, 4]);
        assert_eq!(depth.kernel_sizes, vec![3, 5, 7]);
        assert_eq!(depth.expand_ratios, vec![6.0]);

        let scale = TrainingStage::ElasticScale.training_space(&space());
        assert_eq!(scale.expand_ratios, vec![2.0, 4.0, 6.0]);
        assert_eq!(scale.scales, vec![2, 3, 4]);
        assert_eq!(scale.pinned_width, Some(1));

        assert_eq!(TrainingStage::ElasticWidth.training_space(&space()), space());
    }

    #[test]
    fn test_pin_max_of_empty_stays_empty() {
        let mut s = space();
        s.scales.clear();
        assert!(TrainingStage::Full.training_space(&s).scales.is_empty());
    }
}
