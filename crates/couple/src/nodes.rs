//! Host-facing node adapters.
//!
//! Each node declares its typed inputs (with default, bounds and step) and a
//! `process` entry point. Numeric inputs are checked against their declared
//! bounds before anything else runs; the host's loosely typed
//! `region_1..region_N` arguments are collected into an ordered list by
//! [`collect_regions`] so the assembler only ever sees a slice.

use std::collections::HashMap;

use conditioning::{Conditioning, SpatialMask};
use model::ModelPatcher;

use crate::error::{CoupleError, Result};
use crate::install::{install, PatchMode};
use crate::regions::{build_from_region_list, build_from_split, Orientation, Region, DIMENSION_STEP, MIN_DIMENSION};
use crate::settings::CoupleSettings;

/// Category every node is listed under.
pub const CATEGORY: &str = "loaders";
/// Bounds of the `inputcount` input.
pub const MIN_REGIONS: i64 = 2;
pub const MAX_REGIONS: i64 = 1000;

/// Output types shared by the two coupling nodes.
const COUPLE_OUTPUTS: &[&str] = &["MODEL", "CONDITIONING", "CONDITIONING"];

/// Declared integer input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntInput {
    pub default: i64,
    pub min: i64,
    pub max: i64,
    pub step: i64,
}

impl IntInput {
    pub fn check(&self, field: &'static str, value: i64) -> Result<usize> {
        if value < self.min || value > self.max {
            return Err(CoupleError::invalid(
                field,
                format!("{value} is outside [{}, {}]", self.min, self.max),
            ));
        }
        usize::try_from(value).map_err(|_| CoupleError::invalid(field, format!("{value} is negative")))
    }
}

/// Declared float input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FloatInput {
    pub default: f64,
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl FloatInput {
    pub fn check(&self, field: &'static str, value: f64) -> Result<f64> {
        if !(self.min..=self.max).contains(&value) {
            return Err(CoupleError::invalid(
                field,
                format!("{value} is outside [{}, {}]", self.min, self.max),
            ));
        }
        Ok(value)
    }
}

/// Type of a declared node input.
#[derive(Debug, Clone, PartialEq)]
pub enum InputKind {
    Model,
    Conditioning,
    Mask,
    CoupleRegion,
    Int(IntInput),
    Float(FloatInput),
    Choice(&'static [&'static str]),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputSpec {
    pub name: &'static str,
    pub kind: InputKind,
}

impl InputSpec {
    fn new(name: &'static str, kind: InputKind) -> Self {
        Self { name, kind }
    }
}

/// Registry entry describing one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDefinition {
    pub name: &'static str,
    pub display_name: &'static str,
    pub category: &'static str,
    pub inputs: Vec<InputSpec>,
    pub outputs: &'static [&'static str],
    pub output_names: Option<&'static [&'static str]>,
}

fn dimension_input(max_resolution: usize) -> IntInput {
    IntInput {
        default: 512,
        min: MIN_DIMENSION as i64,
        max: max_resolution as i64,
        step: DIMENSION_STEP as i64,
    }
}

const CENTER_INPUT: FloatInput = FloatInput {
    default: 0.5,
    min: 0.0,
    max: 1.0,
    step: 0.01,
};

const INPUTCOUNT_INPUT: IntInput = IntInput {
    default: MIN_REGIONS,
    min: MIN_REGIONS,
    max: MAX_REGIONS,
    step: 1,
};

/// Parameters of the split layout as received from the host.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitParams {
    pub orientation: String,
    pub center: f64,
    pub width: i64,
    pub height: i64,
}

impl Default for SplitParams {
    fn default() -> Self {
        Self {
            orientation: Orientation::Horizontal.as_str().to_string(),
            center: CENTER_INPUT.default,
            width: 512,
            height: 512,
        }
    }
}

/// Two conditionings split by a single dividing line.
#[derive(Debug, Clone, Default)]
pub struct ComfyCouple {
    settings: CoupleSettings,
}

impl ComfyCouple {
    pub const NAME: &'static str = "Comfy Couple";

    pub fn new(settings: CoupleSettings) -> Self {
        Self { settings }
    }

    pub fn definition(&self) -> NodeDefinition {
        let dimension = InputKind::Int(dimension_input(self.settings.max_resolution));
        NodeDefinition {
            name: Self::NAME,
            display_name: "Comfy Couple",
            category: CATEGORY,
            inputs: vec![
                InputSpec::new("model", InputKind::Model),
                InputSpec::new("positive_1", InputKind::Conditioning),
                InputSpec::new("positive_2", InputKind::Conditioning),
                InputSpec::new("negative", InputKind::Conditioning),
                InputSpec::new("orientation", InputKind::Choice(&["horizontal", "vertical"])),
                InputSpec::new("center", InputKind::Float(CENTER_INPUT)),
                InputSpec::new("width", dimension.clone()),
                InputSpec::new("height", dimension),
            ],
            outputs: COUPLE_OUTPUTS,
            output_names: None,
        }
    }

    pub fn process(
        &self,
        model: &ModelPatcher,
        positive_1: &Conditioning,
        positive_2: &Conditioning,
        negative: &Conditioning,
        params: &SplitParams,
    ) -> Result<(ModelPatcher, Conditioning, Conditioning)> {
        let orientation: Orientation = params.orientation.parse()?;
        let center = CENTER_INPUT.check("center", params.center)?;
        let dimension = dimension_input(self.settings.max_resolution);
        let width = dimension.check("width", params.width)?;
        let height = dimension.check("height", params.height)?;

        let positive = build_from_split(positive_1, positive_2, orientation, center, width, height)?;
        install(model, &positive, negative, PatchMode::Attention, &self.settings)
    }
}

/// Any number of user-masked regions.
#[derive(Debug, Clone, Default)]
pub struct ComfyCoupleMask {
    settings: CoupleSettings,
}

impl ComfyCoupleMask {
    pub const NAME: &'static str = "ComfyCoupleMask";

    pub fn new(settings: CoupleSettings) -> Self {
        Self { settings }
    }

    pub fn definition(&self) -> NodeDefinition {
        NodeDefinition {
            name: Self::NAME,
            display_name: "ComfyCoupleMask",
            category: CATEGORY,
            inputs: vec![
                InputSpec::new("model", InputKind::Model),
                InputSpec::new("negative", InputKind::Conditioning),
                InputSpec::new("inputcount", InputKind::Int(INPUTCOUNT_INPUT)),
                InputSpec::new("region_1", InputKind::CoupleRegion),
                InputSpec::new("region_2", InputKind::CoupleRegion),
            ],
            outputs: COUPLE_OUTPUTS,
            output_names: Some(&["model", "positive", "negative"]),
        }
    }

    pub fn process(
        &self,
        model: &ModelPatcher,
        negative: &Conditioning,
        inputcount: i64,
        named: &HashMap<String, Region>,
    ) -> Result<(ModelPatcher, Conditioning, Conditioning)> {
        let count = INPUTCOUNT_INPUT.check("inputcount", inputcount)?;
        let regions = collect_regions(count, named)?;
        let positive = build_from_region_list(&regions, self.settings.leftover_policy)?;
        install(model, &positive, negative, PatchMode::Attention, &self.settings)
    }
}

/// Pairs a conditioning with its mask.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComfyCoupleRegion;

impl ComfyCoupleRegion {
    pub const NAME: &'static str = "ComfyCoupleRegion";

    pub fn definition(&self) -> NodeDefinition {
        NodeDefinition {
            name: Self::NAME,
            display_name: "ComfyCoupleRegion",
            category: CATEGORY,
            inputs: vec![
                InputSpec::new("positive", InputKind::Conditioning),
                InputSpec::new("mask", InputKind::Mask),
            ],
            outputs: &["COUPLE_REGION"],
            output_names: None,
        }
    }

    pub fn process(&self, positive: &Conditioning, mask: &SpatialMask) -> Region {
        Region::new(positive.clone(), mask.clone())
    }
}

/// Orders `region_1..region_{inputcount}` from the host's argument bag.
pub fn collect_regions(inputcount: usize, named: &HashMap<String, Region>) -> Result<Vec<Region>> {
    let regions = (1..=inputcount)
        .map(|index| {
            let key = format!("region_{index}");
            named
                .get(&key)
                .cloned()
                .ok_or_else(|| CoupleError::invalid("regions", format!("missing input {key}")))
        })
        .collect::<Result<Vec<_>>>()?;
    if named.len() > inputcount {
        log::debug!(
            "ignoring {} region inputs beyond inputcount={inputcount}",
            named.len() - inputcount
        );
    }
    Ok(regions)
}

/// Every node this crate provides.
pub fn node_definitions(settings: &CoupleSettings) -> Vec<NodeDefinition> {
    vec![
        ComfyCouple::new(settings.clone()).definition(),
        ComfyCoupleMask::new(settings.clone()).definition(),
        ComfyCoupleRegion.definition(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};

    fn region(tokens: usize) -> anyhow::Result<Region> {
        let cond = Conditioning::from_embedding(Tensor::zeros((1, tokens, 4), DType::F32, &Device::Cpu)?)?;
        Ok(Region::new(cond, SpatialMask::solid(1.0, 16, 16, &Device::Cpu)?))
    }

    #[test]
    fn registry_lists_three_loader_nodes() {
        let defs = node_definitions(&CoupleSettings::default());
        let names: Vec<&str> = defs.iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["Comfy Couple", "ComfyCoupleMask", "ComfyCoupleRegion"]);
        assert!(defs.iter().all(|d| d.category == "loaders"));
        assert_eq!(defs[2].outputs, &["COUPLE_REGION"]);

        let width = defs[0].inputs.iter().find(|i| i.name == "width").map(|i| i.kind.clone());
        assert_eq!(
            width,
            Some(InputKind::Int(IntInput { default: 512, min: 16, max: 16384, step: 8 }))
        );
    }

    #[test]
    fn max_resolution_is_injected() {
        let settings = CoupleSettings {
            max_resolution: 2048,
            ..CoupleSettings::default()
        };
        let node = ComfyCouple::new(settings);
        let dimension = dimension_input(2048);
        assert_eq!(node.definition().inputs[6].kind, InputKind::Int(dimension));
        assert!(dimension.check("width", 4096).is_err());
        assert_eq!(dimension.check("width", 2048).ok(), Some(2048));
        assert!(dimension.check("height", 8).is_err());
    }

    #[test]
    fn numeric_bounds_are_enforced() {
        assert!(CENTER_INPUT.check("center", -0.01).is_err());
        assert!(CENTER_INPUT.check("center", 1.01).is_err());
        assert!(CENTER_INPUT.check("center", f64::NAN).is_err());
        assert_eq!(CENTER_INPUT.check("center", 1.0).ok(), Some(1.0));
        assert!(INPUTCOUNT_INPUT.check("inputcount", 1).is_err());
        assert!(INPUTCOUNT_INPUT.check("inputcount", 1001).is_err());
        assert_eq!(INPUTCOUNT_INPUT.check("inputcount", 1000).ok(), Some(1000));
    }

    #[test]
    fn collect_regions_orders_by_index() -> anyhow::Result<()> {
        let mut named = HashMap::new();
        named.insert("region_2".to_string(), region(5)?);
        named.insert("region_1".to_string(), region(3)?);
        named.insert("region_3".to_string(), region(7)?);

        let regions = collect_regions(2, &named)?;
        let tokens: Vec<usize> = regions.iter().map(|r| r.conditioning.entries()[0].tokens()).collect();
        assert_eq!(tokens, vec![3, 5]);

        assert!(matches!(
            collect_regions(4, &named),
            Err(CoupleError::InvalidInput { field: "regions", .. })
        ));
        Ok(())
    }
}
