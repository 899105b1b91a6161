//! Solver configuration, loaded from JSON with serde

use std::path::Path;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::error::{FluidError, Result};
use crate::grid::WORKGROUP_SIZE;

/// Startup configuration. Every key is optional in the JSON form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Grid resolution is the viewport right-shifted by this amount.
    pub lod: u32,
    pub density_gain: f32,
    pub velocity_gain: f32,
    pub diffusion_rate: f32,
    pub viscosity: f32,
    /// Jacobi passes per diffusion stage.
    pub relaxation_iterations: u32,
    /// Jacobi passes per pressure solve.
    pub pressure_iterations: u32,
    pub projection: bool,
    /// Upper bound on the measured frame time fed to the solver, in seconds.
    pub max_time_step: f32,
    pub workgroup_size: [u32; 2],
    pub ink_color: [f32; 3],
    pub flow_color: [f32; 3],
    pub flow_scale: f32,
    /// Impulse radius in grid cells for pointer input.
    pub pointer_radius: f32,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            lod: 1,
            density_gain: 40.0,
            velocity_gain: 600.0,
            diffusion_rate: 0.00001,
            viscosity: 0.00001,
            relaxation_iterations: 20,
            pressure_iterations: 30,
            projection: true,
            max_time_step: 1.0 / 15.0,
            workgroup_size: WORKGROUP_SIZE,
            ink_color: [0.9, 0.95, 1.0],
            flow_color: [0.2, 0.6, 1.0],
            flow_scale: 0.05,
            pointer_radius: 4.0,
        }
    }
}

impl SolverConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.params().validate()?;
        non_negative("pointer_radius", self.pointer_radius)?;
        if !(self.max_time_step.is_finite() && self.max_time_step > 0.0) {
            return Err(FluidError::Config(format!(
                "max_time_step must be positive, got {}",
                self.max_time_step
            )));
        }
        Ok(())
    }

    pub fn params(&self) -> SolverParams {
        SolverParams {
            lod: self.lod,
            density_gain: self.density_gain,
            velocity_gain: self.velocity_gain,
            diffusion_rate: self.diffusion_rate,
            viscosity: self.viscosity,
            relaxation_iterations: self.relaxation_iterations,
            pressure_iterations: self.pressure_iterations,
            projection: self.projection,
            palette: Palette {
                ink: Vec3::from_array(self.ink_color),
                flow: Vec3::from_array(self.flow_color),
                flow_scale: self.flow_scale,
            },
        }
    }
}

/// Colours used by the draw stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Palette {
    pub ink: Vec3,
    pub flow: Vec3,
    pub flow_scale: f32,
}

/// Runtime-mutable solver coefficients, read at the start of every frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverParams {
    pub lod: u32,
    pub density_gain: f32,
    pub velocity_gain: f32,
    pub diffusion_rate: f32,
    pub viscosity: f32,
    pub relaxation_iterations: u32,
    pub pressure_iterations: u32,
    pub projection: bool,
    pub palette: Palette,
}

impl SolverParams {
    /// Checked when the config is loaded and again whenever a frame binds them.
    pub fn validate(&self) -> Result<()> {
        non_negative("density_gain", self.density_gain)?;
        non_negative("velocity_gain", self.velocity_gain)?;
        non_negative("diffusion_rate", self.diffusion_rate)?;
        non_negative("viscosity", self.viscosity)?;
        non_negative("flow_scale", self.palette.flow_scale)?;
        if self.relaxation_iterations == 0 {
            return Err(FluidError::Config(
                "relaxation_iterations must be at least 1".into(),
            ));
        }
        if self.lod > 15 {
            return Err(FluidError::Config(format!(
                "lod {} would collapse any viewport",
                self.lod
            )));
        }
        Ok(())
    }
}

fn non_negative(name: &str, value: f32) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(FluidError::Config(format!(
            "{name} must be a non-negative number, got {value}"
        )));
    }
    Ok(())
}

impl Default for SolverParams {
    fn default() -> Self {
        SolverConfig::default().params()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let config = SolverConfig::from_json("{}").unwrap();
        assert_eq!(config, SolverConfig::default());
    }

    #[test]
    fn partial_json_overrides_keys() {
        let config =
            SolverConfig::from_json(r#"{ "lod": 2, "viscosity": 0.5, "projection": false }"#)
                .unwrap();
        assert_eq!(config.lod, 2);
        assert_eq!(config.viscosity, 0.5);
        assert!(!config.projection);
        assert_eq!(config.relaxation_iterations, 20);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            SolverConfig::from_json(r#"{ "density_gain": -1.0 }"#),
            Err(FluidError::Config(_))
        ));
        assert!(matches!(
            SolverConfig::from_json(r#"{ "relaxation_iterations": 0 }"#),
            Err(FluidError::Config(_))
        ));
        assert!(matches!(
            SolverConfig::from_json(r#"{ "lod": 16 }"#),
            Err(FluidError::Config(_))
        ));
        assert!(matches!(
            SolverConfig::from_json(r#"{ "max_time_step": 0.0 }"#),
            Err(FluidError::Config(_))
        ));
        assert!(matches!(
            SolverConfig::from_json("{ not json"),
            Err(FluidError::Json(_))
        ));
    }

    #[test]
    fn runtime_params_are_checked() {
        let mut params = SolverParams::default();
        assert!(params.validate().is_ok());
        params.viscosity = f32::NAN;
        assert!(matches!(params.validate(), Err(FluidError::Config(_))));
        params.viscosity = 0.0;
        params.diffusion_rate = -0.25;
        assert!(matches!(params.validate(), Err(FluidError::Config(_))));
    }

    #[test]
    fn zero_workgroup_is_not_a_config_error() {
        let config = SolverConfig::from_json(r#"{ "workgroup_size": [0, 8] }"#).unwrap();
        assert_eq!(config.workgroup_size, [0, 8]);
    }
}
