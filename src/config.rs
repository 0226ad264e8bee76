use std::path::Path;

use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};

use crate::error::{PhysError, PhysResult};

/// Broad-phase grid layout. Fixed for the lifetime of a world.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub cell_size: f32,
    pub cells_x: u32,
    pub cells_y: u32,
    /// World XY of the corner of cell (0, 0).
    pub origin: Vec2,
    /// Vertical range used to quantize thunk boxes.
    pub z_min: f32,
    pub z_max: f32,
    /// Whether queries leaving the grid consult the out-of-bounds cell.
    pub out_of_bounds_as_result: bool,
    pub max_thunks: usize,
    /// Entities covering more cells than this go to the global list.
    pub max_cells_per_entity: usize,
    /// Ask the region streamer to populate cells on first touch.
    pub physics_on_demand: bool,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            cell_size: 4.0,
            cells_x: 256,
            cells_y: 256,
            origin: Vec2::ZERO,
            z_min: -512.0,
            z_max: 1536.0,
            out_of_bounds_as_result: true,
            max_thunks: 1 << 20,
            max_cells_per_entity: 1024,
            physics_on_demand: false,
        }
    }
}

/// Contact solver and rigid stepping thresholds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub iterations: u32,
    /// Penetration depth that triggers an island step-back.
    pub step_back_depth: f32,
    pub max_step_backs: u32,
    /// Penetration tolerated without positional correction.
    pub allowed_penetration: f32,
    /// Fraction of the remaining penetration pushed out per sub-step.
    pub penetration_recovery: f32,
    pub max_recovery_speed: f32,
    /// `|v| * dt > fast_ratio * size` switches a body to swept CCD.
    pub fast_ratio: f32,
    pub max_velocity: f32,
    pub max_angular_velocity: f32,
    /// Relative normal speeds below this never bounce.
    pub min_bounce_speed: f32,
    /// Extra bbox margin used when collecting contact candidates.
    pub contact_margin: f32,
    /// Fraction of last tick's impulse applied before iterating.
    pub warm_start: f32,
    /// Fraction of a constraint's positional error corrected per sub-step.
    pub constraint_recovery: f32,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            iterations: 12,
            step_back_depth: 0.25,
            max_step_backs: 2,
            allowed_penetration: 0.005,
            penetration_recovery: 0.4,
            max_recovery_speed: 2.0,
            fast_ratio: 0.5,
            max_velocity: 200.0,
            max_angular_velocity: 60.0,
            min_bounce_speed: 1.0,
            contact_margin: 0.02,
            warm_start: 0.8,
            constraint_recovery: 0.2,
        }
    }
}

/// Energy-based sleep thresholds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SleepConfig {
    /// Per unit mass; compared against `E / m`.
    pub min_energy: f32,
    /// Consecutive low-energy ticks required before sleeping.
    pub sleep_frames: u32,
    /// Seconds an entity stays awake after waking.
    pub min_awake_time: f32,
}

impl Default for SleepConfig {
    fn default() -> Self {
        Self { min_energy: 0.07 * 0.07, sleep_frames: 4, min_awake_time: 0.0 }
    }
}

/// Articulated solver thresholds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArticulationConfig {
    /// Joint speeds above this are treated as a blow-up and reset.
    pub max_joint_velocity: f32,
    /// |a0 . a2| above this freezes the third axis.
    pub gimbal_freeze: f32,
    /// |a0 . a2| below this releases a frozen axis.
    pub gimbal_release: f32,
    /// Angular window (radians) before a limit where the dashpot acts.
    pub dashpot_window: f32,
    /// Joint velocity drives below this magnitude are ignored.
    pub min_drive_velocity: f32,
}

impl Default for ArticulationConfig {
    fn default() -> Self {
        Self {
            max_joint_velocity: 50.0,
            gimbal_freeze: 0.99,
            gimbal_release: 0.95,
            dashpot_window: 0.05,
            min_drive_velocity: 1e-4,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadConfig {
    /// Worker count; 0 picks rayon's default.
    pub workers: usize,
    pub stack_size: Option<usize>,
    /// Islands with fewer entities than this are stepped on the calling thread.
    pub min_parallel_islands: usize,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self { workers: 0, stack_size: Some(2 * 1024 * 1024), min_parallel_islands: 2 }
    }
}

/// Hard caps on pooled resources.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_contacts: usize,
    pub max_queued_commands: usize,
    pub max_candidates: usize,
    pub max_ray_hits: usize,
    pub max_events: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_contacts: 1 << 16,
            max_queued_commands: 4096,
            max_candidates: 4096,
            max_ray_hits: 32,
            max_events: 4096,
        }
    }
}

/// Top-level world configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    pub grid: GridConfig,
    pub gravity: Vec3,
    /// Upper bound of one internal sub-step.
    pub max_time_step: f32,
    pub solver: SolverConfig,
    pub sleep: SleepConfig,
    pub articulation: ArticulationConfig,
    pub threads: ThreadConfig,
    pub limits: LimitsConfig,
    /// Collect per-phase timing each tick.
    pub enable_timing: bool,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            grid: GridConfig::default(),
            gravity: Vec3::new(0.0, 0.0, -9.81),
            max_time_step: 0.02,
            solver: SolverConfig::default(),
            sleep: SleepConfig::default(),
            articulation: ArticulationConfig::default(),
            threads: ThreadConfig::default(),
            limits: LimitsConfig::default(),
            enable_timing: false,
        }
    }
}

impl WorldConfig {
    pub fn from_toml_str(s: &str) -> PhysResult<Self> {
        let cfg: WorldConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> PhysResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> PhysResult<()> {
        let g = &self.grid;
        if !(g.cell_size.is_finite() && g.cell_size > 0.0) {
            return Err(PhysError::invalid("grid.cell_size", "must be positive"));
        }
        if g.cells_x == 0 || g.cells_y == 0 {
            return Err(PhysError::invalid("grid.cells", "grid needs at least one cell"));
        }
        if !(g.z_max > g.z_min) {
            return Err(PhysError::invalid("grid.z_max", "must exceed z_min"));
        }
        if g.max_cells_per_entity == 0 {
            return Err(PhysError::invalid("grid.max_cells_per_entity", "must be non-zero"));
        }
        if !self.gravity.is_finite() {
            return Err(PhysError::NonFinite("gravity"));
        }
        if !(self.max_time_step.is_finite() && self.max_time_step > 0.0) {
            return Err(PhysError::invalid("max_time_step", "must be positive"));
        }
        if self.solver.iterations == 0 {
            return Err(PhysError::invalid("solver.iterations", "must be non-zero"));
        }
        if self.sleep.sleep_frames == 0 {
            return Err(PhysError::invalid("sleep.sleep_frames", "must be non-zero"));
        }
        let a = &self.articulation;
        if !(a.gimbal_release < a.gimbal_freeze && a.gimbal_freeze <= 1.0) {
            return Err(PhysError::invalid(
                "articulation.gimbal_freeze",
                "need gimbal_release < gimbal_freeze <= 1",
            ));
        }
        if self.limits.max_ray_hits == 0 {
            return Err(PhysError::invalid("limits.max_ray_hits", "must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates() {
        assert!(WorldConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg = WorldConfig::from_toml_str(
            r#"
            gravity = [0.0, 0.0, -1.62]
            [grid]
            cell_size = 2.0
            [sleep]
            sleep_frames = 8
            "#,
        )
        .unwrap();
        assert_eq!(cfg.grid.cell_size, 2.0);
        assert_eq!(cfg.grid.cells_x, GridConfig::default().cells_x);
        assert_eq!(cfg.sleep.sleep_frames, 8);
        assert!((cfg.gravity.z + 1.62).abs() < 1e-6);
    }

    #[test]
    fn test_rejects_bad_values() {
        let err = WorldConfig::from_toml_str("[grid]\ncell_size = 0.0\n").unwrap_err();
        assert!(matches!(err, PhysError::InvalidParameter { name: "grid.cell_size", .. }));
        assert!(matches!(
            WorldConfig::from_toml_str("max_time_step = -1.0").unwrap_err(),
            PhysError::InvalidParameter { .. }
        ));
        assert!(matches!(
            WorldConfig::from_toml_str("grid = 3").unwrap_err(),
            PhysError::ConfigParse(_)
        ));
    }
}
