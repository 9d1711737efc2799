//! Collision detection over a uniform spatial grid
//!
//! Placed elements register their bounding boxes into grid cells; candidate
//! placements query only the cells they touch. When a candidate overlaps
//! obstacles, an avoidance vector per obstacle pushes it away; repeated
//! no-progress attempts spiral outward from the desired position.
//!
//! Jitter for coincident rectangles is hash-derived rather than random, so
//! a layout recomputed at the same timestamp reproduces byte-identical
//! element positions and stays coherent with cached snapshots.

use crate::config::CollisionConfig;
use crate::models::layout::Bounds;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Result of refining one placement
#[derive(Debug, Clone)]
pub struct Placement {
    /// Final bounds for the element
    pub bounds: Bounds,

    /// Residual score (0 means collision-free inside the region)
    pub score: f64,

    /// Attempts consumed
    pub attempts: usize,
}

/// Uniform-grid collision detector
pub struct CollisionDetector {
    config: CollisionConfig,
    grid: HashMap<(i64, i64), Vec<usize>>,
    obstacles: Vec<Bounds>,
}

impl CollisionDetector {
    pub fn new(config: CollisionConfig) -> Self {
        Self {
            config,
            grid: HashMap::new(),
            obstacles: Vec::new(),
        }
    }

    /// Drop all registered obstacles (fresh frame)
    pub fn reset(&mut self) {
        self.grid.clear();
        self.obstacles.clear();
    }

    /// Number of registered obstacles
    pub fn obstacle_count(&self) -> usize {
        self.obstacles.len()
    }

    fn cells_of(&self, bounds: &Bounds) -> Vec<(i64, i64)> {
        let cell = self.config.cell_size.max(1.0);
        let x0 = (bounds.x / cell).floor() as i64;
        let y0 = (bounds.y / cell).floor() as i64;
        let x1 = (bounds.right() / cell).floor() as i64;
        let y1 = (bounds.bottom() / cell).floor() as i64;

        let mut cells = Vec::new();
        for gx in x0..=x1 {
            for gy in y0..=y1 {
                cells.push((gx, gy));
            }
        }
        cells
    }

    /// Register a placed element as an obstacle
    pub fn insert(&mut self, bounds: Bounds) {
        let index = self.obstacles.len();
        self.obstacles.push(bounds);
        for cell in self.cells_of(&bounds) {
            self.grid.entry(cell).or_default().push(index);
        }
    }

    /// Obstacles whose boxes overlap `bounds`
    pub fn overlapping(&self, bounds: &Bounds) -> Vec<Bounds> {
        let mut seen = std::collections::HashSet::new();
        let mut result = Vec::new();
        for cell in self.cells_of(bounds) {
            if let Some(indices) = self.grid.get(&cell) {
                for &index in indices {
                    if seen.insert(index) && self.obstacles[index].intersects(bounds) {
                        result.push(self.obstacles[index]);
                    }
                }
            }
        }
        result
    }

    /// Displacement pushing `bounds` away from one obstacle
    ///
    /// Normalized center-to-center direction scaled by the overlap extent.
    /// Coincident centers get a deterministic jitter direction instead.
    fn avoidance_vector(&self, bounds: &Bounds, obstacle: &Bounds, attempt: usize) -> (f64, f64) {
        let (cx, cy) = bounds.center();
        let (ox, oy) = obstacle.center();
        let dx = cx - ox;
        let dy = cy - oy;
        let distance = (dx * dx + dy * dy).sqrt();

        let push = (bounds.width.min(obstacle.width) / 2.0).max(8.0);

        if distance < 1e-6 {
            let angle = Self::jitter_angle(bounds, attempt);
            return (angle.cos() * push, angle.sin() * push);
        }

        (dx / distance * push, dy / distance * push)
    }

    fn jitter_angle(bounds: &Bounds, attempt: usize) -> f64 {
        let mut hasher = DefaultHasher::new();
        (bounds.x.to_bits(), bounds.y.to_bits(), attempt).hash(&mut hasher);
        let raw = hasher.finish() % 6283;
        raw as f64 / 1000.0
    }

    fn score(&self, bounds: &Bounds, region: &Bounds) -> f64 {
        let overlap: f64 = self
            .overlapping(bounds)
            .iter()
            .map(|o| o.intersection_area(bounds))
            .sum();
        let mut score = overlap * self.config.severity_penalty;
        if !region.contains(bounds) {
            score += self.config.out_of_region_penalty;
        }
        score
    }

    /// Refine a desired placement against all registered obstacles
    ///
    /// Up to `max_attempts` candidates are scored by overlap area times the
    /// severity penalty plus an out-of-region penalty; the best-scoring
    /// candidate wins. Attempts that stop making progress spiral outward.
    /// The winning bounds are registered as a new obstacle.
    pub fn place(&mut self, desired: Bounds, region: &Bounds) -> Placement {
        let mut candidate = desired;
        let mut best = desired;
        let mut best_score = self.score(&desired, region);
        let mut attempts = 0;

        for attempt in 0..self.config.max_attempts {
            attempts = attempt + 1;
            if best_score <= 0.0 {
                break;
            }

            let overlapping = self.overlapping(&candidate);
            let (mut dx, mut dy) = (0.0, 0.0);
            for obstacle in &overlapping {
                let (ax, ay) = self.avoidance_vector(&candidate, obstacle, attempt);
                dx += ax;
                dy += ay;
            }

            let moved = dx.abs() + dy.abs();
            if moved < 1e-3 {
                // No pressure from obstacles; spiral outward from the
                // desired position
                let turn = attempt as f64 * 0.9;
                let radius = 12.0 * (attempt as f64 + 1.0);
                candidate = Bounds::new(
                    desired.x + turn.cos() * radius,
                    desired.y + turn.sin() * radius,
                    desired.width,
                    desired.height,
                );
            } else {
                candidate = Bounds::new(
                    candidate.x + dx,
                    candidate.y + dy,
                    candidate.width,
                    candidate.height,
                );
            }

            let score = self.score(&candidate, region);
            if score < best_score {
                best_score = score;
                best = candidate;
            }
        }

        self.insert(best);
        Placement {
            bounds: best,
            score: best_score,
            attempts,
        }
    }
}
