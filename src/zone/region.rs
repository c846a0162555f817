//! Gate regions.

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
}

/// Area of the frame in which a track is considered inside the gate zone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Region {
    /// The whole frame.
    #[default]
    Everywhere,
    /// Centroids whose coordinate on `axis` lies within `[min, max]`.
    Band { axis: Axis, min: f32, max: f32 },
    /// Simple polygon, vertices in order. Closing edge is implicit.
    Polygon { points: Vec<[f32; 2]> },
}

impl Region {
    pub fn contains(&self, p: &Point2<f32>) -> bool {
        match self {
            Region::Everywhere => true,
            Region::Band { axis, min, max } => {
                let v = match axis {
                    Axis::X => p.x,
                    Axis::Y => p.y,
                };
                v >= *min && v <= *max
            }
            Region::Polygon { points } => polygon_contains(points, p),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            Region::Everywhere => Ok(()),
            Region::Band { min, max, .. } => {
                if !(min.is_finite() && max.is_finite()) {
                    Err("band bounds must be finite".to_string())
                } else if min > max {
                    Err(format!("band min {min} exceeds max {max}"))
                } else {
                    Ok(())
                }
            }
            Region::Polygon { points } => {
                if points.len() < 3 {
                    Err(format!("polygon needs at least 3 points, got {}", points.len()))
                } else if points.iter().flatten().any(|v| !v.is_finite()) {
                    Err("polygon points must be finite".to_string())
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Even-odd ray casting.
fn polygon_contains(points: &[[f32; 2]], p: &Point2<f32>) -> bool {
    if points.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = points.len() - 1;
    for i in 0..points.len() {
        let [xi, yi] = points[i];
        let [xj, yj] = points[j];
        if (yi > p.y) != (yj > p.y) {
            let x_cross = (xj - xi) * (p.y - yi) / (yj - yi) + xi;
            if p.x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}
