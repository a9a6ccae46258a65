/*
 * This file is part of raphael-thermal.
 *
 * Copyright (C) 2025 raphael-thermal contributors
 *
 * raphael-thermal is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * raphael-thermal is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with raphael-thermal. If not, see <https://www.gnu.org/licenses/>.
 */

//! Combination formulas shared by virtual sensors and virtual power rails.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thermal_error::ThermalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Formula {
    /// Count the readings past a signed threshold. A negative coefficient
    /// counts readings below its magnitude.
    CountThreshold,
    WeightedAvg,
    Maximum,
    Minimum,
}

impl Formula {
    pub fn as_str(self) -> &'static str {
        match self {
            Formula::CountThreshold => "COUNT_THRESHOLD",
            Formula::WeightedAvg => "WEIGHTED_AVG",
            Formula::Maximum => "MAXIMUM",
            Formula::Minimum => "MINIMUM",
        }
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Formula {
    type Err = ThermalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COUNT_THRESHOLD" => Ok(Formula::CountThreshold),
            "WEIGHTED_AVG" => Ok(Formula::WeightedAvg),
            "MAXIMUM" => Ok(Formula::Maximum),
            "MINIMUM" => Ok(Formula::Minimum),
            other => Err(ThermalError::invalid("Formula", format!("unknown formula {other:?}"))),
        }
    }
}

/// Combine `readings` weighted by `coefficients` and add `offset`.
///
/// Pairs are zipped, so the shorter slice bounds the input. With no input the
/// result is `offset` alone.
pub fn combine(formula: Formula, readings: &[f32], coefficients: &[f32], offset: f32) -> f32 {
    let mut pairs = readings.iter().zip(coefficients).peekable();
    if pairs.peek().is_none() {
        return offset;
    }

    let value = match formula {
        Formula::CountThreshold => pairs
            .filter(|&(&r, &c)| (c < 0.0 && r < -c) || (c >= 0.0 && r >= c))
            .count() as f32,
        Formula::WeightedAvg => pairs.map(|(r, c)| r * c).sum::<f32>(),
        Formula::Maximum => pairs.map(|(r, c)| r * c).fold(f32::MIN, f32::max),
        Formula::Minimum => pairs.map(|(r, c)| r * c).fold(f32::MAX, f32::min),
    };
    value + offset
}
