use serde::{Deserialize, Serialize};

use crate::error::{Result, RolloutError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceUnit {
    Count,
    Percentage,
}

/// Requested size of a canary or scale target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInstances {
    pub unit: InstanceUnit,
    pub value: i32,
}

impl TargetInstances {
    pub fn count(value: i32) -> Self {
        Self { unit: InstanceUnit::Count, value }
    }

    pub fn percentage(value: i32) -> Self {
        Self { unit: InstanceUnit::Percentage, value }
    }

    pub fn validate(&self) -> Result<()> {
        match self.unit {
            InstanceUnit::Count if self.value < 0 => {
                Err(RolloutError::Validation(format!("instance count must not be negative (got {})", self.value)))
            }
            InstanceUnit::Percentage if !(0..=100).contains(&self.value) => {
                Err(RolloutError::Validation(format!("instance percentage must be within 0..=100 (got {})", self.value)))
            }
            _ => Ok(()),
        }
    }

    fn scaled(&self, base: i32) -> i32 {
        ((i64::from(self.value) * i64::from(base.max(0)) + 50) / 100) as i32
    }

    /// COUNT is verbatim. PERCENTAGE is `value * base / 100` rounded half up, at least 1.
    pub fn resolve(&self, base: i32) -> i32 {
        match self.unit {
            InstanceUnit::Count => self.value,
            InstanceUnit::Percentage => self.scaled(base).max(1),
        }
    }

    /// True when a percentage rounds to zero and `resolve` raises it to 1.
    pub fn raised_to_minimum(&self, base: i32) -> bool {
        self.unit == InstanceUnit::Percentage && self.scaled(base) < 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_is_verbatim() {
        assert_eq!(TargetInstances::count(7).resolve(100), 7);
        assert_eq!(TargetInstances::count(0).resolve(3), 0);
    }

    #[test]
    fn percentage_rounds_half_up() {
        assert_eq!(TargetInstances::percentage(50).resolve(10), 5);
        assert_eq!(TargetInstances::percentage(33).resolve(10), 3);
        assert_eq!(TargetInstances::percentage(25).resolve(2), 1);
        assert_eq!(TargetInstances::percentage(35).resolve(10), 4);
        assert_eq!(TargetInstances::percentage(100).resolve(4), 4);
    }

    #[test]
    fn percentage_never_drops_below_one() {
        assert_eq!(TargetInstances::percentage(10).resolve(2), 1);
        assert_eq!(TargetInstances::percentage(0).resolve(10), 1);
        assert!(TargetInstances::percentage(10).raised_to_minimum(2));
        assert!(!TargetInstances::percentage(50).raised_to_minimum(2));
    }

    #[test]
    fn out_of_range_is_rejected() {
        assert!(TargetInstances::percentage(101).validate().is_err());
        assert!(TargetInstances::percentage(-1).validate().is_err());
        assert!(TargetInstances::count(-2).validate().is_err());
        assert!(TargetInstances::count(0).validate().is_ok());
    }

    #[test]
    fn serde_uses_upper_case_units() {
        let t: TargetInstances = serde_json::from_str(r#"{"unit":"PERCENTAGE","value":50}"#).unwrap();
        assert_eq!(t, TargetInstances::percentage(50));
    }
}
