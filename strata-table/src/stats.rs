//! Per-column statistics maintained alongside row-group data.
//!
//! Statistics are approximate upper bounds: appends merge new data in, but
//! deletes and reverts do not shrink them.

use arrow::array::{Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::compute::cast;
use arrow::datatypes::DataType;

use strata_result::Result;
use strata_storage::{ColumnStatsData, StatsValue};

/// Runtime wrapper around the persisted stats record.
#[derive(Clone, Debug, Default)]
pub struct ColumnStatistics {
    data: ColumnStatsData,
}

impl ColumnStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_data(data: ColumnStatsData) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &ColumnStatsData {
        &self.data
    }

    pub fn has_null(&self) -> bool {
        self.data.has_null
    }

    pub fn count(&self) -> u64 {
        self.data.count
    }

    pub fn min(&self) -> Option<&StatsValue> {
        self.data.min.as_ref()
    }

    pub fn max(&self) -> Option<&StatsValue> {
        self.data.max.as_ref()
    }

    pub fn set_has_null(&mut self, has_null: bool) {
        self.data.has_null = has_null;
    }

    /// Merge one appended array into the statistics.
    pub fn merge_array(&mut self, array: &ArrayRef) -> Result<()> {
        self.data.count += array.len() as u64;
        if array.null_count() > 0 {
            self.data.has_null = true;
        }

        let (min, max) = match array_bounds(array)? {
            Some(bounds) => bounds,
            None => return Ok(()),
        };
        self.data.min = merge_bound(self.data.min.take(), min, true);
        self.data.max = merge_bound(self.data.max.take(), max, false);
        Ok(())
    }
}

fn merge_bound(
    current: Option<StatsValue>,
    incoming: StatsValue,
    is_min: bool,
) -> Option<StatsValue> {
    let Some(current) = current else {
        return Some(incoming);
    };
    let keep_current = match (&current, &incoming) {
        (StatsValue::Int64(a), StatsValue::Int64(b)) => {
            if is_min { a <= b } else { a >= b }
        }
        (StatsValue::Float64Bits(a), StatsValue::Float64Bits(b)) => {
            let (a, b) = (f64::from_bits(*a), f64::from_bits(*b));
            if is_min { a <= b } else { a >= b }
        }
        (StatsValue::Utf8(a), StatsValue::Utf8(b)) => {
            if is_min { a <= b } else { a >= b }
        }
        (StatsValue::Boolean(a), StatsValue::Boolean(b)) => {
            if is_min { a <= b } else { a >= b }
        }
        // Mixed representations: keep what we have.
        _ => true,
    };
    Some(if keep_current { current } else { incoming })
}

/// Compute (min, max) of the non-null values in `array`, normalized to the
/// stats scalar domain. Returns `None` for types without ordered stats or
/// all-null arrays.
fn array_bounds(array: &ArrayRef) -> Result<Option<(StatsValue, StatsValue)>> {
    if array.len() == array.null_count() {
        return Ok(None);
    }

    match array.data_type() {
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32 => {
            let ints = cast(array.as_ref(), &DataType::Int64)?;
            let ints = ints.as_any().downcast_ref::<Int64Array>().expect("cast");
            let mut bounds: Option<(i64, i64)> = None;
            for value in ints.iter().flatten() {
                bounds = Some(match bounds {
                    None => (value, value),
                    Some((lo, hi)) => (lo.min(value), hi.max(value)),
                });
            }
            Ok(bounds.map(|(lo, hi)| (StatsValue::Int64(lo), StatsValue::Int64(hi))))
        }
        DataType::Float32 | DataType::Float64 => {
            let floats = cast(array.as_ref(), &DataType::Float64)?;
            let floats = floats
                .as_any()
                .downcast_ref::<Float64Array>()
                .expect("cast");
            let mut bounds: Option<(f64, f64)> = None;
            for value in floats.iter().flatten() {
                bounds = Some(match bounds {
                    None => (value, value),
                    Some((lo, hi)) => (lo.min(value), hi.max(value)),
                });
            }
            Ok(bounds.map(|(lo, hi)| {
                (
                    StatsValue::Float64Bits(lo.to_bits()),
                    StatsValue::Float64Bits(hi.to_bits()),
                )
            }))
        }
        DataType::Utf8 => {
            let strings = array.as_any().downcast_ref::<StringArray>().expect("utf8");
            let mut bounds: Option<(&str, &str)> = None;
            for value in strings.iter().flatten() {
                bounds = Some(match bounds {
                    None => (value, value),
                    Some((lo, hi)) => (lo.min(value), hi.max(value)),
                });
            }
            Ok(bounds.map(|(lo, hi)| {
                (
                    StatsValue::Utf8(lo.to_string()),
                    StatsValue::Utf8(hi.to_string()),
                )
            }))
        }
        DataType::Boolean => {
            let bools = array
                .as_any()
                .downcast_ref::<BooleanArray>()
                .expect("boolean");
            let mut bounds: Option<(bool, bool)> = None;
            for value in bools.iter().flatten() {
                bounds = Some(match bounds {
                    None => (value, value),
                    Some((lo, hi)) => (lo & value, hi | value),
                });
            }
            Ok(bounds.map(|(lo, hi)| (StatsValue::Boolean(lo), StatsValue::Boolean(hi))))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int32Array;
    use std::sync::Arc;

    #[test]
    fn merging_tracks_nulls_and_bounds() {
        let mut stats = ColumnStatistics::new();
        let first: ArrayRef = Arc::new(Int32Array::from(vec![Some(5), Some(2), None]));
        stats.merge_array(&first).expect("merge");
        assert!(stats.has_null());
        assert_eq!(stats.count(), 3);
        assert_eq!(stats.min(), Some(&StatsValue::Int64(2)));
        assert_eq!(stats.max(), Some(&StatsValue::Int64(5)));

        let second: ArrayRef = Arc::new(Int32Array::from(vec![9, 1]));
        stats.merge_array(&second).expect("merge");
        assert_eq!(stats.min(), Some(&StatsValue::Int64(1)));
        assert_eq!(stats.max(), Some(&StatsValue::Int64(9)));
    }
}
