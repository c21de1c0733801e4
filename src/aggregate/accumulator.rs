/// Incremental folds used by aggregated tables.
///
/// An accumulator sees every value entering (`add_value`) and leaving
/// (`remove_value`) its bucket, so `current_value` always reflects exactly the
/// current members. Empty (`Null`) values are counted by `Count` and skipped
/// by every other fold.

use crate::column::{ColumnType, ColumnValue, Decimal, ValueKey};
use std::collections::BTreeMap;

/// Built-in aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateKind {
    /// Number of member rows
    Count,
    /// Exact total for integer, decimal and duration sources. Float totals
    /// are compensated but can still differ from a fresh sum by rounding.
    Sum,
    /// Total divided by the number of non-empty values, `0.0` when there are none
    Average,
    Min,
    Max,
}

impl AggregateKind {
    /// Output column type for a source column type, `None` if unsupported.
    pub fn output_type(&self, source: ColumnType) -> Option<ColumnType> {
        match self {
            AggregateKind::Count => Some(ColumnType::Int64),
            AggregateKind::Sum => match source {
                ty if ty.is_integer() => Some(ColumnType::Int64),
                ty if ty.is_float() => Some(ColumnType::Float64),
                ColumnType::Decimal => Some(ColumnType::Decimal),
                ColumnType::Duration => Some(ColumnType::Duration),
                _ => None,
            },
            AggregateKind::Average => source.is_numeric().then_some(ColumnType::Float64),
            AggregateKind::Min | AggregateKind::Max => Some(source),
        }
    }

    /// Create an empty accumulator over a source column of type `source`.
    pub fn accumulator(&self, source: ColumnType) -> Box<dyn Accumulator> {
        match self {
            AggregateKind::Count => Box::new(Count::default()),
            AggregateKind::Sum => Box::new(Sum::new(source)),
            AggregateKind::Average => Box::new(Average::new(source)),
            AggregateKind::Min => Box::new(Extremum::new(false)),
            AggregateKind::Max => Box::new(Extremum::new(true)),
        }
    }
}

pub trait Accumulator {
    fn add_value(&mut self, value: &ColumnValue);

    /// Retire a value previously passed to `add_value`.
    fn remove_value(&mut self, value: &ColumnValue);

    fn current_value(&self) -> ColumnValue;
}

#[derive(Debug, Default)]
pub struct Count {
    members: i64,
}

impl Accumulator for Count {
    fn add_value(&mut self, _value: &ColumnValue) {
        self.members += 1;
    }

    fn remove_value(&mut self, _value: &ColumnValue) {
        self.members -= 1;
    }

    fn current_value(&self) -> ColumnValue {
        ColumnValue::Int64(self.members)
    }
}

/// Decimal total kept as one mantissa total per scale.
///
/// Adding and retiring touch only the value's own scale, so both always
/// succeed and cancel exactly. Scales are combined only when the total is
/// read.
#[derive(Debug, Clone, Default)]
struct DecimalTotal {
    /// scale -> (mantissa total, values at that scale)
    by_scale: BTreeMap<u8, (i128, usize)>,
}

impl DecimalTotal {
    fn apply(&mut self, value: &Decimal, retire: bool) {
        let entry = self.by_scale.entry(value.scale()).or_insert((0, 0));
        if retire {
            entry.0 = entry.0.wrapping_sub(value.mantissa());
            entry.1 = entry.1.saturating_sub(1);
        } else {
            entry.0 = entry.0.wrapping_add(value.mantissa());
            entry.1 += 1;
        }
        if entry.1 == 0 {
            self.by_scale.remove(&value.scale());
        }
    }

    /// The total at the finest scale that fits in an i128.
    ///
    /// When the exact total does not fit, digits beyond the chosen scale are
    /// truncated.
    fn value(&self) -> Decimal {
        let finest = self.by_scale.keys().next_back().copied().unwrap_or(0);
        (0..=finest)
            .rev()
            .find_map(|scale| self.at_scale(scale))
            .unwrap_or_else(|| {
                let bound = if self.to_f64() < 0.0 { i128::MIN } else { i128::MAX };
                Decimal::new(bound, 0)
            })
    }

    fn at_scale(&self, scale: u8) -> Option<Decimal> {
        let mut total: i128 = 0;
        for (&s, &(mantissa, _)) in &self.by_scale {
            let term = if s <= scale {
                mantissa.checked_mul(10i128.checked_pow((scale - s) as u32)?)?
            } else {
                mantissa / 10i128.checked_pow((s - scale) as u32)?
            };
            total = total.checked_add(term)?;
        }
        Some(Decimal::new(total, scale))
    }

    fn to_f64(&self) -> f64 {
        self.by_scale
            .iter()
            .map(|(&scale, &(mantissa, _))| mantissa as f64 / 10f64.powi(scale as i32))
            .sum()
    }
}

/// Running total kept at full precision for the source type.
///
/// Integer, decimal and duration totals are exact: retiring a value undoes
/// its addition. Float totals carry a Neumaier compensation term, which
/// keeps small members visible after large ones leave but is not exact.
#[derive(Debug, Clone)]
enum Total {
    Integer(i128),
    Float { sum: f64, compensation: f64 },
    Decimal(DecimalTotal),
    /// Nanoseconds
    Duration(i128),
}

impl Total {
    fn for_type(source: ColumnType) -> Total {
        match source {
            ColumnType::Decimal => Total::Decimal(DecimalTotal::default()),
            ColumnType::Duration => Total::Duration(0),
            ty if ty.is_float() => Total::Float {
                sum: 0.0,
                compensation: 0.0,
            },
            _ => Total::Integer(0),
        }
    }

    fn apply(&mut self, value: &ColumnValue, retire: bool) {
        match (self, value) {
            (Total::Integer(total), value) => {
                if let Some(v) = value.to_i128() {
                    *total = if retire { total.wrapping_sub(v) } else { total.wrapping_add(v) };
                }
            }
            (Total::Float { sum, compensation }, value) => {
                if let Some(v) = value.to_f64() {
                    let v = if retire { -v } else { v };
                    let next = *sum + v;
                    if sum.abs() >= v.abs() {
                        *compensation += (*sum - next) + v;
                    } else {
                        *compensation += (v - next) + *sum;
                    }
                    *sum = next;
                }
            }
            (Total::Decimal(total), ColumnValue::Decimal(v)) => total.apply(v, retire),
            (Total::Duration(total), ColumnValue::Duration(v)) => {
                let nanos = v.num_seconds() as i128 * 1_000_000_000 + v.subsec_nanos() as i128;
                *total = if retire { total.wrapping_sub(nanos) } else { total.wrapping_add(nanos) };
            }
            _ => {}
        }
    }

    fn value(&self) -> ColumnValue {
        match self {
            Total::Integer(t) => ColumnValue::Int64((*t).clamp(i64::MIN as i128, i64::MAX as i128) as i64),
            Total::Float { sum, compensation } => ColumnValue::Float64(sum + compensation),
            Total::Decimal(t) => ColumnValue::Decimal(t.value()),
            Total::Duration(t) => ColumnValue::Duration(duration_from_nanos(*t)),
        }
    }

    fn to_f64(&self) -> f64 {
        match self {
            Total::Integer(t) => *t as f64,
            Total::Float { sum, compensation } => sum + compensation,
            Total::Decimal(t) => t.to_f64(),
            Total::Duration(t) => (*t / 1_000_000) as f64,
        }
    }
}

/// Saturates at the range `chrono::Duration` can hold.
fn duration_from_nanos(nanos: i128) -> chrono::Duration {
    let secs = nanos / 1_000_000_000;
    let subsec = (nanos % 1_000_000_000) as i64;
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|d| d.checked_add(&chrono::Duration::nanoseconds(subsec)))
        .or_else(|| chrono::Duration::try_milliseconds(if nanos < 0 { -i64::MAX } else { i64::MAX }))
        .unwrap_or_else(chrono::Duration::zero)
}

#[derive(Debug)]
pub struct Sum {
    total: Total,
}

impl Sum {
    pub fn new(source: ColumnType) -> Self {
        Sum {
            total: Total::for_type(source),
        }
    }
}

impl Accumulator for Sum {
    fn add_value(&mut self, value: &ColumnValue) {
        self.total.apply(value, false);
    }

    fn remove_value(&mut self, value: &ColumnValue) {
        self.total.apply(value, true);
    }

    fn current_value(&self) -> ColumnValue {
        self.total.value()
    }
}

#[derive(Debug)]
pub struct Average {
    total: Total,
    count: usize,
}

impl Average {
    pub fn new(source: ColumnType) -> Self {
        Average {
            total: Total::for_type(source),
            count: 0,
        }
    }
}

impl Accumulator for Average {
    fn add_value(&mut self, value: &ColumnValue) {
        if !value.is_null() {
            self.total.apply(value, false);
            self.count += 1;
        }
    }

    fn remove_value(&mut self, value: &ColumnValue) {
        if !value.is_null() {
            self.total.apply(value, true);
            self.count -= 1;
        }
    }

    fn current_value(&self) -> ColumnValue {
        if self.count == 0 {
            return ColumnValue::Float64(0.0);
        }
        ColumnValue::Float64(self.total.to_f64() / self.count as f64)
    }
}

/// Min or Max over an ordered multiset of values.
///
/// Removal is O(log n); no rescan of the bucket is ever needed.
#[derive(Debug)]
pub struct Extremum {
    values: BTreeMap<ValueKey, usize>,
    max: bool,
}

impl Extremum {
    pub fn new(max: bool) -> Self {
        Extremum {
            values: BTreeMap::new(),
            max,
        }
    }
}

impl Accumulator for Extremum {
    fn add_value(&mut self, value: &ColumnValue) {
        if !value.is_null() {
            *self.values.entry(ValueKey::new(value.clone())).or_insert(0) += 1;
        }
    }

    fn remove_value(&mut self, value: &ColumnValue) {
        if value.is_null() {
            return;
        }
        let key = ValueKey::new(value.clone());
        if let Some(count) = self.values.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                self.values.remove(&key);
            }
        }
    }

    fn current_value(&self) -> ColumnValue {
        let entry = if self.max {
            self.values.keys().next_back()
        } else {
            self.values.keys().next()
        };
        entry.map(|k| k.value().clone()).unwrap_or(ColumnValue::Null)
    }
}
