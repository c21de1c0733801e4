/// Reactive Tables Column Implementation
///
/// A Column is an overwrite-indexed sequence of fields addressed by row index.
/// Every field is either a value of the column's declared type or empty.
/// Deleting a row clears its slot without compacting the column, so the slot
/// is reused when the row index is recycled.
///
/// # Unique Index
///
/// A column can carry a unique index mapping each stored value to the row
/// holding it. Storing a value that another live row already holds is
/// rejected with [`Error::DuplicateKey`] instead of overwriting the entry.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Column data types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
    Bool,
    /// Fixed-point decimal, see [`Decimal`]
    Decimal,
    /// Absolute UTC timestamp
    DateTime,
    Duration,
    Uuid,
    Byte,
    /// A single UTF-16 code unit
    Char,
}

impl ColumnType {
    /// Returns true for types that can be summed and averaged.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ColumnType::Int16
                | ColumnType::Int32
                | ColumnType::Int64
                | ColumnType::Float32
                | ColumnType::Float64
                | ColumnType::Decimal
                | ColumnType::Byte
        )
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            ColumnType::Int16 | ColumnType::Int32 | ColumnType::Int64 | ColumnType::Byte
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, ColumnType::Float32 | ColumnType::Float64)
    }
}

/// Fixed-point decimal number: `mantissa * 10^-scale`.
///
/// Equality, hashing and ordering are numeric, so `1.50` and `1.5` are the
/// same value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Decimal {
    mantissa: i128,
    scale: u8,
}

impl Decimal {
    /// Largest supported scale; 10^38 still fits in an i128.
    pub const MAX_SCALE: u8 = 38;

    pub fn new(mantissa: i128, scale: u8) -> Self {
        Decimal {
            mantissa,
            scale: scale.min(Self::MAX_SCALE),
        }
    }

    pub fn zero() -> Self {
        Decimal::new(0, 0)
    }

    pub fn mantissa(&self) -> i128 {
        self.mantissa
    }

    pub fn scale(&self) -> u8 {
        self.scale
    }

    pub fn to_f64(&self) -> f64 {
        self.mantissa as f64 / 10f64.powi(self.scale as i32)
    }

    /// Re-expresses the value at a larger scale, or `None` on overflow.
    ///
    /// Reducing the scale is only possible without loss of precision, so a
    /// smaller target scale also returns `None` unless the digits are zero.
    pub fn rescale(&self, scale: u8) -> Option<Decimal> {
        if scale > Self::MAX_SCALE {
            return None;
        }
        match scale.cmp(&self.scale) {
            Ordering::Equal => Some(*self),
            Ordering::Greater => {
                let factor = 10i128.checked_pow((scale - self.scale) as u32)?;
                Some(Decimal::new(self.mantissa.checked_mul(factor)?, scale))
            }
            Ordering::Less => {
                let factor = 10i128.checked_pow((self.scale - scale) as u32)?;
                if self.mantissa % factor != 0 {
                    return None;
                }
                Some(Decimal::new(self.mantissa / factor, scale))
            }
        }
    }

    /// Strips trailing zero digits from the fraction.
    pub fn normalize(&self) -> Decimal {
        let mut mantissa = self.mantissa;
        let mut scale = self.scale;
        while scale > 0 && mantissa % 10 == 0 {
            mantissa /= 10;
            scale -= 1;
        }
        Decimal { mantissa, scale }
    }

    pub fn checked_add(&self, other: &Decimal) -> Option<Decimal> {
        let scale = self.scale.max(other.scale);
        let a = self.rescale(scale)?;
        let b = other.rescale(scale)?;
        Some(Decimal::new(a.mantissa.checked_add(b.mantissa)?, scale))
    }

    pub fn checked_sub(&self, other: &Decimal) -> Option<Decimal> {
        let negated = Decimal::new(other.mantissa.checked_neg()?, other.scale);
        self.checked_add(&negated)
    }
}

impl PartialEq for Decimal {
    fn eq(&self, other: &Self) -> bool {
        let a = self.normalize();
        let b = other.normalize();
        a.mantissa == b.mantissa && a.scale == b.scale
    }
}

impl Eq for Decimal {}

impl Hash for Decimal {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let n = self.normalize();
        n.mantissa.hash(state);
        n.scale.hash(state);
    }
}

impl Ord for Decimal {
    fn cmp(&self, other: &Self) -> Ordering {
        if self == other {
            return Ordering::Equal;
        }
        let scale = self.scale.max(other.scale);
        match (self.rescale(scale), other.rescale(scale)) {
            (Some(a), Some(b)) => a.mantissa.cmp(&b.mantissa),
            // Out of i128 range at the common scale; f64 keeps the magnitude.
            _ => self.to_f64().total_cmp(&other.to_f64()),
        }
    }
}

impl PartialOrd for Decimal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.mantissa);
        }
        let sign = if self.mantissa < 0 { "-" } else { "" };
        let digits = self.mantissa.unsigned_abs().to_string();
        let scale = self.scale as usize;
        let padded = if digits.len() <= scale {
            format!("{}{}", "0".repeat(scale - digits.len() + 1), digits)
        } else {
            digits
        };
        let (int_part, frac_part) = padded.split_at(padded.len() - scale);
        write!(f, "{}{}.{}", sign, int_part, frac_part)
    }
}

/// Column value enum to support multiple types
///
/// `Null` is the empty sentinel returned when reading a field that holds no
/// value; it is never stored explicitly.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Bool(bool),
    Decimal(Decimal),
    DateTime(DateTime<Utc>),
    Duration(chrono::Duration),
    Uuid(Uuid),
    Byte(u8),
    Char(u16),
    Null,
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    /// Returns the declared type this value belongs to, `None` for `Null`.
    pub fn column_type(&self) -> Option<ColumnType> {
        Some(match self {
            ColumnValue::Int16(_) => ColumnType::Int16,
            ColumnValue::Int32(_) => ColumnType::Int32,
            ColumnValue::Int64(_) => ColumnType::Int64,
            ColumnValue::Float32(_) => ColumnType::Float32,
            ColumnValue::Float64(_) => ColumnType::Float64,
            ColumnValue::String(_) => ColumnType::String,
            ColumnValue::Bool(_) => ColumnType::Bool,
            ColumnValue::Decimal(_) => ColumnType::Decimal,
            ColumnValue::DateTime(_) => ColumnType::DateTime,
            ColumnValue::Duration(_) => ColumnType::Duration,
            ColumnValue::Uuid(_) => ColumnType::Uuid,
            ColumnValue::Byte(_) => ColumnType::Byte,
            ColumnValue::Char(_) => ColumnType::Char,
            ColumnValue::Null => return None,
        })
    }

    pub fn as_i16(&self) -> Option<i16> {
        match self {
            ColumnValue::Int16(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            ColumnValue::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ColumnValue::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            ColumnValue::Float32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ColumnValue::Float64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            ColumnValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ColumnValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            ColumnValue::Decimal(v) => Some(*v),
            _ => None,
        }
    }

    /// Widens any integer value to i128.
    pub fn to_i128(&self) -> Option<i128> {
        match self {
            ColumnValue::Int16(v) => Some(*v as i128),
            ColumnValue::Int32(v) => Some(*v as i128),
            ColumnValue::Int64(v) => Some(*v as i128),
            ColumnValue::Byte(v) => Some(*v as i128),
            _ => None,
        }
    }

    /// Converts any numeric value to f64, possibly losing precision.
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            ColumnValue::Float32(v) => Some(*v as f64),
            ColumnValue::Float64(v) => Some(*v),
            ColumnValue::Decimal(v) => Some(v.to_f64()),
            other => other.to_i128().map(|v| v as f64),
        }
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnValue::Int16(v) => write!(f, "{}", v),
            ColumnValue::Int32(v) => write!(f, "{}", v),
            ColumnValue::Int64(v) => write!(f, "{}", v),
            ColumnValue::Float32(v) => write!(f, "{}", v),
            ColumnValue::Float64(v) => write!(f, "{}", v),
            ColumnValue::String(v) => write!(f, "{}", v),
            ColumnValue::Bool(v) => write!(f, "{}", v),
            ColumnValue::Decimal(v) => write!(f, "{}", v),
            ColumnValue::DateTime(v) => write!(f, "{}", v.to_rfc3339()),
            ColumnValue::Duration(v) => write!(f, "{}", v),
            ColumnValue::Uuid(v) => write!(f, "{}", v),
            ColumnValue::Byte(v) => write!(f, "{}", v),
            ColumnValue::Char(v) => match char::from_u32(*v as u32) {
                Some(c) => write!(f, "{}", c),
                None => write!(f, "\\u{{{:04x}}}", v),
            },
            ColumnValue::Null => write!(f, "null"),
        }
    }
}

/// A [`ColumnValue`] usable as a map key.
///
/// Floats compare by their IEEE total order with `-0.0` folded into `0.0`,
/// which gives every value a consistent `Eq`, `Hash` and `Ord`. Values of
/// different types order by type, with `Null` first.
#[derive(Debug, Clone)]
pub struct ValueKey(ColumnValue);

impl ValueKey {
    pub fn new(value: ColumnValue) -> Self {
        ValueKey(value)
    }

    pub fn value(&self) -> &ColumnValue {
        &self.0
    }

    pub fn into_value(self) -> ColumnValue {
        self.0
    }

    fn rank(&self) -> u8 {
        match &self.0 {
            ColumnValue::Null => 0,
            ColumnValue::Int16(_) => 1,
            ColumnValue::Int32(_) => 2,
            ColumnValue::Int64(_) => 3,
            ColumnValue::Float32(_) => 4,
            ColumnValue::Float64(_) => 5,
            ColumnValue::String(_) => 6,
            ColumnValue::Bool(_) => 7,
            ColumnValue::Decimal(_) => 8,
            ColumnValue::DateTime(_) => 9,
            ColumnValue::Duration(_) => 10,
            ColumnValue::Uuid(_) => 11,
            ColumnValue::Byte(_) => 12,
            ColumnValue::Char(_) => 13,
        }
    }
}

fn fold_zero32(v: f32) -> f32 {
    if v == 0.0 {
        0.0
    } else {
        v
    }
}

fn fold_zero64(v: f64) -> f64 {
    if v == 0.0 {
        0.0
    } else {
        v
    }
}

impl From<ColumnValue> for ValueKey {
    fn from(value: ColumnValue) -> Self {
        ValueKey(value)
    }
}

impl PartialEq for ValueKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ValueKey {}

impl Hash for ValueKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match &self.0 {
            ColumnValue::Int16(v) => v.hash(state),
            ColumnValue::Int32(v) => v.hash(state),
            ColumnValue::Int64(v) => v.hash(state),
            ColumnValue::Float32(v) => fold_zero32(*v).to_bits().hash(state),
            ColumnValue::Float64(v) => fold_zero64(*v).to_bits().hash(state),
            ColumnValue::String(v) => v.hash(state),
            ColumnValue::Bool(v) => v.hash(state),
            ColumnValue::Decimal(v) => v.hash(state),
            ColumnValue::DateTime(v) => v.hash(state),
            ColumnValue::Duration(v) => v.hash(state),
            ColumnValue::Uuid(v) => v.hash(state),
            ColumnValue::Byte(v) => v.hash(state),
            ColumnValue::Char(v) => v.hash(state),
            ColumnValue::Null => {}
        }
    }
}

impl Ord for ValueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.0, &other.0) {
            (ColumnValue::Int16(a), ColumnValue::Int16(b)) => a.cmp(b),
            (ColumnValue::Int32(a), ColumnValue::Int32(b)) => a.cmp(b),
            (ColumnValue::Int64(a), ColumnValue::Int64(b)) => a.cmp(b),
            (ColumnValue::Float32(a), ColumnValue::Float32(b)) => {
                fold_zero32(*a).total_cmp(&fold_zero32(*b))
            }
            (ColumnValue::Float64(a), ColumnValue::Float64(b)) => {
                fold_zero64(*a).total_cmp(&fold_zero64(*b))
            }
            (ColumnValue::String(a), ColumnValue::String(b)) => a.cmp(b),
            (ColumnValue::Bool(a), ColumnValue::Bool(b)) => a.cmp(b),
            (ColumnValue::Decimal(a), ColumnValue::Decimal(b)) => a.cmp(b),
            (ColumnValue::DateTime(a), ColumnValue::DateTime(b)) => a.cmp(b),
            (ColumnValue::Duration(a), ColumnValue::Duration(b)) => a.cmp(b),
            (ColumnValue::Uuid(a), ColumnValue::Uuid(b)) => a.cmp(b),
            (ColumnValue::Byte(a), ColumnValue::Byte(b)) => a.cmp(b),
            (ColumnValue::Char(a), ColumnValue::Char(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for ValueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A typed column of fields indexed by row.
pub struct Column {
    name: String,
    column_type: ColumnType,
    slots: Vec<Option<ColumnValue>>,
    /// Present only for unique columns: value -> row holding it
    index: Option<HashMap<ValueKey, usize>>,
}

impl Column {
    pub fn new(name: String, column_type: ColumnType) -> Self {
        Column {
            name,
            column_type,
            slots: Vec::new(),
            index: None,
        }
    }

    /// Create a column whose values must be unique across live rows.
    pub fn new_unique(name: String, column_type: ColumnType) -> Self {
        Column {
            index: Some(HashMap::new()),
            ..Column::new(name, column_type)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    pub fn is_unique(&self) -> bool {
        self.index.is_some()
    }

    /// Returns the field value, or `Null` if the field is empty.
    pub fn get(&self, row: usize) -> ColumnValue {
        self.get_ref(row).cloned().unwrap_or(ColumnValue::Null)
    }

    pub fn get_ref(&self, row: usize) -> Option<&ColumnValue> {
        self.slots.get(row).and_then(|slot| slot.as_ref())
    }

    pub fn has_value(&self, row: usize) -> bool {
        self.get_ref(row).is_some()
    }

    /// Check that a value may be stored in this column.
    pub fn check_type(&self, value: &ColumnValue) -> Result<()> {
        match value.column_type() {
            Some(ty) if ty == self.column_type => Ok(()),
            actual => Err(Error::TypeMismatch {
                column: self.name.clone(),
                expected: self.column_type,
                actual,
            }),
        }
    }

    /// Store a value, returning the previous one.
    ///
    /// The column grows to cover `row` if needed. On error nothing changes.
    pub fn set(&mut self, row: usize, value: ColumnValue) -> Result<Option<ColumnValue>> {
        self.check_type(&value)?;

        if let Some(index) = self.index.as_mut() {
            let key = ValueKey::new(value.clone());
            match index.get(&key) {
                Some(&holder) if holder != row => {
                    return Err(Error::DuplicateKey(self.name.clone()));
                }
                _ => {}
            }
            if let Some(Some(old)) = self.slots.get(row) {
                index.remove(&ValueKey::new(old.clone()));
            }
            index.insert(key, row);
        }

        if row >= self.slots.len() {
            self.slots.resize(row + 1, None);
        }
        Ok(self.slots[row].replace(value))
    }

    /// Clear a field, returning the value it held.
    pub fn clear(&mut self, row: usize) -> Option<ColumnValue> {
        let old = self.slots.get_mut(row).and_then(|slot| slot.take());
        if let (Some(index), Some(value)) = (self.index.as_mut(), old.as_ref()) {
            index.remove(&ValueKey::new(value.clone()));
        }
        old
    }

    /// Look up the row holding a value in a unique column.
    pub fn find(&self, value: &ColumnValue) -> Option<usize> {
        self.index
            .as_ref()
            .and_then(|index| index.get(&ValueKey::new(value.clone())).copied())
    }
}

impl fmt::Debug for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Column")
            .field("name", &self.name)
            .field("column_type", &self.column_type)
            .field("unique", &self.is_unique())
            .finish()
    }
}
