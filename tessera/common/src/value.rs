use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

/// Temporal payloads carried by [`PropertyValue::Temporal`].
///
/// The derived ordering ranks the kinds in declaration order and compares
/// payloads within one kind, which is the fixed order indexes rely on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum TemporalValue {
    Date(NaiveDate),
    LocalTime(NaiveTime),
    LocalDateTime(NaiveDateTime),
    /// Signed duration in microseconds.
    Duration(i64),
}

/// Dynamic type tag of a property value, used by primary-key schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyDataType {
    Bool,
    Int,
    Double,
    String,
    List,
    Map,
    Date,
    LocalTime,
    LocalDateTime,
    Duration,
}

impl std::fmt::Display for PropertyDataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PropertyDataType::Bool => "BOOL",
            PropertyDataType::Int => "INT",
            PropertyDataType::Double => "DOUBLE",
            PropertyDataType::String => "STRING",
            PropertyDataType::List => "LIST",
            PropertyDataType::Map => "MAP",
            PropertyDataType::Date => "DATE",
            PropertyDataType::LocalTime => "LOCAL TIME",
            PropertyDataType::LocalDateTime => "LOCAL DATE TIME",
            PropertyDataType::Duration => "DURATION",
        };
        f.write_str(name)
    }
}

/// A value as it arrives from an external client, before the engine has
/// accepted it. Variants the storage engine does not model (raw bytes,
/// spatial points) are mapped to [`PropertyValue::Null`] on conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    List(Vec<WireValue>),
    Map(BTreeMap<String, WireValue>),
    Temporal(TemporalValue),
    Bytes(Vec<u8>),
    Point2d { srid: u16, x: f64, y: f64 },
    Point3d { srid: u16, x: f64, y: f64, z: f64 },
}

/// The tagged value carrier stored in vertex and edge properties.
///
/// Equality is structural and type-strict: `Int(1) != Double(1.0)`. The
/// [`Ord`] implementation is the fixed cross-type total order used by the
/// label-property index: Null < Bool < Int/Double (numeric order, NaN last)
/// < String < List < Map < Temporal. Within the merged numeric band a tie
/// between an int and a double orders the int first, keeping `Ord`
/// consistent with the type-strict `Eq`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum PropertyValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    List(Vec<PropertyValue>),
    Map(BTreeMap<String, PropertyValue>),
    Temporal(TemporalValue),
}

impl PropertyValue {
    /// Converts an external wire value, mapping unsupported variants to
    /// `Null`.
    pub fn from_wire(value: WireValue) -> Self {
        match value {
            WireValue::Null => PropertyValue::Null,
            WireValue::Bool(v) => PropertyValue::Bool(v),
            WireValue::Int(v) => PropertyValue::Int(v),
            WireValue::Double(v) => PropertyValue::Double(v),
            WireValue::String(v) => PropertyValue::String(v),
            WireValue::List(vs) => {
                PropertyValue::List(vs.into_iter().map(PropertyValue::from_wire).collect())
            }
            WireValue::Map(m) => PropertyValue::Map(
                m.into_iter()
                    .map(|(k, v)| (k, PropertyValue::from_wire(v)))
                    .collect(),
            ),
            WireValue::Temporal(t) => PropertyValue::Temporal(t),
            // Variants the storage layer does not model.
            WireValue::Bytes(_) | WireValue::Point2d { .. } | WireValue::Point3d { .. } => {
                PropertyValue::Null
            }
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }

    /// Returns the dynamic type tag, or `None` for `Null`.
    pub fn data_type(&self) -> Option<PropertyDataType> {
        match self {
            PropertyValue::Null => None,
            PropertyValue::Bool(_) => Some(PropertyDataType::Bool),
            PropertyValue::Int(_) => Some(PropertyDataType::Int),
            PropertyValue::Double(_) => Some(PropertyDataType::Double),
            PropertyValue::String(_) => Some(PropertyDataType::String),
            PropertyValue::List(_) => Some(PropertyDataType::List),
            PropertyValue::Map(_) => Some(PropertyDataType::Map),
            PropertyValue::Temporal(TemporalValue::Date(_)) => Some(PropertyDataType::Date),
            PropertyValue::Temporal(TemporalValue::LocalTime(_)) => {
                Some(PropertyDataType::LocalTime)
            }
            PropertyValue::Temporal(TemporalValue::LocalDateTime(_)) => {
                Some(PropertyDataType::LocalDateTime)
            }
            PropertyValue::Temporal(TemporalValue::Duration(_)) => {
                Some(PropertyDataType::Duration)
            }
        }
    }

    /// Rank of the variant in the cross-type total order. Int and Double
    /// share a rank and are merged numerically.
    fn type_rank(&self) -> u8 {
        match self {
            PropertyValue::Null => 0,
            PropertyValue::Bool(_) => 1,
            PropertyValue::Int(_) | PropertyValue::Double(_) => 2,
            PropertyValue::String(_) => 3,
            PropertyValue::List(_) => 4,
            PropertyValue::Map(_) => 5,
            PropertyValue::Temporal(_) => 6,
        }
    }
}

impl PartialEq for PropertyValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PropertyValue::Null, PropertyValue::Null) => true,
            (PropertyValue::Bool(a), PropertyValue::Bool(b)) => a == b,
            (PropertyValue::Int(a), PropertyValue::Int(b)) => a == b,
            // total_cmp keeps Eq reflexive in the presence of NaN.
            (PropertyValue::Double(a), PropertyValue::Double(b)) => {
                a.total_cmp(b) == Ordering::Equal
            }
            (PropertyValue::String(a), PropertyValue::String(b)) => a == b,
            (PropertyValue::List(a), PropertyValue::List(b)) => a == b,
            (PropertyValue::Map(a), PropertyValue::Map(b)) => a == b,
            (PropertyValue::Temporal(a), PropertyValue::Temporal(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for PropertyValue {}

impl PartialOrd for PropertyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PropertyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (PropertyValue::Null, PropertyValue::Null) => Ordering::Equal,
            (PropertyValue::Bool(a), PropertyValue::Bool(b)) => a.cmp(b),
            (PropertyValue::Int(a), PropertyValue::Int(b)) => a.cmp(b),
            (PropertyValue::Double(a), PropertyValue::Double(b)) => cmp_doubles(*a, *b),
            (PropertyValue::Int(a), PropertyValue::Double(b)) => cmp_int_double(*a, *b),
            (PropertyValue::Double(a), PropertyValue::Int(b)) => cmp_int_double(*b, *a).reverse(),
            (PropertyValue::String(a), PropertyValue::String(b)) => a.cmp(b),
            (PropertyValue::List(a), PropertyValue::List(b)) => a.cmp(b),
            // BTreeMap iterates key-sorted, so this is lexicographic over
            // sorted (key, value) pairs.
            (PropertyValue::Map(a), PropertyValue::Map(b)) => a.iter().cmp(b.iter()),
            (PropertyValue::Temporal(a), PropertyValue::Temporal(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

/// Numeric order with every NaN sorting after every ordinary number.
fn cmp_doubles(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.total_cmp(&b),
    }
}

/// Orders an int against a double numerically; exact ties order the int
/// first so that the relation stays antisymmetric under `Eq`'s type
/// strictness.
fn cmp_int_double(i: i64, d: f64) -> Ordering {
    if d.is_nan() {
        return Ordering::Less;
    }
    let approx = (i as f64).total_cmp(&d);
    if approx != Ordering::Equal {
        return approx;
    }
    // The cast above rounds beyond 2^53; disambiguate on the integral part
    // before declaring a numeric tie.
    let di = d as i64;
    i.cmp(&di).then(Ordering::Less)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_type_strict() {
        assert_ne!(PropertyValue::Int(1), PropertyValue::Double(1.0));
        assert_eq!(PropertyValue::Int(1), PropertyValue::Int(1));
        assert_eq!(
            PropertyValue::Double(f64::NAN),
            PropertyValue::Double(f64::NAN)
        );
    }

    #[test]
    fn cross_type_rank_order() {
        let ordered = [
            PropertyValue::Null,
            PropertyValue::Bool(true),
            PropertyValue::Int(-5),
            PropertyValue::Double(3.5),
            PropertyValue::Double(f64::NAN),
            PropertyValue::String("a".into()),
            PropertyValue::List(vec![PropertyValue::Int(1)]),
            PropertyValue::Map(BTreeMap::new()),
            PropertyValue::Temporal(TemporalValue::Duration(1)),
        ];
        for window in ordered.windows(2) {
            assert!(window[0] < window[1], "{:?} !< {:?}", window[0], window[1]);
        }
    }

    #[test]
    fn ints_and_doubles_merge_numerically() {
        assert!(PropertyValue::Int(1) < PropertyValue::Double(1.5));
        assert!(PropertyValue::Double(1.5) < PropertyValue::Int(2));
        // Numeric tie: int sorts first.
        assert!(PropertyValue::Int(1) < PropertyValue::Double(1.0));
        // NaN sorts after every ordinary number.
        assert!(PropertyValue::Int(i64::MAX) < PropertyValue::Double(f64::NAN));
    }

    #[test]
    fn list_order_is_lexicographic() {
        let short = PropertyValue::List(vec![PropertyValue::Int(1)]);
        let long = PropertyValue::List(vec![PropertyValue::Int(1), PropertyValue::Int(0)]);
        assert!(short < long);
    }

    #[test]
    fn wire_conversion_rejects_unsupported_as_null() {
        assert_eq!(
            PropertyValue::from_wire(WireValue::Bytes(vec![1, 2, 3])),
            PropertyValue::Null
        );
        assert_eq!(
            PropertyValue::from_wire(WireValue::Point2d {
                srid: 4326,
                x: 1.0,
                y: 2.0
            }),
            PropertyValue::Null
        );
        // Unsupported variants nested in containers degrade to Null in place.
        let nested = WireValue::List(vec![WireValue::Int(1), WireValue::Bytes(vec![0])]);
        assert_eq!(
            PropertyValue::from_wire(nested),
            PropertyValue::List(vec![PropertyValue::Int(1), PropertyValue::Null])
        );
    }

    #[test]
    fn data_type_tags() {
        assert_eq!(PropertyValue::Null.data_type(), None);
        assert_eq!(
            PropertyValue::Int(1).data_type(),
            Some(PropertyDataType::Int)
        );
        assert_eq!(
            PropertyValue::Temporal(TemporalValue::Duration(5)).data_type(),
            Some(PropertyDataType::Duration)
        );
    }
}
