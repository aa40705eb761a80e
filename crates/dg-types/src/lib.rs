#![forbid(unsafe_code)]

use std::fmt;

use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable identity of a record inside a population.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl From<u64> for RecordId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Fields the grouping pipeline requires to be present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripField {
    PickupDatetime,
    TotalAmount,
    Borough,
    Zone,
}

impl TripField {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PickupDatetime => "pickup_datetime",
            Self::TotalAmount => "total_amount",
            Self::Borough => "borough",
            Self::Zone => "zone",
        }
    }
}

impl fmt::Display for TripField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RecordError {
    #[error("required field `{field}` is missing")]
    MissingField { field: TripField },
}

/// Direction of a contribution to an aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sign {
    Add,
    Retract,
}

impl Sign {
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Add => 1,
            Self::Retract => -1,
        }
    }

    #[must_use]
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Add => 1.0,
            Self::Retract => -1.0,
        }
    }

    #[must_use]
    pub fn flipped(self) -> Self {
        match self {
            Self::Add => Self::Retract,
            Self::Retract => Self::Add,
        }
    }
}

impl fmt::Display for Sign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => f.write_str("+1"),
            Self::Retract => f.write_str("-1"),
        }
    }
}

/// A yellow-taxi trip after the zone lookup join.
///
/// All fields are optional: raw loads and left joins can leave holes, and the
/// grouping pipeline decides (via [`RecordError::MissingField`]) what to do
/// with them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TripRecord {
    pub vendor_id: Option<i64>,
    pub pickup_datetime: Option<NaiveDateTime>,
    pub dropoff_datetime: Option<NaiveDateTime>,
    pub passenger_count: Option<i64>,
    pub trip_distance: Option<f64>,
    pub pickup_location_id: Option<i64>,
    pub dropoff_location_id: Option<i64>,
    pub payment_type: Option<i64>,
    pub fare_amount: Option<f64>,
    pub tip_amount: Option<f64>,
    pub total_amount: Option<f64>,
    pub borough: Option<String>,
    pub zone: Option<String>,
}

impl TripRecord {
    /// Minimal record carrying only the fields the aggregate reads.
    #[must_use]
    pub fn new(
        pickup_datetime: NaiveDateTime,
        total_amount: f64,
        pickup_location_id: i64,
    ) -> Self {
        Self {
            pickup_datetime: Some(pickup_datetime),
            total_amount: Some(total_amount),
            pickup_location_id: Some(pickup_location_id),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_zone(mut self, borough: impl Into<String>, zone: impl Into<String>) -> Self {
        self.borough = Some(borough.into());
        self.zone = Some(zone.into());
        self
    }

    #[must_use]
    pub fn with_trip_distance(mut self, trip_distance: f64) -> Self {
        self.trip_distance = Some(trip_distance);
        self
    }

    /// Revenue contribution. NaN counts as missing.
    pub fn amount(&self) -> Result<f64, RecordError> {
        match self.total_amount {
            Some(v) if !v.is_nan() => Ok(v),
            _ => Err(RecordError::MissingField {
                field: TripField::TotalAmount,
            }),
        }
    }

    pub fn pickup_hour(&self) -> Result<u32, RecordError> {
        self.pickup_datetime
            .map(|ts| ts.hour())
            .ok_or(RecordError::MissingField {
                field: TripField::PickupDatetime,
            })
    }

    pub fn group_key(&self) -> Result<GroupKey, RecordError> {
        derive_key(self)
    }

    /// Basic data-quality filter applied to raw loads: positive distance and
    /// positive revenue. Short trips are kept; this is not a distance cut.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        matches!(self.trip_distance, Some(d) if d > 0.0)
            && matches!(self.total_amount, Some(a) if a > 0.0)
    }
}

/// `(borough, zone, pickup_hour)` bucket a trip contributes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    pub borough: String,
    pub zone: String,
    pub pickup_hour: u32,
}

impl GroupKey {
    #[must_use]
    pub fn new(borough: impl Into<String>, zone: impl Into<String>, pickup_hour: u32) -> Self {
        Self {
            borough: borough.into(),
            zone: zone.into(),
            pickup_hour,
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{:02}h", self.borough, self.zone, self.pickup_hour)
    }
}

/// Borrowed form of [`GroupKey`] used on aggregation hot paths so that
/// grouping does not allocate per row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKeyRef<'a> {
    pub borough: &'a str,
    pub zone: &'a str,
    pub pickup_hour: u32,
}

impl GroupKeyRef<'_> {
    #[must_use]
    pub fn to_owned_key(&self) -> GroupKey {
        GroupKey {
            borough: self.borough.to_owned(),
            zone: self.zone.to_owned(),
            pickup_hour: self.pickup_hour,
        }
    }
}

/// Derive the grouping key from the record's current field values.
///
/// Never memoized: callers re-derive whenever a record enters or leaves an
/// aggregate, so an update that moves the pickup time moves the key with it.
pub fn derive_key(record: &TripRecord) -> Result<GroupKey, RecordError> {
    derive_key_ref(record).map(|key| key.to_owned_key())
}

pub fn derive_key_ref(record: &TripRecord) -> Result<GroupKeyRef<'_>, RecordError> {
    let borough = record
        .borough
        .as_deref()
        .ok_or(RecordError::MissingField {
            field: TripField::Borough,
        })?;
    let zone = record.zone.as_deref().ok_or(RecordError::MissingField {
        field: TripField::Zone,
    })?;
    let pickup_hour = record.pickup_hour()?;

    Ok(GroupKeyRef {
        borough,
        zone,
        pickup_hour,
    })
}

/// Key and amount in one pass; this is what every aggregation path consumes.
pub fn derive_contribution(record: &TripRecord) -> Result<(GroupKeyRef<'_>, f64), RecordError> {
    let key = derive_key_ref(record)?;
    let amount = record.amount()?;
    Ok((key, amount))
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveDateTime};

    use super::{
        GroupKey, RecordError, RecordId, Sign, TripField, TripRecord, derive_contribution,
        derive_key,
    };

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 1, 15)
            .expect("date")
            .and_hms_opt(hour, minute, 0)
            .expect("time")
    }

    #[test]
    fn derive_key_uses_hour_of_pickup() {
        let record = TripRecord::new(at(10, 59), 12.5, 161).with_zone("Manhattan", "Midtown Center");
        let key = derive_key(&record).expect("key");
        assert_eq!(key, GroupKey::new("Manhattan", "Midtown Center", 10));
    }

    #[test]
    fn derive_key_follows_current_timestamp() {
        let mut record = TripRecord::new(at(10, 59), 12.5, 161).with_zone("A", "Z");
        let before = record.group_key().expect("before");
        record.pickup_datetime = Some(at(11, 1));
        let after = record.group_key().expect("after");
        assert_eq!(before.pickup_hour, 10);
        assert_eq!(after.pickup_hour, 11);
    }

    #[test]
    fn missing_zone_attributes_are_reported() {
        let record = TripRecord::new(at(3, 0), 9.0, 264);
        let err = derive_key(&record).expect_err("borough missing");
        assert_eq!(
            err,
            RecordError::MissingField {
                field: TripField::Borough
            }
        );
        assert_eq!(err.to_string(), "required field `borough` is missing");

        let record = TripRecord {
            borough: Some("Queens".to_owned()),
            ..record
        };
        let err = derive_key(&record).expect_err("zone missing");
        assert_eq!(
            err,
            RecordError::MissingField {
                field: TripField::Zone
            }
        );
    }

    #[test]
    fn missing_pickup_is_reported() {
        let record = TripRecord {
            total_amount: Some(4.0),
            ..TripRecord::default()
        }
        .with_zone("A", "Z");
        assert_eq!(
            derive_key(&record).expect_err("no pickup"),
            RecordError::MissingField {
                field: TripField::PickupDatetime
            }
        );
    }

    #[test]
    fn nan_amount_counts_as_missing() {
        let record = TripRecord::new(at(1, 0), f64::NAN, 1).with_zone("A", "Z");
        assert_eq!(
            record.amount().expect_err("nan"),
            RecordError::MissingField {
                field: TripField::TotalAmount
            }
        );
    }

    #[test]
    fn contribution_borrows_key_from_record() {
        let record = TripRecord::new(at(23, 30), 41.25, 132).with_zone("Queens", "JFK Airport");
        let (key, amount) = derive_contribution(&record).expect("contribution");
        assert_eq!(key.borough, "Queens");
        assert_eq!(key.pickup_hour, 23);
        assert_eq!(amount, 41.25);
        assert_eq!(key.to_owned_key(), record.group_key().expect("owned"));
    }

    #[test]
    fn clean_filter_requires_positive_distance_and_amount() {
        let base = TripRecord::new(at(1, 0), 10.0, 1);
        assert!(!base.is_clean());
        assert!(base.clone().with_trip_distance(1.2).is_clean());
        assert!(base.clone().with_trip_distance(0.3).is_clean());
        assert!(!base.clone().with_trip_distance(0.0).is_clean());
        let refund = TripRecord::new(at(1, 0), -3.0, 1).with_trip_distance(2.0);
        assert!(!refund.is_clean());
    }

    #[test]
    fn sign_round_trips() {
        assert_eq!(Sign::Add.as_i64(), 1);
        assert_eq!(Sign::Retract.as_f64(), -1.0);
        assert_eq!(Sign::Add.flipped(), Sign::Retract);
        assert_eq!(Sign::Retract.to_string(), "-1");
    }

    #[test]
    fn group_key_display_and_serde_shape() {
        let key = GroupKey::new("Brooklyn", "Park Slope", 7);
        assert_eq!(key.to_string(), "Brooklyn/Park Slope/07h");
        let json = serde_json::to_value(&key).expect("serialize");
        assert_eq!(json["pickup_hour"], 7);
        assert_eq!(serde_json::to_string(&RecordId(9)).expect("id"), "9");
    }
}
