#![forbid(unsafe_code)]

use std::collections::HashMap;

use dg_types::TripRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    Inner,
    Left,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JoinError {
    #[error("location id {0} appears more than once in the zone lookup")]
    DuplicateLocation(i64),
}

/// One row of the taxi zone lookup table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneDescriptor {
    pub location_id: i64,
    pub borough: Option<String>,
    pub zone: Option<String>,
    pub service_zone: Option<String>,
}

impl ZoneDescriptor {
    #[must_use]
    pub fn new(location_id: i64, borough: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            location_id,
            borough: Some(borough.into()),
            zone: Some(zone.into()),
            service_zone: None,
        }
    }

    #[must_use]
    pub fn with_service_zone(mut self, service_zone: impl Into<String>) -> Self {
        self.service_zone = Some(service_zone.into());
        self
    }
}

/// `location_id -> ZoneDescriptor`, unique by location.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZoneLookup {
    by_location: HashMap<i64, ZoneDescriptor>,
}

impl ZoneLookup {
    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = ZoneDescriptor>,
    ) -> Result<Self, JoinError> {
        let mut by_location = HashMap::new();
        for descriptor in descriptors {
            let location_id = descriptor.location_id;
            if by_location.insert(location_id, descriptor).is_some() {
                return Err(JoinError::DuplicateLocation(location_id));
            }
        }
        Ok(Self { by_location })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_location.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_location.is_empty()
    }

    #[must_use]
    pub fn get(&self, location_id: i64) -> Option<&ZoneDescriptor> {
        self.by_location.get(&location_id)
    }

    /// Descriptors sorted by location id.
    #[must_use]
    pub fn descriptors(&self) -> Vec<&ZoneDescriptor> {
        let mut out = self.by_location.values().collect::<Vec<_>>();
        out.sort_by_key(|descriptor| descriptor.location_id);
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinedTrips {
    pub records: Vec<TripRecord>,
    pub matched: usize,
    pub unmatched: usize,
}

/// Attach `borough`/`zone` to each trip by its pickup location.
///
/// Left keeps unmatched trips with their zone attributes cleared; inner
/// drops them. A trip with no pickup location never matches. Input order is
/// preserved.
pub fn join_zones(
    trips: impl IntoIterator<Item = TripRecord>,
    lookup: &ZoneLookup,
    join_type: JoinType,
) -> JoinedTrips {
    let mut records = Vec::new();
    let mut matched = 0;
    let mut unmatched = 0;

    for mut trip in trips {
        let descriptor = trip
            .pickup_location_id
            .and_then(|location_id| lookup.get(location_id));
        match descriptor {
            Some(descriptor) => {
                trip.borough.clone_from(&descriptor.borough);
                trip.zone.clone_from(&descriptor.zone);
                matched += 1;
                records.push(trip);
            }
            None => {
                unmatched += 1;
                if matches!(join_type, JoinType::Left) {
                    trip.borough = None;
                    trip.zone = None;
                    records.push(trip);
                }
            }
        }
    }

    JoinedTrips {
        records,
        matched,
        unmatched,
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use dg_types::TripRecord;

    use super::{JoinError, JoinType, ZoneDescriptor, ZoneLookup, join_zones};

    fn trip(location_id: i64) -> TripRecord {
        let ts = NaiveDate::from_ymd_opt(2025, 1, 3)
            .expect("date")
            .and_hms_opt(8, 30, 0)
            .expect("time");
        TripRecord::new(ts, 20.0, location_id)
    }

    fn lookup() -> ZoneLookup {
        ZoneLookup::from_descriptors(vec![
            ZoneDescriptor::new(132, "Queens", "JFK Airport").with_service_zone("Airports"),
            ZoneDescriptor::new(161, "Manhattan", "Midtown Center"),
        ])
        .expect("lookup")
    }

    #[test]
    fn left_join_keeps_unmatched_trips_without_zone() {
        let joined = join_zones(vec![trip(132), trip(999), trip(161)], &lookup(), JoinType::Left);
        assert_eq!(joined.records.len(), 3);
        assert_eq!(joined.matched, 2);
        assert_eq!(joined.unmatched, 1);
        assert_eq!(joined.records[0].zone.as_deref(), Some("JFK Airport"));
        assert_eq!(joined.records[1].borough, None);
        assert_eq!(joined.records[2].borough.as_deref(), Some("Manhattan"));
    }

    #[test]
    fn inner_join_drops_unmatched_trips() {
        let mut no_location = trip(1);
        no_location.pickup_location_id = None;
        let joined = join_zones(
            vec![trip(999), trip(161), no_location],
            &lookup(),
            JoinType::Inner,
        );
        assert_eq!(joined.records.len(), 1);
        assert_eq!(joined.unmatched, 2);
        assert!(joined.records[0].group_key().is_ok());
    }

    #[test]
    fn join_overwrites_stale_zone_attributes() {
        let stale = trip(132).with_zone("Bronx", "Fordham");
        let joined = join_zones(vec![stale], &lookup(), JoinType::Left);
        assert_eq!(joined.records[0].borough.as_deref(), Some("Queens"));
    }

    #[test]
    fn lookup_rejects_duplicate_locations() {
        let err = ZoneLookup::from_descriptors(vec![
            ZoneDescriptor::new(4, "Manhattan", "Alphabet City"),
            ZoneDescriptor::new(4, "Manhattan", "Alphabet City"),
        ])
        .expect_err("duplicate");
        assert_eq!(err, JoinError::DuplicateLocation(4));
    }

    #[test]
    fn descriptors_are_sorted_by_location() {
        let lookup = lookup();
        let ids = lookup
            .descriptors()
            .iter()
            .map(|descriptor| descriptor.location_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![132, 161]);
        assert_eq!(lookup.len(), 2);
        assert_eq!(
            lookup.get(132).and_then(|d| d.service_zone.as_deref()),
            Some("Airports")
        );
    }
}
