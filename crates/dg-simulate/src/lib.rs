#![forbid(unsafe_code)]

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use dg_frame::{ChangeKind, ChangeSet, FrameError, Population};
use dg_join::{JoinError, JoinType, ZoneDescriptor, ZoneLookup, join_zones};
use dg_types::{RecordId, TripRecord};
use rand::seq::index;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SimulateError {
    #[error("cannot sample {requested} records from a population of {available}")]
    InsufficientPopulation { requested: usize, available: usize },
    #[error("invalid simulation options: {0}")]
    InvalidOptions(String),
    #[error("shifting the pickup time of record {0} leaves the timestamp range")]
    TimestampOverflow(RecordId),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Join(#[from] JoinError),
}

/// Perturbations applied to sampled rows. Ranges are half-open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationOptions {
    pub insert_amount_factor_min: f64,
    pub insert_amount_factor_max: f64,
    pub insert_shift_secs_min: i64,
    pub insert_shift_secs_max: i64,
    pub update_amount_factor: f64,
    /// When set, updates also move the pickup time, which can move a record
    /// to a different hour bucket.
    pub update_pickup_shift_secs: Option<i64>,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            insert_amount_factor_min: 0.9,
            insert_amount_factor_max: 1.1,
            insert_shift_secs_min: 1,
            insert_shift_secs_max: 3_600,
            update_amount_factor: 1.05,
            update_pickup_shift_secs: None,
        }
    }
}

impl SimulationOptions {
    pub fn validate(&self) -> Result<(), SimulateError> {
        let factors = [
            self.insert_amount_factor_min,
            self.insert_amount_factor_max,
            self.update_amount_factor,
        ];
        if factors.iter().any(|factor| !factor.is_finite()) {
            return Err(SimulateError::InvalidOptions(
                "amount factors must be finite".to_owned(),
            ));
        }
        if self.insert_amount_factor_min >= self.insert_amount_factor_max {
            return Err(SimulateError::InvalidOptions(format!(
                "insert amount factor range {}..{} is empty",
                self.insert_amount_factor_min, self.insert_amount_factor_max
            )));
        }
        if self.insert_shift_secs_min >= self.insert_shift_secs_max {
            return Err(SimulateError::InvalidOptions(format!(
                "insert shift range {}..{} is empty",
                self.insert_shift_secs_min, self.insert_shift_secs_max
            )));
        }
        let shifts = [
            Some(self.insert_shift_secs_min),
            Some(self.insert_shift_secs_max),
            self.update_pickup_shift_secs,
        ];
        if shifts
            .into_iter()
            .flatten()
            .any(|secs| TimeDelta::try_seconds(secs).is_none())
        {
            return Err(SimulateError::InvalidOptions(
                "pickup shift is out of range".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Pre- and post-images of an update, captured before the population is
/// edited. Both carry the same ids in the same order.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateSample {
    pub pre_image: ChangeSet,
    pub post_image: ChangeSet,
}

impl UpdateSample {
    #[must_use]
    pub fn ids(&self) -> Vec<RecordId> {
        self.pre_image.ids()
    }
}

/// Seeded source of synthetic inserts, updates and deletes.
///
/// Never edits a population itself: every operation returns snapshots and the
/// caller decides when to apply them.
#[derive(Debug, Clone)]
pub struct ChangeSimulator {
    rng: ChaCha8Rng,
    options: SimulationOptions,
}

impl ChangeSimulator {
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            options: SimulationOptions::default(),
        }
    }

    pub fn with_options(seed: u64, options: SimulationOptions) -> Result<Self, SimulateError> {
        options.validate()?;
        Ok(Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            options,
        })
    }

    #[must_use]
    pub fn options(&self) -> &SimulationOptions {
        &self.options
    }

    pub fn sample_with_replacement(
        &mut self,
        population: &Population,
        n: usize,
    ) -> Result<Vec<RecordId>, SimulateError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let ids = population.ids();
        if ids.is_empty() {
            return Err(SimulateError::InsufficientPopulation {
                requested: n,
                available: 0,
            });
        }
        Ok((0..n)
            .map(|_| ids[self.rng.gen_range(0..ids.len())])
            .collect())
    }

    pub fn sample_without_replacement(
        &mut self,
        population: &Population,
        n: usize,
    ) -> Result<Vec<RecordId>, SimulateError> {
        let ids = population.ids();
        if n > ids.len() {
            return Err(SimulateError::InsufficientPopulation {
                requested: n,
                available: ids.len(),
            });
        }
        Ok(index::sample(&mut self.rng, ids.len(), n)
            .into_iter()
            .map(|pos| ids[pos])
            .collect())
    }

    /// New records copied from `n` draws with replacement, each with its
    /// amount scaled and pickup shifted forward. Missing fields stay missing.
    pub fn simulate_insert(
        &mut self,
        population: &Population,
        n: usize,
    ) -> Result<Vec<TripRecord>, SimulateError> {
        let ids = self.sample_with_replacement(population, n)?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let mut record = population
                .get(id)
                .cloned()
                .ok_or(FrameError::UnknownRecordId(id))?;
            let factor = self.rng.gen_range(
                self.options.insert_amount_factor_min..self.options.insert_amount_factor_max,
            );
            let shift = self
                .rng
                .gen_range(self.options.insert_shift_secs_min..self.options.insert_shift_secs_max);
            record.total_amount = record.total_amount.map(|amount| amount * factor);
            record.pickup_datetime = shift_pickup(id, record.pickup_datetime, shift)?;
            out.push(record);
        }
        Ok(out)
    }

    pub fn simulate_update(
        &mut self,
        population: &Population,
        n: usize,
    ) -> Result<UpdateSample, SimulateError> {
        let ids = self.sample_without_replacement(population, n)?;
        let pre_image = ChangeSet::capture(ChangeKind::UpdateOld, population, &ids)?;
        let mut post_rows = Vec::with_capacity(pre_image.len());
        for (id, record) in pre_image.rows() {
            let mut updated = record.clone();
            updated.total_amount = updated
                .total_amount
                .map(|amount| amount * self.options.update_amount_factor);
            if let Some(shift) = self.options.update_pickup_shift_secs {
                updated.pickup_datetime = shift_pickup(*id, updated.pickup_datetime, shift)?;
            }
            post_rows.push((*id, updated));
        }
        Ok(UpdateSample {
            pre_image,
            post_image: ChangeSet::new(ChangeKind::UpdateNew, post_rows),
        })
    }

    /// Snapshots of `n` distinct records chosen for removal.
    pub fn simulate_delete(
        &mut self,
        population: &Population,
        n: usize,
    ) -> Result<ChangeSet, SimulateError> {
        let ids = self.sample_without_replacement(population, n)?;
        Ok(ChangeSet::capture(ChangeKind::Delete, population, &ids)?)
    }
}

fn shift_pickup(
    id: RecordId,
    pickup: Option<NaiveDateTime>,
    secs: i64,
) -> Result<Option<NaiveDateTime>, SimulateError> {
    pickup
        .map(|ts| {
            TimeDelta::try_seconds(secs)
                .and_then(|delta| ts.checked_add_signed(delta))
                .ok_or(SimulateError::TimestampOverflow(id))
        })
        .transpose()
}

/// `n` perturbed copies drawn with replacement from `population`.
pub fn simulate_insert(
    population: &Population,
    n: usize,
    seed: u64,
) -> Result<Vec<TripRecord>, SimulateError> {
    ChangeSimulator::seeded(seed).simulate_insert(population, n)
}

/// A copy of `population` with `n` distinct records' amounts scaled, plus the
/// ids that changed.
pub fn simulate_update(
    population: &Population,
    n: usize,
    seed: u64,
) -> Result<(Population, Vec<RecordId>), SimulateError> {
    let sample = ChangeSimulator::seeded(seed).simulate_update(population, n)?;
    let mut updated = population.clone();
    updated.replace(sample.post_image.rows())?;
    Ok((updated, sample.ids()))
}

/// A copy of `population` without `n` distinct records, plus the removed ids.
pub fn simulate_delete(
    population: &Population,
    n: usize,
    seed: u64,
) -> Result<(Population, Vec<RecordId>), SimulateError> {
    let removed = ChangeSimulator::seeded(seed).simulate_delete(population, n)?;
    let ids = removed.ids();
    let mut remaining = population.clone();
    remaining.drop_ids(&ids)?;
    Ok((remaining, ids))
}

/// A slice of the NYC taxi zone lookup used when no real data is supplied.
#[must_use]
pub fn default_zone_catalogue() -> Vec<ZoneDescriptor> {
    vec![
        ZoneDescriptor::new(1, "EWR", "Newark Airport").with_service_zone("EWR"),
        ZoneDescriptor::new(4, "Manhattan", "Alphabet City").with_service_zone("Yellow Zone"),
        ZoneDescriptor::new(7, "Queens", "Astoria").with_service_zone("Boro Zone"),
        ZoneDescriptor::new(43, "Manhattan", "Central Park").with_service_zone("Yellow Zone"),
        ZoneDescriptor::new(48, "Manhattan", "Clinton East").with_service_zone("Yellow Zone"),
        ZoneDescriptor::new(79, "Manhattan", "East Village").with_service_zone("Yellow Zone"),
        ZoneDescriptor::new(132, "Queens", "JFK Airport").with_service_zone("Airports"),
        ZoneDescriptor::new(138, "Queens", "LaGuardia Airport").with_service_zone("Airports"),
        ZoneDescriptor::new(161, "Manhattan", "Midtown Center").with_service_zone("Yellow Zone"),
        ZoneDescriptor::new(181, "Brooklyn", "Park Slope").with_service_zone("Boro Zone"),
        ZoneDescriptor::new(230, "Manhattan", "Times Sq/Theatre District")
            .with_service_zone("Yellow Zone"),
        ZoneDescriptor::new(237, "Manhattan", "Upper East Side South")
            .with_service_zone("Yellow Zone"),
    ]
}

// Location id absent from the catalogue; trips placed here lose their zone
// in the left join.
const UNKNOWN_LOCATION_ID: i64 = 264;
const SECONDS_PER_MONTH: i64 = 31 * 24 * 3_600;

/// Deterministic generator of a month of joined yellow-taxi trips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PopulationSynth {
    pub rows: usize,
    pub seed: u64,
    /// Share of trips whose pickup location is not in the catalogue.
    pub unknown_zone_ratio: f64,
    pub zones: Vec<ZoneDescriptor>,
}

impl Default for PopulationSynth {
    fn default() -> Self {
        Self {
            rows: 50_000,
            seed: 42,
            unknown_zone_ratio: 0.0,
            zones: default_zone_catalogue(),
        }
    }
}

impl PopulationSynth {
    #[must_use]
    pub fn new(rows: usize, seed: u64) -> Self {
        Self {
            rows,
            seed,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_unknown_zone_ratio(mut self, ratio: f64) -> Self {
        self.unknown_zone_ratio = ratio;
        self
    }

    #[must_use]
    pub fn zone_lookup_descriptors(&self) -> &[ZoneDescriptor] {
        &self.zones
    }

    /// Raw trips as a loader would see them, before the zone join.
    pub fn raw_trips(&self) -> Result<Vec<TripRecord>, SimulateError> {
        if self.zones.is_empty() {
            return Err(SimulateError::InvalidOptions(
                "zone catalogue is empty".to_owned(),
            ));
        }
        let start = NaiveDate::from_ymd_opt(2025, 1, 1)
            .and_then(|day| day.and_hms_opt(0, 0, 0))
            .ok_or_else(|| SimulateError::InvalidOptions("bad start date".to_owned()))?;
        if !self.unknown_zone_ratio.is_finite() {
            return Err(SimulateError::InvalidOptions(format!(
                "unknown zone ratio {} is not finite",
                self.unknown_zone_ratio
            )));
        }
        let unknown_ratio = self.unknown_zone_ratio.clamp(0.0, 1.0);
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);

        let mut trips = Vec::with_capacity(self.rows);
        for row in 0..self.rows {
            let pickup_location = if rng.gen_bool(unknown_ratio) {
                UNKNOWN_LOCATION_ID
            } else {
                self.zones[rng.gen_range(0..self.zones.len())].location_id
            };
            let dropoff_location = self.zones[rng.gen_range(0..self.zones.len())].location_id;
            let pickup = start + TimeDelta::seconds(rng.gen_range(0..SECONDS_PER_MONTH));
            let duration = TimeDelta::seconds(rng.gen_range(120..3_600));
            let distance_hundredths: u32 = rng.gen_range(30..2_500);
            let fare_cents: u32 = rng.gen_range(300..9_000);
            let tip_cents: u32 = rng.gen_range(0..2_000);

            let fare = f64::from(fare_cents) / 100.0;
            let tip = f64::from(tip_cents) / 100.0;
            trips.push(TripRecord {
                vendor_id: Some(1 + i64::from(row % 2 == 0)),
                pickup_datetime: Some(pickup),
                dropoff_datetime: Some(pickup + duration),
                passenger_count: Some(rng.gen_range(1..=4)),
                trip_distance: Some(f64::from(distance_hundredths) / 100.0),
                pickup_location_id: Some(pickup_location),
                dropoff_location_id: Some(dropoff_location),
                payment_type: Some(rng.gen_range(1..=2)),
                fare_amount: Some(fare),
                tip_amount: Some(tip),
                total_amount: Some(fare + tip + 1.0),
                borough: None,
                zone: None,
            });
        }
        Ok(trips)
    }

    /// Cleaned and zone-joined population with ids `0..rows`.
    pub fn generate(&self) -> Result<Population, SimulateError> {
        let lookup = ZoneLookup::from_descriptors(self.zones.iter().cloned())?;
        let joined = join_zones(self.raw_trips()?, &lookup, JoinType::Left);
        let mut population = Population::from_records(joined.records);
        population.retain_clean();
        Ok(population)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use dg_frame::{ChangeKind, Population};
    use dg_types::{RecordId, TripRecord};

    use super::{
        ChangeSimulator, PopulationSynth, SimulateError, SimulationOptions, simulate_delete,
        simulate_insert, simulate_update,
    };

    fn population(n: usize) -> Population {
        let ts = NaiveDate::from_ymd_opt(2025, 1, 20)
            .expect("date")
            .and_hms_opt(10, 0, 0)
            .expect("time");
        (0..n)
            .map(|i| TripRecord::new(ts, 10.0 + i as f64, 1).with_zone("A", "Z"))
            .collect()
    }

    #[test]
    fn insert_jitters_amount_and_shifts_pickup() {
        let base = population(20);
        let inserted = simulate_insert(&base, 50, 7).expect("insert");
        assert_eq!(inserted.len(), 50);
        for record in &inserted {
            let amount = record.total_amount.expect("amount");
            assert!((10.0 * 0.9..29.0 * 1.1).contains(&amount));
            let shifted = record.pickup_datetime.expect("pickup");
            let base_ts = base.get(RecordId(0)).and_then(|r| r.pickup_datetime).expect("ts");
            let secs = (shifted - base_ts).num_seconds();
            assert!((1..3_600).contains(&secs), "shift {secs}");
        }
    }

    #[test]
    fn insert_is_reproducible_per_seed() {
        let base = population(30);
        assert_eq!(
            simulate_insert(&base, 10, 99).expect("a"),
            simulate_insert(&base, 10, 99).expect("b")
        );
        assert_ne!(
            simulate_insert(&base, 10, 99).expect("a"),
            simulate_insert(&base, 10, 100).expect("c")
        );
    }

    #[test]
    fn insert_keeps_missing_fields_missing() {
        let mut base = population(1);
        base.replace(&[(RecordId(0), TripRecord::default())])
            .expect("replace");
        let inserted = simulate_insert(&base, 3, 1).expect("insert");
        assert!(inserted.iter().all(|r| r.total_amount.is_none()));
        assert!(inserted.iter().all(|r| r.pickup_datetime.is_none()));
    }

    #[test]
    fn insert_from_empty_population_fails() {
        let err = simulate_insert(&Population::new(), 1, 0).expect_err("empty");
        assert_eq!(
            err,
            SimulateError::InsufficientPopulation {
                requested: 1,
                available: 0
            }
        );
        assert!(simulate_insert(&Population::new(), 0, 0).expect("zero").is_empty());
    }

    #[test]
    fn update_scales_distinct_records() {
        let base = population(40);
        let (updated, ids) = simulate_update(&base, 10, 3).expect("update");
        assert_eq!(ids.len(), 10);
        let mut distinct = ids.clone();
        distinct.sort();
        distinct.dedup();
        assert_eq!(distinct.len(), 10);
        for id in &ids {
            let before = base.get(*id).and_then(|r| r.total_amount).expect("before");
            let after = updated.get(*id).and_then(|r| r.total_amount).expect("after");
            assert!((after - before * 1.05).abs() < 1e-12);
        }
        assert_eq!(updated.len(), base.len());
    }

    #[test]
    fn update_sample_captures_images_before_edit() {
        let base = population(5);
        let options = SimulationOptions {
            update_pickup_shift_secs: Some(3_600),
            ..SimulationOptions::default()
        };
        let mut simulator = ChangeSimulator::with_options(11, options).expect("options");
        let sample = simulator.simulate_update(&base, 5).expect("update");
        assert_eq!(sample.pre_image.kind(), ChangeKind::UpdateOld);
        assert_eq!(sample.post_image.kind(), ChangeKind::UpdateNew);
        assert_eq!(sample.pre_image.ids(), sample.post_image.ids());
        for ((_, old), (_, new)) in sample.pre_image.rows().iter().zip(sample.post_image.rows()) {
            assert_eq!(old.pickup_hour().expect("old"), 10);
            assert_eq!(new.pickup_hour().expect("new"), 11);
        }
    }

    #[test]
    fn update_more_than_population_fails() {
        let err = simulate_update(&population(3), 4, 0).expect_err("too many");
        assert_eq!(
            err,
            SimulateError::InsufficientPopulation {
                requested: 4,
                available: 3
            }
        );
    }

    #[test]
    fn delete_removes_exactly_the_sampled_ids() {
        let base = population(25);
        let (remaining, ids) = simulate_delete(&base, 25, 5).expect("delete all");
        assert!(remaining.is_empty());
        assert_eq!(ids.len(), 25);

        let (remaining, ids) = simulate_delete(&base, 7, 5).expect("delete some");
        assert_eq!(remaining.len(), 18);
        assert!(ids.iter().all(|id| !remaining.contains(*id)));
        assert!(simulate_delete(&base, 26, 5).is_err());
    }

    #[test]
    fn invalid_options_are_rejected() {
        let options = SimulationOptions {
            insert_shift_secs_min: 10,
            insert_shift_secs_max: 10,
            ..SimulationOptions::default()
        };
        assert!(matches!(
            ChangeSimulator::with_options(0, options),
            Err(SimulateError::InvalidOptions(_))
        ));
        let options = SimulationOptions {
            update_amount_factor: f64::NAN,
            ..SimulationOptions::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: SimulationOptions =
            serde_json::from_str(r#"{"update_amount_factor": 1.5}"#).expect("parse");
        assert_eq!(options.update_amount_factor, 1.5);
        assert_eq!(options.insert_shift_secs_max, 3_600);
    }

    #[test]
    fn synth_population_is_clean_joined_and_repeatable() {
        let synth = PopulationSynth::new(2_000, 42);
        let population = synth.generate().expect("generate");
        assert_eq!(population.len(), 2_000);
        assert!(population.records().all(|r| r.group_key().is_ok() && r.is_clean()));
        assert_eq!(population, synth.generate().expect("again"));
    }

    #[test]
    fn synth_unknown_zones_surface_as_missing_borough() {
        let population = PopulationSynth::new(1_000, 1)
            .with_unknown_zone_ratio(0.25)
            .generate()
            .expect("generate");
        let missing = population.records().filter(|r| r.borough.is_none()).count();
        assert!(missing > 150 && missing < 350, "missing {missing}");
    }

    #[test]
    fn synth_rejects_non_finite_unknown_zone_ratio() {
        for ratio in [f64::NAN, f64::INFINITY] {
            let err = PopulationSynth::new(10, 1)
                .with_unknown_zone_ratio(ratio)
                .generate()
                .expect_err("non-finite ratio");
            assert!(matches!(err, SimulateError::InvalidOptions(_)));
        }
    }
}
