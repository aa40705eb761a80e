#![forbid(unsafe_code)]

use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::NaiveDateTime;
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use dg_groupby::AggregateState;
use dg_join::{JoinError, ZoneDescriptor, ZoneLookup};
use dg_types::TripRecord;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("csv input has no headers")]
    MissingHeaders,
    #[error("csv input is missing required column `{0}`")]
    MissingColumn(&'static str),
    #[error("row {row}, column `{column}`: cannot parse {value:?}")]
    InvalidCell {
        row: usize,
        column: &'static str,
        value: String,
    },
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Join(#[from] JoinError),
}

/// Timestamp layout written by this crate and accepted first when reading.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const ACCEPTED_TIMESTAMP_FORMATS: [&str; 3] =
    [TIMESTAMP_FORMAT, "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"];

// Cells read as missing, matching the usual dataframe NA tokens.
const MISSING_TOKENS: [&str; 9] = ["", "NA", "N/A", "n/a", "NaN", "nan", "NULL", "null", "<NA>"];

const VENDOR_ID: &str = "VendorID";
const PICKUP_DATETIME: &str = "tpep_pickup_datetime";
const DROPOFF_DATETIME: &str = "tpep_dropoff_datetime";
const PASSENGER_COUNT: &str = "passenger_count";
const TRIP_DISTANCE: &str = "trip_distance";
const PICKUP_LOCATION: &str = "PULocationID";
const DROPOFF_LOCATION: &str = "DOLocationID";
const PAYMENT_TYPE: &str = "payment_type";
const FARE_AMOUNT: &str = "fare_amount";
const TIP_AMOUNT: &str = "tip_amount";
const TOTAL_AMOUNT: &str = "total_amount";
const BOROUGH: &str = "Borough";
const ZONE: &str = "Zone";

const LOCATION_ID: &str = "LocationID";
const SERVICE_ZONE: &str = "service_zone";

const TRIP_HEADERS: [&str; 13] = [
    VENDOR_ID,
    PICKUP_DATETIME,
    DROPOFF_DATETIME,
    PASSENGER_COUNT,
    TRIP_DISTANCE,
    PICKUP_LOCATION,
    DROPOFF_LOCATION,
    PAYMENT_TYPE,
    FARE_AMOUNT,
    TIP_AMOUNT,
    TOTAL_AMOUNT,
    BOROUGH,
    ZONE,
];

const AGGREGATE_HEADERS: [&str; 5] = [BOROUGH, ZONE, "pickup_hour", "trip_count", "total_revenue"];

type Slot = Option<(usize, &'static str)>;

fn locate(headers: &StringRecord, name: &'static str) -> Slot {
    headers
        .iter()
        .position(|header| header.trim() == name)
        .map(|pos| (pos, name))
}

fn require(headers: &StringRecord, name: &'static str) -> Result<Slot, IoError> {
    locate(headers, name)
        .map(Some)
        .ok_or(IoError::MissingColumn(name))
}

struct TripColumns {
    vendor_id: Slot,
    pickup_datetime: Slot,
    dropoff_datetime: Slot,
    passenger_count: Slot,
    trip_distance: Slot,
    pickup_location_id: Slot,
    dropoff_location_id: Slot,
    payment_type: Slot,
    fare_amount: Slot,
    tip_amount: Slot,
    total_amount: Slot,
    borough: Slot,
    zone: Slot,
}

impl TripColumns {
    fn resolve(headers: &StringRecord) -> Result<Self, IoError> {
        Ok(Self {
            vendor_id: locate(headers, VENDOR_ID),
            pickup_datetime: require(headers, PICKUP_DATETIME)?,
            dropoff_datetime: locate(headers, DROPOFF_DATETIME),
            passenger_count: locate(headers, PASSENGER_COUNT),
            trip_distance: locate(headers, TRIP_DISTANCE),
            pickup_location_id: locate(headers, PICKUP_LOCATION),
            dropoff_location_id: locate(headers, DROPOFF_LOCATION),
            payment_type: locate(headers, PAYMENT_TYPE),
            fare_amount: locate(headers, FARE_AMOUNT),
            tip_amount: locate(headers, TIP_AMOUNT),
            total_amount: require(headers, TOTAL_AMOUNT)?,
            borough: locate(headers, BOROUGH),
            zone: locate(headers, ZONE),
        })
    }
}

struct Cells<'r> {
    record: &'r StringRecord,
    row: usize,
}

impl Cells<'_> {
    fn text(&self, slot: Slot) -> Option<&str> {
        slot.and_then(|(pos, _)| self.record.get(pos))
            .map(str::trim)
            .filter(|value| !MISSING_TOKENS.contains(value))
    }

    fn string(&self, slot: Slot) -> Option<String> {
        self.text(slot).map(str::to_owned)
    }

    fn invalid(&self, slot: Slot, value: &str) -> IoError {
        IoError::InvalidCell {
            row: self.row,
            column: slot.map_or("", |(_, name)| name),
            value: value.to_owned(),
        }
    }

    fn float(&self, slot: Slot) -> Result<Option<f64>, IoError> {
        self.text(slot)
            .map(|value| value.parse::<f64>().map_err(|_| self.invalid(slot, value)))
            .transpose()
    }

    // Integer columns exported from float-typed sources arrive as `1.0`.
    fn int(&self, slot: Slot) -> Result<Option<i64>, IoError> {
        self.text(slot)
            .map(|value| {
                value.parse::<i64>().or_else(|_| match value.parse::<f64>() {
                    Ok(v) if v.is_finite() && v.fract() == 0.0 => Ok(v as i64),
                    _ => Err(self.invalid(slot, value)),
                })
            })
            .transpose()
    }

    fn timestamp(&self, slot: Slot) -> Result<Option<NaiveDateTime>, IoError> {
        self.text(slot)
            .map(|value| {
                ACCEPTED_TIMESTAMP_FORMATS
                    .iter()
                    .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
                    .ok_or_else(|| self.invalid(slot, value))
            })
            .transpose()
    }
}

/// Parse yellow-taxi trip rows. `tpep_pickup_datetime` and `total_amount`
/// columns are required; every other known column is optional, and unknown
/// columns are ignored.
pub fn read_trips_csv_str(input: &str) -> Result<Vec<TripRecord>, IoError> {
    read_trips_from_reader(input.as_bytes())
}

pub fn read_trips_csv(path: impl AsRef<Path>) -> Result<Vec<TripRecord>, IoError> {
    read_trips_from_reader(File::open(path)?)
}

fn read_trips_from_reader(source: impl Read) -> Result<Vec<TripRecord>, IoError> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(source);
    let headers = reader.headers()?.clone();
    if headers.is_empty() {
        return Err(IoError::MissingHeaders);
    }
    let columns = TripColumns::resolve(&headers)?;

    let mut out = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let cells = Cells {
            record: &record,
            row,
        };
        out.push(TripRecord {
            vendor_id: cells.int(columns.vendor_id)?,
            pickup_datetime: cells.timestamp(columns.pickup_datetime)?,
            dropoff_datetime: cells.timestamp(columns.dropoff_datetime)?,
            passenger_count: cells.int(columns.passenger_count)?,
            trip_distance: cells.float(columns.trip_distance)?,
            pickup_location_id: cells.int(columns.pickup_location_id)?,
            dropoff_location_id: cells.int(columns.dropoff_location_id)?,
            payment_type: cells.int(columns.payment_type)?,
            fare_amount: cells.float(columns.fare_amount)?,
            tip_amount: cells.float(columns.tip_amount)?,
            total_amount: cells.float(columns.total_amount)?,
            borough: cells.string(columns.borough),
            zone: cells.string(columns.zone),
        });
    }
    Ok(out)
}

/// Parse the taxi zone lookup (`LocationID,Borough,Zone,service_zone`).
pub fn read_zone_lookup_csv_str(input: &str) -> Result<ZoneLookup, IoError> {
    read_zone_lookup_from_reader(input.as_bytes())
}

pub fn read_zone_lookup_csv(path: impl AsRef<Path>) -> Result<ZoneLookup, IoError> {
    read_zone_lookup_from_reader(File::open(path)?)
}

fn read_zone_lookup_from_reader(source: impl Read) -> Result<ZoneLookup, IoError> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(source);
    let headers = reader.headers()?.clone();
    if headers.is_empty() {
        return Err(IoError::MissingHeaders);
    }
    let location = require(&headers, LOCATION_ID)?;
    let borough = locate(&headers, BOROUGH);
    let zone = locate(&headers, ZONE);
    let service_zone = locate(&headers, SERVICE_ZONE);

    let mut descriptors = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let cells = Cells {
            record: &record,
            row,
        };
        let location_id = cells
            .int(location)?
            .ok_or_else(|| cells.invalid(location, ""))?;
        descriptors.push(ZoneDescriptor {
            location_id,
            borough: cells.string(borough),
            zone: cells.string(zone),
            service_zone: cells.string(service_zone),
        });
    }
    Ok(ZoneLookup::from_descriptors(descriptors)?)
}

pub fn write_trips_csv_string<'a>(
    records: impl IntoIterator<Item = &'a TripRecord>,
) -> Result<String, IoError> {
    let mut writer = WriterBuilder::new().from_writer(Vec::new());
    writer.write_record(TRIP_HEADERS)?;

    for record in records {
        writer.write_record([
            opt_to_csv(record.vendor_id),
            timestamp_to_csv(record.pickup_datetime),
            timestamp_to_csv(record.dropoff_datetime),
            opt_to_csv(record.passenger_count),
            opt_to_csv(record.trip_distance),
            opt_to_csv(record.pickup_location_id),
            opt_to_csv(record.dropoff_location_id),
            opt_to_csv(record.payment_type),
            opt_to_csv(record.fare_amount),
            opt_to_csv(record.tip_amount),
            opt_to_csv(record.total_amount),
            record.borough.clone().unwrap_or_default(),
            record.zone.clone().unwrap_or_default(),
        ])?;
    }

    let bytes = writer.into_inner().map_err(|err| err.into_error())?;
    Ok(String::from_utf8(bytes)?)
}

/// One line per group in key order.
pub fn write_aggregate_csv_string(state: &AggregateState) -> Result<String, IoError> {
    let mut writer = WriterBuilder::new().from_writer(Vec::new());
    writer.write_record(AGGREGATE_HEADERS)?;

    for (key, entry) in state.iter() {
        writer.write_record([
            key.borough.clone(),
            key.zone.clone(),
            key.pickup_hour.to_string(),
            entry.count.to_string(),
            entry.sum.to_string(),
        ])?;
    }

    let bytes = writer.into_inner().map_err(|err| err.into_error())?;
    Ok(String::from_utf8(bytes)?)
}

pub fn write_aggregate_csv(path: impl AsRef<Path>, state: &AggregateState) -> Result<(), IoError> {
    std::fs::write(path, write_aggregate_csv_string(state)?)?;
    Ok(())
}

fn opt_to_csv<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(String::new, |v| v.to_string())
}

fn timestamp_to_csv(value: Option<NaiveDateTime>) -> String {
    value.map_or_else(String::new, |ts| ts.format(TIMESTAMP_FORMAT).to_string())
}
