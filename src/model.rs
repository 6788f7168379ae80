//! Records persisted by the ingest pipeline.
//!
//! Source tables keep their feed column names as document field names.
//! [`Station`] is derived and only ever produced by the station aggregator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DataType;

pub const LOCATION_TYPE_STOP: i32 = 0;
pub const LOCATION_TYPE_STATION: i32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agency {
    pub agency_id: String,
    pub agency_name: String,
    pub agency_url: String,
    pub agency_timezone: String,
    pub agency_lang: String,
    pub agency_phone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub route_id: String,
    pub agency_id: String,
    pub route_short_name: String,
    pub route_long_name: String,
    pub route_desc: String,
    pub route_type: i64,
    pub route_url: String,
    pub route_color: String,
    pub route_text_color: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub stop_id: String,
    pub stop_code: String,
    pub stop_name: String,
    pub stop_desc: String,
    pub stop_lat: f64,
    pub stop_lon: f64,
    pub zone_id: String,
    pub stop_url: String,
    pub location_type: i32,
    /// Empty when the stop has no parent.
    pub parent_station: String,
    pub wheelchair_boarding: i32,
}

impl Stop {
    pub fn is_parent_station(&self) -> bool {
        self.location_type == LOCATION_TYPE_STATION
    }

    /// A plain stop that does not belong to any parent station.
    pub fn is_standalone(&self) -> bool {
        self.location_type == LOCATION_TYPE_STOP && self.parent_station.is_empty()
    }

    pub fn parent(&self) -> Option<&str> {
        if self.parent_station.is_empty() {
            None
        } else {
            Some(&self.parent_station)
        }
    }

    pub fn location(&self) -> Location {
        Location {
            lat: self.stop_lat,
            lon: self.stop_lon,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEntry {
    pub service_id: String,
    pub monday: i64,
    pub tuesday: i64,
    pub wednesday: i64,
    pub thursday: i64,
    pub friday: i64,
    pub saturday: i64,
    pub sunday: i64,
    pub start_date: String,
    pub end_date: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapePoint {
    pub shape_id: String,
    pub shape_pt_lat: f64,
    pub shape_pt_lon: f64,
    pub shape_pt_sequence: i64,
    pub shape_dist_traveled: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    pub route_id: String,
    pub service_id: String,
    pub trip_id: String,
    pub trip_headsign: String,
    pub trip_short_name: String,
    pub direction_id: i32,
    pub block_id: String,
    pub shape_id: String,
    pub wheelchair_accessible: i32,
}

/// One visit of a trip to a stop. `stop_sequence` orders the visits of a trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopTime {
    pub trip_id: String,
    pub arrival_time: String,
    pub departure_time: String,
    pub stop_id: String,
    pub stop_sequence: i64,
    pub stop_headsign: String,
    pub pickup_type: i32,
    pub drop_off_type: i32,
    pub shape_dist_traveled: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub from_stop_id: String,
    pub to_stop_id: String,
    pub transfer_type: i64,
    pub min_transfer_time: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildStop {
    pub id: String,
    pub name: String,
    pub location: Location,
}

/// A logical station: a parent station with its platforms, or a standalone stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub id: String,
    pub name: String,
    pub location: Location,
    /// Route ids observed at any member stop, sorted.
    pub lines: Vec<String>,
    pub location_type: i32,
    pub wheelchair_boarding: i32,
    pub child_stops: Vec<ChildStop>,
}

/// Bookkeeping record written once per data type at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedMetadata {
    pub data_type: DataType,
    pub last_updated: DateTime<Utc>,
    pub source_url: String,
    pub is_supplemented: bool,
}

/// A record as stored: the record's own fields plus the variant label and load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tagged<T> {
    #[serde(flatten)]
    pub record: T,
    pub data_type: DataType,
    pub updated_at: DateTime<Utc>,
}

impl<T> Tagged<T> {
    pub fn new(record: T, data_type: DataType, updated_at: DateTime<Utc>) -> Self {
        Self {
            record,
            data_type,
            updated_at,
        }
    }
}
