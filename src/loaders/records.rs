//! Row to record mappings for each feed table.

use anyhow::Result;
use serde::Serialize;
use tracing::warn;

use crate::model::{
    Agency, CalendarEntry, LOCATION_TYPE_STATION, Route, ShapePoint, Stop, StopTime, Transfer,
    Trip,
};
use crate::parser::Row;
use crate::store::collections;

/// A feed table that maps row by row onto a persisted record.
pub trait TableRecord: Serialize + Sized + Send + Sync {
    /// File name inside the feed archive.
    const FILE: &'static str;
    const COLLECTION: &'static str;
    /// Whether a feed without this file is rejected.
    const REQUIRED: bool = true;

    fn from_row(row: &Row) -> Result<Self>;
}

/// A table whose records have a natural identifier used by later stages.
pub trait KeyedRecord: TableRecord {
    fn key(&self) -> &str;
}

impl TableRecord for Agency {
    const FILE: &'static str = "agency.txt";
    const COLLECTION: &'static str = collections::AGENCIES;

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Agency {
            // single-agency feeds may omit the column
            agency_id: row.text_or("agency_id", "MTA"),
            agency_name: row.text("agency_name"),
            agency_url: row.text("agency_url"),
            agency_timezone: row.text("agency_timezone"),
            agency_lang: row.text("agency_lang"),
            agency_phone: row.text("agency_phone"),
        })
    }
}

impl TableRecord for Route {
    const FILE: &'static str = "routes.txt";
    const COLLECTION: &'static str = collections::ROUTES;

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Route {
            route_id: row.text("route_id"),
            agency_id: row.text("agency_id"),
            route_short_name: row.text("route_short_name"),
            route_long_name: row.text("route_long_name"),
            route_desc: row.text("route_desc"),
            route_type: row.int_or_zero("route_type")?,
            route_url: row.text("route_url"),
            route_color: row.text("route_color"),
            route_text_color: row.text("route_text_color"),
        })
    }
}

impl KeyedRecord for Route {
    fn key(&self) -> &str {
        &self.route_id
    }
}

impl TableRecord for Stop {
    const FILE: &'static str = "stops.txt";
    const COLLECTION: &'static str = collections::STOPS;

    fn from_row(row: &Row) -> Result<Self> {
        let mut stop = Stop {
            stop_id: row.text("stop_id"),
            stop_code: row.text("stop_code"),
            stop_name: row.text("stop_name"),
            stop_desc: row.text("stop_desc"),
            stop_lat: row.float_or_zero("stop_lat")?,
            stop_lon: row.float_or_zero("stop_lon")?,
            zone_id: row.text("zone_id"),
            stop_url: row.text("stop_url"),
            location_type: row.flag_or_zero("location_type")?,
            parent_station: row.text("parent_station"),
            wheelchair_boarding: row.flag_or_zero("wheelchair_boarding")?,
        };

        if stop.location_type == LOCATION_TYPE_STATION && !stop.parent_station.is_empty() {
            warn!(
                stop_id = %stop.stop_id,
                parent_station = %stop.parent_station,
                "Parent station references a parent of its own, dropping the reference"
            );
            stop.parent_station.clear();
        }

        Ok(stop)
    }
}

impl KeyedRecord for Stop {
    fn key(&self) -> &str {
        &self.stop_id
    }
}

impl TableRecord for CalendarEntry {
    const FILE: &'static str = "calendar.txt";
    const COLLECTION: &'static str = collections::CALENDAR;
    const REQUIRED: bool = false;

    fn from_row(row: &Row) -> Result<Self> {
        Ok(CalendarEntry {
            service_id: row.text("service_id"),
            monday: row.int_or_zero("monday")?,
            tuesday: row.int_or_zero("tuesday")?,
            wednesday: row.int_or_zero("wednesday")?,
            thursday: row.int_or_zero("thursday")?,
            friday: row.int_or_zero("friday")?,
            saturday: row.int_or_zero("saturday")?,
            sunday: row.int_or_zero("sunday")?,
            start_date: row.text("start_date"),
            end_date: row.text("end_date"),
        })
    }
}

impl KeyedRecord for CalendarEntry {
    fn key(&self) -> &str {
        &self.service_id
    }
}

impl TableRecord for ShapePoint {
    const FILE: &'static str = "shapes.txt";
    const COLLECTION: &'static str = collections::SHAPES;
    const REQUIRED: bool = false;

    fn from_row(row: &Row) -> Result<Self> {
        Ok(ShapePoint {
            shape_id: row.text("shape_id"),
            shape_pt_lat: row.float_or_zero("shape_pt_lat")?,
            shape_pt_lon: row.float_or_zero("shape_pt_lon")?,
            shape_pt_sequence: row.int_or_zero("shape_pt_sequence")?,
            shape_dist_traveled: row.nullable_float("shape_dist_traveled")?,
        })
    }
}

impl TableRecord for Trip {
    const FILE: &'static str = "trips.txt";
    const COLLECTION: &'static str = collections::TRIPS;

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Trip {
            route_id: row.text("route_id"),
            service_id: row.text("service_id"),
            trip_id: row.text("trip_id"),
            trip_headsign: row.text("trip_headsign"),
            trip_short_name: row.text("trip_short_name"),
            direction_id: row.flag_or_zero("direction_id")?,
            block_id: row.text("block_id"),
            shape_id: row.text("shape_id"),
            wheelchair_accessible: row.flag_or_zero("wheelchair_accessible")?,
        })
    }
}

impl KeyedRecord for Trip {
    fn key(&self) -> &str {
        &self.trip_id
    }
}

impl TableRecord for StopTime {
    const FILE: &'static str = "stop_times.txt";
    const COLLECTION: &'static str = collections::STOP_TIMES;

    fn from_row(row: &Row) -> Result<Self> {
        Ok(StopTime {
            trip_id: row.text("trip_id"),
            arrival_time: row.text("arrival_time"),
            departure_time: row.text("departure_time"),
            stop_id: row.text("stop_id"),
            stop_sequence: row.int_or_zero("stop_sequence")?,
            stop_headsign: row.text("stop_headsign"),
            pickup_type: row.flag_or_zero("pickup_type")?,
            drop_off_type: row.flag_or_zero("drop_off_type")?,
            shape_dist_traveled: row.nullable_float("shape_dist_traveled")?,
        })
    }
}

impl TableRecord for Transfer {
    const FILE: &'static str = "transfers.txt";
    const COLLECTION: &'static str = collections::TRANSFERS;
    const REQUIRED: bool = false;

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Transfer {
            from_stop_id: row.text("from_stop_id"),
            to_stop_id: row.text("to_stop_id"),
            transfer_type: row.int_or_zero("transfer_type")?,
            min_transfer_time: row.nullable_int("min_transfer_time")?,
        })
    }
}
