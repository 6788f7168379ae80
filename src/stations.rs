//! Station aggregation.
//!
//! Groups stops into logical stations (parent stations with their child
//! stops, plus standalone stops) and attaches the routes serving each one,
//! found by joining persisted stop times with the in-memory trip map.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

use crate::config::DataType;
use crate::model::{ChildStop, LOCATION_TYPE_STOP, Route, Station, Stop, Tagged, Trip};
use crate::store::{DocumentStore, Filter, FindOptions, collections, to_document};

pub type StopMap = HashMap<String, Stop>;
pub type RouteMap = HashMap<String, Route>;
pub type TripMap = HashMap<String, Trip>;

/// A station before its routes are resolved.
#[derive(Debug)]
pub struct PlannedStation<'a> {
    pub stop: &'a Stop,
    /// Sorted by stop id; always empty for a standalone stop.
    pub children: Vec<&'a Stop>,
}

impl PlannedStation<'_> {
    /// Stops whose stop times count towards this station's routes: the
    /// children of a parent station, or the standalone stop itself.
    pub fn member_stop_ids(&self) -> Vec<&str> {
        if self.stop.is_parent_station() {
            self.children.iter().map(|c| c.stop_id.as_str()).collect()
        } else {
            vec![self.stop.stop_id.as_str()]
        }
    }
}

#[derive(Debug, Default)]
pub struct StationPlan<'a> {
    /// Sorted by station id.
    pub stations: Vec<PlannedStation<'a>>,
    /// Stops whose parent is missing, and plain stops whose parent is not a parent station.
    pub orphans: Vec<&'a Stop>,
}

/// Partitions stops into stations and attaches children.
///
/// Parent stations and standalone stops are disjoint by construction, so
/// every station id is unique. Children are indexed once by parent id.
pub fn plan_stations(stops: &StopMap) -> StationPlan<'_> {
    let mut children_by_parent: HashMap<&str, Vec<&Stop>> = HashMap::new();
    for stop in stops.values() {
        if let Some(parent) = stop.parent() {
            children_by_parent.entry(parent).or_default().push(stop);
        }
    }

    let mut roots: Vec<&Stop> = stops
        .values()
        .filter(|s| s.is_parent_station() || s.is_standalone())
        .collect();
    roots.sort_by(|a, b| a.stop_id.cmp(&b.stop_id));

    let stations = roots
        .into_iter()
        .map(|stop| {
            let mut children = if stop.is_parent_station() {
                children_by_parent.remove(stop.stop_id.as_str()).unwrap_or_default()
            } else {
                Vec::new()
            };
            children.sort_by(|a, b| a.stop_id.cmp(&b.stop_id));
            PlannedStation { stop, children }
        })
        .collect();

    // Leftovers hang off something other than a parent station. Nested stops
    // (boarding areas under a platform) are expected; plain stops are not.
    let mut orphans: Vec<&Stop> = children_by_parent
        .into_iter()
        .flat_map(|(parent, children)| {
            let parent_missing = !stops.contains_key(parent);
            children
                .into_iter()
                .filter(move |c| parent_missing || c.location_type == LOCATION_TYPE_STOP)
        })
        .collect();
    orphans.sort_by(|a, b| a.stop_id.cmp(&b.stop_id));

    StationPlan { stations, orphans }
}

/// Aggregated stations plus the data-quality counters gathered on the way.
#[derive(Debug, Default, Serialize)]
pub struct StationReport {
    #[serde(skip)]
    pub stations: Vec<Station>,
    pub orphaned_stops: usize,
    /// Stop-time rows whose trip is not in the trip map.
    pub unknown_trips: usize,
    /// Trips whose route is not in the route map (the route is still reported).
    pub unknown_routes: usize,
    /// Member stops whose lookup returned exactly `limit` rows and may under-report routes.
    pub capped_member_stops: usize,
}

/// Builds one [`Station`] per logical station.
///
/// Stop times are read from the store per member stop, at most `limit` rows
/// each (`0` disables the cap). A busy stop served by more distinct trips
/// than the cap can therefore miss routes; such stops are counted in
/// [`StationReport::capped_member_stops`].
#[tracing::instrument(skip_all, fields(data_type = %data_type, limit = limit))]
pub async fn aggregate_stations(
    store: &dyn DocumentStore,
    data_type: DataType,
    stops: &StopMap,
    routes: &RouteMap,
    trips: &TripMap,
    limit: usize,
) -> Result<StationReport> {
    let plan = plan_stations(stops);
    let mut report = StationReport {
        orphaned_stops: plan.orphans.len(),
        ..Default::default()
    };

    for orphan in &plan.orphans {
        debug!(
            stop_id = %orphan.stop_id,
            parent_station = %orphan.parent_station,
            "Stop references a parent that is not a parent station"
        );
    }
    if report.orphaned_stops > 0 {
        warn!(count = report.orphaned_stops, "Stops left out of every station");
    }

    let mut options = FindOptions::new().project(&["trip_id"]);
    if limit > 0 {
        options = options.limit(limit);
    }

    for planned in &plan.stations {
        let mut lines = BTreeSet::new();

        for stop_id in planned.member_stop_ids() {
            let filter = Filter::data_type(data_type).eq("stop_id", stop_id);
            let rows = store
                .find(collections::STOP_TIMES, &filter, &options)
                .await?;

            if limit > 0 && rows.len() >= limit {
                report.capped_member_stops += 1;
                debug!(stop_id, limit, "Stop-time lookup hit the cap");
            }

            for trip_id in rows.iter().filter_map(|row| row.get("trip_id").and_then(Value::as_str)) {
                match trips.get(trip_id) {
                    Some(trip) => {
                        if !routes.contains_key(&trip.route_id) {
                            report.unknown_routes += 1;
                        }
                        lines.insert(trip.route_id.clone());
                    }
                    None => report.unknown_trips += 1,
                }
            }
        }

        report.stations.push(build_station(planned, lines));
    }

    if report.capped_member_stops > 0 {
        warn!(
            capped_member_stops = report.capped_member_stops,
            limit, "Some stops hit the stop-time lookup cap; their routes may be incomplete"
        );
    }
    if report.unknown_trips > 0 {
        warn!(count = report.unknown_trips, "Stop times reference trips missing from trips.txt");
    }
    if report.unknown_routes > 0 {
        warn!(count = report.unknown_routes, "Trips reference routes missing from routes.txt");
    }

    info!(stations = report.stations.len(), "Stations aggregated");
    Ok(report)
}

fn build_station(planned: &PlannedStation<'_>, lines: BTreeSet<String>) -> Station {
    let stop = planned.stop;
    Station {
        id: stop.stop_id.clone(),
        name: stop.stop_name.clone(),
        location: stop.location(),
        lines: lines.into_iter().collect(),
        location_type: stop.location_type,
        wheelchair_boarding: stop.wheelchair_boarding,
        child_stops: planned
            .children
            .iter()
            .map(|child| ChildStop {
                id: child.stop_id.clone(),
                name: child.stop_name.clone(),
                location: child.location(),
            })
            .collect(),
    }
}

/// Replaces the station documents of `data_type` with `stations`.
#[tracing::instrument(skip_all, fields(data_type = %data_type, count = stations.len()))]
pub async fn write_stations(
    store: &dyn DocumentStore,
    data_type: DataType,
    stations: &[Station],
    processed_at: DateTime<Utc>,
) -> Result<u64> {
    let docs = stations
        .iter()
        .map(|station| to_document(&Tagged::new(station, data_type, processed_at)))
        .collect::<Result<Vec<_>>>()?;

    let mut session = store
        .begin_replace(collections::PROCESSED_STATIONS, Filter::data_type(data_type))
        .await?;
    session.insert_many(docs).await?;
    let inserted = session.commit().await?;

    info!(inserted, "Inserted processed stations");
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Document, MemoryStore};
    use serde_json::json;

    fn stop(id: &str, location_type: i32, parent: &str) -> Stop {
        Stop {
            stop_id: id.to_string(),
            stop_code: String::new(),
            stop_name: format!("{id} name"),
            stop_desc: String::new(),
            stop_lat: 40.75,
            stop_lon: -73.98,
            zone_id: String::new(),
            stop_url: String::new(),
            location_type,
            parent_station: parent.to_string(),
            wheelchair_boarding: 0,
        }
    }

    fn trip(id: &str, route: &str) -> Trip {
        Trip {
            route_id: route.to_string(),
            service_id: "Weekday".to_string(),
            trip_id: id.to_string(),
            trip_headsign: String::new(),
            trip_short_name: String::new(),
            direction_id: 0,
            block_id: String::new(),
            shape_id: String::new(),
            wheelchair_accessible: 0,
        }
    }

    fn route(id: &str) -> Route {
        Route {
            route_id: id.to_string(),
            agency_id: "MTA NYCT".to_string(),
            route_short_name: id.to_string(),
            route_long_name: String::new(),
            route_desc: String::new(),
            route_type: 1,
            route_url: String::new(),
            route_color: String::new(),
            route_text_color: String::new(),
        }
    }

    fn stop_map(stops: Vec<Stop>) -> StopMap {
        stops.into_iter().map(|s| (s.stop_id.clone(), s)).collect()
    }

    fn stop_time(trip_id: &str, stop_id: &str, seq: i64, data_type: &str) -> Document {
        match json!({
            "trip_id": trip_id,
            "stop_id": stop_id,
            "stop_sequence": seq,
            "data_type": data_type,
        }) {
            Value::Object(doc) => doc,
            _ => unreachable!(),
        }
    }

    struct Fixture {
        store: MemoryStore,
        stops: StopMap,
        routes: RouteMap,
        trips: TripMap,
    }

    /// Parent `A` with children `A1`/`A2`, standalone `B`, orphan `X1`.
    async fn fixture() -> Fixture {
        let stops = stop_map(vec![
            stop("A", 1, ""),
            stop("A2", 0, "A"),
            stop("A1", 0, "A"),
            stop("B", 0, ""),
            stop("X1", 0, "MISSING"),
        ]);
        let trips: TripMap = [trip("T1", "R1"), trip("T2", "R2"), trip("T3", "R3")]
            .into_iter()
            .map(|t| (t.trip_id.clone(), t))
            .collect();
        let routes: RouteMap = ["R1", "R2", "R3"]
            .into_iter()
            .map(|r| (r.to_string(), route(r)))
            .collect();

        let store = MemoryStore::new();
        store
            .insert_many(
                collections::STOP_TIMES,
                vec![
                    stop_time("T1", "A1", 1, "regular"),
                    stop_time("T2", "A2", 1, "regular"),
                    stop_time("T3", "B", 2, "regular"),
                    stop_time("T1", "B", 2, "supplemented"),
                ],
            )
            .await
            .unwrap();

        Fixture {
            store,
            stops,
            routes,
            trips,
        }
    }

    async fn aggregate(f: &Fixture, limit: usize) -> StationReport {
        aggregate_stations(&f.store, DataType::Regular, &f.stops, &f.routes, &f.trips, limit)
            .await
            .unwrap()
    }

    #[test]
    fn test_plan_partitions_parents_and_standalone_stops() {
        let stops = stop_map(vec![
            stop("A", 1, ""),
            stop("A1", 0, "A"),
            stop("B", 0, ""),
            stop("E1", 2, "A"),
            stop("X1", 0, "B"),
        ]);
        let plan = plan_stations(&stops);

        let ids: Vec<_> = plan.stations.iter().map(|s| s.stop.stop_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);

        let children: Vec<_> = plan.stations[0].children.iter().map(|c| c.stop_id.as_str()).collect();
        assert_eq!(children, vec!["A1", "E1"]);
        assert!(plan.stations[1].children.is_empty());

        // a parent reference to a standalone stop does not make it a parent
        let orphans: Vec<_> = plan.orphans.iter().map(|s| s.stop_id.as_str()).collect();
        assert_eq!(orphans, vec!["X1"]);
    }

    #[test]
    fn test_nested_stops_are_not_orphans() {
        let stops = stop_map(vec![
            stop("A", 1, ""),
            stop("A1", 0, "A"),
            stop("BA", 4, "A1"),
            stop("GHOST", 4, "MISSING"),
        ]);
        let plan = plan_stations(&stops);

        // a boarding area under a platform is valid, one under a missing stop is not
        let orphans: Vec<_> = plan.orphans.iter().map(|s| s.stop_id.as_str()).collect();
        assert_eq!(orphans, vec!["GHOST"]);
        let children: Vec<_> = plan.stations[0].children.iter().map(|c| c.stop_id.as_str()).collect();
        assert_eq!(children, vec!["A1"]);
    }

    #[test]
    fn test_member_stops() {
        let stops = stop_map(vec![stop("A", 1, ""), stop("A1", 0, "A"), stop("B", 0, "")]);
        let plan = plan_stations(&stops);
        assert_eq!(plan.stations[0].member_stop_ids(), vec!["A1"]);
        assert_eq!(plan.stations[1].member_stop_ids(), vec!["B"]);
    }

    #[test]
    fn test_parent_without_children_has_no_members() {
        let stops = stop_map(vec![stop("A", 1, "")]);
        let plan = plan_stations(&stops);
        assert!(plan.stations[0].member_stop_ids().is_empty());
    }

    #[tokio::test]
    async fn test_parent_station_collects_routes_of_children() {
        let f = fixture().await;
        let report = aggregate(&f, 1000).await;

        let a = report.stations.iter().find(|s| s.id == "A").unwrap();
        let children: Vec<_> = a.child_stops.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(children, vec!["A1", "A2"]);
        assert_eq!(a.lines, vec!["R1", "R2"]);
        assert_eq!(a.location_type, 1);
        assert_eq!(a.name, "A name");
    }

    #[tokio::test]
    async fn test_standalone_stop_is_its_own_station() {
        let f = fixture().await;
        let report = aggregate(&f, 1000).await;

        let b = report.stations.iter().find(|s| s.id == "B").unwrap();
        assert!(b.child_stops.is_empty());
        // the supplemented stop time for T1 at B must not leak in
        assert_eq!(b.lines, vec!["R3"]);
    }

    #[tokio::test]
    async fn test_orphans_and_children_are_not_stations() {
        let f = fixture().await;
        let report = aggregate(&f, 1000).await;

        let ids: Vec<_> = report.stations.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
        assert_eq!(report.orphaned_stops, 1);
    }

    #[tokio::test]
    async fn test_unknown_trip_is_skipped() {
        let mut f = fixture().await;
        f.trips.remove("T2");
        let report = aggregate(&f, 1000).await;

        let a = report.stations.iter().find(|s| s.id == "A").unwrap();
        assert_eq!(a.lines, vec!["R1"]);
        assert_eq!(report.unknown_trips, 1);
    }

    #[tokio::test]
    async fn test_route_missing_from_route_map_is_still_reported() {
        let mut f = fixture().await;
        f.routes.remove("R3");
        let report = aggregate(&f, 1000).await;

        let b = report.stations.iter().find(|s| s.id == "B").unwrap();
        assert_eq!(b.lines, vec!["R3"]);
        assert_eq!(report.unknown_routes, 1);
    }

    #[tokio::test]
    async fn test_duplicate_trips_produce_one_line() {
        let f = fixture().await;
        f.store
            .insert_many(
                collections::STOP_TIMES,
                vec![stop_time("T3", "B", 7, "regular"), stop_time("T3", "B", 9, "regular")],
            )
            .await
            .unwrap();
        let report = aggregate(&f, 1000).await;

        let b = report.stations.iter().find(|s| s.id == "B").unwrap();
        assert_eq!(b.lines, vec!["R3"]);
    }

    #[tokio::test]
    async fn test_lookup_cap_bounds_rows_and_is_reported() {
        let mut f = fixture().await;
        f.trips.insert("T4".into(), trip("T4", "R4"));
        f.store
            .insert_many(collections::STOP_TIMES, vec![stop_time("T4", "B", 3, "regular")])
            .await
            .unwrap();

        let capped = aggregate(&f, 1).await;
        let b = capped.stations.iter().find(|s| s.id == "B").unwrap();
        assert_eq!(b.lines, vec!["R3"]);
        assert!(capped.capped_member_stops >= 1);

        let uncapped = aggregate(&f, 0).await;
        let b = uncapped.stations.iter().find(|s| s.id == "B").unwrap();
        assert_eq!(b.lines, vec!["R3", "R4"]);
        assert_eq!(uncapped.capped_member_stops, 0);
    }

    #[tokio::test]
    async fn test_write_stations_replaces_own_data_type() {
        let f = fixture().await;
        let report = aggregate(&f, 1000).await;
        let now = Utc::now();

        write_stations(&f.store, DataType::Supplemented, &report.stations[..1], now)
            .await
            .unwrap();
        write_stations(&f.store, DataType::Regular, &report.stations, now)
            .await
            .unwrap();
        write_stations(&f.store, DataType::Regular, &report.stations, now)
            .await
            .unwrap();

        let regular = Filter::data_type(DataType::Regular);
        let docs = f
            .store
            .find(collections::PROCESSED_STATIONS, &regular, &FindOptions::new())
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["id"], json!("A"));
        assert_eq!(docs[0]["lines"], json!(["R1", "R2"]));
        assert_eq!(docs[0]["location"], json!({"lat": 40.75, "lon": -73.98}));
        assert_eq!(
            docs[0]["child_stops"][0],
            json!({"id": "A1", "name": "A1 name", "location": {"lat": 40.75, "lon": -73.98}})
        );

        let supplemented = Filter::data_type(DataType::Supplemented);
        assert_eq!(
            f.store
                .count(collections::PROCESSED_STATIONS, &supplemented)
                .await
                .unwrap(),
            1
        );
    }
}
