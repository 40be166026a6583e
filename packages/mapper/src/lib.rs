#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Per-record parsing, geographic classification, and accumulation.
//!
//! [`map_line`] is the hot loop: it never allocates beyond the one
//! comma split, never panics on malformed input, and absorbs every
//! per-record failure into `StatCounter.invalid` rather than
//! propagating it — only shard-level failures (missing file, I/O
//! error) are supposed to abort a sub-worker.

use taxi_stats_geo::GeoIndex;
use taxi_stats_models::{DISTANCE_BUCKETS, FARE_BUCKETS, StatCounter, TRIP_TIME_BUCKETS, bucket_for};

/// Fixed epoch offset added to a record's `pickup_epoch_seconds` before
/// deriving the hour of day. The normalized shard format already
/// stores absolute Unix seconds, so this is zero; it is named and kept
/// as a constant rather than inlined so a future shard format that
/// reintroduces a non-Unix epoch only has to change this one value.
pub const D0_EPOCH_OFFSET_SECONDS: i64 = 0;

const FIELD_COUNT: usize = 9;

struct ParsedRecord {
    pickup_epoch: i64,
    dropoff_epoch: i64,
    pickup_lon: f64,
    pickup_lat: f64,
    dropoff_lon: f64,
    dropoff_lat: f64,
    trip_distance: f64,
    fare_amount: f64,
}

fn parse_record(line: &str) -> Option<ParsedRecord> {
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() != FIELD_COUNT {
        return None;
    }

    Some(ParsedRecord {
        pickup_epoch: fields[0].trim().parse().ok()?,
        dropoff_epoch: fields[1].trim().parse().ok()?,
        pickup_lon: fields[2].trim().parse().ok()?,
        pickup_lat: fields[3].trim().parse().ok()?,
        dropoff_lon: fields[4].trim().parse().ok()?,
        dropoff_lat: fields[5].trim().parse().ok()?,
        trip_distance: fields[6].trim().parse().ok()?,
        fare_amount: fields[7].trim().parse().ok()?,
        // fields[8] is padding, intentionally unused.
    })
}

fn pickup_hour(pickup_epoch: i64) -> u8 {
    let seconds_of_day = (D0_EPOCH_OFFSET_SECONDS + pickup_epoch).rem_euclid(86_400);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let hour = (seconds_of_day / 3600) as u8;
    hour
}

/// Parses, classifies, and accumulates one record line into `counter`.
///
/// Every record increments `total` exactly once, matching the §8
/// invariant `invalid <= total`. A record contributes to `invalid`
/// instead of the rest of the counters when it fails to split into the
/// expected nine fields, fails to parse as the expected numeric types,
/// or has both its pickup and dropoff point outside every district —
/// a record with only one locatable endpoint still counts toward that
/// endpoint's histograms.
pub fn map_line(line: &str, geo: &GeoIndex, counter: &mut StatCounter) {
    counter.total += 1;

    let Some(record) = parse_record(line) else {
        counter.invalid += 1;
        return;
    };

    let trip_time = (record.dropoff_epoch - record.pickup_epoch).max(0);
    let hour = pickup_hour(record.pickup_epoch);

    let pickup_district = geo.classify(record.pickup_lon, record.pickup_lat);
    let dropoff_district = geo.classify(record.dropoff_lon, record.dropoff_lat);

    if pickup_district.is_none() && dropoff_district.is_none() {
        counter.invalid += 1;
        return;
    }

    if let Some(pd) = pickup_district {
        *counter.pickups.entry(pd).or_insert(0) += 1;
    }
    if let Some(dd) = dropoff_district {
        *counter.dropoffs.entry(dd).or_insert(0) += 1;
    }

    *counter.hour.entry(hour).or_insert(0) += 1;
    *counter
        .distance
        .entry(bucket_for(record.trip_distance, &DISTANCE_BUCKETS))
        .or_insert(0) += 1;
    #[allow(clippy::cast_precision_loss)]
    let trip_time_f = trip_time as f64;
    *counter
        .trip_time
        .entry(bucket_for(trip_time_f, &TRIP_TIME_BUCKETS))
        .or_insert(0) += 1;
    *counter
        .fare
        .entry(bucket_for(record.fare_amount, &FARE_BUCKETS))
        .or_insert(0) += 1;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manhattan_geo() -> GeoIndex {
        let geojson = r#"{
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "properties": { "boro_cd": 101 },
                "geometry": {
                    "type": "MultiPolygon",
                    "coordinates": [[[[-74.05,40.68],[-73.90,40.68],[-73.90,40.88],[-74.05,40.88],[-74.05,40.68]]]]
                }
            }]
        }"#;
        GeoIndex::load(geojson).unwrap()
    }

    #[test]
    fn scenario_both_endpoints_inside_same_district() {
        let geo = manhattan_geo();
        let mut counter = StatCounter::default();
        // pickup 08:00 UTC = 28800s into the day; dropoff 450s later.
        let line = "28800,29250,-74.00,40.75,-74.00,40.75,1.5,7.0,";
        map_line(line, &geo, &mut counter);
        map_line(line, &geo, &mut counter);

        assert_eq!(counter.total, 2);
        assert_eq!(counter.invalid, 0);
        assert_eq!(counter.pickups.get(&10101), Some(&2));
        assert_eq!(counter.dropoffs.get(&10101), Some(&2));
        assert_eq!(counter.hour.get(&8), Some(&2));
        assert_eq!(counter.distance.get(&1), Some(&2));
        assert_eq!(counter.trip_time.get(&300), Some(&2));
        assert_eq!(counter.fare.get(&5), Some(&2));
    }

    #[test]
    fn scenario_both_endpoints_outside_every_district() {
        let geo = manhattan_geo();
        let mut counter = StatCounter::default();
        let line = "0,60,0.0,0.0,0.0,0.0,1.0,5.0,";
        map_line(line, &geo, &mut counter);

        assert_eq!(counter.total, 1);
        assert_eq!(counter.invalid, 1);
        assert!(counter.pickups.is_empty());
        assert!(counter.dropoffs.is_empty());
    }

    #[test]
    fn scenario_one_endpoint_locatable_still_counts() {
        let geo = manhattan_geo();
        let mut counter = StatCounter::default();
        let line = "28800,29250,-74.00,40.75,0.0,0.0,1.5,7.0,";
        map_line(line, &geo, &mut counter);

        assert_eq!(counter.total, 1);
        assert_eq!(counter.invalid, 0);
        assert_eq!(counter.pickups.get(&10101), Some(&1));
        assert!(counter.dropoffs.is_empty());
    }

    #[test]
    fn malformed_line_counts_as_invalid_without_aborting() {
        let geo = manhattan_geo();
        let mut counter = StatCounter::default();
        map_line("not,enough,fields", &geo, &mut counter);
        assert_eq!(counter.total, 1);
        assert_eq!(counter.invalid, 1);
    }

    #[test]
    fn unparseable_numeric_field_counts_as_invalid() {
        let geo = manhattan_geo();
        let mut counter = StatCounter::default();
        let line = "abc,29250,-74.00,40.75,-74.00,40.75,1.5,7.0,";
        map_line(line, &geo, &mut counter);
        assert_eq!(counter.total, 1);
        assert_eq!(counter.invalid, 1);
    }

    #[test]
    fn distance_exactly_at_boundary_goes_to_higher_bucket() {
        let geo = manhattan_geo();
        let mut counter = StatCounter::default();
        let line = "0,60,-74.00,40.75,-74.00,40.75,5.0,0.0,";
        map_line(line, &geo, &mut counter);
        assert_eq!(counter.distance.get(&5), Some(&1));
        assert!(counter.distance.get(&2).is_none());
    }
}
