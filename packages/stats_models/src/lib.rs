#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Domain types shared by every stage of the monthly taxi aggregate
//! pipeline: the shard color, the work-queue task, the aggregate
//! counter, and the fixed histogram bucket tables.
//!
//! This crate performs no I/O. It exists so that `taxi_stats_reader`,
//! `taxi_stats_mapper`, `taxi_stats_queue`, `taxi_stats_store` and
//! `taxi_stats_worker` can all speak the same vocabulary without
//! depending on each other.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Length in bytes of one fixed-width record, including its line
/// terminator. Shard size must be an exact multiple of this.
pub const RECORD_LENGTH: u64 = 80;

/// Distance buckets in miles: "≥ that many miles, < next bucket".
pub const DISTANCE_BUCKETS: [u32; 6] = [0, 1, 2, 5, 10, 20];

/// Trip-time buckets in seconds.
pub const TRIP_TIME_BUCKETS: [u32; 7] = [0, 300, 600, 900, 1800, 2700, 3600];

/// Fare buckets in dollars.
pub const FARE_BUCKETS: [u32; 6] = [0, 5, 10, 25, 50, 100];

/// Returns the bucket a value falls into: the largest threshold in
/// `buckets` that is `<= value`. `buckets` must be sorted ascending and
/// start at 0. A boundary value (e.g. exactly `5.0` against `[.., 5, ..]`)
/// lands in the higher bucket.
#[must_use]
pub fn bucket_for(value: f64, buckets: &[u32]) -> u32 {
    for &threshold in buckets.iter().rev() {
        if value >= f64::from(threshold) {
            return threshold;
        }
    }
    buckets.first().copied().unwrap_or(0)
}

/// Shard color: NYC publishes yellow (Manhattan medallion) and green
/// (boro) taxi trip records as separate monthly files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    /// Yellow medallion cabs.
    Yellow,
    /// Green boro taxis.
    Green,
}

impl Color {
    /// Returns the lowercase wire/file-name representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Yellow => "yellow",
            Self::Green => "green",
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string is not a recognized [`Color`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown color: {0} (expected \"yellow\" or \"green\")")]
pub struct UnknownColor(pub String);

impl FromStr for Color {
    type Err = UnknownColor;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "yellow" => Ok(Self::Yellow),
            "green" => Ok(Self::Green),
            other => Err(UnknownColor(other.to_string())),
        }
    }
}

/// One of the five NYC boroughs, derived from a district index via
/// `index / 10000`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Borough {
    /// Manhattan (borough code 1).
    Manhattan = 1,
    /// The Bronx (borough code 2).
    Bronx = 2,
    /// Brooklyn (borough code 3).
    Brooklyn = 3,
    /// Queens (borough code 4).
    Queens = 4,
    /// Staten Island (borough code 5).
    StatenIsland = 5,
}

impl Borough {
    /// Derives a borough from a district index (`index / 10000`).
    /// Returns `None` if the code does not match one of the five
    /// known boroughs.
    #[must_use]
    pub const fn from_district_index(index: u32) -> Option<Self> {
        match index / 10000 {
            1 => Some(Self::Manhattan),
            2 => Some(Self::Bronx),
            3 => Some(Self::Brooklyn),
            4 => Some(Self::Queens),
            5 => Some(Self::StatenIsland),
            _ => None,
        }
    }

    /// Returns the borough's numeric code (1..=5).
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Returns the human-readable borough name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Manhattan => "Manhattan",
            Self::Bronx => "Bronx",
            Self::Brooklyn => "Brooklyn",
            Self::Queens => "Queens",
            Self::StatenIsland => "Staten Island",
        }
    }
}

impl fmt::Display for Borough {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A half-open record-index range of one shard, plus the queue-assigned
/// lease tokens that are only meaningful between `pull` and `ack`.
///
/// `lease_id`/`lease_handle` are intentionally excluded from
/// [`Task::encode`]/[`Task::decode`] — the wire format in §6 is stable
/// across queue implementations and carries only the six addressing
/// fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Shard color.
    pub color: Color,
    /// Shard year.
    pub year: i32,
    /// Shard month (1-12).
    pub month: u32,
    /// Inclusive start of the record-index range.
    pub start: u64,
    /// Exclusive end of the record-index range.
    pub end: u64,
    /// Visibility lease timeout in seconds.
    pub timeout_seconds: u64,
    /// Queue-provided message identifier. `None` until pulled.
    pub lease_id: Option<String>,
    /// Queue-provided receipt/visibility handle. `None` until pulled.
    pub lease_handle: Option<String>,
}

/// Default visibility lease timeout, in seconds, for newly created tasks.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 3600;

/// Error decoding a [`Task`] from its wire encoding.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskDecodeError {
    /// The body did not split into exactly six comma-separated fields.
    #[error("expected 6 comma-separated fields, found {0}")]
    FieldCount(usize),
    /// A field could not be parsed as its expected type.
    #[error("failed to parse field {field}: {value}")]
    Field {
        /// Name of the field that failed to parse.
        field: &'static str,
        /// The raw value that failed to parse.
        value: String,
    },
    /// The color field was not "yellow" or "green".
    #[error(transparent)]
    Color(#[from] UnknownColor),
}

impl Task {
    /// Creates a new, not-yet-leased task over `[start, end)`.
    #[must_use]
    pub const fn new(
        color: Color,
        year: i32,
        month: u32,
        start: u64,
        end: u64,
        timeout_seconds: u64,
    ) -> Self {
        Self {
            color,
            year,
            month,
            start,
            end,
            timeout_seconds,
            lease_id: None,
            lease_handle: None,
        }
    }

    /// Encodes the task body per §6: `"<color>,<year>,<month>,<start>,<end>,<timeout>"`.
    /// Lease tokens are queue metadata, not part of the body.
    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            "{},{},{},{},{},{}",
            self.color, self.year, self.month, self.start, self.end, self.timeout_seconds
        )
    }

    /// Decodes a task body produced by [`Task::encode`]. The returned
    /// task has no lease tokens set; the caller (queue implementation)
    /// attaches them after a successful pull.
    ///
    /// # Errors
    ///
    /// Returns [`TaskDecodeError`] if the body is malformed.
    pub fn decode(body: &str) -> Result<Self, TaskDecodeError> {
        let fields: Vec<&str> = body.split(',').collect();
        if fields.len() != 6 {
            return Err(TaskDecodeError::FieldCount(fields.len()));
        }

        let color: Color = fields[0].parse()?;
        let year = fields[1]
            .parse()
            .map_err(|_| TaskDecodeError::Field { field: "year", value: fields[1].to_string() })?;
        let month = fields[2]
            .parse()
            .map_err(|_| TaskDecodeError::Field { field: "month", value: fields[2].to_string() })?;
        let start = fields[3]
            .parse()
            .map_err(|_| TaskDecodeError::Field { field: "start", value: fields[3].to_string() })?;
        let end = fields[4]
            .parse()
            .map_err(|_| TaskDecodeError::Field { field: "end", value: fields[4].to_string() })?;
        let timeout_seconds = fields[5].parse().map_err(|_| TaskDecodeError::Field {
            field: "timeout",
            value: fields[5].to_string(),
        })?;

        Ok(Self::new(color, year, month, start, end, timeout_seconds))
    }

    /// Shard object key this task addresses: `"<color>-<year>-<MM>.csv"`.
    #[must_use]
    pub fn shard_key(&self) -> String {
        format!("{}-{}-{:02}.csv", self.color, self.year, self.month)
    }
}

impl fmt::Display for Task {
    /// Compact human-readable form for logs: `color:year:month:[start,end):timeout`.
    /// Distinct from [`Task::encode`], which is the stable wire format.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:[{},{}):{}",
            self.color, self.year, self.month, self.start, self.end, self.timeout_seconds
        )
    }
}

/// Per-(color, year, month) aggregate statistics.
///
/// Every field is a plain additive counter. [`StatCounter::merge`] is
/// commutative and associative, so the order sub-workers complete in
/// never affects the result (§8).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatCounter {
    /// Shard color this counter was accumulated for.
    pub color: Option<Color>,
    /// Shard year.
    pub year: Option<i32>,
    /// Shard month.
    pub month: Option<u32>,
    /// Total records observed (valid + invalid).
    pub total: u64,
    /// Records dropped: parse failure or both endpoints unlocatable.
    pub invalid: u64,
    /// Pickup counts keyed by district index.
    pub pickups: BTreeMap<u32, u64>,
    /// Dropoff counts keyed by district index.
    pub dropoffs: BTreeMap<u32, u64>,
    /// Pickup-hour histogram, keyed 0..23.
    pub hour: BTreeMap<u8, u64>,
    /// Trip-distance histogram, keyed by bucket threshold.
    pub distance: BTreeMap<u32, u64>,
    /// Trip-time histogram, keyed by bucket threshold.
    pub trip_time: BTreeMap<u32, u64>,
    /// Fare histogram, keyed by bucket threshold.
    pub fare: BTreeMap<u32, u64>,
    /// Pickup counts rolled up by borough code (1..=5).
    pub borough_pickups: BTreeMap<u8, u64>,
    /// Dropoff counts rolled up by borough code (1..=5).
    pub borough_dropoffs: BTreeMap<u8, u64>,
}

fn merge_map<K: Ord + Copy>(into: &mut BTreeMap<K, u64>, other: &BTreeMap<K, u64>) {
    for (k, v) in other {
        *into.entry(*k).or_insert(0) += v;
    }
}

impl StatCounter {
    /// Creates an empty counter tagged with a `(color, year, month)` key.
    #[must_use]
    pub fn for_key(color: Color, year: i32, month: u32) -> Self {
        Self {
            color: Some(color),
            year: Some(year),
            month: Some(month),
            ..Self::default()
        }
    }

    /// Merges `other` into `self` by element-wise addition of every
    /// counter field. Commutative and associative; the tag
    /// (`color`/`year`/`month`) is taken from whichever side already
    /// has one set, preferring `self`.
    pub fn merge(&mut self, other: &Self) {
        if self.color.is_none() {
            self.color = other.color;
        }
        if self.year.is_none() {
            self.year = other.year;
        }
        if self.month.is_none() {
            self.month = other.month;
        }

        self.total += other.total;
        self.invalid += other.invalid;
        merge_map(&mut self.pickups, &other.pickups);
        merge_map(&mut self.dropoffs, &other.dropoffs);
        merge_map(&mut self.hour, &other.hour);
        merge_map(&mut self.distance, &other.distance);
        merge_map(&mut self.trip_time, &other.trip_time);
        merge_map(&mut self.fare, &other.fare);
        merge_map(&mut self.borough_pickups, &other.borough_pickups);
        merge_map(&mut self.borough_dropoffs, &other.borough_dropoffs);
    }

    /// Recomputes `borough_pickups`/`borough_dropoffs` from
    /// `pickups`/`dropoffs` by rolling up each district index via
    /// `index / 10000`. Idempotent — safe to call after every merge.
    pub fn recompute_borough_rollups(&mut self) {
        self.borough_pickups.clear();
        self.borough_dropoffs.clear();
        for (&district, &count) in &self.pickups {
            #[allow(clippy::cast_possible_truncation)]
            let borough = (district / 10000) as u8;
            *self.borough_pickups.entry(borough).or_insert(0) += count;
        }
        for (&district, &count) in &self.dropoffs {
            #[allow(clippy::cast_possible_truncation)]
            let borough = (district / 10000) as u8;
            *self.borough_dropoffs.entry(borough).or_insert(0) += count;
        }
    }

    /// The `ResultStore` row key: `(color, year*100 + month)`.
    ///
    /// # Panics
    ///
    /// Panics if `color`, `year` or `month` is unset. Every counter
    /// produced by [`StatCounter::for_key`] satisfies this.
    #[must_use]
    pub fn row_key(&self) -> (Color, i32) {
        (
            self.color.expect("StatCounter missing color tag"),
            self.year.expect("StatCounter missing year tag") * 100
                + i32::try_from(self.month.expect("StatCounter missing month tag"))
                    .unwrap_or_default(),
        )
    }
}

/// Cuts the inclusive range `[start, end]` into `n` contiguous half-open
/// subranges whose union is exactly `[start, end + 1)` (§4.5).
///
/// `step = (end - start + 1) / n`, computed once; the first `n - 1`
/// subranges are `step` wide and the last absorbs the remainder by
/// running to `end + 1`. Requires `end >= start` (at least one element)
/// — a zero-record shard has no valid `end` and must be special-cased
/// by the caller before reaching `cut` (this is the policy chosen for
/// the §8 "cut on an empty range" boundary question).
///
/// When `end - start + 1 < n` the integer-division step floors to 0:
/// the first `n - 1` subranges come out empty and the last absorbs the
/// entire range. This never panics, unlike the off-by-one-prone
/// division in the original implementation; callers should still
/// avoid creating more tasks than records (§9).
///
/// # Panics
///
/// Panics if `n == 0` or `end < start`.
#[must_use]
pub fn cut(start: u64, end: u64, n: u64) -> Vec<(u64, u64)> {
    assert!(n > 0, "cut: n must be positive");
    assert!(end >= start, "cut: end must be >= start");

    let span = end - start + 1;
    let step = span / n;

    let mut bounds = Vec::with_capacity(n as usize + 1);
    bounds.push(start);
    for i in 1..n {
        bounds.push(start + i * step);
    }
    bounds.push(end + 1);

    (0..n as usize).map(|i| (bounds[i], bounds[i + 1])).collect()
}

/// Selects just the `nth` subrange of [`cut`], avoiding the allocation
/// of the other `n - 1` subranges.
///
/// # Panics
///
/// Panics under the same conditions as [`cut`], or if `nth >= n`.
#[must_use]
pub fn cut_nth(start: u64, end: u64, n: u64, nth: u64) -> (u64, u64) {
    assert!(nth < n, "cut_nth: nth must be < n");
    let span = end - start + 1;
    let step = span / n;
    let s = start + nth * step;
    let e = if nth + 1 == n { end + 1 } else { start + (nth + 1) * step };
    (s, e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_boundary_goes_to_higher_bucket() {
        assert_eq!(bucket_for(5.0, &DISTANCE_BUCKETS), 5);
        assert_eq!(bucket_for(4.999, &DISTANCE_BUCKETS), 2);
        assert_eq!(bucket_for(0.0, &DISTANCE_BUCKETS), 0);
        assert_eq!(bucket_for(1000.0, &DISTANCE_BUCKETS), 20);
    }

    #[test]
    fn color_round_trips_through_display_and_parse() {
        assert_eq!("yellow".parse::<Color>().unwrap(), Color::Yellow);
        assert_eq!("green".parse::<Color>().unwrap(), Color::Green);
        assert!("blue".parse::<Color>().is_err());
        assert_eq!(Color::Yellow.to_string(), "yellow");
    }

    #[test]
    fn task_wire_encoding_round_trips() {
        let task = Task::new(Color::Green, 2016, 1, 0, 1000, 60);
        let body = task.encode();
        assert_eq!(body, "green,2016,1,0,1000,60");
        let decoded = Task::decode(&body).unwrap();
        assert_eq!(decoded, task);
    }

    #[test]
    fn task_decode_rejects_wrong_field_count() {
        assert!(matches!(
            Task::decode("green,2016,1,0,1000"),
            Err(TaskDecodeError::FieldCount(5))
        ));
    }

    #[test]
    fn task_display_is_distinct_from_wire_encoding() {
        let task = Task::new(Color::Yellow, 2016, 1, 0, 1000, 3600);
        assert_eq!(task.to_string(), "yellow:2016:1:[0,1000):3600");
        assert_ne!(task.to_string(), task.encode());
    }

    #[test]
    fn borough_derived_from_district_index() {
        assert_eq!(Borough::from_district_index(10101), Some(Borough::Manhattan));
        assert_eq!(Borough::from_district_index(30201), Some(Borough::Brooklyn));
        assert_eq!(Borough::from_district_index(99999), None);
    }

    #[test]
    fn merge_is_commutative_and_associative() {
        let mut a = StatCounter::for_key(Color::Yellow, 2016, 1);
        a.total = 3;
        a.pickups.insert(10101, 2);

        let mut b = StatCounter::for_key(Color::Yellow, 2016, 1);
        b.total = 5;
        b.pickups.insert(10101, 1);
        b.pickups.insert(30201, 4);

        let mut c = StatCounter::for_key(Color::Yellow, 2016, 1);
        c.total = 7;
        c.pickups.insert(40301, 9);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab, ba);

        let mut ab_c = ab.clone();
        ab_c.merge(&c);
        let mut bc = b.clone();
        bc.merge(&c);
        let mut a_bc = a.clone();
        a_bc.merge(&bc);
        assert_eq!(ab_c, a_bc);

        assert_eq!(ab.total, 8);
        assert_eq!(ab.pickups.get(&10101), Some(&3));
        assert_eq!(ab.pickups.get(&30201), Some(&4));
    }

    #[test]
    fn borough_rollup_sums_match_district_sums() {
        let mut s = StatCounter::for_key(Color::Green, 2016, 1);
        s.pickups.insert(10101, 2);
        s.pickups.insert(30201, 4);
        s.dropoffs.insert(10101, 1);
        s.recompute_borough_rollups();

        let pickup_sum: u64 = s.pickups.values().sum();
        let borough_sum: u64 = s.borough_pickups.values().sum();
        assert_eq!(pickup_sum, borough_sum);
        assert_eq!(s.borough_pickups.get(&1), Some(&2));
        assert_eq!(s.borough_pickups.get(&3), Some(&4));
    }
}
