use crate::hyperlink::LinkMode;
use std::collections::{BTreeMap, HashMap};

// Times are minutes after midnight. They may go negative or past 1440 while a
// path crosses the midnight boundary; lookups that need a clock time wrap via
// fix_time_range.
pub type StopId = u32;
pub type TripId = u32;
pub type RouteId = u32;
pub type SupplyModeId = u32;
// Stop sequence on a trip, starting at 1. -1 for links that are not trips.
pub type SeqNum = i32;
pub type Cost = f64;

/// Generic named attributes attached to a link or trip. Ordered so that
/// iteration (and anything derived from it, like trace output) is stable.
pub type Attributes = BTreeMap<String, f64>;

/// Supply data: stop metadata. The zone is used for fare period lookups
/// (-1 when the stop has no fare zone).
#[derive(Debug, Clone)]
pub struct StopInfo {
    pub name: String,
    pub zone: i32,
}

/// Supply data: transit trip metadata, indexed by trip id.
#[derive(Debug, Clone)]
pub struct TripInfo {
    pub route_id: RouteId,
    pub supply_mode: SupplyModeId,
    pub attributes: Attributes,
}

/// Supply data: one row of a transit vehicle schedule.
#[derive(Debug, Clone)]
pub struct TripStopTime {
    pub trip_id: TripId,
    /// Stop sequence on the trip, dense and starting at 1.
    pub seq: SeqNum,
    pub stop_id: StopId,
    pub arrive_time: f64,
    pub depart_time: f64,
    pub shape_dist_trav: f64,
    /// Passengers over capacity from the last simulation snapshot.
    /// Negative when the vehicle has spare room.
    pub overcap: f64,
}

/// Validity period `[start, end)` in minutes after midnight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimePeriod {
    pub start: f64,
    pub end: f64,
}

impl TimePeriod {
    pub const ALL_DAY: TimePeriod = TimePeriod { start: 0.0, end: 1440.0 };

    pub fn contains(&self, time: f64) -> bool {
        self.start <= time && time < self.end
    }
}

/// Fare period definition.
#[derive(Debug, Clone)]
pub struct FarePeriod {
    pub fare_id: String,
    /// Name of the fare period; fare transfer rules are keyed by these names.
    pub fare_period: String,
    pub period: TimePeriod,
    /// Currency unspecified but consistent with value_of_time.
    pub price: f64,
    /// Number of free transfers allowed within this fare period.
    pub transfers: i32,
    /// Transfer duration in seconds. Negative means no limit.
    pub transfer_duration: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FareTransferType {
    Free,
    Discount,
    SetCost,
}

/// Fare adjustment when a board crosses from one fare period into another.
#[derive(Debug, Clone)]
pub struct FareTransfer {
    pub transfer_type: FareTransferType,
    pub amount: f64,
}

/// Fare periods are looked up by route and origin/destination fare zone;
/// -1 stands for "not applicable".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct RouteStopZone {
    route_id: i32,
    origin_zone: i32,
    destination_zone: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightKind {
    Linear,
    Exponential,
    Logarithmic,
    Logistic,
}

/// A single named weight. Deployed weight tables are linear; the nonlinear
/// kinds are kept as a hook for weight files that opt into them.
#[derive(Debug, Clone, Copy)]
pub struct Weight {
    pub kind: WeightKind,
    pub value: f64,
    /// Only for WeightKind::Logarithmic.
    pub log_base: f64,
    /// Only for WeightKind::Logistic.
    pub logistic_max: f64,
    /// Only for WeightKind::Logistic.
    pub logistic_mid: f64,
}

impl Weight {
    pub fn linear(value: f64) -> Weight {
        Weight { kind: WeightKind::Linear, value, log_base: 0.0, logistic_max: 0.0, logistic_mid: 0.0 }
    }

    pub fn apply(&self, x: f64) -> f64 {
        match self.kind {
            WeightKind::Linear => self.value * x,
            WeightKind::Exponential => (1.0 + self.value).powf(x) - 1.0,
            WeightKind::Logarithmic => self.value * (1.0 + x).ln() / self.log_base.ln(),
            WeightKind::Logistic => {
                self.logistic_max / (1.0 + (-self.value * (x - self.logistic_mid)).exp())
            }
        }
    }
}

pub type NamedWeights = BTreeMap<String, Weight>;
pub type SupplyModeWeights = BTreeMap<SupplyModeId, NamedWeights>;

/// Weight table key: which traveler, for which purpose, doing what.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WeightKey {
    pub user_class: String,
    pub purpose: String,
    pub demand_mode_type: LinkMode,
    pub demand_mode: String,
}

/// Access/egress links between TAZs and stops, each valid for a time period.
/// taz -> supply mode -> stop -> [(period, attributes)].
#[derive(Debug, Default)]
pub struct AccessEgressLinks {
    links: HashMap<StopId, HashMap<SupplyModeId, BTreeMap<StopId, Vec<(TimePeriod, Attributes)>>>>,
}

impl AccessEgressLinks {
    pub fn add(
        &mut self,
        taz_id: StopId,
        supply_mode: SupplyModeId,
        stop_id: StopId,
        period: TimePeriod,
        attributes: Attributes,
    ) {
        self.links
            .entry(taz_id)
            .or_default()
            .entry(supply_mode)
            .or_default()
            .entry(stop_id)
            .or_default()
            .push((period, attributes));
    }

    pub fn has_links_for_taz(&self, taz_id: StopId) -> bool {
        self.links.get(&taz_id).is_some_and(|m| !m.is_empty())
    }

    /// All stops linked to the TAZ by the given supply mode, with their
    /// time-period alternatives.
    pub fn links_for(
        &self,
        taz_id: StopId,
        supply_mode: SupplyModeId,
    ) -> impl Iterator<Item = (StopId, &[(TimePeriod, Attributes)])> {
        self.links
            .get(&taz_id)
            .and_then(|m| m.get(&supply_mode))
            .into_iter()
            .flat_map(|stops| stops.iter().map(|(&stop, periods)| (stop, periods.as_slice())))
    }

    /// Resolve the attributes valid at the given clock time (wrapped into
    /// [0, 1440)). The first matching period wins.
    pub fn attributes(
        &self,
        taz_id: StopId,
        supply_mode: SupplyModeId,
        stop_id: StopId,
        time: f64,
    ) -> Option<&Attributes> {
        let periods = self.links.get(&taz_id)?.get(&supply_mode)?.get(&stop_id)?;
        resolve_period(periods, time)
    }
}

/// First entry whose `[start, end)` contains `fix_time_range(time)`.
pub fn resolve_period(periods: &[(TimePeriod, Attributes)], time: f64) -> Option<&Attributes> {
    let clock = crate::path::fix_time_range(time);
    periods.iter().find(|(p, _)| p.contains(clock)).map(|(_, a)| a)
}

/// The read-only network supply for a batch of pathfinding requests.
/// Loading happens once through the `add_*` methods; during pathfinding the
/// supply is only read, so it can be shared by reference across threads.
#[derive(Default)]
pub struct Supply {
    stops: HashMap<StopId, StopInfo>,
    routes: HashMap<RouteId, String>,
    modes: HashMap<SupplyModeId, String>,
    transfer_supply_mode: SupplyModeId,

    trip_info: HashMap<TripId, TripInfo>,
    trip_names: HashMap<TripId, String>,
    trip_stop_times: HashMap<TripId, Vec<TripStopTime>>,
    stop_trip_times: HashMap<StopId, Vec<TripStopTime>>,

    access_egress: AccessEgressLinks,

    // Transfer attributes, indexed in both directions.
    transfer_links_o_d: HashMap<StopId, BTreeMap<StopId, Attributes>>,
    transfer_links_d_o: HashMap<StopId, BTreeMap<StopId, Attributes>>,

    fare_periods: Vec<FarePeriod>,
    fare_index: BTreeMap<RouteStopZone, Vec<usize>>,
    fare_transfer_rules: HashMap<(String, String), FareTransfer>,

    weights: HashMap<WeightKey, SupplyModeWeights>,

    // (trip, seq, stop) -> time the first bumped would-be passenger started
    // waiting there.
    bump_wait: HashMap<(TripId, SeqNum, StopId), f64>,
}

impl Supply {
    pub fn new() -> Supply {
        Supply::default()
    }

    // ---- loading ----

    pub fn add_stop(&mut self, stop_id: StopId, name: &str, zone: i32) {
        self.stops.insert(stop_id, StopInfo { name: name.to_owned(), zone });
    }

    pub fn add_route(&mut self, route_id: RouteId, name: &str) {
        self.routes.insert(route_id, name.to_owned());
    }

    pub fn add_supply_mode(&mut self, mode: SupplyModeId, name: &str) {
        if name == "transfer" {
            self.transfer_supply_mode = mode;
        }
        self.modes.insert(mode, name.to_owned());
    }

    pub fn add_trip(
        &mut self,
        trip_id: TripId,
        name: &str,
        route_id: RouteId,
        supply_mode: SupplyModeId,
        attributes: Attributes,
    ) {
        self.trip_names.insert(trip_id, name.to_owned());
        self.trip_info.insert(trip_id, TripInfo { route_id, supply_mode, attributes });
    }

    pub fn add_trip_stop_time(&mut self, stt: TripStopTime) {
        let stop_times = self.trip_stop_times.entry(stt.trip_id).or_default();
        // sequence numbers are dense, starting at 1
        debug_assert_eq!(stt.seq as usize, stop_times.len() + 1);
        stop_times.push(stt.clone());
        self.stop_trip_times.entry(stt.stop_id).or_default().push(stt);
    }

    pub fn add_access_link(
        &mut self,
        taz_id: StopId,
        supply_mode: SupplyModeId,
        stop_id: StopId,
        period: TimePeriod,
        attributes: Attributes,
    ) {
        self.access_egress.add(taz_id, supply_mode, stop_id, period, attributes);
    }

    pub fn add_transfer(&mut self, from_stop: StopId, to_stop: StopId, attributes: Attributes) {
        self.transfer_links_o_d
            .entry(from_stop)
            .or_default()
            .insert(to_stop, attributes.clone());
        self.transfer_links_d_o.entry(to_stop).or_default().insert(from_stop, attributes);
    }

    /// Register a fare period for the given route and zone pair; -1 stands
    /// for "any".
    pub fn add_fare_period(
        &mut self,
        route_id: i32,
        origin_zone: i32,
        destination_zone: i32,
        fare_period: FarePeriod,
    ) {
        let idx = self.fare_periods.len();
        self.fare_periods.push(fare_period);
        self.fare_index
            .entry(RouteStopZone { route_id, origin_zone, destination_zone })
            .or_default()
            .push(idx);
    }

    pub fn add_fare_transfer(
        &mut self,
        from_fare_period: &str,
        to_fare_period: &str,
        rule: FareTransfer,
    ) {
        self.fare_transfer_rules
            .insert((from_fare_period.to_owned(), to_fare_period.to_owned()), rule);
    }

    pub fn add_weights(&mut self, key: WeightKey, supply_mode: SupplyModeId, weights: NamedWeights) {
        self.weights.entry(key).or_default().insert(supply_mode, weights);
    }

    pub fn set_bump_wait(&mut self, trip_id: TripId, seq: SeqNum, stop_id: StopId, wait_start: f64) {
        self.bump_wait.insert((trip_id, seq, stop_id), wait_start);
    }

    // ---- lookups ----

    pub fn transfer_supply_mode(&self) -> SupplyModeId {
        self.transfer_supply_mode
    }

    pub fn access_egress(&self) -> &AccessEgressLinks {
        &self.access_egress
    }

    pub fn stop_zone(&self, stop_id: StopId) -> i32 {
        self.stops.get(&stop_id).map_or(-1, |s| s.zone)
    }

    pub fn trip_info(&self, trip_id: TripId) -> Option<&TripInfo> {
        self.trip_info.get(&trip_id)
    }

    pub fn trip_stop_times(&self, trip_id: TripId) -> Option<&[TripStopTime]> {
        self.trip_stop_times.get(&trip_id).map(Vec::as_slice)
    }

    /// Stop time for the given trip at the given sequence number.
    pub fn trip_stop_time(&self, trip_id: TripId, seq: SeqNum) -> Option<&TripStopTime> {
        if seq < 1 {
            return None;
        }
        self.trip_stop_times.get(&trip_id)?.get((seq - 1) as usize)
    }

    /// Departure time of the vehicle from the given stop on the given trip.
    /// A negative sequence matches the first visit to the stop.
    pub fn scheduled_departure(&self, trip_id: TripId, stop_id: StopId, seq: SeqNum) -> Option<f64> {
        let stop_times = self.trip_stop_times.get(&trip_id)?;
        stop_times
            .iter()
            .find(|stt| stt.stop_id == stop_id && (seq < 0 || seq == stt.seq))
            .map(|stt| stt.depart_time)
    }

    /// Trips usable at the stop near the timepoint.
    /// Outbound searches backwards, so this returns trips arriving at the stop
    /// within `(timepoint - window, timepoint]`; inbound searches forwards and
    /// returns trips departing within `[timepoint, timepoint + window)`.
    pub fn trips_within_time(
        &self,
        stop_id: StopId,
        outbound: bool,
        timepoint: f64,
        window: f64,
    ) -> Vec<TripStopTime> {
        let mut found = Vec::new();
        let Some(stop_times) = self.stop_trip_times.get(&stop_id) else {
            return found;
        };
        for stt in stop_times {
            if outbound && stt.arrive_time <= timepoint && stt.arrive_time > timepoint - window {
                found.push(stt.clone());
            } else if !outbound && stt.depart_time >= timepoint && stt.depart_time < timepoint + window
            {
                found.push(stt.clone());
            }
        }
        found
    }

    /// Transfer neighbors of the stop for the labeling direction: outbound
    /// labeling walks backwards so it wants transfers *to* the stop, inbound
    /// wants transfers *from* it.
    pub fn transfer_links(
        &self,
        stop_id: StopId,
        outbound: bool,
    ) -> Option<&BTreeMap<StopId, Attributes>> {
        if outbound {
            self.transfer_links_d_o.get(&stop_id)
        } else {
            self.transfer_links_o_d.get(&stop_id)
        }
    }

    pub fn transfer_attributes(&self, origin_stop: StopId, destination_stop: StopId) -> Option<&Attributes> {
        self.transfer_links_o_d.get(&origin_stop)?.get(&destination_stop)
    }

    pub fn supply_mode_weights(&self, key: &WeightKey) -> Option<&SupplyModeWeights> {
        self.weights.get(key)
    }

    pub fn named_weights(&self, key: &WeightKey, supply_mode: SupplyModeId) -> Option<&NamedWeights> {
        self.weights.get(key)?.get(&supply_mode)
    }

    /// Resolve the fare period for a boarded trip leg. Key patterns are tried
    /// most-specific first; the first entry whose time period contains the
    /// (wrapped) departure time wins.
    pub fn find_fare_period(
        &self,
        route_id: RouteId,
        origin_zone: i32,
        destination_zone: i32,
        depart_time: f64,
    ) -> Option<usize> {
        let route = route_id as i32;
        let patterns = [
            RouteStopZone { route_id: route, origin_zone, destination_zone },
            RouteStopZone { route_id: route, origin_zone, destination_zone: -1 },
            RouteStopZone { route_id: route, origin_zone: -1, destination_zone },
            RouteStopZone { route_id: route, origin_zone: -1, destination_zone: -1 },
        ];
        let clock = crate::path::fix_time_range(depart_time);
        for pattern in &patterns {
            if let Some(indices) = self.fare_index.get(pattern) {
                for &idx in indices {
                    if self.fare_periods[idx].period.contains(clock) {
                        return Some(idx);
                    }
                }
            }
        }
        None
    }

    pub fn fare_period(&self, idx: usize) -> &FarePeriod {
        &self.fare_periods[idx]
    }

    pub fn fare_transfer(&self, from_fare_period: &str, to_fare_period: &str) -> Option<&FareTransfer> {
        self.fare_transfer_rules
            .get(&(from_fare_period.to_owned(), to_fare_period.to_owned()))
    }

    pub fn bump_wait(&self, trip_id: TripId, seq: SeqNum, stop_id: StopId) -> Option<f64> {
        self.bump_wait.get(&(trip_id, seq, stop_id)).copied()
    }

    // ---- id strings for trace output ----

    pub fn stop_str(&self, stop_id: StopId) -> String {
        self.stops.get(&stop_id).map_or_else(|| stop_id.to_string(), |s| s.name.clone())
    }

    pub fn trip_str(&self, trip_id: TripId) -> String {
        self.trip_names.get(&trip_id).map_or_else(|| trip_id.to_string(), Clone::clone)
    }

    pub fn mode_str(&self, mode: SupplyModeId) -> String {
        self.modes.get(&mode).map_or_else(|| mode.to_string(), Clone::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, f64)]) -> Attributes {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn access_link_time_period_resolution() {
        let mut links = AccessEgressLinks::default();
        links.add(100, 1, 5, TimePeriod { start: 0.0, end: 720.0 }, attrs(&[("time_min", 4.0)]));
        links.add(100, 1, 5, TimePeriod { start: 720.0, end: 1440.0 }, attrs(&[("time_min", 6.0)]));

        let morning = links.attributes(100, 1, 5, 480.0).unwrap();
        assert_eq!(morning["time_min"], 4.0);
        let evening = links.attributes(100, 1, 5, 1000.0).unwrap();
        assert_eq!(evening["time_min"], 6.0);
        // wrapped: 1500 min -> 60 min
        let wrapped = links.attributes(100, 1, 5, 1500.0).unwrap();
        assert_eq!(wrapped["time_min"], 4.0);
        // negative: -10 min -> 1430 min
        let negative = links.attributes(100, 1, 5, -10.0).unwrap();
        assert_eq!(negative["time_min"], 6.0);

        assert!(links.attributes(100, 2, 5, 480.0).is_none());
        assert!(links.has_links_for_taz(100));
        assert!(!links.has_links_for_taz(101));
    }

    #[test]
    fn trips_within_time_windows() {
        let mut supply = Supply::new();
        for (trip, arrive) in [(1, 470.0), (2, 490.0), (3, 505.0)] {
            supply.add_trip_stop_time(TripStopTime {
                trip_id: trip,
                seq: 1,
                stop_id: 7,
                arrive_time: arrive,
                depart_time: arrive + 1.0,
                shape_dist_trav: 0.0,
                overcap: -1.0,
            });
        }

        // outbound: arrivals in (475, 505]
        let outbound: Vec<TripId> =
            supply.trips_within_time(7, true, 505.0, 30.0).iter().map(|t| t.trip_id).collect();
        assert_eq!(outbound, vec![2, 3]);

        // inbound: departures in [471, 501)
        let inbound: Vec<TripId> =
            supply.trips_within_time(7, false, 471.0, 30.0).iter().map(|t| t.trip_id).collect();
        assert_eq!(inbound, vec![1, 2]);

        assert!(supply.trips_within_time(8, true, 505.0, 30.0).is_empty());
    }

    #[test]
    fn fare_period_resolution_prefers_specific_keys() {
        let mut supply = Supply::new();
        let period = |name: &str, price: f64| FarePeriod {
            fare_id: name.to_owned(),
            fare_period: name.to_owned(),
            period: TimePeriod::ALL_DAY,
            price,
            transfers: 0,
            transfer_duration: -1.0,
        };
        supply.add_fare_period(4, -1, -1, period("route_any", 2.0));
        supply.add_fare_period(4, 1, 2, period("zone_pair", 3.5));

        let specific = supply.find_fare_period(4, 1, 2, 480.0).unwrap();
        assert_eq!(supply.fare_period(specific).fare_period, "zone_pair");

        let fallback = supply.find_fare_period(4, 1, 3, 480.0).unwrap();
        assert_eq!(supply.fare_period(fallback).fare_period, "route_any");

        assert!(supply.find_fare_period(5, 1, 2, 480.0).is_none());
    }

    #[test]
    fn scheduled_departure_matches_stop_and_sequence() {
        let mut supply = Supply::new();
        supply.add_trip_stop_time(TripStopTime {
            trip_id: 9,
            seq: 1,
            stop_id: 3,
            arrive_time: 480.0,
            depart_time: 481.0,
            shape_dist_trav: 0.0,
            overcap: -1.0,
        });
        supply.add_trip_stop_time(TripStopTime {
            trip_id: 9,
            seq: 2,
            stop_id: 4,
            arrive_time: 490.0,
            depart_time: 491.0,
            shape_dist_trav: 1.2,
            overcap: -1.0,
        });

        assert_eq!(supply.scheduled_departure(9, 4, 2), Some(491.0));
        assert_eq!(supply.scheduled_departure(9, 4, -1), Some(491.0));
        assert_eq!(supply.scheduled_departure(9, 4, 1), None);
        assert_eq!(supply.scheduled_departure(8, 4, 2), None);
        assert_eq!(supply.trip_stop_time(9, 2).unwrap().stop_id, 4);
        assert!(supply.trip_stop_time(9, 3).is_none());
        assert!(supply.trip_stop_time(9, -1).is_none());
    }

    #[test]
    fn nonlinear_weight_hook() {
        assert_eq!(Weight::linear(2.0).apply(3.0), 6.0);

        let exp = Weight { kind: WeightKind::Exponential, value: 1.0, ..Weight::linear(0.0) };
        assert!((exp.apply(3.0) - 7.0).abs() < 1e-12);

        let log = Weight { kind: WeightKind::Logarithmic, value: 2.0, log_base: std::f64::consts::E, ..Weight::linear(0.0) };
        assert!((log.apply(std::f64::consts::E - 1.0) - 2.0).abs() < 1e-12);

        let logistic = Weight {
            kind: WeightKind::Logistic,
            value: 1.0,
            logistic_max: 10.0,
            logistic_mid: 5.0,
            ..Weight::linear(0.0)
        };
        assert!((logistic.apply(5.0) - 5.0).abs() < 1e-12);
    }
}
